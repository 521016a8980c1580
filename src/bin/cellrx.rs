// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use log::{error, info};
use cellrx::core::config::MachineConfig;
use cellrx::core::context::Family;
use cellrx::core::error::Result;
use cellrx::core::memory::layout::PAGE_SIZE;
use cellrx::core::system::demo::AtomicCounter;
use cellrx::core::system::{RunOutcome, System};
use serde::Serialize;
use std::path::PathBuf;

/// Cell console memory and scheduling core
///
/// Runs the built-in shared-counter workload: every context increments one
/// guest word with line reservations, sleeping between increments.
#[derive(Parser)]
#[command(name = "cellrx")]
#[command(about = "Cell console emulator core smoke runner", long_about = None)]
struct Args {
    /// Machine configuration (TOML); defaults are used when omitted
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Virtual cycles to run
    #[arg(short = 'n', long, default_value = "100000000")]
    cycles: u64,

    /// Contexts per interpreter family
    #[arg(long, default_value = "2")]
    contexts: usize,

    /// Increments each context performs before exiting
    #[arg(long, default_value = "100")]
    iterations: u64,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    outcome: RunOutcome,
    counter: u32,
    expected: u64,
    failed_commits: u64,
    #[serde(flatten)]
    stats: &'a cellrx::core::system::SystemStats,
}

fn main() -> Result<()> {
    // Load .env file if present (RUST_LOG and friends)
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Initialize logger with default level INFO
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("cellrx v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => MachineConfig::load(path).inspect_err(|e| error!("Failed to load config: {}", e))?,
        None => MachineConfig::default(),
    };

    let mut system = System::new(config)?;
    let page = system.allocate(PAGE_SIZE, None, false, PAGE_SIZE)?;
    let counter = page.vaddr;

    let mut ppu = AtomicCounter::new(Family::Ppu, counter, args.iterations);
    let mut spu = AtomicCounter::new(Family::Spu, counter, args.iterations);
    ppu.spawn(&mut system, args.contexts)?;
    spu.spawn(&mut system, args.contexts)?;

    info!(
        "Starting emulation: {} contexts per family, {} cycles",
        args.contexts, args.cycles
    );

    let outcome = match system.run(&mut ppu, &mut spu, args.cycles) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Stopped after {} cycles", system.cycles());
            return Err(e);
        }
    };

    let value = system.read::<u32>(counter)?;
    let expected = 2 * args.contexts as u64 * args.iterations;
    let stats = system.stats();

    info!("Emulation finished: {:?}", outcome);
    info!("Total cycles: {}", stats.cycles);
    info!("Counter: {} (expected {} once all contexts exit)", value, expected);
    info!(
        "Failed conditional stores: PPU {}, SPU {}",
        ppu.failed_commits, spu.failed_commits
    );

    if args.json {
        let report = Report {
            outcome,
            counter: value,
            expected,
            failed_commits: ppu.failed_commits + spu.failed_commits,
            stats: &stats,
        };
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize report: {}", e),
        }
    }

    Ok(())
}
