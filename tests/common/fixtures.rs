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

//! Test fixtures for common test scenarios

use cellrx::core::config::MachineConfig;
use cellrx::core::context::{ContextId, ContextSpec, ContextStatus, Entry, Family};
use cellrx::core::memory::layout::PAGE_SIZE;
use cellrx::core::memory::MapEntry;
use cellrx::core::system::System;
use std::io::Write;
use tempfile::NamedTempFile;

pub const ENTRY: u64 = 0x0001_0000;

/// Configuration with a small RAM and a slower guest clock
#[allow(dead_code)]
pub const SMALL_MACHINE_TOML: &str = r#"
[memory]
main_size = 0x800000
main_system_reserve = 0x100000
video_size = 0x100000
stack_size = 0x400000

[timing]
cpu_frequency = 1000000
max_pending_events = 32

[threads]
default_stack_size = 0x10000
"#;

/// Create a System with the compact layout
#[allow(dead_code)]
pub fn create_test_system() -> System {
    System::new(MachineConfig::compact()).expect("compact config is valid")
}

/// Write `text` to a temporary `.toml` file
#[allow(dead_code)]
pub fn write_config(text: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(text.as_bytes())
        .expect("Failed to write config");
    file
}

/// Allocate one page of main RAM
#[allow(dead_code)]
pub fn alloc_page(system: &mut System) -> MapEntry {
    system
        .allocate(PAGE_SIZE, None, false, PAGE_SIZE)
        .expect("Failed to allocate a page")
}

/// Spawn a context; `boot` switches it in immediately
#[allow(dead_code)]
pub fn spawn(system: &mut System, family: Family, name: &str, boot: bool) -> ContextId {
    let spec = ContextSpec::new(name, Entry::Direct(ENTRY));
    let spec = if boot {
        spec.boot()
    } else {
        spec.with_status(ContextStatus::Running)
    };
    system
        .spawn_context(family, spec)
        .expect("Failed to spawn context")
}
