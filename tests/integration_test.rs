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

mod common;

use cellrx::core::config::MachineConfig;
use cellrx::core::context::{ContextStatus, EventFlags, Family};
use cellrx::core::error::{EmulatorError, Result};
use cellrx::core::memory::layout::PAGE_SIZE;
use cellrx::core::system::demo::AtomicCounter;
use cellrx::core::system::{RunOutcome, System};
use cellrx::core::SchedulerHost;
use common::assertions::{assert_fast, assert_memory_word, assert_status};
use common::fixtures::{alloc_page, create_test_system, spawn, write_config, SMALL_MACHINE_TOML};

#[test]
fn test_basic_initialization() -> Result<()> {
    let system = System::new(MachineConfig::compact())?;
    assert_eq!(system.cycles(), 0);
    assert!(system.ppu().is_empty());
    Ok(())
}

#[test]
fn test_system_from_config_file() -> Result<()> {
    let file = write_config(SMALL_MACHINE_TOML);
    let config = MachineConfig::load(file.path())?;
    assert_eq!(config.timing.cpu_frequency, 1_000_000);

    let mut system = System::new(config)?;
    assert_eq!(system.us_to_cycles(1000), 1000);
    assert_eq!(system.available_bytes(), 0x700000);

    let id = spawn(&mut system, Family::Ppu, "main", true);
    system.sleep(id, 5)?;
    system.advance_clock(4)?;
    assert_status(&system, id, ContextStatus::Sleeping);
    system.advance_clock(1)?;
    assert_status(&system, id, ContextStatus::Running);
    Ok(())
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = MachineConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, EmulatorError::Io(_)));
}

#[test]
fn test_memory_round_trip() {
    let mut system = create_test_system();
    let page = alloc_page(&mut system);

    system.write::<u32>(page.vaddr, 0xDEADBEEF).unwrap();
    system.write::<u64>(page.vaddr + 8, 0x0123_4567_89AB_CDEF).unwrap();
    system.advance_clock(0).unwrap();

    assert_memory_word(&mut system, page.vaddr, 0xDEADBEEF);
    assert_memory_word(&mut system, page.vaddr + 8, 0x0123_4567);
    assert_fast(&system, page.vaddr, true, true);
}

#[test]
fn test_reservation_loss_reaches_waiting_context() {
    let mut system = create_test_system();
    let page = alloc_page(&mut system);
    let waiter = spawn(&mut system, Family::Spu, "waiter", true);
    let writer = spawn(&mut system, Family::Ppu, "writer", true);

    system.reserve(waiter, page.vaddr).unwrap();
    system
        .wait_for_events(waiter, EventFlags::LOCKLINE_LOST)
        .unwrap();
    assert_fast(&system, page.vaddr, true, false);

    system.memory_mut().set_accessor(Some(writer));
    system.write::<u8>(page.vaddr + 0x7F, 1).unwrap();
    assert_fast(&system, page.vaddr, true, true);

    let delay = system.config().timing.reservation_written_delay;
    system.advance_clock(delay).unwrap();
    assert_status(&system, waiter, ContextStatus::Running);
}

#[test]
fn test_timed_wait_expires() {
    let mut system = create_test_system();
    let id = spawn(&mut system, Family::Ppu, "main", true);

    system.wait_with_timeout(id, "semaphore", 10).unwrap();
    let remaining = system.skip_to_next_event().unwrap();
    assert_eq!(remaining, system.us_to_cycles(10));

    assert_status(&system, id, ContextStatus::Running);
    let ctx = system.ppu().context(id).unwrap();
    assert!(ctx.timed_out);
    assert_eq!(system.ppu().registers().gprs[3], 0x8001_000B);
}

#[test]
fn test_counter_workload_is_exact() {
    let mut system = create_test_system();
    let page = alloc_page(&mut system);

    let mut ppu = AtomicCounter::new(Family::Ppu, page.vaddr, 25);
    let mut spu = AtomicCounter::new(Family::Spu, page.vaddr, 25);
    ppu.spawn(&mut system, 3).unwrap();
    spu.spawn(&mut system, 3).unwrap();

    let outcome = system.run(&mut ppu, &mut spu, u64::MAX / 2).unwrap();
    assert_eq!(outcome, RunOutcome::Idle);
    assert_memory_word(&mut system, page.vaddr, 150);
    assert!(!system.is_halted());
}

#[test]
fn test_counter_workload_is_deterministic() {
    let run = || {
        let mut system = create_test_system();
        let page = alloc_page(&mut system);
        let mut ppu = AtomicCounter::new(Family::Ppu, page.vaddr, 10);
        let mut spu = AtomicCounter::new(Family::Spu, page.vaddr, 10);
        spu.pause_us = 3;
        ppu.spawn(&mut system, 2).unwrap();
        spu.spawn(&mut system, 2).unwrap();
        system.run(&mut ppu, &mut spu, u64::MAX / 2).unwrap();
        (system.cycles(), system.steps(), ppu.failed_commits, spu.failed_commits)
    };

    assert_eq!(run(), run());
}

#[test]
fn test_out_of_memory_is_reported() {
    let mut system = create_test_system();
    let too_big = system.config().memory.main_size + PAGE_SIZE;
    assert!(!system.can_allocate(too_big));
    let err = system
        .allocate(too_big, None, false, PAGE_SIZE)
        .unwrap_err();
    assert!(!err.is_fatal());
}
