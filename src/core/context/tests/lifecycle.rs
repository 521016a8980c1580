// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut

//! Creation, exit and join

use super::helpers::*;
use super::*;
use crate::core::memory::layout::{DEFAULT_STACK_SIZE, PAGE_SIZE};
use crate::core::timing::SchedulerHost;

#[test]
fn test_boot_context_is_active() {
    let mut host = TestHost::new();
    let id = host.boot();

    assert_eq!(id, Family::Ppu.id_base());
    assert!(host.ppu.is_enabled());
    assert_eq!(host.ppu.active(), Some(id));
    assert_eq!(host.ppu.registers().pc, ENTRY);
    assert_eq!(host.memory.accessor(), Some(id));
}

#[test]
fn test_stack_is_mapped_at_window() {
    let mut host = TestHost::new();
    let id = host.boot();
    let window = host.memory.region(RegionId::STACK).virtual_base();

    let sp = host.ppu.registers().stack_pointer();
    assert_eq!(sp, window + DEFAULT_STACK_SIZE - 8);

    // The top of the stack is usable memory
    host.memory.write::<u64>(sp, 0x1122_3344_5566_7788).unwrap();
    assert_eq!(host.memory.read::<u64>(sp).unwrap(), 0x1122_3344_5566_7788);

    let stack = host.ppu.context(id).unwrap().stack.unwrap();
    assert_eq!(host.memory.translate(window).unwrap(), stack.start);
}

#[test]
fn test_small_stack_is_rounded_up() {
    let mut host = TestHost::new();
    let spec = ContextSpec::new("tiny", Entry::Direct(ENTRY)).with_stack_size(0x1000);
    let id = host.ppu.create(spec, &mut host.memory).unwrap();

    let stack = host.ppu.context(id).unwrap().stack.unwrap();
    assert_eq!(stack.size, DEFAULT_STACK_SIZE);
}

#[test]
fn test_argument_and_ids() {
    let mut host = TestHost::new();
    let spec = ContextSpec::new("worker", Entry::Direct(ENTRY)).with_arg(0xABCD);
    let a = host.ppu.create(spec, &mut host.memory).unwrap();
    let b = host.spawn("second", ContextStatus::Waiting);

    assert_eq!(b, a + 1);
    assert_eq!(host.ppu.registers_of(a).unwrap().arg(0), 0xABCD);
    assert_eq!(host.status(a), ContextStatus::Waiting);
    assert!(!host.ppu.is_enabled());
}

#[test]
fn test_entry_through_descriptor() {
    let mut host = TestHost::new();
    let area = host.memory.alloc(PAGE_SIZE, 0, false, PAGE_SIZE).unwrap();
    host.memory.write::<u32>(area.vaddr, 0x0002_0000).unwrap();
    host.memory.write::<u32>(area.vaddr + 4, 0x0003_8000).unwrap();

    let spec = ContextSpec::new("descr", Entry::Descriptor(area.vaddr));
    let id = host.ppu.create(spec, &mut host.memory).unwrap();

    let regs = host.ppu.registers_of(id).unwrap();
    assert_eq!(regs.pc, 0x0002_0000);
    assert_eq!(regs.gprs[PpuRegisters::TOC], 0x0003_8000);
}

#[test]
fn test_tls_image_is_copied_and_zeroed() {
    let mut host = TestHost::new();
    let image = host.memory.alloc(PAGE_SIZE, 0, false, PAGE_SIZE).unwrap();
    host.memory.write_bytes(image.vaddr, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    host.memory.write::<u32>(image.vaddr + 8, 0xFFFF_FFFF).unwrap();

    let spec = ContextSpec::new("tls", Entry::Direct(ENTRY)).with_tls(TlsImage {
        vaddr: image.vaddr,
        file_size: 8,
        mem_size: 0x100,
    });
    let id = host.ppu.create(spec, &mut host.memory).unwrap();

    let area = host.ppu.context(id).unwrap().tls.unwrap();
    assert_eq!(host.ppu.registers_of(id).unwrap().gprs[PpuRegisters::TLS], area.vaddr);

    let mut copied = [0u8; 12];
    host.memory.peek_bytes(area.vaddr, &mut copied).unwrap();
    assert_eq!(copied, [1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0]);
}

#[test]
fn test_unknown_context_is_reported() {
    let mut host = TestHost::new();
    let err = host.ppu.wake(0xDEAD, &mut host.scheduler).unwrap_err();
    assert!(matches!(
        err,
        EmulatorError::UnknownHandle { kind: "context", id: 0xDEAD }
    ));
    assert!(err.is_fatal());
}

#[test]
fn test_join_running_context_blocks_until_exit() {
    let mut host = TestHost::new();
    let main = host.boot();
    let worker = host.spawn("worker", ContextStatus::Running);
    let slot = host.memory.alloc(PAGE_SIZE, 0, false, PAGE_SIZE).unwrap().vaddr;

    let joined = host
        .ppu
        .join(main, worker, Some(slot), &mut host.scheduler)
        .unwrap();
    assert_eq!(joined, None);
    assert_eq!(host.status(main), ContextStatus::Waiting);

    host.advance(0).unwrap();
    assert_eq!(host.ppu.active(), Some(worker));

    host.ppu
        .exit(worker, 42, &mut host.memory, &mut host.scheduler)
        .unwrap();
    host.advance(0).unwrap();

    assert_eq!(host.status(worker), ContextStatus::Terminated);
    assert_eq!(host.status(main), ContextStatus::Running);
    assert_eq!(host.ppu.context(main).unwrap().join_result, Some(42));
    assert_eq!(host.memory.read::<u64>(slot).unwrap(), 42);
    assert_eq!(host.ppu.active(), Some(main));
}

#[test]
fn test_join_terminated_context_returns_immediately() {
    let mut host = TestHost::new();
    let main = host.boot();
    let worker = host.spawn("worker", ContextStatus::Running);
    host.ppu
        .exit(worker, 7, &mut host.memory, &mut host.scheduler)
        .unwrap();

    let joined = host.ppu.join(main, worker, None, &mut host.scheduler).unwrap();
    assert_eq!(joined, Some(7));
    assert_eq!(host.status(main), ContextStatus::Running);
}

#[test]
fn test_second_joiner_is_rejected() {
    let mut host = TestHost::new();
    let a = host.spawn("a", ContextStatus::Running);
    let b = host.spawn("b", ContextStatus::Running);
    let target = host.spawn("target", ContextStatus::Running);

    host.ppu.join(a, target, None, &mut host.scheduler).unwrap();
    let err = host.ppu.join(b, target, None, &mut host.scheduler).unwrap_err();

    assert!(matches!(err, EmulatorError::JoinAlreadyPending { .. }));
    assert!(!err.is_fatal());
    assert_eq!(host.status(b), ContextStatus::Running);
}

#[test]
fn test_wake_terminated_is_ignored() {
    let mut host = TestHost::new();
    let id = host.spawn("done", ContextStatus::Running);
    host.ppu
        .exit(id, 0, &mut host.memory, &mut host.scheduler)
        .unwrap();

    host.ppu.wake(id, &mut host.scheduler).unwrap();
    assert_eq!(host.status(id), ContextStatus::Terminated);
}
