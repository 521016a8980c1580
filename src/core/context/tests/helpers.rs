// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut

//! Minimal host owning one PPU manager

use super::*;
use crate::core::config::MachineConfig;
use crate::core::timing::SchedulerHost;

pub const ENTRY: u64 = 0x0001_0000;

pub struct TestHost {
    pub memory: AddressSpace,
    pub scheduler: Scheduler<TestHost>,
    pub ppu: ContextManager<PpuRegisters, TestHost>,
}

fn ppu_parts(host: &mut TestHost) -> ContextParts<'_, PpuRegisters, TestHost> {
    ContextParts {
        manager: &mut host.ppu,
        memory: &mut host.memory,
        scheduler: &mut host.scheduler,
    }
}

impl SchedulerHost for TestHost {
    fn scheduler_mut(&mut self) -> &mut Scheduler<Self> {
        &mut self.scheduler
    }
}

impl TestHost {
    pub fn new() -> Self {
        let config = MachineConfig::compact();
        Self {
            memory: AddressSpace::new(&config.memory),
            scheduler: Scheduler::new(&config.timing),
            ppu: ContextManager::new(
                Family::Ppu,
                config.threads.default_stack_size,
                Some(config.memory.stack_base),
                ppu_parts,
            ),
        }
    }

    /// Create a context that starts in `status`
    pub fn spawn(&mut self, name: &str, status: ContextStatus) -> ContextId {
        let spec = ContextSpec::new(name, Entry::Direct(ENTRY)).with_status(status);
        self.ppu.create(spec, &mut self.memory).unwrap()
    }

    /// Create the boot context
    pub fn boot(&mut self) -> ContextId {
        let spec = ContextSpec::new("main", Entry::Direct(ENTRY)).boot();
        self.ppu.create(spec, &mut self.memory).unwrap()
    }

    pub fn status(&self, id: ContextId) -> ContextStatus {
        self.ppu.status_of(id).unwrap()
    }
}
