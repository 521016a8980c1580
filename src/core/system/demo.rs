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

//! Built-in workload for smoke runs and benchmarks
//!
//! [`AtomicCounter`] is a two-instruction loop that increments a shared
//! big-endian `u32` with a line reservation: a load-reserved of the whole
//! line, then a conditional store. After each successful increment the
//! context sleeps; after `iterations` increments it exits.
//!
//! Progress is kept in the register file (`arg(1)` counts increments,
//! `arg(2)` holds the loaded value) so that context switches preserve it.

use super::System;
use crate::core::context::{ContextId, ContextSpec, ContextStatus, Entry, Family, RegisterState};
use crate::core::error::Result;
use crate::core::memory::layout::{line_of, LINE_SIZE};

/// Entry point given to demo contexts
pub const DEMO_ENTRY: u64 = 0x0001_0000;

/// Shared-counter increment loop for one interpreter family
#[derive(Debug, Clone)]
pub struct AtomicCounter {
    pub family: Family,
    /// Guest address of the counter; must not straddle a line
    pub counter: u64,
    pub iterations: u64,
    /// Sleep between increments
    pub pause_us: u64,
    /// Conditional stores that failed
    pub failed_commits: u64,
}

impl AtomicCounter {
    pub fn new(family: Family, counter: u64, iterations: u64) -> Self {
        Self {
            family,
            counter,
            iterations,
            pause_us: 10,
            failed_commits: 0,
        }
    }

    /// Spawn `count` contexts running this loop; the first one boots
    pub fn spawn(&self, system: &mut System, count: usize) -> Result<Vec<ContextId>> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let name = format!("{}-counter-{}", self.family.name().to_lowercase(), i);
            let spec = ContextSpec::new(name, Entry::Direct(DEMO_ENTRY)).with_arg(i as u64);
            let spec = if i == 0 {
                spec.boot()
            } else {
                spec.with_status(ContextStatus::Running)
            };
            ids.push(system.spawn_context(self.family, spec)?);
        }
        Ok(ids)
    }

    fn load_state(&self, system: &System) -> (u64, u64, u64) {
        match self.family {
            Family::Ppu => state_of(system.ppu().registers()),
            Family::Spu => state_of(system.spu().registers()),
        }
    }

    fn store_state(&self, system: &mut System, pc: u64, done: u64, loaded: u64) {
        match self.family {
            Family::Ppu => set_state(system.ppu_mut().registers_mut(), pc, done, loaded),
            Family::Spu => set_state(system.spu_mut().registers_mut(), pc, done, loaded),
        }
    }
}

fn state_of<R: RegisterState>(regs: &R) -> (u64, u64, u64) {
    (regs.pc(), regs.arg(1), regs.arg(2))
}

fn set_state<R: RegisterState>(regs: &mut R, pc: u64, done: u64, loaded: u64) {
    regs.set_pc(pc);
    regs.set_arg(1, done);
    regs.set_arg(2, loaded);
}

impl super::GuestCpu for AtomicCounter {
    fn step(&mut self, system: &mut System) -> Result<()> {
        let Some(id) = system.current_context_id(self.family) else {
            return Ok(());
        };
        let (pc, mut done, loaded) = self.load_state(system);
        let line = line_of(self.counter);
        let offset = (self.counter - line) as usize;

        // Even pc: load reserved
        if pc.wrapping_sub(DEMO_ENTRY) % 8 == 0 {
            let data = system.load_reserved_line(id, line)?;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[offset..offset + 4]);
            self.store_state(system, pc + 4, done, u64::from(u32::from_be_bytes(raw)));
            return Ok(());
        }

        // Odd pc: conditional store, then branch back
        let mut data = [0u8; LINE_SIZE as usize];
        system.read_bytes(line, &mut data)?;
        data[offset..offset + 4].copy_from_slice(&(loaded as u32).wrapping_add(1).to_be_bytes());

        if !system.store_conditional_line(id, line, &data)? {
            self.failed_commits += 1;
            self.store_state(system, DEMO_ENTRY, done, loaded);
            return Ok(());
        }

        done += 1;
        self.store_state(system, DEMO_ENTRY, done, loaded);
        if done >= self.iterations {
            system.exit(id, done)
        } else {
            system.sleep(id, self.pause_us)
        }
    }
}
