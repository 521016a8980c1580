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

//! System integration module
//!
//! This module ties together the address space, the reservation table, the
//! virtual clock and the two context families, and provides the main
//! emulation loop. Instruction interpreters are external; they plug in
//! through [`GuestCpu`] and use the `System` API for memory and OS services.

pub mod demo;

#[cfg(test)]
mod tests;

use super::config::MachineConfig;
use super::context::{
    ContextId, ContextManager, ContextParts, ContextSpec, ContextStatus, ContextSummary, EventFlags, Family,
    PpuRegisters, RegisterState, SpuRegisters,
};
use super::error::{EmulatorError, Result};
use super::memory::layout::LINE_SIZE;
use super::memory::{AddressSpace, GuestValue, MapEntry, MemoryStats};
use super::reservation::{LossCause, ReservationTable, SharedReservations};
use super::timing::{Cycle, EventHandle, Scheduler, SchedulerHost};
use serde::Serialize;

/// An instruction interpreter
///
/// `step` executes one instruction of the active context of its family.
/// The live register file is reachable through [`System::ppu_mut`] /
/// [`System::spu_mut`].
pub trait GuestCpu {
    fn step(&mut self, system: &mut System) -> Result<()>;
}

impl<F> GuestCpu for F
where
    F: FnMut(&mut System) -> Result<()>,
{
    fn step(&mut self, system: &mut System) -> Result<()> {
        self(system)
    }
}

/// How a call to [`System::run`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// The requested number of cycles elapsed
    Completed,
    /// No context is runnable and no event is queued
    Idle,
    /// A fatal error stopped emulation earlier
    Halted,
}

/// Snapshot of the whole machine, for reports
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cycles: Cycle,
    pub steps: u64,
    pub pending_events: usize,
    pub reservations: usize,
    pub memory: MemoryStats,
    pub ppu: Vec<ContextSummary>,
    pub spu: Vec<ContextSummary>,
}

/// Runs `$body` with `$mgr` bound to the manager owning context `$id`
macro_rules! with_manager {
    ($self:ident, $id:expr, $mgr:ident => $body:expr) => {
        match Family::of($id) {
            Some(Family::Ppu) => {
                let $mgr = &mut $self.ppu;
                $body
            }
            Some(Family::Spu) => {
                let $mgr = &mut $self.spu;
                $body
            }
            None => Err(EmulatorError::UnknownHandle {
                kind: "context",
                id: $id,
            }),
        }
    };
}

/// The emulated machine
///
/// # Example
/// ```
/// use cellrx::core::config::MachineConfig;
/// use cellrx::core::system::System;
///
/// let mut system = System::new(MachineConfig::compact()).unwrap();
/// let entry = system.allocate(0x10000, None, false, 0x10000).unwrap();
/// system.write::<u32>(entry.vaddr, 0xDEADBEEF).unwrap();
/// assert_eq!(system.read::<u32>(entry.vaddr).unwrap(), 0xDEADBEEF);
/// ```
pub struct System {
    memory: AddressSpace,
    scheduler: Scheduler<System>,
    reservations: SharedReservations,
    ppu: ContextManager<PpuRegisters, System>,
    spu: ContextManager<SpuRegisters, System>,
    config: MachineConfig,
    /// Interpreter steps executed
    steps: u64,
    halted: bool,
}

fn ppu_parts(system: &mut System) -> ContextParts<'_, PpuRegisters, System> {
    ContextParts {
        manager: &mut system.ppu,
        memory: &mut system.memory,
        scheduler: &mut system.scheduler,
    }
}

fn spu_parts(system: &mut System) -> ContextParts<'_, SpuRegisters, System> {
    ContextParts {
        manager: &mut system.spu,
        memory: &mut system.memory,
        scheduler: &mut system.scheduler,
    }
}

/// Active context of an enabled manager, with its pc, if it may run now
///
/// A context that blocked earlier in the cycle stays active until the
/// pending reschedule fires; it must not execute meanwhile.
fn runnable_active<R: RegisterState + 'static>(manager: &ContextManager<R, System>) -> Option<(ContextId, u64)> {
    let id = manager.active().filter(|_| manager.is_enabled())?;
    let ctx = manager.context(id).ok()?;
    ctx.is_runnable().then(|| (id, manager.registers().pc()))
}

impl SchedulerHost for System {
    fn scheduler_mut(&mut self) -> &mut Scheduler<Self> {
        &mut self.scheduler
    }

    /// Callbacks may write guest memory; report the reservations they broke
    fn after_event(&mut self) -> Result<()> {
        self.dispatch_reservation_losses()
    }
}

impl System {
    /// Create a system from a validated configuration
    pub fn new(config: MachineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: MachineConfig) -> Self {
        log::info!(
            "System: {} MiB main RAM, {} MHz guest clock",
            config.memory.main_size >> 20,
            config.timing.cpu_frequency / 1_000_000
        );

        Self {
            memory: AddressSpace::new(&config.memory),
            scheduler: Scheduler::new(&config.timing),
            reservations: ReservationTable::new_shared(),
            ppu: ContextManager::new(
                Family::Ppu,
                config.threads.default_stack_size,
                Some(config.memory.stack_base),
                ppu_parts,
            ),
            spu: ContextManager::new(Family::Spu, config.threads.default_stack_size, None, spu_parts),
            config,
            steps: 0,
            halted: false,
        }
    }

    /// Reset the system to its power-on state
    ///
    /// Drops every context, mapping, reservation and pending event.
    pub fn reset(&mut self) {
        self.reservations.borrow_mut().clear(&mut self.memory);
        self.memory.reset();
        self.scheduler.reset();
        self.ppu.reset();
        self.spu.reset();
        self.steps = 0;
        self.halted = false;
        log::info!("System reset");
    }

    // ----- Execution -----------------------------------------------------

    /// Execute one instruction per enabled family, then one virtual cycle
    ///
    /// # Errors
    ///
    /// A fatal error is returned as `EmulatorError::Halted`; the system
    /// refuses to step afterwards.
    pub fn step(&mut self, ppu: &mut dyn GuestCpu, spu: &mut dyn GuestCpu) -> Result<()> {
        if self.halted {
            return Ok(());
        }

        if let Some((id, pc)) = runnable_active(&self.ppu) {
            self.step_family(ppu, Family::Ppu, id, pc)?;
        }

        if let Some((id, pc)) = runnable_active(&self.spu) {
            self.step_family(spu, Family::Spu, id, pc)?;
        }

        self.steps += 1;
        if let Err(e) = self.advance(1) {
            return Err(self.halt("scheduler", 0, 0, e));
        }
        Ok(())
    }

    fn step_family(&mut self, cpu: &mut dyn GuestCpu, family: Family, id: ContextId, pc: u64) -> Result<()> {
        self.memory.set_accessor(Some(id));
        let result = match cpu.step(self) {
            Ok(()) => self.dispatch_reservation_losses(),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if !e.is_fatal() => {
                log::warn!("{} context {:#x} at 0x{:08X}: {}", family, id, pc, e);
                Ok(())
            }
            Err(e) => Err(self.halt(family.name(), id, pc, e)),
        }
    }

    /// Run for `cycles` virtual cycles
    ///
    /// While no family is enabled the clock jumps straight to the next event.
    pub fn run(&mut self, ppu: &mut dyn GuestCpu, spu: &mut dyn GuestCpu, cycles: Cycle) -> Result<RunOutcome> {
        if self.halted {
            return Ok(RunOutcome::Halted);
        }

        let target = self.scheduler.now().saturating_add(cycles);
        while self.scheduler.now() < target {
            if self.ppu.is_enabled() || self.spu.is_enabled() {
                self.step(ppu, spu)?;
                continue;
            }

            match self.scheduler.next_event_time() {
                None => {
                    log::info!("System idle at cycle {}", self.scheduler.now());
                    return Ok(RunOutcome::Idle);
                }
                Some(next) if next > target => {
                    let remaining = target - self.scheduler.now();
                    self.scheduler.tick(remaining);
                }
                Some(_) => {
                    if let Err(e) = self.skip_to_next_event() {
                        return Err(self.halt("scheduler", 0, 0, e));
                    }
                }
            }
        }
        Ok(RunOutcome::Completed)
    }

    fn halt(&mut self, family: &'static str, context: ContextId, pc: u64, error: EmulatorError) -> EmulatorError {
        self.halted = true;
        let error = match error {
            halted @ EmulatorError::Halted { .. } => halted,
            source => EmulatorError::Halted {
                family,
                context,
                pc,
                source: Box::new(source),
            },
        };
        log::error!("{}", error);
        error
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    // ----- Memory --------------------------------------------------------

    pub fn read<T: GuestValue>(&mut self, vaddr: u64) -> Result<T> {
        self.memory.read(vaddr)
    }

    pub fn write<T: GuestValue>(&mut self, vaddr: u64, value: T) -> Result<()> {
        self.memory.write(vaddr, value)?;
        self.dispatch_reservation_losses()
    }

    pub fn read_bytes(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<()> {
        self.memory.read_bytes(vaddr, buf)
    }

    pub fn write_bytes(&mut self, vaddr: u64, data: &[u8]) -> Result<()> {
        self.memory.write_bytes(vaddr, data)?;
        self.dispatch_reservation_losses()
    }

    /// Allocate and map main RAM
    ///
    /// `preferred` is the lowest acceptable virtual address.
    pub fn allocate(&mut self, size: u64, preferred: Option<u64>, system: bool, alignment: u64) -> Result<MapEntry> {
        self.memory
            .alloc(size, preferred.unwrap_or(0), system, alignment)
            .inspect_err(|e| log::warn!("allocate(0x{:X}): {}", size, e))
    }

    pub fn free(&mut self, handle: u64) -> Result<()> {
        self.memory.free(handle)
    }

    pub fn can_allocate(&self, size: u64) -> bool {
        self.memory.can_alloc(size)
    }

    pub fn available_bytes(&self) -> u64 {
        self.memory.available_mem()
    }

    // ----- Reservations --------------------------------------------------

    pub fn reserve(&mut self, owner: u64, vaddr: u64) -> Result<()> {
        self.reservations
            .borrow_mut()
            .reserve(&mut self.memory, owner, vaddr)
    }

    /// Reserve the line containing `vaddr` and return its contents
    pub fn load_reserved_line(&mut self, owner: u64, vaddr: u64) -> Result<[u8; LINE_SIZE as usize]> {
        self.reserve(owner, vaddr)?;
        let snapshot = self.reservations.borrow().reservation(owner).map(|r| r.snapshot);
        snapshot.ok_or_else(|| EmulatorError::InvalidReservationState {
            owner,
            reason: "reservation vanished after reserve".to_string(),
        })
    }

    /// Conditional-store check; consumes the reservation of `owner`
    pub fn try_commit(&mut self, owner: u64, vaddr: u64) -> Result<bool> {
        let acquired = self.reservations.borrow_mut().try_acquire(owner, vaddr);
        self.dispatch_reservation_losses()?;
        self.reservations
            .borrow_mut()
            .release_idle_lines(&mut self.memory);
        Ok(acquired)
    }

    /// Store a whole line if `owner` still holds its reservation
    ///
    /// # Errors
    ///
    /// `InvalidReservationState` if `vaddr` is not line aligned.
    pub fn store_conditional_line(&mut self, owner: u64, vaddr: u64, data: &[u8; LINE_SIZE as usize]) -> Result<bool> {
        if vaddr % LINE_SIZE != 0 {
            return Err(EmulatorError::InvalidReservationState {
                owner,
                reason: format!("conditional store to unaligned line 0x{:08X}", vaddr),
            });
        }
        if !self.try_commit(owner, vaddr)? {
            return Ok(false);
        }

        let previous = self.memory.accessor();
        self.memory.set_accessor(Some(owner));
        let written = self.memory.write_bytes(vaddr, data);
        self.memory.set_accessor(previous);
        written?;

        self.dispatch_reservation_losses()?;
        Ok(true)
    }

    pub fn drop_reservation(&mut self, owner: u64) -> bool {
        let mut reservations = self.reservations.borrow_mut();
        let dropped = reservations.invalidate(owner);
        reservations.release_idle_lines(&mut self.memory);
        dropped
    }

    /// Turn queued reservation losses into scheduler events
    fn dispatch_reservation_losses(&mut self) -> Result<()> {
        let lost = self.reservations.borrow_mut().take_lost();
        if lost.is_empty() {
            return Ok(());
        }

        for loss in lost {
            let delay = match loss.cause {
                LossCause::Written => self.config.timing.reservation_written_delay,
                LossCause::Committed => self.config.timing.reservation_committed_delay,
            };
            let owner = loss.owner;
            self.scheduler
                .schedule(delay, format!("reservation lost {}", owner), move |system: &mut System| {
                    system.notify_reservation_lost(owner)
                })?;
        }

        self.reservations
            .borrow_mut()
            .release_idle_lines(&mut self.memory);
        Ok(())
    }

    fn notify_reservation_lost(&mut self, owner: u64) -> Result<()> {
        if Family::of(owner).is_none() {
            log::debug!("Reservation lost by non-context owner {:#x}", owner);
            return Ok(());
        }
        self.raise_events(owner, EventFlags::LOCKLINE_LOST)
    }

    // ----- Contexts ------------------------------------------------------

    pub fn spawn_context(&mut self, family: Family, spec: ContextSpec) -> Result<ContextId> {
        let id = match family {
            Family::Ppu => self.ppu.create(spec, &mut self.memory)?,
            Family::Spu => self.spu.create(spec, &mut self.memory)?,
        };
        // TLS images are copied into guest memory
        self.dispatch_reservation_losses()?;
        Ok(id)
    }

    pub fn sleep(&mut self, id: ContextId, us: u64) -> Result<()> {
        with_manager!(self, id, mgr => mgr.sleep(id, us, &mut self.scheduler))
    }

    pub fn wait(&mut self, id: ContextId, reason: &str) -> Result<()> {
        with_manager!(self, id, mgr => mgr.wait(id, reason, &mut self.scheduler))
    }

    pub fn wait_with_timeout(&mut self, id: ContextId, reason: &str, us: u64) -> Result<()> {
        with_manager!(self, id, mgr => mgr.wait_with_timeout(id, reason, us, &mut self.scheduler))
    }

    pub fn wake(&mut self, id: ContextId) -> Result<()> {
        with_manager!(self, id, mgr => mgr.wake(id, &mut self.scheduler))
    }

    pub fn join(&mut self, waiter: ContextId, target: ContextId, result_ptr: Option<u64>) -> Result<Option<u64>> {
        with_manager!(self, target, mgr => mgr.join(waiter, target, result_ptr, &mut self.scheduler))
    }

    pub fn exit(&mut self, id: ContextId, value: u64) -> Result<()> {
        with_manager!(self, id, mgr => mgr.exit(id, value, &mut self.memory, &mut self.scheduler))?;
        // Join results are stored in guest memory
        self.dispatch_reservation_losses()
    }

    pub fn raise_events(&mut self, id: ContextId, flags: EventFlags) -> Result<()> {
        with_manager!(self, id, mgr => mgr.raise_events(id, flags, &mut self.scheduler))
    }

    pub fn wait_for_events(&mut self, id: ContextId, mask: EventFlags) -> Result<EventFlags> {
        with_manager!(self, id, mgr => mgr.wait_for_events(id, mask, &mut self.scheduler))
    }

    pub fn acknowledge_events(&mut self, id: ContextId, flags: EventFlags) -> Result<()> {
        with_manager!(self, id, mgr => mgr.acknowledge_events(id, flags))
    }

    pub fn write_inbound(&mut self, id: ContextId, value: u32) -> Result<bool> {
        with_manager!(self, id, mgr => mgr.write_inbound(id, value, &mut self.scheduler))
    }

    pub fn read_inbound(&mut self, id: ContextId) -> Result<Option<u32>> {
        with_manager!(self, id, mgr => mgr.read_inbound(id, &mut self.scheduler))
    }

    /// Ask `family` to switch to its next runnable context
    pub fn reschedule(&mut self, family: Family) -> Result<()> {
        match family {
            Family::Ppu => self.ppu.reschedule(&mut self.scheduler),
            Family::Spu => self.spu.reschedule(&mut self.scheduler),
        }
    }

    pub fn current_context_id(&self, family: Family) -> Option<ContextId> {
        match family {
            Family::Ppu => self.ppu.active(),
            Family::Spu => self.spu.active(),
        }
    }

    pub fn status_of(&self, id: ContextId) -> Result<ContextStatus> {
        match Family::of(id) {
            Some(Family::Ppu) => self.ppu.status_of(id),
            Some(Family::Spu) => self.spu.status_of(id),
            None => Err(EmulatorError::UnknownHandle { kind: "context", id }),
        }
    }

    // ----- Clock ---------------------------------------------------------

    pub fn schedule_after<F>(&mut self, delay: Cycle, name: &str, callback: F) -> Result<EventHandle>
    where
        F: FnOnce(&mut System) -> Result<()> + 'static,
    {
        self.scheduler.schedule(delay, name, callback)
    }

    pub fn cancel_named(&mut self, name: &str) -> usize {
        self.scheduler.cancel_all_named(name)
    }

    pub fn advance_clock(&mut self, cycles: Cycle) -> Result<()> {
        self.advance(cycles)
    }

    pub fn us_to_cycles(&self, us: u64) -> Cycle {
        self.scheduler.us_to_cycles(us)
    }

    // ----- Accessors -----------------------------------------------------

    /// Current virtual time
    pub fn cycles(&self) -> Cycle {
        self.scheduler.now()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut AddressSpace {
        &mut self.memory
    }

    pub fn scheduler(&self) -> &Scheduler<System> {
        &self.scheduler
    }

    pub fn reservations(&self) -> SharedReservations {
        self.reservations.clone()
    }

    pub fn ppu(&self) -> &ContextManager<PpuRegisters, System> {
        &self.ppu
    }

    pub fn ppu_mut(&mut self) -> &mut ContextManager<PpuRegisters, System> {
        &mut self.ppu
    }

    pub fn spu(&self) -> &ContextManager<SpuRegisters, System> {
        &self.spu
    }

    pub fn spu_mut(&mut self) -> &mut ContextManager<SpuRegisters, System> {
        &mut self.spu
    }

    pub fn stats(&self) -> SystemStats {
        SystemStats {
            cycles: self.scheduler.now(),
            steps: self.steps,
            pending_events: self.scheduler.pending(),
            reservations: self.reservations.borrow().len(),
            memory: self.memory.stats(),
            ppu: self.ppu.summaries(),
            spu: self.spu.summaries(),
        }
    }
}

impl Default for System {
    fn default() -> Self {
        Self::build(MachineConfig::default())
    }
}
