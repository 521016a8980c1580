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

//! Cooperative execution contexts
//!
//! Each interpreter family (PPU, SPU) has one physical interpreter and many
//! logical contexts. A [`ContextManager`] owns the contexts of one family,
//! the interpreter's live register file and the id of the active context.
//!
//! # Scheduling
//!
//! Status changes never switch contexts directly. They request a
//! reschedule, which is a scheduler event at delay 0; when it fires the
//! manager picks the next runnable context round robin and swaps register
//! files. With nothing runnable the interpreter is disabled until a context
//! is woken again.
//!
//! Scheduler callbacks reach the manager through a [`Locator`], a plain
//! function that borrows the manager, the address space and the scheduler
//! out of the host.

mod registers;
mod thread;

#[cfg(test)]
mod tests;

pub use registers::{PpuRegisters, RegisterState, SpuRegisters};
pub use thread::{
    Blocker, ContextId, ContextSpec, ContextStatus, Entry, EventFlags, ExecutionContext, Mailbox, TlsImage,
    ETIMEDOUT,
};

use crate::core::error::{EmulatorError, Result};
use crate::core::memory::layout::PAGE_SIZE;
use crate::core::memory::{AddressSpace, MapEntry, RegionId};
use crate::core::timing::{Cycle, Scheduler};
use serde::Serialize;
use std::fmt;

/// Name of the event that runs [`ContextManager::pick_next`] for `family`
pub fn reschedule_event(family: Family) -> String {
    format!("{} reschedule", family.name())
}

/// Name of the event ending a sleep of context `id`
pub fn wakeup_event(id: ContextId) -> String {
    format!("wakeup {}", id)
}

/// Name of the event ending a timed wait of context `id`
pub fn timeout_event(id: ContextId) -> String {
    format!("timeout {}", id)
}

/// Interpreter family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Family {
    Ppu,
    Spu,
}

impl Family {
    const ID_SPAN: ContextId = 0x0100_0000;

    pub fn name(self) -> &'static str {
        match self {
            Family::Ppu => "PPU",
            Family::Spu => "SPU",
        }
    }

    /// First context id handed out for this family
    pub fn id_base(self) -> ContextId {
        match self {
            Family::Ppu => 0x0100_0000,
            Family::Spu => 0x0200_0000,
        }
    }

    /// Family that issued `id`
    pub fn of(id: ContextId) -> Option<Family> {
        [Family::Ppu, Family::Spu]
            .into_iter()
            .find(|f| (f.id_base()..f.id_base() + Self::ID_SPAN).contains(&id))
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Disjoint borrows a scheduler callback needs from the host
pub struct ContextParts<'a, R: RegisterState, H> {
    pub manager: &'a mut ContextManager<R, H>,
    pub memory: &'a mut AddressSpace,
    pub scheduler: &'a mut Scheduler<H>,
}

/// Finds a family's manager inside the host
pub type Locator<R, H> = for<'a> fn(&'a mut H) -> ContextParts<'a, R, H>;

/// Per-context line of a status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSummary {
    pub id: ContextId,
    pub name: String,
    pub status: ContextStatus,
    pub pc: u64,
    pub wait_reason: Option<String>,
}

/// Contexts of one interpreter family
pub struct ContextManager<R: RegisterState, H> {
    family: Family,
    /// Creation order, which is also the round-robin order
    contexts: Vec<ExecutionContext<R>>,
    /// Live register file of the interpreter
    registers: R,
    enabled: bool,
    active: Option<ContextId>,
    next_id: ContextId,
    default_stack_size: u64,
    /// Virtual address where the active context's stack is mapped
    stack_window: Option<u64>,
    reschedule_pending: bool,
    locate: Locator<R, H>,
}

impl<R: RegisterState + 'static, H: 'static> ContextManager<R, H> {
    /// Create an empty manager
    ///
    /// With a `stack_window`, every context gets a stack in the stack region
    /// that is mapped at the window while the context is active.
    pub fn new(family: Family, default_stack_size: u64, stack_window: Option<u64>, locate: Locator<R, H>) -> Self {
        Self {
            family,
            contexts: Vec::new(),
            registers: R::default(),
            enabled: false,
            active: None,
            next_id: family.id_base(),
            default_stack_size,
            stack_window,
            reschedule_pending: false,
            locate,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Whether the interpreter has a context to run
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn active(&self) -> Option<ContextId> {
        self.active
    }

    /// Live register file of the interpreter
    pub fn registers(&self) -> &R {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut R {
        &mut self.registers
    }

    pub fn contexts(&self) -> &[ExecutionContext<R>] {
        &self.contexts
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn context(&self, id: ContextId) -> Result<&ExecutionContext<R>> {
        Ok(&self.contexts[self.index_of(id)?])
    }

    pub fn status_of(&self, id: ContextId) -> Result<ContextStatus> {
        Ok(self.context(id)?.status)
    }

    /// Current registers of `id`, live ones if it is active
    pub fn registers_of(&self, id: ContextId) -> Result<&R> {
        if self.active == Some(id) {
            return Ok(&self.registers);
        }
        Ok(&self.context(id)?.registers)
    }

    pub fn set_return_value(&mut self, id: ContextId, value: u64) -> Result<()> {
        self.registers_of_mut(id)?.set_return_value(value);
        Ok(())
    }

    pub fn summaries(&self) -> Vec<ContextSummary> {
        self.contexts
            .iter()
            .map(|ctx| ContextSummary {
                id: ctx.id,
                name: ctx.name.clone(),
                status: ctx.status,
                pc: self.registers_of(ctx.id).map_or(0, |r| r.pc()),
                wait_reason: ctx.wait_reason.clone(),
            })
            .collect()
    }

    fn index_of(&self, id: ContextId) -> Result<usize> {
        self.contexts
            .iter()
            .position(|ctx| ctx.id == id)
            .ok_or(EmulatorError::UnknownHandle { kind: "context", id })
    }

    fn ctx_mut(&mut self, id: ContextId) -> Result<&mut ExecutionContext<R>> {
        let idx = self.index_of(id)?;
        Ok(&mut self.contexts[idx])
    }

    fn registers_of_mut(&mut self, id: ContextId) -> Result<&mut R> {
        if self.active == Some(id) {
            return Ok(&mut self.registers);
        }
        Ok(&mut self.ctx_mut(id)?.registers)
    }

    // ----- Creation ------------------------------------------------------

    /// Create a context
    ///
    /// Allocates the stack (and TLS area, if any) and sets up the entry
    /// registers. A boot context is switched in immediately.
    pub fn create(&mut self, spec: ContextSpec, mem: &mut AddressSpace) -> Result<ContextId> {
        let id = self.next_id;

        let mut regs = R::default();
        match spec.entry {
            Entry::Direct(pc) => regs.set_pc(pc),
            Entry::Descriptor(addr) => {
                let pc = mem.read::<u32>(addr)?;
                let toc = mem.read::<u32>(addr + 4)?;
                regs.set_pc(u64::from(pc));
                regs.set_toc(u64::from(toc));
            }
        }
        regs.set_arg(0, spec.arg);

        let mut ctx = ExecutionContext::new(id, spec.name, spec.priority, spec.initial_status, regs);

        if let Some(window) = self.stack_window {
            let size = spec.stack_size.max(self.default_stack_size);
            let block = mem.alloc_phys_in(RegionId::STACK, size, false)?;
            ctx.registers.set_stack_pointer(window + block.size - 8);
            ctx.stack = Some(block);
        }

        if let Some(image) = spec.tls {
            match Self::init_tls(&image, mem) {
                Ok(area) => {
                    ctx.registers.set_tls(area.vaddr);
                    ctx.tls = Some(area);
                }
                Err(e) => {
                    if let Some(stack) = ctx.stack {
                        mem.free_phys(stack.handle)?;
                    }
                    return Err(e);
                }
            }
        }

        log::info!(
            "{}: created context {:#x} \"{}\" (entry 0x{:08X}, {})",
            self.family,
            id,
            ctx.name,
            ctx.registers.pc(),
            ctx.status
        );

        self.next_id += 1;
        self.contexts.push(ctx);

        if spec.boot {
            self.switch_to(id, mem)?;
        }
        Ok(id)
    }

    /// Allocate a TLS area, copy the initialised image and zero the rest
    fn init_tls(image: &TlsImage, mem: &mut AddressSpace) -> Result<MapEntry> {
        let file_size = image.file_size.min(image.mem_size);
        let mut data = vec![0u8; file_size as usize];
        mem.peek_bytes(image.vaddr, &mut data)?;

        let area = mem.alloc(image.mem_size.max(1), 0, false, PAGE_SIZE)?;
        mem.write_bytes(area.vaddr, &data)?;
        mem.fill(area.vaddr + file_size, (area.size - file_size) as usize)?;

        log::debug!(
            "TLS: 0x{:X} bytes at 0x{:08X} (image 0x{:X} bytes from 0x{:08X})",
            area.size,
            area.vaddr,
            file_size,
            image.vaddr
        );
        Ok(area)
    }

    // ----- Switching -----------------------------------------------------

    /// Request a context switch at the next scheduler run
    ///
    /// Requests coalesce while the event is queued. A request whose event
    /// was cancelled by name is issued again.
    pub fn reschedule(&mut self, scheduler: &mut Scheduler<H>) -> Result<()> {
        let name = reschedule_event(self.family);
        if self.reschedule_pending {
            if scheduler.is_pending(&name) {
                return Ok(());
            }
            log::debug!("{}: reschedule event was cancelled, requesting again", self.family);
        }

        let locate = self.locate;
        scheduler.schedule(0, &name, move |host: &mut H| {
            let parts = locate(host);
            parts.manager.reschedule_pending = false;
            parts.manager.pick_next(parts.memory)
        })?;
        self.reschedule_pending = true;
        Ok(())
    }

    /// Activate the next runnable context after the active one
    ///
    /// With nothing runnable the interpreter is disabled and its registers
    /// are saved into the context that was active.
    pub fn pick_next(&mut self, mem: &mut AddressSpace) -> Result<()> {
        let count = self.contexts.len();
        let start = match self.active {
            Some(id) => self.index_of(id)? + 1,
            None => 0,
        };

        let next = (0..count)
            .map(|k| (start + k) % count)
            .find(|&i| self.contexts[i].is_runnable());

        match next {
            Some(idx) => {
                let id = self.contexts[idx].id;
                self.switch_to(id, mem)
            }
            None => {
                if let Some(id) = self.active.take() {
                    let idx = self.index_of(id)?;
                    self.contexts[idx].registers = self.registers.clone();
                    log::debug!(
                        "{}: no runnable context, disabling (pc was 0x{:08X})",
                        self.family,
                        self.registers.pc()
                    );
                }
                self.enabled = false;
                Ok(())
            }
        }
    }

    /// Make `id` the active context
    pub fn switch_to(&mut self, id: ContextId, mem: &mut AddressSpace) -> Result<()> {
        let idx = self.index_of(id)?;
        self.enabled = true;
        if self.active == Some(id) {
            return Ok(());
        }

        if let Some(current) = self.active {
            let cur = self.index_of(current)?;
            self.contexts[cur].registers = self.registers.clone();
            log::debug!(
                "{}: switched from {:#x} \"{}\" to {:#x} \"{}\"",
                self.family,
                current,
                self.contexts[cur].name,
                id,
                self.contexts[idx].name
            );
        } else {
            log::debug!("{}: switched to {:#x} \"{}\"", self.family, id, self.contexts[idx].name);
        }

        self.registers = self.contexts[idx].registers.clone();

        if let (Some(window), Some(stack)) = (self.stack_window, self.contexts[idx].stack) {
            mem.unmap(window);
            mem.map_in(RegionId::STACK, window, stack.start, stack.size, true)?;
        }

        self.active = Some(id);
        mem.set_accessor(Some(id));
        Ok(())
    }

    // ----- Blocking ------------------------------------------------------

    /// Sleep for `us` microseconds of guest time
    pub fn sleep(&mut self, id: ContextId, us: u64, scheduler: &mut Scheduler<H>) -> Result<()> {
        let cycles = scheduler.us_to_cycles(us);
        self.sleep_cycles(id, cycles, scheduler)
    }

    pub fn sleep_cycles(&mut self, id: ContextId, cycles: Cycle, scheduler: &mut Scheduler<H>) -> Result<()> {
        self.index_of(id)?;
        let locate = self.locate;
        scheduler.schedule(cycles, wakeup_event(id), move |host: &mut H| {
            let parts = locate(host);
            parts.manager.wake(id, parts.scheduler)
        })?;

        self.ctx_mut(id)?.status = ContextStatus::Sleeping;
        log::debug!("{}: context {:#x} sleeping for {} cycles", self.family, id, cycles);
        self.reschedule(scheduler)
    }

    /// Block until woken
    pub fn wait(&mut self, id: ContextId, reason: impl Into<String>, scheduler: &mut Scheduler<H>) -> Result<()> {
        let family = self.family;
        let ctx = self.ctx_mut(id)?;
        ctx.status = ContextStatus::Waiting;
        ctx.wait_reason = Some(reason.into());
        log::debug!(
            "{}: context {:#x} \"{}\" waiting ({})",
            family,
            id,
            ctx.name,
            ctx.wait_reason.as_deref().unwrap_or_default()
        );
        self.reschedule(scheduler)
    }

    /// Block until woken or until `us` microseconds pass
    ///
    /// On expiry the context resumes with `timed_out` set and `ETIMEDOUT`
    /// in its return register.
    pub fn wait_with_timeout(
        &mut self,
        id: ContextId,
        reason: impl Into<String>,
        us: u64,
        scheduler: &mut Scheduler<H>,
    ) -> Result<()> {
        self.index_of(id)?;
        let cycles = scheduler.us_to_cycles(us);
        let locate = self.locate;
        scheduler.schedule(cycles, timeout_event(id), move |host: &mut H| {
            let parts = locate(host);
            parts.manager.time_out(id, parts.scheduler)
        })?;

        self.ctx_mut(id)?.timed_out = false;
        self.wait(id, reason, scheduler)
    }

    fn time_out(&mut self, id: ContextId, scheduler: &mut Scheduler<H>) -> Result<()> {
        let ctx = self.ctx_mut(id)?;
        if ctx.status == ContextStatus::Terminated {
            return Ok(());
        }
        ctx.timed_out = true;
        self.set_return_value(id, ETIMEDOUT)?;
        log::debug!("{}: context {:#x} timed out", self.family, id);
        self.wake(id, scheduler)
    }

    /// Make `id` runnable again
    ///
    /// Cancels its pending wakeup and timeout. Terminated contexts stay
    /// terminated.
    pub fn wake(&mut self, id: ContextId, scheduler: &mut Scheduler<H>) -> Result<()> {
        let family = self.family;
        let ctx = self.ctx_mut(id)?;
        if ctx.status == ContextStatus::Terminated {
            log::debug!("{}: ignoring wake of terminated context {:#x}", family, id);
            return Ok(());
        }

        ctx.status = ContextStatus::Running;
        ctx.wait_reason = None;
        ctx.blocked_on = None;
        log::debug!("{}: woke context {:#x} \"{}\"", family, id, ctx.name);

        scheduler.cancel_all_named(&wakeup_event(id));
        scheduler.cancel_all_named(&timeout_event(id));
        self.reschedule(scheduler)
    }

    /// Wait for `target` to exit
    ///
    /// Returns the exit value right away when `target` already terminated;
    /// otherwise `waiter` blocks and `None` is returned. The exit value is
    /// later stored in the waiter's `join_result` and, if given, at
    /// `result_ptr` in guest memory.
    ///
    /// # Errors
    ///
    /// `JoinAlreadyPending` if another context is already joining `target`.
    pub fn join(
        &mut self,
        waiter: ContextId,
        target: ContextId,
        result_ptr: Option<u64>,
        scheduler: &mut Scheduler<H>,
    ) -> Result<Option<u64>> {
        self.index_of(waiter)?;
        let joined = self.ctx_mut(target)?;
        if joined.status == ContextStatus::Terminated {
            return Ok(Some(joined.exit_value.unwrap_or(0)));
        }
        if let Some(existing) = joined.waiter {
            if existing != waiter {
                log::warn!(
                    "Context {:#x} tried to join {:#x}, already joined by {:#x}",
                    waiter,
                    target,
                    existing
                );
                return Err(EmulatorError::JoinAlreadyPending { target, waiter });
            }
        }
        joined.waiter = Some(waiter);
        joined.join_ptr = result_ptr;
        let reason = format!("joining context \"{}\"", joined.name);

        let ctx = self.ctx_mut(waiter)?;
        ctx.join_result = None;
        ctx.blocked_on = Some(Blocker::Join(target));
        self.wait(waiter, reason, scheduler)?;
        Ok(None)
    }

    /// Terminate `id` and hand its exit value to a joiner
    pub fn exit(
        &mut self,
        id: ContextId,
        value: u64,
        mem: &mut AddressSpace,
        scheduler: &mut Scheduler<H>,
    ) -> Result<()> {
        let family = self.family;
        let ctx = self.ctx_mut(id)?;
        ctx.status = ContextStatus::Terminated;
        ctx.exit_value = Some(value);
        ctx.wait_reason = None;
        ctx.blocked_on = None;
        let waiter = ctx.waiter.take();
        let result_ptr = ctx.join_ptr.take();
        log::info!("{}: context {:#x} \"{}\" exited with {:#x}", family, id, ctx.name, value);

        scheduler.cancel_all_named(&wakeup_event(id));
        scheduler.cancel_all_named(&timeout_event(id));
        self.reschedule(scheduler)?;

        if let Some(waiter) = waiter {
            if let Some(ptr) = result_ptr {
                mem.write::<u64>(ptr, value)?;
            }
            self.ctx_mut(waiter)?.join_result = Some(value);
            self.wake(waiter, scheduler)?;
        }
        Ok(())
    }

    // ----- Events and mailbox --------------------------------------------

    /// Raise event bits; wakes `id` if it waits on one of them
    pub fn raise_events(&mut self, id: ContextId, flags: EventFlags, scheduler: &mut Scheduler<H>) -> Result<()> {
        let ctx = self.ctx_mut(id)?;
        ctx.events |= flags;
        let wake = ctx.status == ContextStatus::Waiting
            && ctx.blocked_on == Some(Blocker::Events)
            && !ctx.pending_events().is_empty();
        log::trace!("{}: context {:#x} events {:?}", self.family, id, flags);

        if wake {
            self.wake(id, scheduler)?;
        }
        Ok(())
    }

    /// Select events with `mask` and block unless one is already raised
    ///
    /// Returns the raised events under the mask; empty means the context is
    /// now waiting.
    pub fn wait_for_events(
        &mut self,
        id: ContextId,
        mask: EventFlags,
        scheduler: &mut Scheduler<H>,
    ) -> Result<EventFlags> {
        let ctx = self.ctx_mut(id)?;
        ctx.event_mask = mask;
        let pending = ctx.pending_events();
        if !pending.is_empty() {
            return Ok(pending);
        }

        ctx.blocked_on = Some(Blocker::Events);
        self.wait(id, "waiting for events", scheduler)?;
        Ok(EventFlags::empty())
    }

    /// Clear event bits
    pub fn acknowledge_events(&mut self, id: ContextId, flags: EventFlags) -> Result<()> {
        self.ctx_mut(id)?.events.remove(flags);
        Ok(())
    }

    /// Deliver a word to the inbound mailbox of `id`
    ///
    /// Returns false (and drops the value) when the mailbox is full.
    pub fn write_inbound(&mut self, id: ContextId, value: u32, scheduler: &mut Scheduler<H>) -> Result<bool> {
        let family = self.family;
        let ctx = self.ctx_mut(id)?;
        if !ctx.inbound.push(value) {
            log::warn!(
                "{}: inbound mailbox of {:#x} is full, dropping 0x{:08X}",
                family,
                id,
                value
            );
            return Ok(false);
        }

        if ctx.status == ContextStatus::Waiting && ctx.blocked_on == Some(Blocker::InboundMailbox) {
            self.wake(id, scheduler)?;
        }
        Ok(true)
    }

    /// Take a word from the inbound mailbox, blocking `id` when it is empty
    pub fn read_inbound(&mut self, id: ContextId, scheduler: &mut Scheduler<H>) -> Result<Option<u32>> {
        let ctx = self.ctx_mut(id)?;
        if let Some(value) = ctx.inbound.pop() {
            return Ok(Some(value));
        }

        ctx.blocked_on = Some(Blocker::InboundMailbox);
        self.wait(id, "reading inbound mailbox", scheduler)?;
        Ok(None)
    }

    /// Drop all contexts
    ///
    /// Backing memory is not released; reset the address space as well.
    pub fn reset(&mut self) {
        self.contexts.clear();
        self.registers = R::default();
        self.enabled = false;
        self.active = None;
        self.next_id = self.family.id_base();
        self.reschedule_pending = false;
    }
}
