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

//! Execution context records

use super::registers::RegisterState;
use crate::core::memory::{MapEntry, PhysicalBlock};
use bitflags::bitflags;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Context identifier, unique across interpreter families
pub type ContextId = u64;

/// Error code written to the return register when a timed wait expires
pub const ETIMEDOUT: u64 = 0x8001_000B;

/// Scheduling status of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContextStatus {
    Running,
    Waiting,
    Sleeping,
    Terminated,
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextStatus::Running => "running",
            ContextStatus::Waiting => "waiting",
            ContextStatus::Sleeping => "sleeping",
            ContextStatus::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Asynchronous event bits delivered to a context
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u32 {
        /// Reservation on a line was lost
        const LOCKLINE_LOST = 0x400;
        const SIGNAL_NOTIFY_1 = 0x200;
        const SIGNAL_NOTIFY_2 = 0x100;
        const DECREMENTER = 0x20;
        /// A value arrived in the inbound mailbox
        const INBOUND_MAILBOX = 0x10;
    }
}

/// What a waiting context is blocked on, when a wake-up is conditional
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocker {
    /// Any raised event bit that is also set in the mask
    Events,
    /// Inbound mailbox becoming non-empty
    InboundMailbox,
    /// Termination of another context
    Join(ContextId),
}

/// Fixed-capacity FIFO of 32-bit words
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    entries: VecDeque<u32>,
    capacity: usize,
}

impl Mailbox {
    pub const INBOUND_CAPACITY: usize = 4;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `value`; returns false when the mailbox is full
    pub fn push(&mut self, value: u32) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push_back(value);
        true
    }

    pub fn pop(&mut self) -> Option<u32> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

/// Where a new context starts executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Start at this program counter
    Direct(u64),
    /// Guest address of a function descriptor `{pc: u32, toc: u32}`
    Descriptor(u64),
}

/// Thread-local storage template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsImage {
    /// Guest address of the initialised part
    pub vaddr: u64,
    /// Bytes copied from `vaddr`
    pub file_size: u64,
    /// Total size; the tail past `file_size` is zeroed
    pub mem_size: u64,
}

/// Parameters for creating a context
#[derive(Debug, Clone)]
pub struct ContextSpec {
    pub entry: Entry,
    pub stack_size: u64,
    pub arg: u64,
    pub priority: i32,
    pub name: String,
    pub tls: Option<TlsImage>,
    pub initial_status: ContextStatus,
    /// Start running and switch in immediately
    pub boot: bool,
}

impl ContextSpec {
    /// Spec for a context that waits to be started, with default settings
    pub fn new(name: impl Into<String>, entry: Entry) -> Self {
        Self {
            entry,
            stack_size: 0,
            arg: 0,
            priority: 0,
            name: name.into(),
            tls: None,
            initial_status: ContextStatus::Waiting,
            boot: false,
        }
    }

    pub fn with_arg(mut self, arg: u64) -> Self {
        self.arg = arg;
        self
    }

    pub fn with_stack_size(mut self, size: u64) -> Self {
        self.stack_size = size;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tls(mut self, tls: TlsImage) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_status(mut self, status: ContextStatus) -> Self {
        self.initial_status = status;
        self
    }

    pub fn boot(mut self) -> Self {
        self.boot = true;
        self.initial_status = ContextStatus::Running;
        self
    }
}

/// One logical thread of execution
#[derive(Debug, Clone)]
pub struct ExecutionContext<R: RegisterState> {
    pub id: ContextId,
    pub name: String,
    pub priority: i32,
    pub status: ContextStatus,
    /// Saved registers; stale while the context is active
    pub registers: R,
    pub stack: Option<PhysicalBlock>,
    pub tls: Option<MapEntry>,

    pub wait_reason: Option<String>,
    pub blocked_on: Option<Blocker>,
    /// Set when the last timed wait expired
    pub timed_out: bool,

    /// Context waiting to join this one
    pub waiter: Option<ContextId>,
    /// Guest address receiving the exit value of a joined context
    pub join_ptr: Option<u64>,
    /// Exit value of the context this one joined
    pub join_result: Option<u64>,
    pub exit_value: Option<u64>,

    pub events: EventFlags,
    pub event_mask: EventFlags,
    pub inbound: Mailbox,
}

impl<R: RegisterState> ExecutionContext<R> {
    pub fn new(id: ContextId, name: String, priority: i32, status: ContextStatus, registers: R) -> Self {
        Self {
            id,
            name,
            priority,
            status,
            registers,
            stack: None,
            tls: None,
            wait_reason: None,
            blocked_on: None,
            timed_out: false,
            waiter: None,
            join_ptr: None,
            join_result: None,
            exit_value: None,
            events: EventFlags::empty(),
            event_mask: EventFlags::empty(),
            inbound: Mailbox::new(Mailbox::INBOUND_CAPACITY),
        }
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.status == ContextStatus::Running
    }

    /// Raised events selected by the mask
    pub fn pending_events(&self) -> EventFlags {
        self.events & self.event_mask
    }
}
