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

/// Emulator error types
use thiserror::Error;

/// Result type for emulator operations
pub type Result<T> = std::result::Result<T, EmulatorError>;

/// Main error type for the emulator core
///
/// Most variants describe a broken host/guest contract and halt emulation of
/// the current instruction stream. Use [`EmulatorError::is_fatal`] to tell
/// them apart from the conditions the OS layer may report back to the guest.
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("{operation}: unmapped address 0x{address:016X}")]
    UnmappedAddress {
        address: u64,
        operation: &'static str,
    },

    #[error("{size}-byte access at 0x{address:016X} is not backed by memory")]
    UnbackedAccess { address: u64, size: usize },

    #[error("Tried to map already mapped range 0x{address:016X} (size 0x{size:X})")]
    DoubleMapping { address: u64, size: u64 },

    #[error("Out of memory in {region} region (requested 0x{requested:X} bytes)")]
    OutOfMemory {
        requested: u64,
        region: &'static str,
    },

    #[error("Unknown {kind} handle {id:#x}")]
    UnknownHandle { kind: &'static str, id: u64 },

    #[error("Invalid reservation state for owner {owner:#x}: {reason}")]
    InvalidReservationState { owner: u64, reason: String },

    #[error("Scheduler queue overflow: more than {limit} pending events")]
    SchedulerQueueOverflow { limit: usize },

    #[error("Tried to skip to the next scheduler event, but the queue is empty")]
    EmptyEventQueue,

    #[error("Context {target:#x} already has a pending joiner (requested by {waiter:#x})")]
    JoinAlreadyPending { target: u64, waiter: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Emulation halted in {family} context {context:#x} (pc 0x{pc:08X}): {source}")]
    Halted {
        family: &'static str,
        context: u64,
        pc: u64,
        #[source]
        source: Box<EmulatorError>,
    },
}

impl EmulatorError {
    /// Whether the error must stop emulation
    ///
    /// Out-of-memory and a second joiner are guest-visible conditions that
    /// real firmware reports through error codes. Everything else indicates a
    /// guest bug beyond the emulator's contract or an internal inconsistency.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EmulatorError::OutOfMemory { .. } | EmulatorError::JoinAlreadyPending { .. }
        )
    }
}
