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

//! Core emulation components
//!
//! This module contains:
//! - Guest address space (mapping, fast path, watchpoints)
//! - Reservation table for atomic line updates
//! - Virtual clock and event scheduler
//! - Execution contexts for both interpreter families
//! - System integration

pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod reservation;
pub mod system;
pub mod timing;

// Re-export commonly used types
pub use config::MachineConfig;
pub use context::{ContextId, ContextManager, ContextSpec, ContextStatus, Family};
pub use error::{EmulatorError, Result};
pub use memory::AddressSpace;
pub use reservation::ReservationTable;
pub use system::{GuestCpu, RunOutcome, System};
pub use timing::{Scheduler, SchedulerHost};
