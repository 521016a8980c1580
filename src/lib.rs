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

//! Cell console emulator core library
//!
//! This library provides the guest-facing machinery an instruction
//! interpreter runs on: the 32-bit guest address space with its fast path
//! and watchpoints, the line reservation table used by atomic
//! load/store-conditional sequences, a deterministic virtual-clock event
//! scheduler, and cooperative execution contexts for the general-purpose
//! (PPU) and coprocessor (SPU) interpreter families.
//!
//! # Example
//!
//! ```
//! use cellrx::core::config::MachineConfig;
//! use cellrx::core::context::{ContextSpec, ContextStatus, Entry, Family};
//! use cellrx::core::System;
//!
//! let mut system = System::new(MachineConfig::compact()).unwrap();
//! let main = system
//!     .spawn_context(Family::Ppu, ContextSpec::new("main", Entry::Direct(0x10000)).boot())
//!     .unwrap();
//!
//! system.sleep(main, 1000).unwrap();
//! system.advance_clock(system.us_to_cycles(1000)).unwrap();
//! assert_eq!(system.status_of(main).unwrap(), ContextStatus::Running);
//! ```

pub mod core;
