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

//! System module tests
//!
//! This module contains organized test suites for the System component:
//! the public API, end-to-end scenarios and the execution loop.


use super::*;
use crate::core::context::Entry;

pub const ENTRY: u64 = 0x0001_0000;

pub fn system() -> System {
    System::new(MachineConfig::compact()).unwrap()
}

pub fn noop(_: &mut System) -> Result<()> {
    Ok(())
}

/// Boot context of `family`
pub fn boot(system: &mut System, family: Family, name: &str) -> ContextId {
    let spec = ContextSpec::new(name, Entry::Direct(ENTRY)).boot();
    system.spawn_context(family, spec).unwrap()
}

/// Runnable context of `family` that is not switched in
pub fn spawn_running(system: &mut System, family: Family, name: &str) -> ContextId {
    let spec = ContextSpec::new(name, Entry::Direct(ENTRY)).with_status(ContextStatus::Running);
    system.spawn_context(family, spec).unwrap()
}
