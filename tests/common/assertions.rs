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

//! Custom assertions for emulator core testing

use cellrx::core::context::{ContextId, ContextStatus};
use cellrx::core::system::System;

/// Assert a context has the expected status
#[allow(dead_code)]
pub fn assert_status(system: &System, id: ContextId, expected: ContextStatus) {
    let actual = system.status_of(id).expect("Unknown context");
    assert_eq!(
        actual, expected,
        "Context {:#x} status mismatch: expected {}, got {}",
        id, expected, actual
    );
}

/// Assert memory contains expected value at address
#[allow(dead_code)]
pub fn assert_memory_word(system: &mut System, addr: u64, expected: u32) {
    let actual = system.read::<u32>(addr).expect("Failed to read memory");
    assert_eq!(
        actual, expected,
        "Memory at 0x{:08X} mismatch: expected 0x{:08X}, got 0x{:08X}",
        addr, expected, actual
    );
}

/// Assert both fast-path directions of the page holding `addr`
#[allow(dead_code)]
pub fn assert_fast(system: &System, addr: u64, read: bool, write: bool) {
    let actual = system.memory().is_fast(addr);
    assert_eq!(
        actual,
        (read, write),
        "Fast path at 0x{:08X} mismatch: expected {:?}, got {:?}",
        addr,
        (read, write),
        actual
    );
}
