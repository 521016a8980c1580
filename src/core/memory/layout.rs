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

//! Guest memory layout constants
//!
//! | Virtual range             | Region      | Size   |
//! |---------------------------|-------------|--------|
//! | 0x00010000-0x1000FFFF     | Main RAM    | 256MB  |
//! | 0xC0000000-0xCFFFFFFF     | Video RAM   | 256MB  |
//! | 0xD0000000-0xDFFFFFFF     | Stack window| 256MB  |
//!
//! Pages are 64KB, so a table of 65536 entries covers the whole 32-bit
//! guest address space.

pub const PAGE_BITS: u64 = 16;
pub const PAGE_SHIFT: u64 = 32 - PAGE_BITS;
pub const PAGE_COUNT: usize = 1 << PAGE_BITS;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// First address past the guest virtual space
pub const GUEST_ADDRESS_LIMIT: u64 = 1 << 32;

pub const RAM_START: u64 = 0x0001_0000;
pub const RAM_SIZE: u64 = 256 * 1024 * 1024;
pub const RAM_SYSTEM_RESERVE: u64 = 10 * 1024 * 1024;

pub const VIDEO_MEM_START: u64 = 0xC000_0000;
pub const VIDEO_MEM_SIZE: u64 = 256 * 1024 * 1024;

pub const STACK_REGION_START: u64 = 0xD000_0000;
pub const STACK_REGION_SIZE: u64 = 0x1000_0000;
pub const DEFAULT_STACK_SIZE: u64 = 0x40000;

/// Reservation granule
pub const LINE_SIZE: u64 = 128;

/// Round `size` up to a whole number of pages
#[inline]
pub const fn page_align(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !PAGE_MASK
}

/// Round `addr` up to `alignment` (a power of two)
#[inline]
pub const fn align_up(addr: u64, alignment: u64) -> u64 {
    (addr + alignment - 1) & !(alignment - 1)
}

/// Page index of a guest address, if it lies inside the 32-bit space
#[inline]
pub const fn page_of(vaddr: u64) -> Option<usize> {
    if vaddr < GUEST_ADDRESS_LIMIT {
        Some((vaddr >> PAGE_SHIFT) as usize)
    } else {
        None
    }
}

/// Base address of a reservation line
#[inline]
pub const fn line_of(vaddr: u64) -> u64 {
    vaddr & !(LINE_SIZE - 1)
}
