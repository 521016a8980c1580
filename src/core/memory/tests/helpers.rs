// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut

//! Helper functions for address space tests

use super::*;

/// Pages of main RAM in the test layout
pub const MAIN_PAGES: u64 = 32;

/// Pages reserved for the system in the test layout
pub const RESERVED_PAGES: u64 = 2;

/// Creates a small address space: 2MB main RAM, 256KB video, 512KB stack
pub fn create_test_space() -> AddressSpace {
    AddressSpace::new(&MemoryConfig {
        main_size: MAIN_PAGES * PAGE_SIZE,
        main_system_reserve: RESERVED_PAGES * PAGE_SIZE,
        video_size: 4 * PAGE_SIZE,
        stack_size: 8 * PAGE_SIZE,
        ..MemoryConfig::default()
    })
}

/// Address space with one fast mapping of `pages` pages; returns the entry
#[allow(dead_code)]
pub fn create_space_with_mapping(pages: u64) -> (AddressSpace, MapEntry) {
    let mut mem = create_test_space();
    let entry = mem.alloc(pages * PAGE_SIZE, 0, false, PAGE_SIZE).unwrap();
    (mem, entry)
}
