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

//! Physical memory regions
//!
//! A region owns a zero-initialised backing buffer and a list of allocated
//! physical blocks. Physical addresses handed out by a region are byte
//! offsets into its buffer.

use super::layout::page_align;
use crate::core::error::{EmulatorError, Result};

/// Identifies one of the address space's backing regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub(super) usize);

impl RegionId {
    /// Main RAM
    pub const MAIN: RegionId = RegionId(0);
    /// Video (local) memory
    pub const VIDEO: RegionId = RegionId(1);
    /// Backing store for context stacks
    pub const STACK: RegionId = RegionId(2);

    pub fn index(self) -> usize {
        self.0
    }
}

/// An allocated, not necessarily mapped, span of physical memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalBlock {
    pub start: u64,
    pub size: u64,
    pub handle: u64,
    /// Allocated by the OS; not counted against the guest's available memory
    pub system: bool,
}

impl PhysicalBlock {
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// A physical memory region with its block allocator
pub struct MemoryRegion {
    name: &'static str,
    /// Default virtual base for allocations in this region
    virtual_base: u64,
    size: u64,
    system_size: u64,
    /// Backing storage, indexed by physical address
    pub(super) mem: Vec<u8>,
    /// Allocated blocks, sorted by start address
    blocks: Vec<PhysicalBlock>,
}

impl MemoryRegion {
    /// Create a region of `size` bytes, all zero
    pub fn new(name: &'static str, virtual_base: u64, size: u64, system_size: u64) -> Self {
        Self {
            name,
            virtual_base,
            size,
            system_size,
            mem: vec![0u8; size as usize],
            blocks: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn virtual_base(&self) -> u64 {
        self.virtual_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn blocks(&self) -> &[PhysicalBlock] {
        &self.blocks
    }

    /// Find the lowest physical offset with room for `aligned_size` bytes
    fn find_gap(&self, aligned_size: u64) -> Option<u64> {
        let mut candidate = 0u64;
        for block in &self.blocks {
            if block.start >= candidate && block.start - candidate >= aligned_size {
                break;
            }
            candidate = candidate.max(block.end());
        }

        if candidate + aligned_size <= self.size {
            Some(candidate)
        } else {
            None
        }
    }

    /// Allocate a page-aligned physical block
    ///
    /// # Errors
    ///
    /// `EmulatorError::OutOfMemory` when no gap below the region size fits
    /// the page-aligned request.
    pub(super) fn alloc_phys(&mut self, size: u64, system: bool, handle: u64) -> Result<PhysicalBlock> {
        let aligned_size = page_align(size.max(1));
        let start = self.find_gap(aligned_size).ok_or(EmulatorError::OutOfMemory {
            requested: aligned_size,
            region: self.name,
        })?;

        let block = PhysicalBlock {
            start,
            size: aligned_size,
            handle,
            system,
        };
        let pos = self.blocks.partition_point(|b| b.start < start);
        self.blocks.insert(pos, block);

        log::debug!(
            "{}: allocated block {:#x} at p:0x{:08X} (0x{:X} bytes{})",
            self.name,
            handle,
            start,
            aligned_size,
            if system { ", system" } else { "" }
        );
        Ok(block)
    }

    /// Whether a block of `size` bytes could be allocated right now
    pub fn can_alloc(&self, size: u64) -> bool {
        self.find_gap(page_align(size.max(1))).is_some()
    }

    /// Release the block with `handle`, returning it
    pub(super) fn free_block(&mut self, handle: u64) -> Option<PhysicalBlock> {
        let pos = self.blocks.iter().position(|b| b.handle == handle)?;
        let block = self.blocks.remove(pos);
        log::debug!(
            "{}: freed block {:#x} at p:0x{:08X}",
            self.name,
            handle,
            block.start
        );
        Some(block)
    }

    pub fn find_block_with_handle(&self, handle: u64) -> Option<&PhysicalBlock> {
        self.blocks.iter().find(|b| b.handle == handle)
    }

    /// The block containing physical address `paddr`
    pub fn find_block_from_addr(&self, paddr: u64) -> Option<&PhysicalBlock> {
        self.blocks
            .iter()
            .find(|b| paddr >= b.start && paddr < b.end())
    }

    /// Bytes the guest may still allocate
    ///
    /// System blocks and the system reserve are excluded, so guest
    /// allocations lower this by exactly their page-aligned size.
    pub fn available_mem(&self) -> u64 {
        let used: u64 = self
            .blocks
            .iter()
            .filter(|b| !b.system)
            .map(|b| b.size)
            .sum();
        self.size.saturating_sub(self.system_size).saturating_sub(used)
    }

    /// Whether `[paddr, paddr + len)` lies inside the backing buffer
    #[inline]
    pub fn is_backed(&self, paddr: u64, len: u64) -> bool {
        paddr.checked_add(len).is_some_and(|end| end <= self.size)
    }

    /// Zero the buffer and forget every block
    pub fn reset(&mut self) {
        self.mem.fill(0);
        self.blocks.clear();
    }
}
