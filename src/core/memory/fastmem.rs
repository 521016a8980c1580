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

//! Fast-path page table
//!
//! Two parallel tables, one for reads and one for writes, with one slot per
//! guest page. A filled slot names the backing region and the byte offset
//! of the page inside that region's buffer, so an access resolves to a
//! slice index without translation or watchpoint lookups. Slots never hold
//! raw pointers; the buffer is re-borrowed at the point of access.

use super::layout::PAGE_COUNT;
use super::region::RegionId;

/// Where a fast page lives in host memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastSlot {
    pub region: RegionId,
    /// Offset of the first byte of the page inside the region buffer
    pub offset: usize,
}

/// Read and write fast-path tables
pub struct FastPathTable {
    read: Vec<Option<FastSlot>>,
    write: Vec<Option<FastSlot>>,
}

impl FastPathTable {
    pub fn new() -> Self {
        Self {
            read: vec![None; PAGE_COUNT],
            write: vec![None; PAGE_COUNT],
        }
    }

    /// Put `page` on the fast path for the selected directions
    pub fn mark_fast(&mut self, page: usize, slot: FastSlot, read: bool, write: bool) {
        if read {
            self.read[page] = Some(slot);
        }
        if write {
            self.write[page] = Some(slot);
        }
    }

    /// Take `page` off the fast path for the selected directions
    pub fn mark_slow(&mut self, page: usize, read: bool, write: bool) {
        if read {
            self.read[page] = None;
        }
        if write {
            self.write[page] = None;
        }
    }

    #[inline(always)]
    pub fn read_slot(&self, page: usize) -> Option<FastSlot> {
        self.read[page]
    }

    #[inline(always)]
    pub fn write_slot(&self, page: usize) -> Option<FastSlot> {
        self.write[page]
    }

    /// Number of pages currently fast for reads and for writes
    pub fn fast_page_counts(&self) -> (usize, usize) {
        (
            self.read.iter().filter(|s| s.is_some()).count(),
            self.write.iter().filter(|s| s.is_some()).count(),
        )
    }

    pub fn clear(&mut self) {
        self.read.fill(None);
        self.write.fill(None);
    }
}

impl Default for FastPathTable {
    fn default() -> Self {
        Self::new()
    }
}
