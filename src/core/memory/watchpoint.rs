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

//! Memory watchpoints
//!
//! A watchpoint calls a function when a single guest address is accessed
//! through the slow path. Read handlers run before the value is loaded,
//! write handlers after it is stored, so both can see the data involved.
//! A store covering several watched bytes runs each distinct handler once,
//! at the first watched byte it covers.
//! Handlers receive the address space itself and may map, unmap or write
//! memory; they are cloned out of the table before being invoked.

use super::layout::{page_of, PAGE_MASK};
use super::AddressSpace;
use crate::core::error::Result;
use std::collections::HashMap;
use std::rc::Rc;

/// Watchpoint handler, called with the accessed address
pub type WatchFn = Rc<dyn Fn(&mut AddressSpace, u64) -> Result<()>>;

/// Read/write watchpoint tables with per-page counts
#[derive(Default)]
pub struct Watchpoints {
    read: HashMap<u64, WatchFn>,
    write: HashMap<u64, WatchFn>,
    read_pages: HashMap<usize, usize>,
    write_pages: HashMap<usize, usize>,
}

impl Watchpoints {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_to_page(pages: &mut HashMap<usize, usize>, vaddr: u64) {
        if let Some(page) = page_of(vaddr) {
            *pages.entry(page).or_insert(0) += 1;
        }
    }

    fn remove_from_page(pages: &mut HashMap<usize, usize>, vaddr: u64) {
        if let Some(page) = page_of(vaddr) {
            if let Some(count) = pages.get_mut(&page) {
                *count -= 1;
                if *count == 0 {
                    pages.remove(&page);
                }
            }
        }
    }

    /// Install a read handler, replacing any previous one at `vaddr`
    pub fn insert_read(&mut self, vaddr: u64, handler: WatchFn) {
        if self.read.insert(vaddr, handler).is_none() {
            Self::add_to_page(&mut self.read_pages, vaddr);
        }
    }

    /// Install a write handler, replacing any previous one at `vaddr`
    pub fn insert_write(&mut self, vaddr: u64, handler: WatchFn) {
        if self.write.insert(vaddr, handler).is_none() {
            Self::add_to_page(&mut self.write_pages, vaddr);
        }
    }

    pub fn remove_read(&mut self, vaddr: u64) -> bool {
        let removed = self.read.remove(&vaddr).is_some();
        if removed {
            Self::remove_from_page(&mut self.read_pages, vaddr);
        }
        removed
    }

    pub fn remove_write(&mut self, vaddr: u64) -> bool {
        let removed = self.write.remove(&vaddr).is_some();
        if removed {
            Self::remove_from_page(&mut self.write_pages, vaddr);
        }
        removed
    }

    #[inline]
    pub fn read_handler(&self, vaddr: u64) -> Option<WatchFn> {
        self.read.get(&vaddr).cloned()
    }

    /// Distinct write handlers watching bytes in `[vaddr, vaddr + len)`
    ///
    /// Each handler appears once, paired with the lowest watched address it
    /// covers. Pages without write watchpoints are skipped.
    pub fn write_handlers_in(&self, vaddr: u64, len: u64) -> Vec<(u64, WatchFn)> {
        let mut found: Vec<(u64, WatchFn)> = Vec::new();
        if self.write.is_empty() {
            return found;
        }
        let end = vaddr.saturating_add(len);
        let mut cur = vaddr;
        while cur < end {
            let chunk_end = ((cur | PAGE_MASK) + 1).min(end);
            if page_of(cur).is_some_and(|page| self.page_has_write(page)) {
                for addr in cur..chunk_end {
                    if let Some(handler) = self.write.get(&addr) {
                        if !found.iter().any(|(_, seen)| Rc::ptr_eq(seen, handler)) {
                            found.push((addr, Rc::clone(handler)));
                        }
                    }
                }
            }
            cur = chunk_end;
        }
        found
    }

    pub fn page_has_read(&self, page: usize) -> bool {
        self.read_pages.contains_key(&page)
    }

    pub fn page_has_write(&self, page: usize) -> bool {
        self.write_pages.contains_key(&page)
    }

    pub fn is_watched_write(&self, vaddr: u64) -> bool {
        self.write.contains_key(&vaddr)
    }

    pub fn len(&self) -> usize {
        self.read.len() + self.write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
        self.read_pages.clear();
        self.write_pages.clear();
    }
}
