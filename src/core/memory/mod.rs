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

//! Guest address space
//!
//! The [`AddressSpace`] owns the physical memory regions, the list of
//! virtual-to-physical mappings, the fast-path page table and the memory
//! watchpoints. It is the only component that touches guest bytes.
//!
//! # Access paths
//!
//! - **Fast path**: the page has a slot in the [`FastPathTable`]; the access
//!   indexes the region buffer directly.
//! - **Slow path**: the address is translated through the map list, checked
//!   against the backing store, and any watchpoint on it is dispatched.
//!
//! Guest memory is big-endian on both paths.
//!
//! # Example
//!
//! ```
//! use cellrx::core::config::MachineConfig;
//! use cellrx::core::memory::AddressSpace;
//!
//! let mut mem = AddressSpace::new(&MachineConfig::compact().memory);
//!
//! let entry = mem.alloc(0x10000, 0, false, 0x10000).unwrap();
//! mem.write::<u32>(entry.vaddr, 0xDEADBEEF).unwrap();
//! assert_eq!(mem.read::<u32>(entry.vaddr).unwrap(), 0xDEADBEEF);
//! assert_eq!(mem.read::<u8>(entry.vaddr).unwrap(), 0xDE);
//! ```

pub mod fastmem;
pub mod layout;
mod region;
mod value;
mod watchpoint;

#[cfg(test)]
mod tests;

pub use fastmem::{FastPathTable, FastSlot};
pub use region::{MemoryRegion, PhysicalBlock, RegionId};
pub use value::GuestValue;
pub use watchpoint::{WatchFn, Watchpoints};

use crate::core::config::MemoryConfig;
use crate::core::error::{EmulatorError, Result};
use layout::{page_align, page_of, GUEST_ADDRESS_LIMIT, PAGE_COUNT, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use serde::Serialize;
use value::access_name;

/// A virtual-to-physical mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub vaddr: u64,
    /// Offset inside the backing region
    pub paddr: u64,
    /// Always a multiple of the page size
    pub size: u64,
    pub handle: u64,
    pub region: RegionId,
    /// Whether the entry's pages are eligible for the fast path
    pub fast: bool,
}

impl MapEntry {
    #[inline]
    pub fn end(&self) -> u64 {
        self.vaddr + self.size
    }

    #[inline]
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.vaddr && vaddr < self.end()
    }
}

/// Snapshot of address space usage, for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub mapped_bytes: u64,
    pub map_entries: usize,
    pub fast_read_pages: usize,
    pub fast_write_pages: usize,
    pub watchpoints: usize,
    pub available_bytes: u64,
}

/// The guest's memory
pub struct AddressSpace {
    /// Backing regions, indexed by `RegionId`
    regions: Vec<MemoryRegion>,
    /// Mappings sorted by virtual address
    map: Vec<MapEntry>,
    fast: FastPathTable,
    watchpoints: Watchpoints,
    next_handle: u64,
    /// Context currently issuing accesses, for watchpoint observers
    accessor: Option<u64>,
}

impl AddressSpace {
    /// Create an address space with the main, video and stack regions
    pub fn new(config: &MemoryConfig) -> Self {
        let regions = vec![
            MemoryRegion::new(
                "main",
                config.main_base,
                config.main_size,
                config.main_system_reserve,
            ),
            MemoryRegion::new("video", config.video_base, config.video_size, 0),
            MemoryRegion::new("stack", config.stack_base, config.stack_size, 0),
        ];

        log::debug!(
            "AddressSpace: main 0x{:X} bytes @ 0x{:08X}, video 0x{:X} bytes @ 0x{:08X}, stack 0x{:X} bytes @ 0x{:08X}",
            config.main_size,
            config.main_base,
            config.video_size,
            config.video_base,
            config.stack_size,
            config.stack_base
        );

        Self {
            regions,
            map: Vec::new(),
            fast: FastPathTable::new(),
            watchpoints: Watchpoints::new(),
            next_handle: 1,
            accessor: None,
        }
    }

    pub fn region(&self, id: RegionId) -> &MemoryRegion {
        &self.regions[id.0]
    }

    fn take_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    // ----- Physical allocation -------------------------------------------

    /// Allocate physical main RAM without mapping it
    pub fn alloc_phys(&mut self, size: u64, system: bool) -> Result<PhysicalBlock> {
        self.alloc_phys_in(RegionId::MAIN, size, system)
    }

    pub fn alloc_phys_in(&mut self, region: RegionId, size: u64, system: bool) -> Result<PhysicalBlock> {
        let handle = self.take_handle();
        self.regions[region.0].alloc_phys(size, system, handle)
    }

    /// Release a physical block without touching mappings
    pub fn free_phys(&mut self, handle: u64) -> Result<PhysicalBlock> {
        self.regions
            .iter_mut()
            .find_map(|r| r.free_block(handle))
            .ok_or(EmulatorError::UnknownHandle {
                kind: "memory block",
                id: handle,
            })
    }

    pub fn can_alloc(&self, size: u64) -> bool {
        self.regions[RegionId::MAIN.0].can_alloc(size)
    }

    /// Main RAM still available to the guest
    pub fn available_mem(&self) -> u64 {
        self.regions[RegionId::MAIN.0].available_mem()
    }

    pub fn find_block_with_handle(&self, handle: u64) -> Option<(RegionId, PhysicalBlock)> {
        self.regions.iter().enumerate().find_map(|(i, r)| {
            r.find_block_with_handle(handle)
                .map(|block| (RegionId(i), *block))
        })
    }

    // ----- Mapping ---------------------------------------------------------

    /// Map main RAM at `vaddr`
    pub fn map(&mut self, vaddr: u64, paddr: u64, size: u64, fast: bool) -> Result<MapEntry> {
        self.map_in(RegionId::MAIN, vaddr, paddr, size, fast)
    }

    /// Map `size` bytes of `region` starting at `paddr` to `vaddr`
    ///
    /// The size is rounded up to whole pages.
    ///
    /// # Errors
    ///
    /// `EmulatorError::DoubleMapping` if any byte of the virtual range is
    /// already mapped.
    pub fn map_in(
        &mut self,
        region: RegionId,
        vaddr: u64,
        paddr: u64,
        size: u64,
        fast: bool,
    ) -> Result<MapEntry> {
        let aligned = page_align(size.max(1));
        if self.overlaps(vaddr, aligned) {
            return Err(EmulatorError::DoubleMapping {
                address: vaddr,
                size: aligned,
            });
        }

        let handle = self.regions[region.0]
            .find_block_from_addr(paddr)
            .map_or(0, |b| b.handle);
        let entry = MapEntry {
            vaddr,
            paddr,
            size: aligned,
            handle,
            region,
            fast,
        };

        let pos = self.map.partition_point(|e| e.vaddr < vaddr);
        self.map.insert(pos, entry);
        if fast {
            self.refresh_range(vaddr, aligned);
        }

        log::debug!(
            "Mapped v:0x{:08X}-0x{:08X} -> {} p:0x{:08X}{}",
            vaddr,
            vaddr + aligned - 1,
            self.regions[region.0].name(),
            paddr,
            if fast { "" } else { " (slow)" }
        );
        Ok(entry)
    }

    /// Allocate and map main RAM
    ///
    /// `start` is the lowest acceptable virtual address (0 selects the
    /// region's base); the mapping is aligned to `alignment` (at least a page).
    pub fn alloc(&mut self, size: u64, start: u64, system: bool, alignment: u64) -> Result<MapEntry> {
        self.alloc_in(RegionId::MAIN, size, start, system, alignment)
    }

    pub fn alloc_in(
        &mut self,
        region: RegionId,
        size: u64,
        start: u64,
        system: bool,
        alignment: u64,
    ) -> Result<MapEntry> {
        let block = self.alloc_phys_in(region, size, system)?;
        let base = if start == 0 {
            self.regions[region.0].virtual_base()
        } else {
            start
        };

        let vaddr = match self.find_next_allocatable_vaddr(block.size, base, alignment) {
            Ok(vaddr) => vaddr,
            Err(e) => {
                self.regions[region.0].free_block(block.handle);
                return Err(e);
            }
        };

        self.map_in(region, vaddr, block.start, block.size, true)
    }

    /// First aligned virtual address at or above `start` with `size` free bytes
    pub fn find_next_allocatable_vaddr(&self, size: u64, start: u64, alignment: u64) -> Result<u64> {
        let alignment = alignment.max(PAGE_SIZE).next_power_of_two();
        let size = page_align(size.max(1));
        let mut candidate = layout::align_up(start, alignment);

        for entry in &self.map {
            if entry.end() <= candidate {
                continue;
            }
            if entry.vaddr >= candidate + size {
                break;
            }
            candidate = layout::align_up(entry.end(), alignment);
        }

        if candidate + size > GUEST_ADDRESS_LIMIT {
            return Err(EmulatorError::OutOfMemory {
                requested: size,
                region: "virtual",
            });
        }
        Ok(candidate)
    }

    /// Remove the mapping that starts at `vaddr`
    ///
    /// The backing block stays allocated; use [`AddressSpace::free`] to
    /// release both.
    pub fn unmap(&mut self, vaddr: u64) {
        let Some(pos) = self.map.iter().position(|e| e.vaddr == vaddr) else {
            log::trace!("unmap: nothing mapped at 0x{:08X}", vaddr);
            return;
        };

        let entry = self.map.remove(pos);
        self.refresh_range(entry.vaddr, entry.size);
        log::debug!("Unmapped v:0x{:08X}-0x{:08X}", entry.vaddr, entry.end() - 1);
    }

    /// Free the block with `handle` and drop every mapping of it
    pub fn free(&mut self, handle: u64) -> Result<()> {
        self.free_phys(handle)?;

        let (removed, kept): (Vec<MapEntry>, Vec<MapEntry>) =
            self.map.drain(..).partition(|e| e.handle == handle);
        self.map = kept;
        for entry in removed {
            self.refresh_range(entry.vaddr, entry.size);
        }
        Ok(())
    }

    /// Free the block behind `entry` and remove the entry
    pub fn free_entry(&mut self, entry: &MapEntry) -> Result<()> {
        self.free(entry.handle)
    }

    pub fn is_mapped(&self, vaddr: u64) -> Option<&MapEntry> {
        self.lookup(vaddr)
    }

    pub fn find_map_entry_with_handle(&self, handle: u64) -> Option<&MapEntry> {
        self.map.iter().find(|e| e.handle == handle)
    }

    pub fn map_entries(&self) -> &[MapEntry] {
        &self.map
    }

    fn overlaps(&self, vaddr: u64, size: u64) -> bool {
        self.map
            .iter()
            .any(|e| e.vaddr < vaddr + size && vaddr < e.end())
    }

    fn lookup(&self, vaddr: u64) -> Option<&MapEntry> {
        let idx = self.map.partition_point(|e| e.vaddr <= vaddr);
        let entry = self.map.get(idx.checked_sub(1)?)?;
        entry.contains(vaddr).then_some(entry)
    }

    // ----- Translation -----------------------------------------------------

    /// Translate a virtual address to a physical offset in its region
    pub fn translate(&self, vaddr: u64) -> Result<u64> {
        self.lookup(vaddr)
            .map(|e| e.paddr + (vaddr - e.vaddr))
            .ok_or(EmulatorError::UnmappedAddress {
                address: vaddr,
                operation: "translate",
            })
    }

    /// Translate and check that `len` bytes are backed by the region
    fn resolve(&self, vaddr: u64, len: u64, operation: &'static str) -> Result<(RegionId, u64)> {
        let entry = self.lookup(vaddr).ok_or(EmulatorError::UnmappedAddress {
            address: vaddr,
            operation,
        })?;
        let paddr = entry.paddr + (vaddr - entry.vaddr);
        if !self.regions[entry.region.0].is_backed(paddr, len) {
            return Err(EmulatorError::UnbackedAccess {
                address: vaddr,
                size: len as usize,
            });
        }
        Ok((entry.region, paddr))
    }

    // ----- Fast path table -------------------------------------------------

    pub fn mark_fast(&mut self, page: usize, slot: FastSlot, read: bool, write: bool) {
        self.fast.mark_fast(page, slot, read, write);
    }

    pub fn mark_slow(&mut self, page: usize, read: bool, write: bool) {
        self.fast.mark_slow(page, read, write);
    }

    /// Whether `vaddr`'s page is on the fast path for (reads, writes)
    pub fn is_fast(&self, vaddr: u64) -> (bool, bool) {
        page_of(vaddr).map_or((false, false), |page| {
            (
                self.fast.read_slot(page).is_some(),
                self.fast.write_slot(page).is_some(),
            )
        })
    }

    /// Recompute fast-path eligibility of one page
    ///
    /// A page is fast when a fast mapping covers all of it with backed
    /// memory; each direction additionally requires no watchpoint on the page.
    fn refresh_page(&mut self, page: usize) {
        let page_start = (page as u64) << PAGE_SHIFT;
        let slot = self
            .lookup(page_start)
            .filter(|e| e.fast && e.end() >= page_start + PAGE_SIZE)
            .and_then(|e| {
                let offset = e.paddr + (page_start - e.vaddr);
                self.regions[e.region.0]
                    .is_backed(offset, PAGE_SIZE)
                    .then_some(FastSlot {
                        region: e.region,
                        offset: offset as usize,
                    })
            });

        match slot {
            Some(slot) => {
                let read = !self.watchpoints.page_has_read(page);
                let write = !self.watchpoints.page_has_write(page);
                self.fast.mark_fast(page, slot, read, write);
                self.fast.mark_slow(page, !read, !write);
            }
            None => self.fast.mark_slow(page, true, true),
        }
    }

    fn refresh_range(&mut self, vaddr: u64, size: u64) {
        let Some(first) = page_of(vaddr) else {
            return;
        };
        let last = page_of(vaddr + size - 1).unwrap_or(PAGE_COUNT - 1);
        for page in first..=last {
            self.refresh_page(page);
        }
    }

    // ----- Watchpoints -----------------------------------------------------

    /// Call `handler` before every read of `vaddr`
    pub fn watch_read(&mut self, vaddr: u64, handler: WatchFn) {
        self.watchpoints.insert_read(vaddr, handler);
        self.refresh_range(vaddr, 1);
    }

    /// Call `handler` after every write to `vaddr`
    pub fn watch_write(&mut self, vaddr: u64, handler: WatchFn) {
        self.watchpoints.insert_write(vaddr, handler);
        self.refresh_range(vaddr, 1);
    }

    pub fn unwatch_read(&mut self, vaddr: u64) {
        if self.watchpoints.remove_read(vaddr) {
            self.refresh_range(vaddr, 1);
        }
    }

    pub fn unwatch_write(&mut self, vaddr: u64) {
        if self.watchpoints.remove_write(vaddr) {
            self.refresh_range(vaddr, 1);
        }
    }

    pub fn is_watched_write(&self, vaddr: u64) -> bool {
        self.watchpoints.is_watched_write(vaddr)
    }

    /// Set the id of the context whose accesses follow
    pub fn set_accessor(&mut self, accessor: Option<u64>) {
        self.accessor = accessor;
    }

    pub fn accessor(&self) -> Option<u64> {
        self.accessor
    }

    // ----- Access ----------------------------------------------------------

    /// Load a big-endian value
    ///
    /// # Errors
    ///
    /// `UnmappedAddress` / `UnbackedAccess` on the slow path, or whatever a
    /// read watchpoint returns.
    #[inline]
    pub fn read<T: GuestValue>(&mut self, vaddr: u64) -> Result<T> {
        if let Some(slot) = page_of(vaddr).and_then(|page| self.fast.read_slot(page)) {
            let offset = (vaddr & PAGE_MASK) as usize;
            if offset + T::SIZE <= PAGE_SIZE as usize {
                let start = slot.offset + offset;
                return Ok(T::read_be(&self.regions[slot.region.0].mem[start..start + T::SIZE]));
            }
        }
        self.read_slow(vaddr)
    }

    fn read_slow<T: GuestValue>(&mut self, vaddr: u64) -> Result<T> {
        let operation = access_name(false, T::SIZE);
        self.resolve(vaddr, T::SIZE as u64, operation)?;

        if let Some(handler) = self.watchpoints.read_handler(vaddr) {
            (*handler)(self, vaddr)?;
        }

        // The handler may have remapped the page
        let (region, paddr) = self.resolve(vaddr, T::SIZE as u64, operation)?;
        let start = paddr as usize;
        let value = T::read_be(&self.regions[region.0].mem[start..start + T::SIZE]);
        log::trace!("{} v:0x{:08X} p:0x{:08X} -> {:?}", operation, vaddr, paddr, value);
        Ok(value)
    }

    /// Store a value in big-endian order
    #[inline]
    pub fn write<T: GuestValue>(&mut self, vaddr: u64, value: T) -> Result<()> {
        if let Some(slot) = page_of(vaddr).and_then(|page| self.fast.write_slot(page)) {
            let offset = (vaddr & PAGE_MASK) as usize;
            if offset + T::SIZE <= PAGE_SIZE as usize {
                let start = slot.offset + offset;
                value.write_be(&mut self.regions[slot.region.0].mem[start..start + T::SIZE]);
                return Ok(());
            }
        }
        self.write_slow(vaddr, value)
    }

    fn write_slow<T: GuestValue>(&mut self, vaddr: u64, value: T) -> Result<()> {
        let operation = access_name(true, T::SIZE);
        let (region, paddr) = self.resolve(vaddr, T::SIZE as u64, operation)?;
        let start = paddr as usize;
        value.write_be(&mut self.regions[region.0].mem[start..start + T::SIZE]);
        log::trace!("{} v:0x{:08X} p:0x{:08X} <- {:?}", operation, vaddr, paddr, value);

        self.run_write_watchpoints(vaddr, T::SIZE as u64)
    }

    /// Run every distinct write handler watching `[vaddr, vaddr + len)`
    fn run_write_watchpoints(&mut self, vaddr: u64, len: u64) -> Result<()> {
        for (addr, handler) in self.watchpoints.write_handlers_in(vaddr, len) {
            (*handler)(self, addr)?;
        }
        Ok(())
    }

    /// Copy guest bytes without triggering watchpoints
    ///
    /// The range may span several mappings.
    pub fn peek_bytes(&self, vaddr: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = vaddr + done as u64;
            let entry = self.lookup(cur).ok_or(EmulatorError::UnmappedAddress {
                address: cur,
                operation: "read_bytes",
            })?;
            let chunk = ((entry.end() - cur) as usize).min(buf.len() - done);
            let (region, paddr) = self.resolve(cur, chunk as u64, "read_bytes")?;
            let start = paddr as usize;
            buf[done..done + chunk].copy_from_slice(&self.regions[region.0].mem[start..start + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy guest bytes, running the read watchpoint at `vaddr` first
    pub fn read_bytes(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<()> {
        if let Some(handler) = self.watchpoints.read_handler(vaddr) {
            (*handler)(self, vaddr)?;
        }
        self.peek_bytes(vaddr, buf)
    }

    /// Store guest bytes, then run each write watchpoint the range covers
    pub fn write_bytes(&mut self, vaddr: u64, data: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < data.len() {
            let cur = vaddr + done as u64;
            let entry = self.lookup(cur).ok_or(EmulatorError::UnmappedAddress {
                address: cur,
                operation: "write_bytes",
            })?;
            let chunk = ((entry.end() - cur) as usize).min(data.len() - done);
            let (region, paddr) = self.resolve(cur, chunk as u64, "write_bytes")?;
            let start = paddr as usize;
            self.regions[region.0].mem[start..start + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }

        self.run_write_watchpoints(vaddr, data.len() as u64)
    }

    /// Zero-fill `len` guest bytes at `vaddr`
    pub fn fill(&mut self, vaddr: u64, len: usize) -> Result<()> {
        self.write_bytes(vaddr, &vec![0u8; len])
    }

    // ----- Diagnostics -----------------------------------------------------

    /// (start, inclusive end) of every mapping
    pub fn address_map(&self) -> Vec<(u64, u64)> {
        self.map.iter().map(|e| (e.vaddr, e.end() - 1)).collect()
    }

    pub fn log_address_map(&self) {
        for (start, end) in self.address_map() {
            log::debug!("0x{:016x} -> 0x{:016x}", start, end);
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let (fast_read_pages, fast_write_pages) = self.fast.fast_page_counts();
        MemoryStats {
            mapped_bytes: self.map.iter().map(|e| e.size).sum(),
            map_entries: self.map.len(),
            fast_read_pages,
            fast_write_pages,
            watchpoints: self.watchpoints.len(),
            available_bytes: self.available_mem(),
        }
    }

    /// Clear all memory, mappings and watchpoints
    pub fn reset(&mut self) {
        for region in &mut self.regions {
            region.reset();
        }
        self.map.clear();
        self.fast.clear();
        self.watchpoints.clear();
        self.accessor = None;
    }
}
