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

//! Load-reserve / store-conditional bookkeeping
//!
//! A reservation snapshots one 128-byte line for its owner. Every byte of a
//! reserved line carries a write watchpoint; when a write changes the line,
//! each other owner whose snapshot no longer matches loses its reservation.
//!
//! Losses take effect in the table at once (so a later conditional store
//! fails), while the notification to the owner is deferred: lost entries
//! are queued and the `System` turns them into scheduler events, so the
//! owner observes the loss at a fixed virtual-time offset.


use crate::core::error::{EmulatorError, Result};
use crate::core::memory::layout::{line_of, LINE_SIZE};
use crate::core::memory::{AddressSpace, WatchFn};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

/// Reservation table shared between the system and its watchpoints
pub type SharedReservations = Rc<RefCell<ReservationTable>>;

/// Why a reservation was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCause {
    /// Another context changed the line
    Written,
    /// Another context committed a conditional store to the line
    Committed,
}

/// A loss waiting to be reported to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostReservation {
    pub owner: u64,
    pub line: u64,
    pub cause: LossCause,
}

/// One outstanding load-reserve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub owner: u64,
    /// Line address (128-byte aligned)
    pub addr: u64,
    pub snapshot: [u8; LINE_SIZE as usize],
}

#[derive(Debug)]
pub struct ReservationTable {
    /// At most one reservation per owner
    reservations: BTreeMap<u64, Reservation>,
    /// Lines that currently carry write watchpoints
    watched: BTreeSet<u64>,
    /// Losses not yet reported
    lost: Vec<LostReservation>,
    this: Weak<RefCell<ReservationTable>>,
}

impl ReservationTable {
    pub fn new_shared() -> SharedReservations {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                reservations: BTreeMap::new(),
                watched: BTreeSet::new(),
                lost: Vec::new(),
                this: this.clone(),
            })
        })
    }

    /// Reserve the line containing `addr` for `owner`
    ///
    /// A previous reservation of `owner` is replaced without notification.
    pub fn reserve(&mut self, mem: &mut AddressSpace, owner: u64, addr: u64) -> Result<()> {
        let line = line_of(addr);
        let mut snapshot = [0u8; LINE_SIZE as usize];
        mem.peek_bytes(line, &mut snapshot)?;

        if let Some(old) = self.reservations.insert(
            owner,
            Reservation {
                owner,
                addr: line,
                snapshot,
            },
        ) {
            if old.addr != line {
                log::trace!(
                    "Reservation: owner {:#x} moved from 0x{:08X} to 0x{:08X}",
                    owner,
                    old.addr,
                    line
                );
            }
        }

        if self.watched.insert(line) {
            let handler = self.line_watcher();
            for byte in line..line + LINE_SIZE {
                mem.watch_write(byte, handler.clone());
            }
        }

        log::trace!("Reservation: owner {:#x} reserved line 0x{:08X}", owner, line);
        Ok(())
    }

    /// Attempt the conditional store of `owner` to `addr`
    ///
    /// Matching is line-granular: a conditional store always covers the
    /// whole 128-byte line, so any `addr` inside the reserved line matches
    /// and an address on another line fails. The reservation of `owner` is
    /// consumed whatever the outcome. On success every other owner of the
    /// same line loses its reservation.
    pub fn try_acquire(&mut self, owner: u64, addr: u64) -> bool {
        let line = line_of(addr);
        let held = self.reservations.remove(&owner);
        if held.map(|r| r.addr) != Some(line) {
            log::trace!(
                "Reservation: owner {:#x} failed to acquire line 0x{:08X}",
                owner,
                line
            );
            return false;
        }

        let losers: Vec<u64> = self
            .reservations
            .values()
            .filter(|r| r.addr == line)
            .map(|r| r.owner)
            .collect();
        for loser in losers {
            self.lose(loser, line, LossCause::Committed);
        }
        true
    }

    /// Drop the reservation of `owner` without notifying anyone
    pub fn invalidate(&mut self, owner: u64) -> bool {
        self.reservations.remove(&owner).is_some()
    }

    /// First owner (lowest id) reserving the line containing `addr`
    pub fn owner_of(&self, addr: u64) -> Option<u64> {
        let line = line_of(addr);
        self.reservations
            .values()
            .find(|r| r.addr == line)
            .map(|r| r.owner)
    }

    pub fn is_reserved(&self, addr: u64) -> bool {
        self.owner_of(addr).is_some()
    }

    pub fn reservation(&self, owner: u64) -> Option<&Reservation> {
        self.reservations.get(&owner)
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    /// Whether losses are waiting to be reported
    pub fn has_lost(&self) -> bool {
        !self.lost.is_empty()
    }

    /// Take the queued losses, oldest first
    pub fn take_lost(&mut self) -> Vec<LostReservation> {
        std::mem::take(&mut self.lost)
    }

    /// Remove the watchpoints of lines nobody reserves anymore
    ///
    /// Returns the number of lines released.
    pub fn release_idle_lines(&mut self, mem: &mut AddressSpace) -> usize {
        let idle: Vec<u64> = self
            .watched
            .iter()
            .copied()
            .filter(|line| !self.reservations.values().any(|r| r.addr == *line))
            .collect();

        for &line in &idle {
            for byte in line..line + LINE_SIZE {
                mem.unwatch_write(byte);
            }
            self.watched.remove(&line);
            log::trace!("Reservation: released line 0x{:08X}", line);
        }
        idle.len()
    }

    /// Forget everything, removing all line watchpoints
    pub fn clear(&mut self, mem: &mut AddressSpace) {
        self.reservations.clear();
        self.lost.clear();
        self.release_idle_lines(mem);
    }

    fn lose(&mut self, owner: u64, line: u64, cause: LossCause) {
        self.reservations.remove(&owner);
        log::debug!(
            "Reservation: owner {:#x} lost line 0x{:08X} ({:?})",
            owner,
            line,
            cause
        );
        self.lost.push(LostReservation { owner, line, cause });
    }

    fn line_watcher(&self) -> WatchFn {
        let table = self.this.clone();
        Rc::new(move |mem: &mut AddressSpace, vaddr| {
            let Some(shared) = table.upgrade() else {
                return Ok(());
            };
            let mut table = shared
                .try_borrow_mut()
                .map_err(|_| EmulatorError::InvalidReservationState {
                    owner: mem.accessor().unwrap_or(0),
                    reason: format!("table busy during write to 0x{:08X}", vaddr),
                })?;
            table.on_line_written(mem, vaddr);
            Ok(())
        })
    }

    /// Compare every snapshot of the written line with memory
    fn on_line_written(&mut self, mem: &AddressSpace, vaddr: u64) {
        let line = line_of(vaddr);
        let writer = mem.accessor();

        let mut current = [0u8; LINE_SIZE as usize];
        let readable = mem.peek_bytes(line, &mut current).is_ok();

        let losers: Vec<u64> = self
            .reservations
            .values()
            .filter(|r| r.addr == line && Some(r.owner) != writer)
            .filter(|r| !readable || r.snapshot != current)
            .map(|r| r.owner)
            .collect();
        for loser in losers {
            self.lose(loser, line, LossCause::Written);
        }
    }
}
