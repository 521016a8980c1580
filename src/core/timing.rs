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

//! Virtual Clock Scheduler
//!
//! This module implements the virtual-time event queue that drives context
//! switching, sleeps, timeouts and deferred notifications.
//!
//! # Architecture
//!
//! The scheduler keeps a virtual cycle counter. Events are scheduled to run
//! a number of cycles in the future and fire in `(cycle, sequence)` order, so
//! events due on the same cycle run in the order they were scheduled.
//!
//! Callbacks receive the *host* that owns the scheduler (`&mut H`), which is
//! how an event reaches the context managers, the address space, or the
//! scheduler itself. The host drives the clock through [`SchedulerHost`].
//!
//! # Example
//!
//! ```
//! use cellrx::core::config::TimingConfig;
//! use cellrx::core::timing::{Scheduler, SchedulerHost};
//!
//! struct Host {
//!     scheduler: Scheduler<Host>,
//!     fired: Vec<u64>,
//! }
//!
//! impl SchedulerHost for Host {
//!     fn scheduler_mut(&mut self) -> &mut Scheduler<Self> {
//!         &mut self.scheduler
//!     }
//! }
//!
//! let mut host = Host {
//!     scheduler: Scheduler::new(&TimingConfig::default()),
//!     fired: Vec::new(),
//! };
//!
//! host.scheduler
//!     .schedule(1000, "tick", |h: &mut Host| {
//!         let now = h.scheduler.now();
//!         h.fired.push(now);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! host.advance(999).unwrap();
//! assert!(host.fired.is_empty());
//! host.advance(1).unwrap();
//! assert_eq!(host.fired, vec![1000]);
//! ```

use crate::core::config::TimingConfig;
use crate::core::error::{EmulatorError, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Absolute time in virtual cycles since reset
pub type Cycle = u64;

/// Callback invoked when an event fires
pub type EventCallback<H> = Box<dyn FnOnce(&mut H) -> Result<()>>;

/// Identifies one scheduled event
///
/// Handles order the same way events fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle {
    cycle: Cycle,
    seq: u64,
}

impl EventHandle {
    /// Cycle at which the event fires
    pub fn cycle(&self) -> Cycle {
        self.cycle
    }
}

/// A queued event
pub struct ScheduledEvent<H> {
    /// Event name, used for cancellation and debugging
    pub name: String,
    callback: EventCallback<H>,
}

impl<H> ScheduledEvent<H> {
    /// Consume the event and run its callback against `host`
    pub fn fire(self, host: &mut H) -> Result<()> {
        (self.callback)(host)
    }
}

/// Virtual-time event queue
pub struct Scheduler<H> {
    /// Current virtual time
    now: Cycle,

    /// Tie breaker for events on the same cycle
    next_seq: u64,

    /// Pending events ordered by (cycle, seq)
    events: BTreeMap<(Cycle, u64), ScheduledEvent<H>>,

    /// Queue limit; reaching it means the guest is spinning on retries
    max_pending: usize,

    /// Guest clock in Hz
    cpu_frequency: u64,
}

impl<H> Scheduler<H> {
    /// Create an empty scheduler at cycle 0
    pub fn new(config: &TimingConfig) -> Self {
        Self {
            now: 0,
            next_seq: 0,
            events: BTreeMap::new(),
            max_pending: config.max_pending_events,
            cpu_frequency: config.cpu_frequency,
        }
    }

    /// Schedule `callback` to run `delay` cycles from now
    ///
    /// # Errors
    ///
    /// `SchedulerQueueOverflow` if the queue already holds the maximum
    /// number of events.
    pub fn schedule<F>(&mut self, delay: Cycle, name: impl Into<String>, callback: F) -> Result<EventHandle>
    where
        F: FnOnce(&mut H) -> Result<()> + 'static,
    {
        let name = name.into();
        if self.events.len() >= self.max_pending {
            log::error!(
                "Scheduler: queue full ({} events) while scheduling '{}'",
                self.events.len(),
                name
            );
            return Err(EmulatorError::SchedulerQueueOverflow {
                limit: self.max_pending,
            });
        }

        let handle = EventHandle {
            cycle: self.now.saturating_add(delay),
            seq: self.next_seq,
        };
        self.next_seq += 1;

        log::trace!("Scheduler: '{}' at cycle {} (+{})", name, handle.cycle, delay);
        self.events.insert(
            (handle.cycle, handle.seq),
            ScheduledEvent {
                name,
                callback: Box::new(callback),
            },
        );
        Ok(handle)
    }

    /// Remove one event; returns whether it was still pending
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        self.events.remove(&(handle.cycle, handle.seq)).is_some()
    }

    /// Remove every pending event called `name`; returns how many were removed
    pub fn cancel_all_named(&mut self, name: &str) -> usize {
        let before = self.events.len();
        self.events.retain(|_, event| event.name != name);
        let removed = before - self.events.len();
        if removed > 0 {
            log::trace!("Scheduler: cancelled {} x '{}'", removed, name);
        }
        removed
    }

    /// Remove and return the earliest event due at or before the current time
    pub fn pop_due(&mut self) -> Option<ScheduledEvent<H>> {
        let entry = self.events.first_entry()?;
        if entry.key().0 > self.now {
            return None;
        }
        Some(entry.remove())
    }

    /// Move the clock forward without running anything
    ///
    /// Returns the new time. Hosts normally use [`SchedulerHost::advance`].
    pub fn tick(&mut self, cycles: Cycle) -> Cycle {
        self.now = self.now.saturating_add(cycles);
        self.now
    }

    #[inline]
    pub fn now(&self) -> Cycle {
        self.now
    }

    /// Number of queued events
    pub fn pending(&self) -> usize {
        self.events.len()
    }

    /// Firing time of the earliest event
    pub fn next_event_time(&self) -> Option<Cycle> {
        self.events.keys().next().map(|&(cycle, _)| cycle)
    }

    /// Names of queued events in firing order
    pub fn pending_names(&self) -> Vec<&str> {
        self.events.values().map(|e| e.name.as_str()).collect()
    }

    /// Whether an event called `name` is queued
    pub fn is_pending(&self, name: &str) -> bool {
        self.events.values().any(|e| e.name == name)
    }

    /// Convert microseconds of guest time to cycles
    pub fn us_to_cycles(&self, us: u64) -> Cycle {
        (u128::from(us) * u128::from(self.cpu_frequency) / 1_000_000) as Cycle
    }

    /// Drop all events and rewind to cycle 0
    pub fn reset(&mut self) {
        self.now = 0;
        self.next_seq = 0;
        self.events.clear();
    }
}

impl<H> fmt::Debug for Scheduler<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now)
            .field("max_pending", &self.max_pending)
            .field("events", &self.pending_names())
            .finish()
    }
}

/// Owner of a [`Scheduler`] whose callbacks mutate it
pub trait SchedulerHost: Sized {
    fn scheduler_mut(&mut self) -> &mut Scheduler<Self>;

    /// Called after every fired event, before the next one is popped
    ///
    /// Hosts drain work queued by callbacks here.
    fn after_event(&mut self) -> Result<()> {
        Ok(())
    }

    /// Advance the clock by `cycles` and run every event that became due
    ///
    /// Events scheduled by callbacks (or by [`after_event`]) run in the same
    /// call when they are already due. A failing callback stops the loop;
    /// later events stay queued.
    ///
    /// [`after_event`]: SchedulerHost::after_event
    fn advance(&mut self, cycles: Cycle) -> Result<()> {
        self.scheduler_mut().tick(cycles);
        while let Some(event) = self.scheduler_mut().pop_due() {
            log::trace!("Scheduler: firing '{}'", event.name);
            event.fire(self)?;
            self.after_event()?;
        }
        Ok(())
    }

    /// Jump to the next event and run it (plus anything else due then)
    ///
    /// Returns the number of cycles skipped.
    ///
    /// # Errors
    ///
    /// `EmptyEventQueue` when nothing is scheduled.
    fn skip_to_next_event(&mut self) -> Result<Cycle> {
        let scheduler = self.scheduler_mut();
        let next = scheduler
            .next_event_time()
            .ok_or(EmulatorError::EmptyEventQueue)?;
        let elapsed = next.saturating_sub(scheduler.now());
        self.advance(elapsed)?;
        Ok(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestHost {
        scheduler: Scheduler<TestHost>,
        log: Vec<(&'static str, Cycle)>,
        settled: usize,
    }

    impl TestHost {
        fn new() -> Self {
            Self {
                scheduler: Scheduler::new(&TimingConfig::default()),
                log: Vec::new(),
                settled: 0,
            }
        }

        fn record(&mut self, delay: Cycle, tag: &'static str) -> EventHandle {
            self.scheduler
                .schedule(delay, tag, move |h: &mut TestHost| {
                    let now = h.scheduler.now();
                    h.log.push((tag, now));
                    Ok(())
                })
                .unwrap()
        }
    }

    impl SchedulerHost for TestHost {
        fn scheduler_mut(&mut self) -> &mut Scheduler<Self> {
            &mut self.scheduler
        }

        fn after_event(&mut self) -> Result<()> {
            self.settled += 1;
            Ok(())
        }
    }

    #[test]
    fn test_scheduler_initialization() {
        let host = TestHost::new();
        assert_eq!(host.scheduler.now(), 0);
        assert_eq!(host.scheduler.pending(), 0);
        assert_eq!(host.scheduler.next_event_time(), None);
    }

    #[test]
    fn test_single_event_execution() {
        let mut host = TestHost::new();
        host.record(1000, "a");

        host.advance(999).unwrap();
        assert!(host.log.is_empty());

        host.advance(1).unwrap();
        assert_eq!(host.log, vec![("a", 1000)]);
        assert_eq!(host.scheduler.pending(), 0);
    }

    #[test]
    fn test_multiple_events_in_order() {
        let mut host = TestHost::new();
        host.record(1000, "one");
        host.record(500, "two");
        host.record(1500, "three");

        host.advance(2000).unwrap();
        assert_eq!(host.log, vec![("two", 2000), ("one", 2000), ("three", 2000)]);
    }

    #[test]
    fn test_same_cycle_events_run_fifo() {
        let mut host = TestHost::new();
        for tag in ["first", "second", "third", "fourth"] {
            host.record(10, tag);
        }

        host.advance(10).unwrap();
        let order: Vec<_> = host.log.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(order, vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn test_late_event_execution() {
        let mut host = TestHost::new();
        host.record(1000, "late");

        host.advance(1500).unwrap();
        assert_eq!(host.log, vec![("late", 1500)]);
        assert_eq!(host.scheduler.now(), 1500);
    }

    #[test]
    fn test_callback_scheduled_due_event_runs_same_advance() {
        let mut host = TestHost::new();
        host.scheduler
            .schedule(5, "outer", |h: &mut TestHost| {
                h.log.push(("outer", h.scheduler.now()));
                h.record(0, "inner");
                Ok(())
            })
            .unwrap();

        host.advance(5).unwrap();
        assert_eq!(host.log, vec![("outer", 5), ("inner", 5)]);
    }

    #[test]
    fn test_after_event_runs_once_per_fired_event() {
        let mut host = TestHost::new();
        host.record(10, "a");
        host.record(10, "b");
        host.record(50, "c");

        host.advance(10).unwrap();
        assert_eq!(host.settled, 2);
        host.advance(100).unwrap();
        assert_eq!(host.settled, 3);
        host.advance(100).unwrap();
        assert_eq!(host.settled, 3);
    }

    #[test]
    fn test_cancel_by_name_and_handle() {
        let mut host = TestHost::new();
        host.record(10, "wakeup 1");
        host.record(20, "wakeup 1");
        let keep = host.record(30, "timeout 1");
        let drop = host.record(40, "timeout 2");

        assert_eq!(host.scheduler.cancel_all_named("wakeup 1"), 2);
        assert_eq!(host.scheduler.cancel_all_named("wakeup 1"), 0);
        assert!(host.scheduler.cancel(drop));
        assert!(!host.scheduler.cancel(drop));
        assert_eq!(host.scheduler.pending_names(), vec!["timeout 1"]);
        assert_eq!(host.scheduler.next_event_time(), Some(keep.cycle()));
    }

    #[test]
    fn test_skip_to_next_event() {
        let mut host = TestHost::new();
        host.record(250, "a");
        host.record(250, "b");
        host.record(400, "c");

        assert_eq!(host.skip_to_next_event().unwrap(), 250);
        assert_eq!(host.log, vec![("a", 250), ("b", 250)]);

        assert_eq!(host.skip_to_next_event().unwrap(), 150);
        assert_eq!(host.scheduler.now(), 400);

        assert!(matches!(
            host.skip_to_next_event(),
            Err(EmulatorError::EmptyEventQueue)
        ));
    }

    #[test]
    fn test_queue_overflow() {
        let mut host = TestHost::new();
        for _ in 0..64 {
            host.record(1, "spin");
        }

        let err = host
            .scheduler
            .schedule(1, "one too many", |_: &mut TestHost| Ok(()))
            .unwrap_err();
        assert!(matches!(err, EmulatorError::SchedulerQueueOverflow { limit: 64 }));
        assert_eq!(host.scheduler.pending(), 64);
    }

    #[test]
    fn test_failing_callback_keeps_later_events() {
        let mut host = TestHost::new();
        host.scheduler
            .schedule(1, "bad", |_: &mut TestHost| Err(EmulatorError::EmptyEventQueue))
            .unwrap();
        host.record(1, "after");

        assert!(host.advance(1).is_err());
        assert_eq!(host.scheduler.pending_names(), vec!["after"]);

        host.advance(0).unwrap();
        assert_eq!(host.log, vec![("after", 1)]);
    }

    #[test]
    fn test_us_to_cycles() {
        let host = TestHost::new();
        assert_eq!(host.scheduler.us_to_cycles(1), 3_200);
        assert_eq!(host.scheduler.us_to_cycles(1000), 3_200_000);
        assert_eq!(host.scheduler.us_to_cycles(0), 0);
    }

    #[test]
    fn test_reset() {
        let mut host = TestHost::new();
        host.record(10, "a");
        host.advance(5).unwrap();

        host.scheduler.reset();
        assert_eq!(host.scheduler.now(), 0);
        assert_eq!(host.scheduler.pending(), 0);
    }
}
