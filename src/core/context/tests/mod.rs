// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut

//! Context manager tests
//!
//! - `lifecycle`: creation, stacks, TLS, exit and join
//! - `scheduling`: round robin, register preservation, disabling
//! - `blocking`: sleep, wait, timeouts, events and the mailbox
//! - `helpers`: a minimal scheduler host

use super::*;

mod helpers;
mod lifecycle;
