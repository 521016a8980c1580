// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut

//! Address space tests
//!
//! - `allocator`: physical allocation and available-memory accounting
//! - `mapping`: map/unmap/free and translation laws
//! - `access`: read/write round trips on the fast and slow paths
//! - `watchpoints`: watchpoint dispatch and fast-path eligibility
//! - `helpers`: common test utilities

use super::*;

mod helpers;
