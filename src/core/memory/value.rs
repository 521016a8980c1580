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

//! Guest value widths
//!
//! Guest memory is big-endian. Values cross the memory boundary through
//! this trait so every path swaps bytes the same way.

/// An unsigned integer that can be loaded from or stored to guest memory
pub trait GuestValue: Copy + std::fmt::Debug + PartialEq + 'static {
    /// Width in bytes
    const SIZE: usize;

    /// Decode from the first `SIZE` bytes of `bytes` (guest order)
    fn read_be(bytes: &[u8]) -> Self;

    /// Encode into the first `SIZE` bytes of `out` (guest order)
    fn write_be(self, out: &mut [u8]);
}

macro_rules! impl_guest_value {
    ($($ty:ty),*) => {
        $(
            impl GuestValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline(always)]
                fn read_be(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_be_bytes(raw)
                }

                #[inline(always)]
                fn write_be(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_be_bytes());
                }
            }
        )*
    };
}

impl_guest_value!(u8, u16, u32, u64, u128);

/// Operation name used in diagnostics, e.g. `read32`
pub(crate) fn access_name(write: bool, size: usize) -> &'static str {
    match (write, size) {
        (false, 1) => "read8",
        (false, 2) => "read16",
        (false, 4) => "read32",
        (false, 8) => "read64",
        (false, 16) => "read128",
        (false, _) => "read",
        (true, 1) => "write8",
        (true, 2) => "write16",
        (true, 4) => "write32",
        (true, 8) => "write64",
        (true, 16) => "write128",
        (true, _) => "write",
    }
}
