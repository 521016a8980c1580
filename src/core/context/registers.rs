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

//! Interpreter register files
//!
//! The context manager swaps whole register files on every context switch.
//! It only needs to know where the ABI keeps a handful of values, which is
//! what [`RegisterState`] exposes.

use std::fmt;

/// ABI view of an interpreter register file
pub trait RegisterState: Clone + Default + fmt::Debug {
    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);

    fn stack_pointer(&self) -> u64;
    fn set_stack_pointer(&mut self, sp: u64);

    /// Argument register `index` (0-based)
    fn arg(&self, index: usize) -> u64;
    fn set_arg(&mut self, index: usize, value: u64);

    fn return_value(&self) -> u64;
    fn set_return_value(&mut self, value: u64);

    /// Table-of-contents pointer from a function descriptor
    fn set_toc(&mut self, _toc: u64) {}

    /// Thread-local storage base
    fn set_tls(&mut self, _base: u64) {}
}

/// General-purpose (PPU) register file
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PpuRegisters {
    pub gprs: [u64; 32],
    pub pc: u64,
    pub lr: u64,
    pub ctr: u64,
    pub cr: u32,
    pub xer: u64,
}

impl PpuRegisters {
    /// r1
    pub const SP: usize = 1;
    /// r2
    pub const TOC: usize = 2;
    /// r3..r10 carry arguments, r3 the return value
    pub const ARG0: usize = 3;
    /// r13
    pub const TLS: usize = 13;
}

impl fmt::Debug for PpuRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc=0x{:08X} lr=0x{:08X} ctr=0x{:X} cr=0x{:08X}", self.pc, self.lr, self.ctr, self.cr)?;
        for (i, value) in self.gprs.iter().enumerate() {
            if *value != 0 {
                write!(f, " r{}=0x{:X}", i, value)?;
            }
        }
        Ok(())
    }
}

impl RegisterState for PpuRegisters {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn stack_pointer(&self) -> u64 {
        self.gprs[Self::SP]
    }

    fn set_stack_pointer(&mut self, sp: u64) {
        self.gprs[Self::SP] = sp;
    }

    fn arg(&self, index: usize) -> u64 {
        self.gprs[Self::ARG0 + index]
    }

    fn set_arg(&mut self, index: usize, value: u64) {
        self.gprs[Self::ARG0 + index] = value;
    }

    fn return_value(&self) -> u64 {
        self.gprs[Self::ARG0]
    }

    fn set_return_value(&mut self, value: u64) {
        self.gprs[Self::ARG0] = value;
    }

    fn set_toc(&mut self, toc: u64) {
        self.gprs[Self::TOC] = toc;
    }

    fn set_tls(&mut self, base: u64) {
        self.gprs[Self::TLS] = base;
    }
}

/// Coprocessor (SPU) register file
///
/// Registers are 128 bits wide. Scalars live in the preferred slot, the
/// most significant doubleword.
#[derive(Clone, PartialEq, Eq)]
pub struct SpuRegisters {
    pub gprs: [u128; 128],
    pub pc: u64,
}

impl SpuRegisters {
    pub const SP: usize = 1;
    pub const ARG0: usize = 3;
    /// Initial stack pointer: top of the 256 KiB local store
    pub const LOCAL_STORE_TOP: u64 = 0x3FFF0;

    #[inline]
    pub fn preferred(&self, index: usize) -> u64 {
        (self.gprs[index] >> 64) as u64
    }

    #[inline]
    pub fn set_preferred(&mut self, index: usize, value: u64) {
        let low = self.gprs[index] & u128::from(u64::MAX);
        self.gprs[index] = (u128::from(value) << 64) | low;
    }
}

impl Default for SpuRegisters {
    fn default() -> Self {
        let mut regs = Self {
            gprs: [0; 128],
            pc: 0,
        };
        regs.set_preferred(Self::SP, Self::LOCAL_STORE_TOP);
        regs
    }
}

impl fmt::Debug for SpuRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc=0x{:05X}", self.pc)?;
        for (i, value) in self.gprs.iter().enumerate() {
            if *value != 0 {
                write!(f, " r{}=0x{:032X}", i, value)?;
            }
        }
        Ok(())
    }
}

impl RegisterState for SpuRegisters {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn stack_pointer(&self) -> u64 {
        self.preferred(Self::SP)
    }

    fn set_stack_pointer(&mut self, sp: u64) {
        self.set_preferred(Self::SP, sp);
    }

    fn arg(&self, index: usize) -> u64 {
        self.preferred(Self::ARG0 + index)
    }

    fn set_arg(&mut self, index: usize, value: u64) {
        self.set_preferred(Self::ARG0 + index, value);
    }

    fn return_value(&self) -> u64 {
        self.preferred(Self::ARG0)
    }

    fn set_return_value(&mut self, value: u64) {
        self.set_preferred(Self::ARG0, value);
    }
}
