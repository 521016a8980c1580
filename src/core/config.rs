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

//! Machine configuration
//!
//! All knobs default to the values of the retail console memory map and the
//! 3.2 GHz guest clock. A TOML file may override any subset of them:
//!
//! ```toml
//! [memory]
//! main_size = 0x1000000
//!
//! [timing]
//! max_pending_events = 128
//! ```
//!
//! # Example
//!
//! ```
//! use cellrx::core::config::MachineConfig;
//!
//! let config = MachineConfig::from_toml_str("[threads]\ndefault_stack_size = 0x80000\n").unwrap();
//! assert_eq!(config.threads.default_stack_size, 0x80000);
//! assert_eq!(config.timing.cpu_frequency, 3_200_000_000);
//! ```

use crate::core::error::{EmulatorError, Result};
use crate::core::memory::layout;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration of a [`System`](crate::core::system::System)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub memory: MemoryConfig,
    pub timing: TimingConfig,
    pub threads: ThreadConfig,
}

/// Guest memory layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Virtual base of main RAM allocations
    pub main_base: u64,
    /// Main RAM size in bytes
    pub main_size: u64,
    /// Bytes of main RAM reserved for the OS (not reported as available)
    pub main_system_reserve: u64,
    pub video_base: u64,
    pub video_size: u64,
    /// Stack window base; context stacks are aliased here on switch
    pub stack_base: u64,
    pub stack_size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            main_base: layout::RAM_START,
            main_size: layout::RAM_SIZE,
            main_system_reserve: layout::RAM_SYSTEM_RESERVE,
            video_base: layout::VIDEO_MEM_START,
            video_size: layout::VIDEO_MEM_SIZE,
            stack_base: layout::STACK_REGION_START,
            stack_size: layout::STACK_REGION_SIZE,
        }
    }
}

/// Virtual clock parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Guest clock in Hz, used to convert microseconds to cycles
    pub cpu_frequency: u64,
    /// Queue size limit; exceeding it signals a runaway retry loop
    pub max_pending_events: usize,
    /// Delay before a third-party write is reported as a lost reservation
    pub reservation_written_delay: u64,
    /// Delay before a competing commit is reported as a lost reservation
    pub reservation_committed_delay: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cpu_frequency: 3_200_000_000,
            max_pending_events: 64,
            reservation_written_delay: 10_000,
            reservation_committed_delay: 5_000,
        }
    }
}

/// Execution context defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Minimum stack size; smaller requests are rounded up to it
    pub default_stack_size: u64,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            default_stack_size: layout::DEFAULT_STACK_SIZE,
        }
    }
}

impl MachineConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MachineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    ///
    /// # Errors
    ///
    /// Returns `EmulatorError::Io` if the file cannot be read and
    /// `EmulatorError::Toml` if it is not valid TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        log::info!("Loaded configuration from {}", path.as_ref().display());
        Self::from_toml_str(&text)
    }

    /// Check the layout is usable
    ///
    /// Region bases must be page aligned, regions must not overlap inside
    /// the 32-bit guest space, and the system reserve must fit in RAM.
    pub fn validate(&self) -> Result<()> {
        let mem = &self.memory;
        let regions = [
            ("main", mem.main_base, mem.main_size),
            ("video", mem.video_base, mem.video_size),
            ("stack", mem.stack_base, mem.stack_size),
        ];

        for (name, base, size) in regions {
            if base & layout::PAGE_MASK != 0 {
                return Err(EmulatorError::Config(format!(
                    "{name} region base 0x{base:X} is not page aligned"
                )));
            }
            if size == 0 || base + size > layout::GUEST_ADDRESS_LIMIT {
                return Err(EmulatorError::Config(format!(
                    "{name} region 0x{base:X}+0x{size:X} does not fit the guest address space"
                )));
            }
        }

        for (i, (name_a, base_a, size_a)) in regions.iter().enumerate() {
            for (name_b, base_b, size_b) in regions.iter().skip(i + 1) {
                if base_a < &(base_b + size_b) && base_b < &(base_a + size_a) {
                    return Err(EmulatorError::Config(format!(
                        "{name_a} and {name_b} regions overlap"
                    )));
                }
            }
        }

        if mem.main_system_reserve > mem.main_size {
            return Err(EmulatorError::Config(
                "system reserve is larger than main RAM".to_string(),
            ));
        }

        if self.timing.cpu_frequency == 0 {
            return Err(EmulatorError::Config("cpu_frequency must be non-zero".to_string()));
        }

        Ok(())
    }

    /// Small layout for tests and tools: 16 MiB RAM, 4 MiB video, 4 MiB stacks
    pub fn compact() -> Self {
        Self {
            memory: MemoryConfig {
                main_size: 16 * 1024 * 1024,
                main_system_reserve: 1024 * 1024,
                video_size: 4 * 1024 * 1024,
                stack_size: 4 * 1024 * 1024,
                ..MemoryConfig::default()
            },
            ..Self::default()
        }
    }
}
