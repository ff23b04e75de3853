/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::path::PathBuf;

use crate::{error::ConfigError, util::page_size};

/// First address of the region in which client pages are mapped.
///
/// This address is not normally used by the Linux kernel.
pub const UVM_BASE_ADDR: usize = 0x6000_0000;

/// Last address of the client region (1 MiB in total, 256 pages of 4 KiB).
pub const UVM_MAX_ADDR: usize = 0x600F_FFFF;

pub(crate) const MAX_FRAMES: usize = 256;
pub(crate) const MIN_BLOCKS: usize = 2;
pub(crate) const MAX_BLOCKS: usize = 1024;

const SOCKET_ENV: &str = "MEMPAGER_SOCKET";
const DEFAULT_SOCKET_PATH: &str = "/tmp/mempager.sock";

fn default_socket_path() -> PathBuf {
    std::env::var_os(SOCKET_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

/// Configuration of the memory manager process.
#[derive(Debug, Clone)]
pub struct MmuConfig {
    /// Number of frames of emulated physical memory
    pub frame_count: usize,

    /// Number of blocks of the emulated swap disk
    pub block_count: usize,

    /// Unix socket the manager listens on
    pub socket_path: PathBuf,

    /// Directory in which the physical memory image is created
    pub pmem_dir: PathBuf,
}

impl MmuConfig {
    /// Creates a config with the default socket path (`$MEMPAGER_SOCKET` if set).
    pub fn new(frame_count: usize, block_count: usize) -> Self {
        Self {
            frame_count,
            block_count,
            socket_path: default_socket_path(),
            pmem_dir: std::env::temp_dir(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_count < 1 || self.frame_count > MAX_FRAMES {
            return Err(ConfigError::FrameCount(self.frame_count));
        }
        if self.block_count < MIN_BLOCKS || self.block_count > MAX_BLOCKS {
            return Err(ConfigError::BlockCount(self.block_count));
        }
        Ok(())
    }

    pub(crate) fn pager_config(&self) -> PagerConfig {
        PagerConfig {
            frame_count: self.frame_count,
            block_count: self.block_count,
            page_size: page_size(),
            base_addr: UVM_BASE_ADDR,
            max_addr: UVM_MAX_ADDR,
        }
    }
}

/// Table sizes and address layout used by the [`Pager`](crate::Pager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerConfig {
    pub frame_count: usize,
    pub block_count: usize,
    pub page_size: usize,

    /// Virtual address of a process's first page
    pub base_addr: usize,

    /// Last virtual address a page may cover
    pub max_addr: usize,
}

impl PagerConfig {
    /// Config with the host page size and the default client region.
    pub fn new(frame_count: usize, block_count: usize) -> Self {
        Self {
            frame_count,
            block_count,
            page_size: page_size(),
            base_addr: UVM_BASE_ADDR,
            max_addr: UVM_MAX_ADDR,
        }
    }

    /// Maximum number of pages a single process can address.
    #[inline]
    pub fn region_pages(&self) -> usize {
        (self.max_addr + 1 - self.base_addr) / self.page_size
    }
}

/// Configuration of a client runtime.
#[derive(Debug, Clone)]
pub struct UvmConfig {
    pub socket_path: PathBuf,
}

impl Default for UvmConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{MmuConfig, PagerConfig};
    use crate::ConfigError;

    #[test]
    fn test_validate_ranges() {
        assert!(MmuConfig::new(1, 2).validate().is_ok());
        assert!(MmuConfig::new(256, 1024).validate().is_ok());

        assert!(matches!(
            MmuConfig::new(0, 4).validate(),
            Err(ConfigError::FrameCount(0))
        ));
        assert!(matches!(
            MmuConfig::new(257, 4).validate(),
            Err(ConfigError::FrameCount(257))
        ));
        assert!(matches!(
            MmuConfig::new(4, 1).validate(),
            Err(ConfigError::BlockCount(1))
        ));
        assert!(matches!(
            MmuConfig::new(4, 1025).validate(),
            Err(ConfigError::BlockCount(1025))
        ));
    }

    #[test]
    fn test_region_pages() {
        let config = PagerConfig {
            page_size: 4096,
            ..PagerConfig::new(2, 4)
        };
        assert_eq!(config.region_pages(), 256);
    }
}
