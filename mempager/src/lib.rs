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

//! User-space demand paging.
//!
//! A central memory manager ([`Mmu`]) emulates physical memory and a swap
//! disk for several client processes. Clients link the runtime in [`Uvm`],
//! which turns real page faults into requests for the manager. The policy
//! itself (frame/block bookkeeping and clock eviction) lives in [`Pager`].

mod config;
mod error;
mod mmu;
mod pager;
mod uvm;
mod util;

pub mod modules;
pub mod protocol;

pub use config::{MmuConfig, PagerConfig, UvmConfig, UVM_BASE_ADDR, UVM_MAX_ADDR};
pub use error::{ConfigError, MappingError, MmuError, PagerError, ProtocolError, UvmError};
pub use mmu::{Mmu, ShutdownHandle};
pub use pager::{AddressSpace, Block, Frame, Page, PageRef, Pager};
pub use uvm::Uvm;
pub use util::page_size;

/// Process id as reported by a client on registration.
pub type Pid = u32;
