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

use std::io;

use thiserror::Error;

use crate::Pid;

/// Errors of the policy engine.
///
/// Only [`PagerError::NoSpace`] and [`PagerError::InvalidRegion`] are ever reported back to a client,
/// everything else either closes one connection or stops the whole manager.
#[derive(Debug, Error)]
pub enum PagerError {
    #[error("no free block left to extend process {0}")]
    NoSpace(Pid),

    #[error("region {addr:#x}+{len} is not allocated to process {pid}")]
    InvalidRegion { pid: Pid, addr: usize, len: usize },

    #[error("process {0} is already registered")]
    DuplicateProcess(Pid),

    #[error("process {0} was never registered")]
    UnknownProcess(Pid),

    #[error("address {addr:#x} is not allocated to process {pid}")]
    UnmanagedAddress { pid: Pid, addr: usize },

    #[error("clock sweep did not find a victim frame")]
    NoVictim,

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

impl PagerError {
    /// Errors that are reported to the requesting client as a failure value.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PagerError::NoSpace(_) | PagerError::InvalidRegion { .. }
        )
    }

    /// Errors that mean the pager tables can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PagerError::DuplicateProcess(_) | PagerError::UnknownProcess(_) | PagerError::NoVictim
        )
    }
}

/// Errors while changing the mappings of a client.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("process {0} has no open connection")]
    NoConnection(Pid),

    #[error("upcall to process {pid} failed: {source}")]
    Upcall {
        pid: Pid,
        #[source]
        source: ProtocolError,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown message type {0}")]
    UnknownMessage(u32),

    #[error("expected {expected} but received {received}")]
    Unexpected {
        expected: &'static str,
        received: &'static str,
    },

    #[error("path of {0} bytes does not fit into a message")]
    PathTooLong(usize),

    #[error("peer disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum MmuError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not bind {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("could not create physical memory image: {0}")]
    Memory(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum UvmError {
    #[error("no swap space left")]
    NoSpace,

    #[error("region is not allocated")]
    InvalidRegion,

    #[error("another client runtime is already active in this process")]
    AlreadyActive,

    #[error("could not set up client memory: {0}")]
    Memory(#[source] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("frame count {0} out of range, expected 1 <= frames <= 256")]
    FrameCount(usize),

    #[error("block count {0} out of range, expected 2 <= blocks <= 1024")]
    BlockCount(usize),
}
