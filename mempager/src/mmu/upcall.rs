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

use std::{collections::HashMap, sync::Arc};

use log::debug;
use parking_lot::Mutex;

use super::connection::Connection;
use crate::{
    modules::mapping::{MappingModule, Protection},
    protocol::Message,
    MappingError, Pid,
};

/// Applies mapping changes by sending upcalls to the client that owns the page.
///
/// Frame `n` is at offset `n * page_size` of the physical memory image.
pub(crate) struct RemoteMapping<'a> {
    connections: &'a Mutex<HashMap<u64, Arc<Connection>>>,
    page_size: usize,
}

impl<'a> RemoteMapping<'a> {
    pub(crate) fn new(
        connections: &'a Mutex<HashMap<u64, Arc<Connection>>>,
        page_size: usize,
    ) -> Self {
        Self {
            connections,
            page_size,
        }
    }

    fn connection(&self, pid: Pid) -> Result<Arc<Connection>, MappingError> {
        self.connections
            .lock()
            .values()
            .find(|connection| connection.pid() == Some(pid))
            .cloned()
            .ok_or(MappingError::NoConnection(pid))
    }

    fn upcall(&self, pid: Pid, message: Message) -> Result<(), MappingError> {
        let connection = self.connection(pid)?;
        connection
            .upcall(message)
            .map_err(|source| MappingError::Upcall { pid, source })?;
        debug!("connection {}: upcall acknowledged", connection.id());
        Ok(())
    }
}

impl MappingModule for RemoteMapping<'_> {
    fn resident(
        &self,
        pid: Pid,
        vaddr: usize,
        frame: usize,
        prot: Protection,
    ) -> Result<(), MappingError> {
        self.upcall(
            pid,
            Message::Resident {
                prot: prot.bits(),
                offset: (frame * self.page_size) as u64,
                vaddr: vaddr as u64,
            },
        )
    }

    fn nonresident(&self, pid: Pid, vaddr: usize) -> Result<(), MappingError> {
        self.chprot(pid, vaddr, Protection::None)
    }

    fn chprot(&self, pid: Pid, vaddr: usize, prot: Protection) -> Result<(), MappingError> {
        self.upcall(
            pid,
            Message::Protect {
                prot: prot.bits(),
                vaddr: vaddr as u64,
            },
        )
    }
}
