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

use libc::{PROT_NONE, PROT_READ, PROT_WRITE};

use crate::{MappingError, Pid};

/// Access permissions of a mapped client page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

impl Protection {
    /// `PROT_*` bits as used by `mmap` and `mprotect`.
    pub fn bits(self) -> i32 {
        match self {
            Protection::None => PROT_NONE,
            Protection::Read => PROT_READ,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
        }
    }

    pub fn from_bits(bits: i32) -> Option<Self> {
        match bits {
            b if b == PROT_NONE => Some(Protection::None),
            b if b == PROT_READ => Some(Protection::Read),
            b if b == PROT_READ | PROT_WRITE => Some(Protection::ReadWrite),
            _ => None,
        }
    }
}

/// Changes the page mappings of client processes.
///
/// All calls block until the client has applied the change,
/// so a frame can be reused safely as soon as a call returns.
/// `vaddr` is always page aligned.
pub trait MappingModule {
    /// Maps `vaddr` of process `pid` to `frame` with protection `prot`.
    fn resident(&self, pid: Pid, vaddr: usize, frame: usize, prot: Protection)
        -> Result<(), MappingError>;

    /// Makes the page at `vaddr` of process `pid` inaccessible.
    fn nonresident(&self, pid: Pid, vaddr: usize) -> Result<(), MappingError>;

    /// Changes the protection of the page at `vaddr` of process `pid`.
    fn chprot(&self, pid: Pid, vaddr: usize, prot: Protection) -> Result<(), MappingError>;
}

#[cfg(test)]
mod test {
    use super::Protection;

    #[test]
    fn test_protection_bits() {
        for prot in [Protection::None, Protection::Read, Protection::ReadWrite] {
            assert_eq!(Protection::from_bits(prot.bits()), Some(prot));
        }
        assert_eq!(Protection::from_bits(libc::PROT_WRITE), None);
    }
}
