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

use super::BackingStoreModule;

/// Backing store that keeps memory and disk in plain vectors.
///
/// Frames cannot be mapped by other processes, so this is only useful if no real clients are involved.
pub struct MemoryBackingStore {
    page_size: usize,
    memory: Vec<u8>,
    disk: Vec<u8>,
}

impl MemoryBackingStore {
    pub fn new(page_size: usize, frame_count: usize, block_count: usize) -> Self {
        Self {
            page_size,
            memory: vec![0; page_size * frame_count],
            disk: vec![0; page_size * block_count],
        }
    }
}

impl BackingStoreModule for MemoryBackingStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn disk(&self) -> &[u8] {
        &self.disk
    }

    fn parts_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut self.memory, &mut self.disk)
    }
}

#[cfg(test)]
mod test {
    use super::MemoryBackingStore;
    use crate::modules::backing_store::{test::test_backing_store_normal, BackingStoreModule};

    #[test]
    fn test_memory_backing_store_normal() {
        test_backing_store_normal(MemoryBackingStore::new(256, 2, 4));
    }

    #[test]
    fn test_memory_backing_store_counts() {
        let store = MemoryBackingStore::new(4096, 3, 7);
        assert_eq!(store.frame_count(), 3);
        assert_eq!(store.block_count(), 7);
        assert_eq!(store.frame(2).len(), 4096);
    }
}
