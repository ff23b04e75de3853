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

use std::{
    fs::{remove_file, File},
    io,
    mem::ManuallyDrop,
    path::{Path, PathBuf},
};

use super::BackingStoreModule;
use crate::util::mmap_guard::MMapGuard;

/// Backing store whose physical memory is a shared mapping of a file.
///
/// Clients open the same file and map single frames of it into their own address space,
/// so every write of a client ends up in the manager's memory without any copying.
/// The disk is private to the manager and kept in a vector.
pub struct FileBackingStore {
    /// shared mapping of `file`, dropped before the file is closed
    memory: ManuallyDrop<MMapGuard>,

    /// underlying file which will be mapped
    file: ManuallyDrop<File>,

    /// path of file, save for deleting file later
    file_path: PathBuf,

    disk: Vec<u8>,

    page_size: usize,
}

impl FileBackingStore {
    /// Creates (or truncates) the memory image at `file_path` and maps it.
    pub fn new(
        file_path: PathBuf,
        page_size: usize,
        frame_count: usize,
        block_count: usize,
    ) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .truncate(true)
            .create(true)
            .open(&file_path)?;

        let memory_size = page_size * frame_count;
        file.set_len(memory_size as u64)?;

        let memory = MMapGuard::map_shared(&file, memory_size)?;
        log::info!(
            "physical memory: {} bytes in {} frames at {}",
            memory_size,
            frame_count,
            file_path.display()
        );
        log::info!(
            "disk: {} bytes in {} blocks",
            page_size * block_count,
            block_count
        );

        Ok(Self {
            memory: ManuallyDrop::new(memory),
            file: ManuallyDrop::new(file),
            file_path,
            disk: vec![0; page_size * block_count],
            page_size,
        })
    }

    /// Path clients have to map to see the physical memory.
    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

impl BackingStoreModule for FileBackingStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn memory(&self) -> &[u8] {
        self.memory.as_slice()
    }

    fn disk(&self) -> &[u8] {
        &self.disk
    }

    fn parts_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        (self.memory.as_mut_slice(), &mut self.disk)
    }
}

impl Drop for FileBackingStore {
    fn drop(&mut self) {
        // unmap and close file before removing
        // note that after this call, neither memory nor file should be accessed again...
        unsafe {
            ManuallyDrop::drop(&mut self.memory);
            ManuallyDrop::drop(&mut self.file);
        }

        if self.file_path.exists() {
            let _ = remove_file(&self.file_path);
        }
    }
}
