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

//! Runs the client runtime against a manager inside of this process.
//!
//! Kept in its own test binary with a single test: the runtime installs a process wide
//! SIGSEGV handler and reserves a fixed address range.

use std::{ptr, thread};

use mempager::{page_size, Mmu, MmuConfig, Uvm, UvmConfig, UvmError, UVM_BASE_ADDR};

#[test]
fn test_demand_paging_with_swapping() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("mmu.sock");
    let mmu = Mmu::bind(MmuConfig {
        frame_count: 2,
        block_count: 8,
        socket_path: socket_path.clone(),
        pmem_dir: dir.path().to_path_buf(),
    })
    .unwrap();
    let handle = mmu.shutdown_handle();
    let manager = thread::spawn(move || mmu.run());

    let uvm = Uvm::connect(UvmConfig {
        socket_path: socket_path.clone(),
    })
    .unwrap();
    assert!(matches!(
        Uvm::connect(UvmConfig {
            socket_path: socket_path.clone()
        }),
        Err(UvmError::AlreadyActive)
    ));

    let pages: Vec<*mut u8> = (0..3).map(|_| uvm.extend().unwrap().as_ptr()).collect();
    for (i, page) in pages.iter().enumerate() {
        assert_eq!(*page as usize, UVM_BASE_ADDR + i * page_size());
    }
    assert_eq!(uvm.page_count(), 3);

    unsafe {
        ptr::write_volatile(pages[0], b'1');
        assert_eq!(ptr::read_volatile(pages[0].add(1)), b'0');

        // only two frames, the first page has to be swapped out
        ptr::write_volatile(pages[1], b'2');
        ptr::write_volatile(pages[2], b'3');

        assert_eq!(ptr::read_volatile(pages[0]), b'1');
        assert_eq!(ptr::read_volatile(pages[1]), b'2');
        assert_eq!(ptr::read_volatile(pages[2]), b'3');

        // written again after being swapped in read only
        ptr::write_volatile(pages[0].add(2), b'4');
        assert_eq!(ptr::read_volatile(pages[0].add(2)), b'4');
    }

    uvm.read_region(pages[0], 4).unwrap();
    uvm.read_region(pages[1].wrapping_add(page_size() - 2), 4)
        .unwrap();
    assert!(matches!(
        uvm.read_region(pages[2].wrapping_add(page_size() - 2), 4),
        Err(UvmError::InvalidRegion)
    ));

    // five blocks left
    for _ in 0..5 {
        uvm.extend().unwrap();
    }
    assert!(matches!(uvm.extend(), Err(UvmError::NoSpace)));
    assert_eq!(uvm.page_count(), 8);

    uvm.exit().unwrap();

    // a new runtime starts with an empty address space
    let uvm = Uvm::connect(UvmConfig { socket_path }).unwrap();
    let page = uvm.extend().unwrap().as_ptr();
    assert_eq!(page as usize, UVM_BASE_ADDR);
    assert_eq!(unsafe { ptr::read_volatile(page) }, b'0');
    drop(uvm);

    handle.shutdown();
    manager.join().unwrap().unwrap();
}
