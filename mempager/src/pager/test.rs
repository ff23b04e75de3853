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
    cell::RefCell,
    collections::{HashMap, HashSet},
};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use super::{PageRef, Pager};
use crate::{
    config::{PagerConfig, UVM_BASE_ADDR},
    modules::{
        backing_store::{BackingStoreModule, MemoryBackingStore, ZERO_FILL_BYTE},
        mapping::{MappingModule, Protection},
    },
    MappingError, PagerError, Pid,
};

const PAGE_SIZE: usize = 4096;
const BASE: usize = UVM_BASE_ADDR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MappingCall {
    Resident {
        pid: Pid,
        vaddr: usize,
        frame: usize,
        prot: Protection,
    },
    Nonresident {
        pid: Pid,
        vaddr: usize,
    },
    Chprot {
        pid: Pid,
        vaddr: usize,
        prot: Protection,
    },
}

/// Records all mapping changes, calls for pids in `unreachable` fail.
#[derive(Default)]
pub(crate) struct RecordingMapping {
    calls: RefCell<Vec<MappingCall>>,
    unreachable: HashSet<Pid>,
}

impl RecordingMapping {
    fn unreachable(pids: &[Pid]) -> Self {
        Self {
            calls: RefCell::new(vec![]),
            unreachable: pids.iter().copied().collect(),
        }
    }

    fn take(&self) -> Vec<MappingCall> {
        self.calls.take()
    }

    fn record(&self, pid: Pid, call: MappingCall) -> Result<(), MappingError> {
        self.calls.borrow_mut().push(call);
        if self.unreachable.contains(&pid) {
            return Err(MappingError::NoConnection(pid));
        }
        Ok(())
    }
}

impl MappingModule for RecordingMapping {
    fn resident(
        &self,
        pid: Pid,
        vaddr: usize,
        frame: usize,
        prot: Protection,
    ) -> Result<(), MappingError> {
        self.record(
            pid,
            MappingCall::Resident {
                pid,
                vaddr,
                frame,
                prot,
            },
        )
    }

    fn nonresident(&self, pid: Pid, vaddr: usize) -> Result<(), MappingError> {
        self.record(pid, MappingCall::Nonresident { pid, vaddr })
    }

    fn chprot(&self, pid: Pid, vaddr: usize, prot: Protection) -> Result<(), MappingError> {
        self.record(pid, MappingCall::Chprot { pid, vaddr, prot })
    }
}

fn get_test_pager_with_page_size(
    frames: usize,
    blocks: usize,
    page_size: usize,
) -> Pager<MemoryBackingStore> {
    let config = PagerConfig {
        page_size,
        ..PagerConfig::new(frames, blocks)
    };
    Pager::new(config, MemoryBackingStore::new(page_size, frames, blocks))
}

fn get_test_pager(frames: usize, blocks: usize) -> Pager<MemoryBackingStore> {
    get_test_pager_with_page_size(frames, blocks, PAGE_SIZE)
}

/// Checks that frames, blocks and pages agree with each other.
fn check_invariants(pager: &Pager<MemoryBackingStore>) {
    let mut used_frames = HashSet::new();
    let mut used_blocks = HashSet::new();

    for space in pager.address_spaces() {
        for (ordinal, page) in space.pages().iter().enumerate() {
            let page_ref = PageRef {
                pid: space.pid(),
                page: ordinal,
            };

            assert!(used_blocks.insert(page.block()), "block {} shared", page.block());
            assert_eq!(pager.blocks()[page.block()].owner(), Some(page_ref));

            if let Some(frame) = page.frame() {
                assert!(used_frames.insert(frame), "frame {} shared", frame);
                assert_eq!(pager.frames()[frame].owner(), Some(page_ref));
            }
        }
    }

    for (i, frame) in pager.frames().iter().enumerate() {
        if frame.owner().is_some() {
            assert!(used_frames.contains(&i), "frame {} owned by a non-resident page", i);
        }
    }
    for (i, block) in pager.blocks().iter().enumerate() {
        if block.owner().is_some() {
            assert!(used_blocks.contains(&i), "block {} owned by a missing page", i);
        }
    }
}

#[test]
fn test_extend_assigns_contiguous_addresses() {
    let mut pager = get_test_pager(2, 4);
    pager.register(1).unwrap();
    pager.register(2).unwrap();

    assert_eq!(pager.extend(1).unwrap(), BASE);
    assert_eq!(pager.extend(2).unwrap(), BASE);
    assert_eq!(pager.extend(1).unwrap(), BASE + PAGE_SIZE);

    // lowest free block first
    let space = pager.address_space(1).unwrap();
    assert_eq!(space.pages()[0].block(), 0);
    assert_eq!(space.pages()[1].block(), 2);
    assert_eq!(pager.address_space(2).unwrap().pages()[0].block(), 1);

    // lazy: nothing is resident yet
    assert!(space.pages().iter().all(|page| !page.is_valid()));
    assert!(pager.frames().iter().all(|frame| frame.is_free()));
    check_invariants(&pager);
}

#[test]
fn test_register_twice_fails() {
    let mut pager = get_test_pager(2, 4);
    pager.register(7).unwrap();

    let err = pager.register(7).unwrap_err();
    assert!(matches!(err, PagerError::DuplicateProcess(7)));
    assert!(err.is_fatal());
}

#[test]
fn test_unknown_process() {
    let mut pager = get_test_pager(2, 4);
    let mapping = RecordingMapping::default();

    assert!(matches!(pager.extend(3), Err(PagerError::UnknownProcess(3))));
    assert!(matches!(
        pager.fault(3, BASE, &mapping),
        Err(PagerError::UnknownProcess(3))
    ));
    assert!(matches!(pager.destroy(3), Err(PagerError::UnknownProcess(3))));
    assert!(mapping.take().is_empty());
}

/// two frames, four blocks, one process with three pages
#[test]
fn test_fault_write_and_evict() {
    let mut pager = get_test_pager(2, 4);
    let mapping = RecordingMapping::default();
    pager.register(1).unwrap();
    let pages: Vec<usize> = (0..3).map(|_| pager.extend(1).unwrap()).collect();

    // first access: zero filled and mapped read only
    pager.fault(1, pages[0] + 10, &mapping).unwrap();
    assert_eq!(
        mapping.take(),
        vec![MappingCall::Resident {
            pid: 1,
            vaddr: pages[0],
            frame: 0,
            prot: Protection::Read
        }]
    );
    assert!(pager.store().frame(0).iter().all(|b| *b == ZERO_FILL_BYTE));
    assert!(!pager.address_space(1).unwrap().pages()[0].is_dirty());

    // write access to the resident page
    pager.fault(1, pages[0] + 10, &mapping).unwrap();
    assert_eq!(
        mapping.take(),
        vec![MappingCall::Chprot {
            pid: 1,
            vaddr: pages[0],
            prot: Protection::ReadWrite
        }]
    );
    let page = &pager.address_space(1).unwrap().pages()[0];
    assert_eq!(page.frame(), Some(0));
    assert!(page.is_dirty());
    let block0 = page.block();

    // client writes through its mapping
    pager.store_mut().frame_mut(0)[..4].copy_from_slice(b"abcd");

    pager.fault(1, pages[1], &mapping).unwrap();
    assert_eq!(
        mapping.take(),
        vec![MappingCall::Resident {
            pid: 1,
            vaddr: pages[1],
            frame: 1,
            prot: Protection::Read
        }]
    );
    check_invariants(&pager);

    // both frames were accessed: the clock clears both bits and comes back to frame 0
    pager.fault(1, pages[2], &mapping).unwrap();
    assert_eq!(
        mapping.take(),
        vec![
            MappingCall::Nonresident {
                pid: 1,
                vaddr: pages[0]
            },
            MappingCall::Resident {
                pid: 1,
                vaddr: pages[2],
                frame: 0,
                prot: Protection::Read
            }
        ]
    );
    let space = pager.address_space(1).unwrap();
    assert!(!space.pages()[0].is_valid());
    assert_eq!(space.pages()[2].frame(), Some(0));

    // dirty victim was written back
    assert!(pager.blocks()[block0].is_used());
    assert_eq!(&pager.store().block(block0)[..4], b"abcd");
    assert!(pager.store().block(block0)[4..]
        .iter()
        .all(|b| *b == ZERO_FILL_BYTE));
    // and the frame was reinitialized for its new page
    assert!(pager.store().frame(0).iter().all(|b| *b == ZERO_FILL_BYTE));
    check_invariants(&pager);

    // page 1 was not accessed since the last sweep, so it goes next, without a write back
    pager.fault(1, pages[0] + 2, &mapping).unwrap();
    assert_eq!(
        mapping.take(),
        vec![
            MappingCall::Nonresident {
                pid: 1,
                vaddr: pages[1]
            },
            MappingCall::Resident {
                pid: 1,
                vaddr: pages[0],
                frame: 1,
                prot: Protection::Read
            }
        ]
    );
    let space = pager.address_space(1).unwrap();
    assert!(!pager.blocks()[space.pages()[1].block()].is_used());
    assert!(!space.pages()[0].is_dirty());
    // swapped in from disk
    assert_eq!(&pager.store().frame(1)[..4], b"abcd");
    check_invariants(&pager);
}

#[test]
fn test_fault_on_valid_page_keeps_frame_and_block() {
    let mut pager = get_test_pager(2, 4);
    let mapping = RecordingMapping::default();
    pager.register(1).unwrap();
    let vaddr = pager.extend(1).unwrap();

    pager.fault(1, vaddr, &mapping).unwrap();
    let before = pager.address_space(1).unwrap().pages()[0].clone();

    pager.fault(1, vaddr + 1, &mapping).unwrap();
    pager.fault(1, vaddr + 2, &mapping).unwrap();

    let after = &pager.address_space(1).unwrap().pages()[0];
    assert_eq!(before.frame(), after.frame());
    assert_eq!(before.block(), after.block());
    assert!(after.is_dirty());
    assert!(pager.frames()[0].accessed());
}

#[test]
fn test_fault_outside_allocated_pages() {
    let mut pager = get_test_pager(2, 4);
    let mapping = RecordingMapping::default();
    pager.register(1).unwrap();
    pager.extend(1).unwrap();

    assert!(matches!(
        pager.fault(1, BASE + PAGE_SIZE, &mapping),
        Err(PagerError::UnmanagedAddress { pid: 1, .. })
    ));
    assert!(matches!(
        pager.fault(1, BASE - 1, &mapping),
        Err(PagerError::UnmanagedAddress { pid: 1, .. })
    ));
    assert!(mapping.take().is_empty());
}

#[test]
fn test_extend_without_free_blocks() {
    let mut pager = get_test_pager(2, 2);
    pager.register(1).unwrap();
    pager.register(2).unwrap();

    pager.extend(1).unwrap();
    pager.extend(2).unwrap();

    let err = pager.extend(1).unwrap_err();
    assert!(matches!(err, PagerError::NoSpace(1)));
    assert!(err.is_recoverable());
    assert_eq!(pager.address_space(1).unwrap().len(), 1);
    assert!(pager.blocks().iter().all(|block| !block.is_free()));
    check_invariants(&pager);
}

#[test]
fn test_extend_stops_at_region_end() {
    let mut pager = get_test_pager(2, 300);
    pager.register(1).unwrap();

    let region_pages = pager.config().region_pages();
    for i in 0..region_pages {
        assert_eq!(pager.extend(1).unwrap(), BASE + i * PAGE_SIZE);
    }
    assert!(matches!(pager.extend(1), Err(PagerError::NoSpace(1))));
    assert_eq!(pager.address_space(1).unwrap().len(), region_pages);
}

#[test]
fn test_destroy_untouched_process() {
    let mut pager = get_test_pager(2, 4);
    pager.register(1).unwrap();
    for _ in 0..3 {
        pager.extend(1).unwrap();
    }

    pager.destroy(1).unwrap();

    assert!(pager.address_space(1).is_none());
    assert!(pager.blocks().iter().all(|block| block.is_free()));
    assert!(pager.frames().iter().all(|frame| frame.is_free()));

    // pid can be used again
    pager.register(1).unwrap();
}

#[test]
fn test_destroy_releases_frames_and_swapped_blocks() {
    let mut pager = get_test_pager(1, 2);
    let mapping = RecordingMapping::default();
    pager.register(1).unwrap();
    let first = pager.extend(1).unwrap();
    let second = pager.extend(1).unwrap();

    pager.fault(1, first, &mapping).unwrap();
    pager.fault(1, first, &mapping).unwrap();
    pager.store_mut().frame_mut(0).fill(b'x');
    // evicts the dirty first page
    pager.fault(1, second, &mapping).unwrap();
    assert!(pager.blocks()[0].is_used());
    mapping.take();

    pager.destroy(1).unwrap();
    assert!(mapping.take().is_empty());
    assert!(pager.frames()[0].is_free());
    assert!(pager.blocks().iter().all(|b| b.is_free() && !b.is_used()));

    // new owner of block 0 gets a fresh page instead of old data
    pager.register(2).unwrap();
    let vaddr = pager.extend(2).unwrap();
    pager.fault(2, vaddr, &mapping).unwrap();
    assert!(pager.store().frame(0).iter().all(|b| *b == ZERO_FILL_BYTE));
}

#[test]
fn test_eviction_of_unreachable_owner_continues() {
    let mut pager = get_test_pager(1, 4);
    let mapping = RecordingMapping::unreachable(&[2]);
    pager.register(1).unwrap();
    pager.register(2).unwrap();
    let own = pager.extend(1).unwrap();
    let other = pager.extend(2).unwrap();

    // process 2 cannot be reached anymore, but its page still sits in frame 0
    assert!(pager.fault(2, other, &mapping).is_err());
    assert_eq!(pager.frames()[0].owner(), Some(PageRef { pid: 2, page: 0 }));

    pager.fault(1, own, &mapping).unwrap();
    assert_eq!(pager.frames()[0].owner(), Some(PageRef { pid: 1, page: 0 }));
    assert!(!pager.address_space(2).unwrap().pages()[0].is_valid());
    check_invariants(&pager);
}

#[test]
fn test_read_region_invalid() {
    let mut pager = get_test_pager(2, 4);
    let mapping = RecordingMapping::default();
    pager.register(1).unwrap();
    pager.extend(1).unwrap();

    for (addr, len) in [
        (BASE + PAGE_SIZE - 1, 2),
        (BASE - 1, 1),
        (BASE + PAGE_SIZE, 1),
        (usize::MAX - 1, 4),
    ] {
        let err = pager.read_region(1, addr, len, &mapping).unwrap_err();
        assert!(matches!(err, PagerError::InvalidRegion { pid: 1, .. }));
        assert!(err.is_recoverable());
    }

    // empty regions are always fine
    assert!(pager.read_region(1, 0, 0, &mapping).unwrap().is_empty());
    assert!(mapping.take().is_empty());
}

#[test]
fn test_read_region_loads_pages() {
    let mut pager = get_test_pager(1, 4);
    let mapping = RecordingMapping::default();
    pager.register(1).unwrap();
    let first = pager.extend(1).unwrap();
    let second = pager.extend(1).unwrap();

    pager.fault(1, first, &mapping).unwrap();
    pager.fault(1, first, &mapping).unwrap();
    pager.store_mut().frame_mut(0)[PAGE_SIZE - 2..].copy_from_slice(b"hi");
    mapping.take();

    // spans the end of the first and the start of the second page
    let data = pager.read_region(1, first + PAGE_SIZE - 2, 4, &mapping).unwrap();
    assert_eq!(data, vec![b'h', b'i', ZERO_FILL_BYTE, ZERO_FILL_BYTE]);

    // second page was loaded in place of the first one
    assert_eq!(
        mapping.take(),
        vec![
            MappingCall::Nonresident {
                pid: 1,
                vaddr: first
            },
            MappingCall::Resident {
                pid: 1,
                vaddr: second,
                frame: 0,
                prot: Protection::Read
            }
        ]
    );

    // and the first page comes back from disk
    let data = pager.read_region(1, first + PAGE_SIZE - 2, 2, &mapping).unwrap();
    assert_eq!(data, b"hi".to_vec());
    check_invariants(&pager);
}

/// random operations of several processes, checked against a shadow copy of every page
#[test]
fn test_random_operations_keep_tables_consistent() {
    const SMALL_PAGE: usize = 128;
    const FRAMES: usize = 3;
    const BLOCKS: usize = 10;
    const SEED: u64 = 5446535461589659585;

    let mut pager = get_test_pager_with_page_size(FRAMES, BLOCKS, SMALL_PAGE);
    let mapping = RecordingMapping::default();
    let mut rand = SmallRng::seed_from_u64(SEED);
    let mut shadow: HashMap<Pid, Vec<Vec<u8>>> = HashMap::new();

    for _ in 0..5_000 {
        let pid = rand.gen_range(1..=3);

        if !shadow.contains_key(&pid) {
            pager.register(pid).unwrap();
            shadow.insert(pid, vec![]);
            continue;
        }

        let page_count = shadow[&pid].len();
        match rand.gen_range(0..100) {
            0..=14 => match pager.extend(pid) {
                Ok(vaddr) => {
                    assert_eq!(vaddr, BASE + page_count * SMALL_PAGE);
                    shadow
                        .get_mut(&pid)
                        .unwrap()
                        .push(vec![ZERO_FILL_BYTE; SMALL_PAGE]);
                }
                Err(PagerError::NoSpace(_)) => {
                    let total: usize = pager.address_spaces().map(|space| space.len()).sum();
                    assert_eq!(total, BLOCKS);
                }
                Err(err) => panic!("unexpected error: {}", err),
            },
            15..=59 if page_count > 0 => {
                // write one byte: read fault (if needed) and write fault, then write through the mapping
                let ordinal = rand.gen_range(0..page_count);
                let offset = rand.gen_range(0..SMALL_PAGE);
                let vaddr = BASE + ordinal * SMALL_PAGE + offset;

                if !pager.address_space(pid).unwrap().pages()[ordinal].is_valid() {
                    pager.fault(pid, vaddr, &mapping).unwrap();
                }
                pager.fault(pid, vaddr, &mapping).unwrap();

                let page = &pager.address_space(pid).unwrap().pages()[ordinal];
                assert!(page.is_dirty());
                let frame = page.frame().unwrap();

                let value: u8 = rand.gen();
                pager.store_mut().frame_mut(frame)[offset] = value;
                shadow.get_mut(&pid).unwrap()[ordinal][offset] = value;
            }
            60..=94 if page_count > 0 => {
                let start = rand.gen_range(0..page_count * SMALL_PAGE);
                let len = rand.gen_range(0..=(page_count * SMALL_PAGE - start).min(3 * SMALL_PAGE));

                let data = pager
                    .read_region(pid, BASE + start, len, &mapping)
                    .unwrap();
                let expected: Vec<u8> = shadow[&pid]
                    .iter()
                    .flatten()
                    .skip(start)
                    .take(len)
                    .copied()
                    .collect();
                assert_eq!(data, expected);
            }
            95..=99 => {
                pager.destroy(pid).unwrap();
                shadow.remove(&pid);
            }
            _ => {}
        }

        check_invariants(&pager);
        mapping.take();
    }
}
