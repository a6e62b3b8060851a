// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use mem_pages::{PageAddr, PageFrame, PAGE_SHIFT};
use spin::Mutex;

use crate::mem_map::MemMap;
use crate::page_map::{PageMap, PageState};

bitflags! {
    /// Allocation policy bits. Clients record a policy once and pass it through
    /// on every request they make.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// The page must be reachable through the kernel's direct map. All RAM
        /// handed to the allocator currently qualifies, so this bit does not
        /// narrow the pool.
        const DIRECT_MAP = 1 << 0;
    }
}

// Inner struct that is wrapped in a mutex by `PageAllocator`.
struct AllocatorInner {
    map: PageMap,
    // Free pages, kept in address order so contiguous runs can be found.
    free: BTreeSet<PageAddr>,
}

impl AllocatorInner {
    // Removes `addr` from the free pool and mints the frame that now owns it.
    fn take_free(&mut self, addr: PageAddr) -> Option<PageFrame> {
        if !self.free.remove(&addr) {
            return None;
        }
        *self.map.get_mut(addr).unwrap() = PageState::Alloc;
        // Safety: the page was in the free pool, so no other frame for it
        // exists; this frame becomes the unique owner.
        Some(unsafe { PageFrame::new(addr) })
    }
}

/// Hands out uniquely-owned pages of physical memory. Can be cloned and passed
/// to every component that allocates or returns pages; all clones share the
/// same pool and page states.
#[derive(Clone)]
pub struct PageAllocator {
    inner: Arc<Mutex<AllocatorInner>>,
}

impl PageAllocator {
    /// Creates an allocator owning every available page described by
    /// `mem_map`.
    pub fn new(mem_map: MemMap) -> Self {
        let map = PageMap::build_from(&mem_map);
        let mut free = BTreeSet::new();
        let mut addr = map.base();
        for _ in 0..map.num_pages() {
            if map.get(addr) == Some(PageState::Free) {
                free.insert(addr);
            }
            // Unwrap ok, the map covers a validated address range.
            addr = addr.checked_add_pages(1).unwrap();
        }
        Self {
            inner: Arc::new(Mutex::new(AllocatorInner { map, free })),
        }
    }

    /// Allocates a single page, or `None` if the pool is empty.
    pub fn alloc_page(&self, _flags: AllocFlags) -> Option<PageFrame> {
        let mut inner = self.inner.lock();
        let addr = inner.free.iter().next().copied()?;
        inner.take_free(addr)
    }

    /// Allocates up to `count` pages. The returned frames need not be
    /// contiguous, and fewer than `count` are returned if the pool runs dry.
    pub fn alloc_pages(&self, count: usize, _flags: AllocFlags) -> Vec<PageFrame> {
        let mut inner = self.inner.lock();
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let addr = match inner.free.iter().next().copied() {
                Some(a) => a,
                None => break,
            };
            // Unwrap ok, the address was just observed in the pool.
            frames.push(inner.take_free(addr).unwrap());
        }
        frames
    }

    /// Allocates `count` physically-contiguous pages whose base is aligned to
    /// `2^align_log2` bytes. Returns the frames in address order, or an empty
    /// vector if no such run exists. The alignment is floored at the page
    /// size.
    pub fn alloc_contiguous(
        &self,
        count: usize,
        _flags: AllocFlags,
        align_log2: u8,
    ) -> Vec<PageFrame> {
        if count == 0 {
            return Vec::new();
        }
        let align = 1u64 << (align_log2 as u32).max(PAGE_SHIFT);
        let mut inner = self.inner.lock();

        let mut base = None;
        'candidates: for &addr in inner.free.iter() {
            if addr.bits() & (align - 1) != 0 {
                continue;
            }
            for i in 1..count as u64 {
                match addr.checked_add_pages(i) {
                    Some(next) if inner.free.contains(&next) => (),
                    _ => continue 'candidates,
                }
            }
            base = Some(addr);
            break;
        }

        let Some(base) = base else {
            return Vec::new();
        };
        let mut frames = Vec::with_capacity(count);
        for i in 0..count as u64 {
            // Unwraps ok, the whole run was just observed in the pool.
            let addr = base.checked_add_pages(i).unwrap();
            frames.push(inner.take_free(addr).unwrap());
        }
        frames
    }

    /// Allocates the specific pages starting at `base`, stopping early at the
    /// first page that is not free. Used to claim pages by physical address,
    /// e.g. for ranges the kernel already addresses directly.
    pub fn alloc_range(&self, base: PageAddr, count: usize) -> Vec<PageFrame> {
        let mut inner = self.inner.lock();
        let mut frames = Vec::with_capacity(count);
        for i in 0..count as u64 {
            let addr = match base.checked_add_pages(i) {
                Some(a) => a,
                None => break,
            };
            match inner.take_free(addr) {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        frames
    }

    /// Returns `frame` to the free pool.
    pub fn free_page(&self, frame: PageFrame) {
        let mut inner = self.inner.lock();
        let addr = frame.addr();
        let state = inner.map.get_mut(addr).expect("freed page outside the map");
        debug_assert!(matches!(*state, PageState::Alloc | PageState::Object));
        *state = PageState::Free;
        inner.free.insert(addr);
    }

    /// Returns a batch of frames to the free pool.
    pub fn free_pages(&self, frames: impl IntoIterator<Item = PageFrame>) {
        for frame in frames {
            self.free_page(frame);
        }
    }

    /// Returns the state of the page at `addr`, or `None` if the address is
    /// outside the managed range.
    pub fn page_state(&self, addr: PageAddr) -> Option<PageState> {
        self.inner.lock().map.get(addr)
    }

    /// Records that `frame` is now owned by a memory object's page list.
    pub fn mark_object(&self, frame: &PageFrame) {
        self.set_state(frame, PageState::Object);
    }

    /// Records that `frame` is wired to the kernel image and will never return
    /// to the pool.
    pub fn mark_wired(&self, frame: &PageFrame) {
        self.set_state(frame, PageState::Wired);
    }

    fn set_state(&self, frame: &PageFrame, state: PageState) {
        let mut inner = self.inner.lock();
        let entry = inner
            .map
            .get_mut(frame.addr())
            .expect("page outside the map");
        debug_assert_eq!(*entry, PageState::Alloc);
        *entry = state;
    }

    /// Returns the number of pages currently in the free pool.
    pub fn free_page_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Returns the number of pages covered by the allocator's map, free or
    /// not.
    pub fn total_page_count(&self) -> usize {
        self.inner.lock().map.num_pages()
    }

    /// Creates an allocator backed by leaked, page-aligned host memory for use
    /// in test environments.
    #[cfg(test)]
    pub(crate) fn new_in_test(num_pages: usize) -> Self {
        use crate::mem_map::MemMapBuilder;
        use mem_pages::{PhysAddr, PAGE_SIZE};

        let len = (num_pages + 1) * PAGE_SIZE as usize;
        let backing = vec![0u8; len];
        let aligned = unsafe {
            // Not safe - just a test.
            backing
                .as_ptr()
                .add(backing.as_ptr().align_offset(PAGE_SIZE as usize))
        };
        let mem_map = unsafe {
            // Not safe - just a test.
            MemMapBuilder::new()
                .add_memory_region(
                    PhysAddr::new(aligned as u64),
                    num_pages as u64 * PAGE_SIZE,
                )
                .unwrap()
                .build()
        };
        // Leak the backing ram so it doesn't get freed.
        std::mem::forget(backing);
        Self::new(mem_map)
    }
}
