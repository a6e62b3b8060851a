// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use bitflags::bitflags;
use core::cmp::min;
use core::mem;
use mem_pages::{
    arch, is_page_aligned, round_page_down, round_page_up, PageAddr, PageFrame, PhysAddr,
    PAGE_SIZE,
};
use page_alloc::{AllocFlags, PageAllocator, PageState};
use spin::Mutex;
use static_assertions::const_assert;

use crate::page_list::PageList;
use crate::region::{RegionSet, VmRegion};
use crate::usercopy::UserPtr;
use crate::{Error, Result};

bitflags! {
    /// Flags describing the access that triggered a page fault.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFaultFlags: u32 {
        /// The faulting access was a write.
        const WRITE = 1 << 0;
        /// The faulting access came from user mode.
        const USER = 1 << 1;
        /// The faulting access was an instruction fetch.
        const EXECUTE = 1 << 2;
    }
}

// The kinds of maintenance `cache_op` can apply to a range.
#[derive(Clone, Copy)]
enum CacheOpKind {
    Invalidate,
    Clean,
    CleanInvalidate,
    Sync,
}

// State protected by the object's lock.
struct VmoInner {
    size: u64,
    pages: PageList,
    regions: RegionSet,
}

/// An anonymous, byte-addressable container of physical memory pages.
///
/// An object is created empty: pages are produced on demand, either by a page
/// fault from a mapping region or by an explicit commit, and are zero-filled
/// before they become visible. Shrinking or decommitting first revokes the
/// affected translations in every region that maps the object, then returns
/// the pages to the allocator. When the last shared reference drops, every
/// remaining page goes back to the allocator exactly once.
///
/// A single lock serializes all operations; it is held across allocator calls,
/// region unmap callbacks, and user copies, which keeps the present/install
/// races out of the picture at the cost of long critical sections.
pub struct VmObject {
    // Allocation policy applied to every page this object requests.
    alloc_flags: AllocFlags,
    allocator: PageAllocator,
    inner: Mutex<VmoInner>,
}

// A byte range is acceptable iff it lies entirely within [0, size]; ranges
// that straddle the end are rejected rather than clipped.
fn range_within(offset: u64, len: u64, size: u64) -> bool {
    offset.checked_add(len).map_or(false, |end| end <= size)
}

impl VmObject {
    /// The largest size an object may take, bounded so that rounding a size up
    /// to a page boundary cannot overflow and page counts stay in range.
    pub const MAX_SIZE: u64 = u64::MAX & !(PAGE_SIZE - 1);

    /// Creates an empty object of `size` bytes whose page allocations carry
    /// `alloc_flags`.
    pub fn create(
        allocator: PageAllocator,
        alloc_flags: AllocFlags,
        size: u64,
    ) -> Result<Arc<Self>> {
        // There's a max size to keep offsets within range.
        if size > Self::MAX_SIZE {
            return Err(Error::OutOfRange);
        }
        let vmo = Self {
            alloc_flags,
            allocator: allocator.clone(),
            inner: Mutex::new(VmoInner {
                size: 0,
                pages: PageList::new(allocator),
                regions: RegionSet::new(),
            }),
        };
        vmo.resize(size)?;
        log::trace!("vmo created, size {:#x}", size);
        Ok(Arc::new(vmo))
    }

    /// Wraps `size` bytes of kernel data at `data` in an object without
    /// allocating. Pages already wired to the kernel image are adopted as-is;
    /// free pages are claimed from the allocator and wired. A page owned by
    /// anyone else is fatal.
    ///
    /// One strong reference to the result is intentionally leaked: freeing a
    /// wired page would punch a hole in the kernel image mapping, so the
    /// object must never be destroyed.
    ///
    /// # Safety
    ///
    /// `data` must be a valid, page-aligned range of `size` bytes in the
    /// kernel's direct map whose pages are never claimed through any other
    /// path for the lifetime of the system.
    pub unsafe fn create_from_wired_data(
        allocator: PageAllocator,
        data: *const u8,
        size: u64,
    ) -> Result<Arc<Self>> {
        let vmo = Self::create(allocator.clone(), AllocFlags::empty(), size)?;
        if size == 0 {
            return Ok(vmo);
        }
        assert!(is_page_aligned(data as u64));
        assert!(is_page_aligned(size));

        // Look up the physical pages backing the range and install them
        // directly. Under the direct map the physical address is the pointer
        // itself.
        let start = PageAddr::new(PhysAddr::new(data as u64)).unwrap();
        for count in 0..size / PAGE_SIZE {
            // Unwrap ok, the end of the range fit in `size` checks above.
            let addr = start.checked_add_pages(count).unwrap();
            let frame = match allocator.page_state(addr) {
                Some(PageState::Wired) => {
                    // Wired to the kernel image, so it can be used directly.
                    // Safety: the caller guarantees the range is claimed
                    // through no other path.
                    unsafe { PageFrame::new(addr) }
                }
                Some(PageState::Free) => {
                    let mut frames = allocator.alloc_range(addr, 1);
                    let frame = frames.pop().expect("free page not allocatable");
                    allocator.mark_wired(&frame);
                    frame
                }
                state => panic!(
                    "page backing static object in unusable state: {:#x} {:?}",
                    addr.bits(),
                    state
                ),
            };
            vmo.add_page(frame, count * PAGE_SIZE)
                .expect("static page install");
        }

        // Leak a reference so the object is never destroyed and the pages stay
        // put.
        mem::forget(Arc::clone(&vmo));
        Ok(vmo)
    }

    /// Returns the object's current size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Sets the object's size. Shrinking revokes the translations for, and
    /// then frees, every whole page beyond the new end; growing is a pure
    /// metadata update and allocates nothing.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        if new_size > Self::MAX_SIZE {
            return Err(Error::OutOfRange);
        }
        let mut inner = self.inner.lock();
        log::trace!("vmo resize {:#x} -> {:#x}", inner.size, new_size);
        if new_size < inner.size {
            let start = round_page_up(new_size);
            let end = round_page_up(inner.size);
            // Only whole pages are removed.
            if end > start {
                // No region may keep a translation to a page that is about to
                // leave the object.
                inner
                    .regions
                    .for_each(|r| r.unmap_vmo_range_locked(start, end - start));
                let mut offset = start;
                while offset < end {
                    inner.pages.free_page(offset);
                    offset += PAGE_SIZE;
                }
            }
        }
        inner.size = new_size;
        Ok(())
    }

    /// Installs `frame` at the page-aligned `offset`, taking ownership.
    /// Rejects offsets at or beyond the object's size. On failure the frame
    /// is consumed without being installed.
    pub fn add_page(&self, frame: PageFrame, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if offset >= inner.size {
            return Err(Error::OutOfRange);
        }
        inner.pages.add_page(frame, offset)
    }

    /// Returns the physical page backing `offset` if one is present. Never
    /// faults anything in.
    pub fn get_page(&self, offset: u64) -> Option<PageAddr> {
        let inner = self.inner.lock();
        Self::get_page_locked(&inner, offset)
    }

    /// Returns the physical page backing `offset`, allocating, zeroing, and
    /// installing a new one if the offset has no page yet. `flags` describes
    /// the faulting access; the current policy does not depend on it.
    pub fn fault_page(&self, offset: u64, flags: PageFaultFlags) -> Result<PageAddr> {
        let mut inner = self.inner.lock();
        self.fault_page_locked(&mut inner, offset, flags)
    }

    fn get_page_locked(inner: &VmoInner, offset: u64) -> Option<PageAddr> {
        if offset >= inner.size {
            return None;
        }
        inner
            .pages
            .get_page(round_page_down(offset))
            .map(|frame| frame.addr())
    }

    // The sole production point of new pages in the object.
    fn fault_page_locked(
        &self,
        inner: &mut VmoInner,
        offset: u64,
        _flags: PageFaultFlags,
    ) -> Result<PageAddr> {
        if offset >= inner.size {
            return Err(Error::OutOfRange);
        }
        let aligned = round_page_down(offset);
        if let Some(frame) = inner.pages.get_page(aligned) {
            return Ok(frame.addr());
        }

        let mut frame = self
            .allocator
            .alloc_page(self.alloc_flags)
            .ok_or(Error::NoMemory)?;
        self.allocator.mark_object(&frame);
        // TODO: drop the explicit zero once the allocator hands out zeroed
        // frames.
        frame.zero();
        let addr = frame.addr();
        log::trace!("vmo faulted in {:#x} at offset {:#x}", addr.bits(), aligned);
        // The slot was observed empty moments ago under this same lock.
        inner
            .pages
            .add_page(frame, aligned)
            .expect("fault-in hit an occupied slot");
        Ok(addr)
    }

    /// Commits every missing page in the range, returning the number of newly
    /// committed bytes. Either every hole is filled or, if the allocator runs
    /// short, the partial batch is returned and the object is left untouched.
    pub fn commit_range(&self, offset: u64, len: u64) -> Result<u64> {
        log::trace!("vmo commit offset {:#x} len {:#x}", offset, len);
        let mut inner = self.inner.lock();
        if !range_within(offset, len, inner.size) {
            return Err(Error::OutOfRange);
        }
        if len == 0 {
            return Ok(0);
        }

        let start = round_page_down(offset);
        let end = round_page_up(offset + len);

        // First pass: count the holes.
        let mut missing = 0;
        let mut o = start;
        while o < end {
            if inner.pages.get_page(o).is_none() {
                missing += 1;
            }
            o += PAGE_SIZE;
        }
        if missing == 0 {
            return Ok(0);
        }

        let frames = self.allocator.alloc_pages(missing, self.alloc_flags);
        if frames.len() < missing {
            log::debug!(
                "vmo commit failed, asked for {} pages, got {}",
                missing,
                frames.len()
            );
            self.allocator.free_pages(frames);
            return Err(Error::NoMemory);
        }

        // Second pass: attach one frame to every hole.
        let mut frames = frames.into_iter();
        let mut committed = 0;
        let mut o = start;
        while o < end {
            if inner.pages.get_page(o).is_none() {
                // Unwrap ok, exactly `missing` frames were allocated.
                let mut frame = frames.next().unwrap();
                self.allocator.mark_object(&frame);
                frame.zero();
                inner
                    .pages
                    .add_page(frame, o)
                    .expect("hole filled during commit");
                committed += PAGE_SIZE;
            }
            o += PAGE_SIZE;
        }
        debug_assert!(frames.next().is_none());
        Ok(committed)
    }

    /// As `commit_range`, but backs the range with physically contiguous
    /// pages whose base is aligned to `2^align_log2` bytes. The range must be
    /// page-aligned and entirely uncommitted; a partial fill has no sound
    /// contract and is rejected.
    pub fn commit_range_contiguous(&self, offset: u64, len: u64, align_log2: u8) -> Result<u64> {
        log::trace!(
            "vmo commit contiguous offset {:#x} len {:#x} align {}",
            offset,
            len,
            align_log2
        );
        if !is_page_aligned(offset) || !is_page_aligned(len) {
            return Err(Error::InvalidArgs);
        }
        let mut inner = self.inner.lock();
        if !range_within(offset, len, inner.size) {
            return Err(Error::OutOfRange);
        }
        if len == 0 {
            return Ok(0);
        }

        let end = offset + len;
        let mut o = offset;
        while o < end {
            if inner.pages.get_page(o).is_some() {
                return Err(Error::InvalidArgs);
            }
            o += PAGE_SIZE;
        }

        let count = (len / PAGE_SIZE) as usize;
        let frames = self
            .allocator
            .alloc_contiguous(count, self.alloc_flags, align_log2);
        if frames.len() < count {
            log::debug!("vmo contiguous commit failed, {} pages unavailable", count);
            self.allocator.free_pages(frames);
            return Err(Error::NoMemory);
        }

        let mut committed = 0;
        let mut o = offset;
        for mut frame in frames {
            self.allocator.mark_object(&frame);
            frame.zero();
            inner
                .pages
                .add_page(frame, o)
                .expect("hole filled during commit");
            committed += PAGE_SIZE;
            o += PAGE_SIZE;
        }
        Ok(committed)
    }

    /// Releases every present page in the range, returning the number of
    /// bytes freed. Absent pages are skipped; the offsets remain valid and
    /// fault back in on next use.
    pub fn decommit_range(&self, offset: u64, len: u64) -> Result<u64> {
        log::trace!("vmo decommit offset {:#x} len {:#x}", offset, len);
        let mut inner = self.inner.lock();
        if !range_within(offset, len, inner.size) {
            return Err(Error::OutOfRange);
        }
        if len == 0 {
            return Ok(0);
        }

        let start = round_page_down(offset);
        let end = round_page_up(offset + len);
        // Revoke translations before the pages go back to the allocator.
        inner
            .regions
            .for_each(|r| r.unmap_vmo_range_locked(start, end - start));

        let mut freed = 0;
        let mut o = start;
        while o < end {
            if inner.pages.free_page(o) {
                freed += PAGE_SIZE;
            }
            o += PAGE_SIZE;
        }
        Ok(freed)
    }

    // Walks every page chunk covered by [offset, offset + len), faulting the
    // page in and handing the chunk to `copy_chunk(frame, page_off, buf_off,
    // n)`. Progress lands in `copied` as chunks complete, so partial
    // transfers survive a failure.
    fn read_write_internal<F>(
        &self,
        mut offset: u64,
        mut len: usize,
        write: bool,
        copied: &mut usize,
        mut copy_chunk: F,
    ) -> Result<()>
    where
        F: FnMut(&mut PageFrame, usize, usize, usize) -> Result<()>,
    {
        *copied = 0;
        let mut inner = self.inner.lock();
        if !range_within(offset, len as u64, inner.size) {
            return Err(Error::OutOfRange);
        }
        let flags = if write {
            PageFaultFlags::WRITE
        } else {
            PageFaultFlags::empty()
        };

        let mut buf_off = 0;
        while len > 0 {
            let page_off = (offset % PAGE_SIZE) as usize;
            let tocopy = min(PAGE_SIZE as usize - page_off, len);

            self.fault_page_locked(&mut inner, offset, flags)?;
            // Unwrap ok, the page was just faulted in under the lock.
            let frame = inner.pages.get_page_mut(round_page_down(offset)).unwrap();
            copy_chunk(frame, page_off, buf_off, tocopy)?;

            *copied += tocopy;
            offset += tocopy as u64;
            buf_off += tocopy;
            len -= tocopy;
        }
        Ok(())
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`, faulting in
    /// any missing pages on the way. `copied` tracks the bytes transferred
    /// and is meaningful even when an error cuts the copy short.
    pub fn read(&self, buf: &mut [u8], offset: u64, copied: &mut usize) -> Result<()> {
        self.read_write_internal(
            offset,
            buf.len(),
            false,
            copied,
            |frame, page_off, buf_off, n| {
                buf[buf_off..buf_off + n].copy_from_slice(&frame.as_bytes()[page_off..page_off + n]);
                Ok(())
            },
        )
    }

    /// Copies `buf` into the object starting at `offset`.
    pub fn write(&self, buf: &[u8], offset: u64, copied: &mut usize) -> Result<()> {
        self.read_write_internal(
            offset,
            buf.len(),
            true,
            copied,
            |frame, page_off, buf_off, n| {
                frame.as_bytes_mut()[page_off..page_off + n]
                    .copy_from_slice(&buf[buf_off..buf_off + n]);
                Ok(())
            },
        )
    }

    /// As `read`, but the destination is an untrusted user pointer, validated
    /// up front. The lock is held across the user copy; faults are resolved
    /// by the copy primitive without re-entering this object and are reported
    /// verbatim.
    pub fn read_user(
        &self,
        ptr: UserPtr,
        offset: u64,
        len: usize,
        copied: &mut usize,
    ) -> Result<()> {
        *copied = 0;
        if !ptr.is_user_address() {
            return Err(Error::InvalidArgs);
        }
        self.read_write_internal(offset, len, false, copied, |frame, page_off, buf_off, n| {
            ptr.byte_offset(buf_off)
                .copy_array_to_user(&frame.as_bytes()[page_off..page_off + n])
        })
    }

    /// As `write`, but the source is an untrusted user pointer.
    pub fn write_user(
        &self,
        ptr: UserPtr,
        offset: u64,
        len: usize,
        copied: &mut usize,
    ) -> Result<()> {
        *copied = 0;
        if !ptr.is_user_address() {
            return Err(Error::InvalidArgs);
        }
        self.read_write_internal(offset, len, true, copied, |frame, page_off, buf_off, n| {
            ptr.byte_offset(buf_off)
                .copy_array_from_user(&mut frame.as_bytes_mut()[page_off..page_off + n])
        })
    }

    /// Writes the physical address of every page touching the range into the
    /// user-supplied table of `u64`s, `out_capacity` bytes long. Absent pages
    /// are reported as `NoMemory` rather than faulted in.
    pub fn lookup(&self, offset: u64, len: u64, table: UserPtr, out_capacity: usize) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidArgs);
        }
        let inner = self.inner.lock();
        if !range_within(offset, len, inner.size) {
            return Err(Error::OutOfRange);
        }

        let start = round_page_down(offset);
        let end = round_page_up(offset + len);
        let table_size = ((end - start) / PAGE_SIZE) as usize * core::mem::size_of::<u64>();
        if table_size > out_capacity {
            return Err(Error::BufferTooSmall);
        }

        let mut index = 0;
        let mut o = start;
        while o < end {
            let addr = Self::get_page_locked(&inner, o).ok_or(Error::NoMemory)?;
            table.element_offset::<u64>(index).copy_to_user(addr.bits())?;
            index += 1;
            o += PAGE_SIZE;
        }
        Ok(())
    }

    /// Drops cached lines for the range without writing them back.
    pub fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()> {
        self.cache_op(offset, len, CacheOpKind::Invalidate)
    }

    /// Writes back any dirty cached lines for the range.
    pub fn clean_cache(&self, offset: u64, len: u64) -> Result<()> {
        self.cache_op(offset, len, CacheOpKind::Clean)
    }

    /// Writes back and drops cached lines for the range.
    pub fn clean_invalidate_cache(&self, offset: u64, len: u64) -> Result<()> {
        self.cache_op(offset, len, CacheOpKind::CleanInvalidate)
    }

    /// Synchronizes the range for instruction fetch.
    pub fn sync_cache(&self, offset: u64, len: u64) -> Result<()> {
        self.cache_op(offset, len, CacheOpKind::Sync)
    }

    fn cache_op(&self, offset: u64, len: u64, kind: CacheOpKind) -> Result<()> {
        self.cache_op_with(offset, len, |va, n| match kind {
            CacheOpKind::Invalidate => arch::invalidate_cache_range(va, n),
            CacheOpKind::Clean => arch::clean_cache_range(va, n),
            CacheOpKind::CleanInvalidate => arch::clean_invalidate_cache_range(va, n),
            CacheOpKind::Sync => arch::sync_cache_range(va, n),
        })
    }

    // Walks the per-page subranges of [offset, offset + len), invoking `op`
    // on the kernel mapping of each present page's portion and skipping
    // holes.
    fn cache_op_with<F: FnMut(*const u8, usize)>(
        &self,
        offset: u64,
        len: u64,
        mut op: F,
    ) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidArgs);
        }
        let inner = self.inner.lock();
        if !range_within(offset, len, inner.size) {
            return Err(Error::OutOfRange);
        }

        let end = offset + len;
        let mut op_start = offset;
        while op_start != end {
            // The op covers to the end of the current page or of the whole
            // range, whichever comes first.
            let op_end = min(round_page_down(op_start) + PAGE_SIZE, end);
            let page_off = op_start % PAGE_SIZE;
            if let Some(addr) = Self::get_page_locked(&inner, op_start) {
                op(
                    (addr.bits() + page_off) as *const u8,
                    (op_end - op_start) as usize,
                );
            }
            op_start = op_end;
        }
        Ok(())
    }

    /// Returns the number of pages attached to the object.
    pub fn allocated_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Logs a summary of the object, indented by `depth`, with per-page
    /// detail if `verbose`.
    pub fn dump(&self, depth: usize, verbose: bool) {
        let inner = self.inner.lock();
        log::info!(
            "{:indent$}object size {:#x} pages {}",
            "",
            inner.size,
            inner.pages.len(),
            indent = depth * 2
        );
        if verbose {
            inner.pages.for_every_page(|frame, offset| {
                log::info!(
                    "{:indent$}offset {:#x} paddr {:#x}",
                    "",
                    offset,
                    frame.addr().bits(),
                    indent = (depth + 1) * 2
                );
            });
        }
    }

    /// Records that `region` now maps some range of this object. Called by
    /// the mapping layer when the mapping is created.
    pub fn attach_region(&self, region: &Arc<dyn VmRegion>) {
        self.inner.lock().regions.attach(Arc::downgrade(region));
    }

    /// Forgets the back-reference to `region`. The mapping layer must call
    /// this before the region is destroyed.
    pub fn detach_region(&self, region: &Arc<dyn VmRegion>) {
        self.inner.lock().regions.detach(&Arc::downgrade(region));
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        // No mapping may outlive the object.
        debug_assert!(inner.regions.is_empty());
        // Free all of the pages attached to us.
        inner.pages.free_all_pages();
    }
}

const_assert!(is_page_aligned(VmObject::MAX_SIZE));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_allocator, test_allocator_with_wired};
    use crate::usercopy::test_support;
    use alloc::vec::Vec;

    struct TestRegion {
        unmaps: Mutex<Vec<(u64, u64)>>,
    }

    impl TestRegion {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                unmaps: Mutex::new(Vec::new()),
            })
        }

        fn unmaps(&self) -> Vec<(u64, u64)> {
            self.unmaps.lock().clone()
        }
    }

    impl VmRegion for TestRegion {
        fn unmap_vmo_range_locked(&self, offset: u64, len: u64) {
            self.unmaps.lock().push((offset, len));
        }
    }

    fn page_addr(bits: u64) -> PageAddr {
        PageAddr::new(PhysAddr::new(bits)).unwrap()
    }

    #[test]
    fn zero_sized_object() {
        let allocator = test_allocator(2);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 0).unwrap();
        assert_eq!(vmo.size(), 0);
        assert_eq!(vmo.allocated_pages(), 0);

        let mut copied = 1;
        vmo.write(&[], 0, &mut copied).unwrap();
        assert_eq!(copied, 0);
    }

    #[test]
    fn create_rejects_oversize() {
        let allocator = test_allocator(1);
        let result = VmObject::create(allocator, AllocFlags::empty(), VmObject::MAX_SIZE + 1);
        assert_eq!(result.err(), Some(Error::OutOfRange));
    }

    #[test]
    fn write_read_roundtrip_across_pages() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 8192).unwrap();

        let data = [0x41u8; 100];
        let mut copied = 0;
        vmo.write(&data, 4090, &mut copied).unwrap();
        assert_eq!(copied, 100);
        assert_eq!(vmo.allocated_pages(), 2);

        let mut out = [0u8; 100];
        vmo.read(&mut out, 4090, &mut copied).unwrap();
        assert_eq!(copied, 100);
        assert_eq!(out[..], data[..]);
    }

    #[test]
    fn fault_in_zeroes_recycled_pages() {
        let allocator = test_allocator(1);
        // Dirty the page before it ever reaches an object.
        let mut frame = allocator.alloc_page(AllocFlags::empty()).unwrap();
        frame.as_bytes_mut().fill(0xdb);
        allocator.free_page(frame);

        let vmo = VmObject::create(allocator, AllocFlags::empty(), PAGE_SIZE).unwrap();
        let mut out = [0xffu8; 64];
        let mut copied = 0;
        vmo.read(&mut out, 0, &mut copied).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn commit_then_decommit() {
        let allocator = test_allocator(8);
        let vmo = VmObject::create(allocator.clone(), AllocFlags::empty(), 12288).unwrap();
        let region = TestRegion::new();
        let region_dyn: Arc<dyn VmRegion> = region.clone();
        vmo.attach_region(&region_dyn);

        assert_eq!(vmo.commit_range(0, 12288).unwrap(), 12288);
        assert_eq!(vmo.allocated_pages(), 3);
        assert_eq!(allocator.free_page_count(), 5);

        assert_eq!(vmo.decommit_range(4096, 4096).unwrap(), 4096);
        assert_eq!(vmo.allocated_pages(), 2);
        assert_eq!(allocator.free_page_count(), 6);
        assert_eq!(region.unmaps(), vec![(4096, 4096)]);

        vmo.detach_region(&region_dyn);
    }

    #[test]
    fn decommit_skips_holes() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 12288).unwrap();
        vmo.commit_range(0, 4096).unwrap();
        // Only page 0 is present; the rest of the range is skipped silently.
        assert_eq!(vmo.decommit_range(0, 12288).unwrap(), 4096);
        assert_eq!(vmo.allocated_pages(), 0);
    }

    #[test]
    fn commit_nothing_when_out_of_pages() {
        let allocator = test_allocator(1);
        let vmo = VmObject::create(allocator.clone(), AllocFlags::empty(), 4096).unwrap();
        let hold = allocator.alloc_page(AllocFlags::empty()).unwrap();

        assert_eq!(vmo.commit_range(0, 4096).err(), Some(Error::NoMemory));
        assert_eq!(vmo.allocated_pages(), 0);

        allocator.free_page(hold);
    }

    #[test]
    fn commit_is_atomic_on_partial_allocation() {
        let allocator = test_allocator(2);
        let vmo = VmObject::create(allocator.clone(), AllocFlags::empty(), 12288).unwrap();

        let data = [0x66u8; 16];
        let mut copied = 0;
        vmo.write(&data, 0, &mut copied).unwrap();
        assert_eq!(allocator.free_page_count(), 1);

        // Two pages are missing but only one is available; the partial batch
        // must be rolled back untouched.
        assert_eq!(
            vmo.commit_range(4096, 8192).err(),
            Some(Error::NoMemory)
        );
        assert_eq!(allocator.free_page_count(), 1);
        assert_eq!(vmo.allocated_pages(), 1);

        let mut out = [0u8; 16];
        vmo.read(&mut out, 0, &mut copied).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn no_double_commit() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator.clone(), AllocFlags::empty(), 8192).unwrap();

        assert_eq!(vmo.commit_range(0, 8192).unwrap(), 8192);
        let free_after_first = allocator.free_page_count();
        assert_eq!(vmo.commit_range(0, 8192).unwrap(), 0);
        assert_eq!(allocator.free_page_count(), free_after_first);
    }

    #[test]
    fn commit_fills_only_holes() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 12288).unwrap();
        vmo.commit_range(4096, 4096).unwrap();
        // Pages 0 and 2 are missing.
        assert_eq!(vmo.commit_range(0, 12288).unwrap(), 8192);
        assert_eq!(vmo.allocated_pages(), 3);
    }

    #[test]
    fn resize_shrink_invalidates_mappings() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator.clone(), AllocFlags::empty(), 8192).unwrap();
        let region = TestRegion::new();
        let region_dyn: Arc<dyn VmRegion> = region.clone();
        vmo.attach_region(&region_dyn);

        let data = vec![0x3c; 8192];
        let mut copied = 0;
        vmo.write(&data, 0, &mut copied).unwrap();
        assert_eq!(vmo.allocated_pages(), 2);

        vmo.resize(4096).unwrap();
        assert_eq!(vmo.size(), 4096);
        assert_eq!(vmo.allocated_pages(), 1);
        assert_eq!(region.unmaps(), vec![(4096, 4096)]);
        assert_eq!(allocator.free_page_count(), 3);

        // The shrunk-away range is gone for good.
        let mut out = [0u8; 1];
        assert_eq!(
            vmo.read(&mut out, 4096, &mut copied).err(),
            Some(Error::OutOfRange)
        );

        vmo.detach_region(&region_dyn);
    }

    #[test]
    fn resize_shrink_to_unaligned_size_keeps_last_page() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 8192).unwrap();
        vmo.commit_range(0, 8192).unwrap();
        // 4097 still straddles into the second page; nothing may be freed.
        vmo.resize(4097).unwrap();
        assert_eq!(vmo.allocated_pages(), 2);
        vmo.resize(4096).unwrap();
        assert_eq!(vmo.allocated_pages(), 1);
    }

    #[test]
    fn resize_grow_is_metadata_only() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator.clone(), AllocFlags::empty(), 4096).unwrap();
        let free_before = allocator.free_page_count();
        vmo.resize(4 * 4096).unwrap();
        assert_eq!(vmo.size(), 4 * 4096);
        assert_eq!(vmo.allocated_pages(), 0);
        assert_eq!(allocator.free_page_count(), free_before);
    }

    #[test]
    fn write_reports_partial_progress_on_failure() {
        let allocator = test_allocator(1);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 8192).unwrap();

        let data = vec![0x7f; 8192];
        let mut copied = 0;
        assert_eq!(
            vmo.write(&data, 0, &mut copied).err(),
            Some(Error::NoMemory)
        );
        // The first page made it; the second had no backing page to fault in.
        assert_eq!(copied, 4096);
    }

    #[test]
    fn lookup_reports_pages_without_faulting() {
        let allocator = test_allocator(2);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 4096).unwrap();

        let mut table = [0u64; 1];
        let ptr = UserPtr::new(table.as_mut_ptr() as u64);
        assert_eq!(vmo.lookup(0, 4096, ptr, 8).err(), Some(Error::NoMemory));
        // Lookup never faults in.
        assert!(vmo.get_page(0).is_none());

        vmo.commit_range(0, 4096).unwrap();
        vmo.lookup(0, 4096, ptr, 8).unwrap();
        assert_eq!(table[0], vmo.get_page(0).unwrap().bits());
    }

    #[test]
    fn lookup_validates_arguments() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 8192).unwrap();
        vmo.commit_range(0, 8192).unwrap();

        let mut table = [0u64; 2];
        let ptr = UserPtr::new(table.as_mut_ptr() as u64);
        assert_eq!(vmo.lookup(0, 0, ptr, 16).err(), Some(Error::InvalidArgs));
        assert_eq!(
            vmo.lookup(0, 12288, ptr, 64).err(),
            Some(Error::OutOfRange)
        );
        assert_eq!(
            vmo.lookup(0, 8192, ptr, 8).err(),
            Some(Error::BufferTooSmall)
        );

        // An unaligned range still reports every page it touches.
        vmo.lookup(4090, 10, ptr, 16).unwrap();
        assert_eq!(table[0], vmo.get_page(0).unwrap().bits());
        assert_eq!(table[1], vmo.get_page(4096).unwrap().bits());
    }

    #[test]
    fn cache_op_skips_holes() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 12288).unwrap();
        vmo.commit_range(0, 4096).unwrap();
        vmo.commit_range(8192, 4096).unwrap();
        let page0 = vmo.get_page(0).unwrap().bits();
        let page2 = vmo.get_page(8192).unwrap().bits();

        let mut ranges = Vec::new();
        vmo.cache_op_with(100, 12088, |va, n| ranges.push((va as u64, n)))
            .unwrap();
        assert_eq!(
            ranges,
            vec![(page0 + 100, 3996), (page2, 3996)]
        );
    }

    #[test]
    fn cache_ops_validate_range() {
        let allocator = test_allocator(2);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 4096).unwrap();
        vmo.commit_range(0, 4096).unwrap();

        assert_eq!(vmo.invalidate_cache(0, 0).err(), Some(Error::InvalidArgs));
        assert_eq!(vmo.clean_cache(0, 8192).err(), Some(Error::OutOfRange));
        vmo.invalidate_cache(0, 4096).unwrap();
        vmo.clean_cache(100, 200).unwrap();
        vmo.clean_invalidate_cache(0, 4096).unwrap();
        vmo.sync_cache(0, 4096).unwrap();
    }

    #[test]
    fn pages_return_to_allocator_on_drop() {
        let allocator = test_allocator(8);
        {
            let vmo =
                VmObject::create(allocator.clone(), AllocFlags::empty(), 6 * 4096).unwrap();
            let mut copied = 0;
            vmo.write(&[0x11; 5000], 100, &mut copied).unwrap();
            vmo.commit_range(3 * 4096, 2 * 4096).unwrap();
            vmo.decommit_range(0, 4096).unwrap();
            vmo.resize(4 * 4096).unwrap();
            assert_ne!(allocator.free_page_count(), 8);
        }
        assert_eq!(allocator.free_page_count(), 8);
    }

    #[test]
    fn fault_page_reuses_existing_page() {
        let allocator = test_allocator(2);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 8192).unwrap();

        let addr = vmo.fault_page(100, PageFaultFlags::empty()).unwrap();
        assert_eq!(vmo.get_page(0), Some(addr));
        // A write fault of the same page finds it in place.
        assert_eq!(vmo.fault_page(4095, PageFaultFlags::WRITE).unwrap(), addr);
        assert_eq!(vmo.allocated_pages(), 1);

        assert_eq!(
            vmo.fault_page(8192, PageFaultFlags::empty()).err(),
            Some(Error::OutOfRange)
        );
    }

    #[test]
    fn fault_page_fails_when_pool_is_dry() {
        let allocator = test_allocator(1);
        let vmo = VmObject::create(allocator.clone(), AllocFlags::empty(), 8192).unwrap();
        let hold = allocator.alloc_page(AllocFlags::empty()).unwrap();
        assert_eq!(
            vmo.fault_page(0, PageFaultFlags::WRITE).err(),
            Some(Error::NoMemory)
        );
        allocator.free_page(hold);
    }

    #[test]
    fn add_page_validates_offset() {
        let allocator = test_allocator(2);
        let vmo = VmObject::create(allocator.clone(), AllocFlags::empty(), 4096).unwrap();

        let frame = allocator.alloc_page(AllocFlags::empty()).unwrap();
        allocator.mark_object(&frame);
        assert_eq!(vmo.add_page(frame, 4096).err(), Some(Error::OutOfRange));

        let frame = allocator.alloc_page(AllocFlags::empty()).unwrap();
        allocator.mark_object(&frame);
        vmo.add_page(frame, 0).unwrap();
        assert_eq!(vmo.allocated_pages(), 1);
    }

    #[test]
    fn read_write_user_roundtrip() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 8192).unwrap();

        let data = vec![0x5au8; 300];
        let mut copied = 0;
        vmo.write_user(
            UserPtr::new(data.as_ptr() as u64),
            4000,
            data.len(),
            &mut copied,
        )
        .unwrap();
        assert_eq!(copied, 300);

        let mut out = vec![0u8; 300];
        vmo.read_user(
            UserPtr::new(out.as_mut_ptr() as u64),
            4000,
            out.len(),
            &mut copied,
        )
        .unwrap();
        assert_eq!(copied, 300);
        assert_eq!(out, data);
    }

    #[test]
    fn user_ops_reject_kernel_pointers() {
        let allocator = test_allocator(2);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 4096).unwrap();
        let kernel_ptr = UserPtr::new(0xffff_ff80_0000_0000);
        let mut copied = 0;
        assert_eq!(
            vmo.read_user(kernel_ptr, 0, 16, &mut copied).err(),
            Some(Error::InvalidArgs)
        );
        assert_eq!(
            vmo.write_user(kernel_ptr, 0, 16, &mut copied).err(),
            Some(Error::InvalidArgs)
        );
    }

    #[test]
    fn user_faults_surface_verbatim_with_progress() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 8192).unwrap();

        let mut buf = vec![0u8; 8192];
        let base = buf.as_mut_ptr() as u64;
        // The second page of the user buffer faults on access.
        test_support::arm_fault_window(base + 4096, base + 8192);
        let mut copied = 0;
        let err = vmo
            .read_user(UserPtr::new(base), 0, 8192, &mut copied)
            .unwrap_err();
        test_support::clear_fault_window();

        assert_eq!(err, Error::Fault(base + 4096));
        assert_eq!(copied, 4096);
    }

    #[test]
    fn contiguous_commit_allocates_a_run() {
        let allocator = test_allocator(8);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 16384).unwrap();
        assert_eq!(vmo.commit_range_contiguous(0, 16384, 12).unwrap(), 16384);

        let mut prev = vmo.get_page(0).unwrap();
        for offset in [4096u64, 8192, 12288] {
            let addr = vmo.get_page(offset).unwrap();
            assert_eq!(prev.checked_add_pages(1).unwrap(), addr);
            prev = addr;
        }
    }

    #[test]
    fn contiguous_commit_rejects_partial_ranges() {
        let allocator = test_allocator(8);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 16384).unwrap();
        vmo.commit_range(4096, 4096).unwrap();
        assert_eq!(
            vmo.commit_range_contiguous(0, 16384, 12).err(),
            Some(Error::InvalidArgs)
        );
        assert_eq!(
            vmo.commit_range_contiguous(100, 4096, 12).err(),
            Some(Error::InvalidArgs)
        );
    }

    #[test]
    fn contiguous_commit_rolls_back_on_failure() {
        let allocator = test_allocator(2);
        let vmo = VmObject::create(allocator.clone(), AllocFlags::empty(), 16384).unwrap();
        assert_eq!(
            vmo.commit_range_contiguous(0, 16384, 12).err(),
            Some(Error::NoMemory)
        );
        assert_eq!(vmo.allocated_pages(), 0);
        assert_eq!(allocator.free_page_count(), 2);
    }

    #[test]
    fn static_object_wraps_wired_range() {
        let (allocator, base) = test_allocator_with_wired(8, 2);
        let vmo = unsafe {
            VmObject::create_from_wired_data(allocator.clone(), base as *const u8, 8192)
        }
        .unwrap();

        assert_eq!(vmo.allocated_pages(), 2);
        assert_eq!(vmo.get_page(0).unwrap().bits(), base);
        assert_eq!(vmo.get_page(4096).unwrap().bits(), base + 4096);
        assert_eq!(
            allocator.page_state(page_addr(base)),
            Some(PageState::Wired)
        );
        // The factory leaks a reference so the object can never be destroyed.
        assert_eq!(Arc::strong_count(&vmo), 2);
    }

    #[test]
    fn static_object_claims_free_pages() {
        let allocator = test_allocator(4);
        // Learn where the pool starts.
        let probe = allocator.alloc_page(AllocFlags::empty()).unwrap();
        let base = probe.addr();
        allocator.free_page(probe);
        let free_before = allocator.free_page_count();

        let vmo = unsafe {
            VmObject::create_from_wired_data(allocator.clone(), base.bits() as *const u8, 4096)
        }
        .unwrap();

        assert_eq!(vmo.get_page(0), Some(base));
        assert_eq!(allocator.page_state(base), Some(PageState::Wired));
        assert_eq!(allocator.free_page_count(), free_before - 1);
    }

    #[test]
    #[should_panic(expected = "unusable state")]
    fn static_object_panics_on_owned_page() {
        let allocator = test_allocator(2);
        let frame = allocator.alloc_page(AllocFlags::empty()).unwrap();
        allocator.mark_object(&frame);
        let addr = frame.addr();
        std::mem::forget(frame);

        let _ = unsafe {
            VmObject::create_from_wired_data(allocator, addr.bits() as *const u8, 4096)
        };
    }

    #[test]
    fn detached_regions_stop_hearing_unmaps() {
        let allocator = test_allocator(4);
        let vmo = VmObject::create(allocator, AllocFlags::empty(), 8192).unwrap();
        let first = TestRegion::new();
        let second = TestRegion::new();
        let first_dyn: Arc<dyn VmRegion> = first.clone();
        let second_dyn: Arc<dyn VmRegion> = second.clone();
        vmo.attach_region(&first_dyn);
        vmo.attach_region(&second_dyn);

        vmo.commit_range(0, 8192).unwrap();
        vmo.decommit_range(0, 4096).unwrap();
        assert_eq!(first.unmaps(), vec![(0, 4096)]);
        assert_eq!(second.unmaps(), vec![(0, 4096)]);

        vmo.detach_region(&first_dyn);
        vmo.decommit_range(4096, 4096).unwrap();
        assert_eq!(first.unmaps(), vec![(0, 4096)]);
        assert_eq!(second.unmaps(), vec![(0, 4096), (4096, 4096)]);

        vmo.detach_region(&second_dyn);
        vmo.dump(0, true);
    }
}
