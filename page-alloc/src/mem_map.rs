// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arrayvec::ArrayVec;
use core::result;
use mem_pages::{is_page_aligned, PageAddr, PhysAddr, PAGE_SIZE};

/// The maximum number of regions in a `MemMap`. Statically sized since there is
/// no dynamic memory allocation at the point at which the memory map is
/// constructed.
const MAX_MEM_REGIONS: usize = 32;

type RegionVec = ArrayVec<MemRegion, MAX_MEM_REGIONS>;

/// Describes the usage of a region in the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRegionType {
    /// Physical memory the allocator may hand out for any purpose.
    Available,

    /// Physical memory that is already spoken for at boot.
    Reserved(ReservedMemType),
}

/// Describes the purpose of a reserved region in the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedMemType {
    /// The kernel image itself (code, data, stack). The pages stay wired for
    /// the lifetime of the system; they may be wrapped by a memory object but
    /// never returned to the free pool.
    KernelImage,

    /// Firmware says this range is reserved. Can't be used for any purpose
    /// and should not be accessed.
    Firmware,
}

/// A contiguous, page-aligned region in the memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    region_type: MemRegionType,
    base: PageAddr,
    size: u64,
}

impl MemRegion {
    /// Returns the type of the memory region.
    pub fn region_type(&self) -> MemRegionType {
        self.region_type
    }

    /// Returns the page-aligned base address of the region.
    pub fn base(&self) -> PageAddr {
        self.base
    }

    /// Returns the total size of the region.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the first page address past the end of the region.
    pub fn end(&self) -> PageAddr {
        // Unwrap ok because `size` must be a multiple of the page size.
        self.base.checked_add_pages(self.size / PAGE_SIZE).unwrap()
    }
}

/// Errors that can be raised while building the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Memory region base or size is unaligned.
    UnalignedRegion,

    /// Memory region overlaps with another one.
    OverlappingRegion,

    /// Reserved region isn't a subset of an available memory region.
    InvalidReservedRegion,

    /// No more entries available in the memory map.
    OutOfSpace,
}

/// Holds the result of memory map operations.
pub type Result<T> = result::Result<T, Error>;

/// Represents the system memory map. Owns all the memory it describes.
/// Configuring it correctly is _critical_: every page the allocator will ever
/// hand out is derived from this map.
#[derive(Default)]
pub struct MemMap {
    // Maintained in sorted order.
    regions: RegionVec,
}

impl MemMap {
    /// Returns an iterator over the regions of the map, in address order.
    pub fn regions(&self) -> impl ExactSizeIterator<Item = &MemRegion> {
        self.regions.iter()
    }
}

/// A builder for a `MemMap`. Call `add_memory_region()` once for each range of
/// physical memory in the system and `reserve_region()` for each range that is
/// claimed from the start. The constructed `MemMap` must be the unique owner of
/// the memory it points to.
pub struct MemMapBuilder {
    inner: MemMap,
}

impl MemMapBuilder {
    /// Creates an empty memory map.
    pub fn new() -> Self {
        Self {
            inner: MemMap::default(),
        }
    }

    /// Adds a range of available RAM to the map. Base and size must be
    /// page-aligned and must not overlap any previously-added region.
    ///
    /// # Safety
    ///
    /// The region must be a valid range of memory uniquely owned by the
    /// builder.
    pub unsafe fn add_memory_region(mut self, base: PhysAddr, size: u64) -> Result<Self> {
        if !is_page_aligned(base.bits()) || !is_page_aligned(size) {
            return Err(Error::UnalignedRegion);
        }
        let base = PageAddr::new(base).unwrap();
        let region = MemRegion {
            region_type: MemRegionType::Available,
            base,
            size,
        };
        let mut index = 0;
        for other in &self.inner.regions {
            if other.base() > region.base() {
                if region.end() > other.base() {
                    return Err(Error::OverlappingRegion);
                }
                break;
            } else if region.base() < other.end() {
                return Err(Error::OverlappingRegion);
            }
            index += 1;
        }
        self.inner
            .regions
            .try_insert(index, region)
            .map_err(|_| Error::OutOfSpace)?;
        Ok(self)
    }

    /// Reserves a page-aligned range for the given purpose. The range must be a
    /// subset of a previously-added available region; the containing region is
    /// split around it.
    pub fn reserve_region(
        mut self,
        resv_type: ReservedMemType,
        base: PhysAddr,
        size: u64,
    ) -> Result<Self> {
        if !is_page_aligned(base.bits()) || !is_page_aligned(size) {
            return Err(Error::UnalignedRegion);
        }
        let base = PageAddr::new(base).unwrap();
        let end = base
            .checked_add_pages(size / PAGE_SIZE)
            .ok_or(Error::InvalidReservedRegion)?;
        let index = self
            .inner
            .regions
            .iter()
            .position(|r| {
                r.region_type() == MemRegionType::Available && r.base() <= base && end <= r.end()
            })
            .ok_or(Error::InvalidReservedRegion)?;
        let existing = self.inner.regions[index];

        // Make sure the split fits before modifying anything.
        let mut to_reserve = 0;
        if existing.base() != base {
            to_reserve += 1;
        }
        if existing.end() != end {
            to_reserve += 1;
        }
        if self.inner.regions.remaining_capacity() < to_reserve {
            return Err(Error::OutOfSpace);
        }

        // Carve the reservation out of the containing region, keeping the list
        // sorted.
        self.inner.regions.remove(index);
        let mut insert_at = index;
        if existing.base() != base {
            let head = MemRegion {
                region_type: MemRegionType::Available,
                base: existing.base(),
                size: base.bits() - existing.base().bits(),
            };
            // Unwraps below are ok, capacity was checked above.
            self.inner.regions.try_insert(insert_at, head).unwrap();
            insert_at += 1;
        }
        let reserved = MemRegion {
            region_type: MemRegionType::Reserved(resv_type),
            base,
            size,
        };
        self.inner.regions.try_insert(insert_at, reserved).unwrap();
        insert_at += 1;
        if existing.end() != end {
            let tail = MemRegion {
                region_type: MemRegionType::Available,
                base: end,
                size: existing.end().bits() - end.bits(),
            };
            self.inner.regions.try_insert(insert_at, tail).unwrap();
        }
        Ok(self)
    }

    /// Consumes the builder, returning the finished map.
    pub fn build(self) -> MemMap {
        self.inner
    }
}

impl Default for MemMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}
