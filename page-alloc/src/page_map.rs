// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use mem_pages::{PageAddr, PAGE_SIZE};

use crate::mem_map::{MemMap, MemRegionType, ReservedMemType};

/// `PageState` holds the current ownership status of a page. The tag is the
/// authoritative witness of who holds a page: every transfer of a page between
/// the free pool, the kernel image, and memory objects updates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Not present, firmware-reserved, or otherwise not usable.
    Reserved,

    /// Page is in the allocator's free pool.
    Free,

    /// Page has left the free pool but has not yet reached its owner.
    Alloc,

    /// Page is permanently owned by the kernel image. Wired pages never return
    /// to the free pool.
    Wired,

    /// Page is owned by a memory object's page list.
    Object,
}

/// Tracks the state of every page in the range covered by the system memory
/// map. Gaps between map regions are `Reserved` and stay that way.
pub struct PageMap {
    base: PageAddr,
    states: Vec<PageState>,
}

impl PageMap {
    /// Creates a `PageMap` covering `mem_map`, with available pages `Free`,
    /// kernel-image reservations `Wired`, and everything else `Reserved`.
    pub fn build_from(mem_map: &MemMap) -> Self {
        let base = mem_map
            .regions()
            .next()
            .expect("memory map has no regions")
            .base();
        // Unwrap ok, the map's regions are sorted.
        let end = mem_map.regions().last().unwrap().end();
        let num_pages = (end.bits() - base.bits()) / PAGE_SIZE;
        let mut states = Vec::new();
        states.resize(num_pages as usize, PageState::Reserved);

        let mut map = Self { base, states };
        for region in mem_map.regions() {
            let state = match region.region_type() {
                MemRegionType::Available => PageState::Free,
                MemRegionType::Reserved(ReservedMemType::KernelImage) => PageState::Wired,
                MemRegionType::Reserved(ReservedMemType::Firmware) => PageState::Reserved,
            };
            let mut addr = region.base();
            while addr != region.end() {
                *map.get_mut(addr).unwrap() = state;
                // Unwrap ok, the region end was validated at map construction.
                addr = addr.checked_add_pages(1).unwrap();
            }
        }
        map
    }

    /// Returns the address of the first page covered by the map.
    pub fn base(&self) -> PageAddr {
        self.base
    }

    /// Returns the number of pages covered by the map.
    pub fn num_pages(&self) -> usize {
        self.states.len()
    }

    /// Returns the state of the page at `addr`, or `None` if the address is
    /// outside the map.
    pub fn get(&self, addr: PageAddr) -> Option<PageState> {
        self.index_of(addr).map(|i| self.states[i])
    }

    /// Returns a mutable reference to the state of the page at `addr`.
    pub(crate) fn get_mut(&mut self, addr: PageAddr) -> Option<&mut PageState> {
        self.index_of(addr).map(move |i| &mut self.states[i])
    }

    fn index_of(&self, addr: PageAddr) -> Option<usize> {
        if addr.bits() < self.base.bits() {
            return None;
        }
        let index = ((addr.bits() - self.base.bits()) / PAGE_SIZE) as usize;
        (index < self.states.len()).then_some(index)
    }
}
