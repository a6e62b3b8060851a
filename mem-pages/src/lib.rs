// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Physical page primitives
//!
//! - `PhysAddr` and `PageAddr` are physical addresses, the latter proven
//!   aligned to a page boundary.
//! - `PageFrame` is the basic building block of memory management: an owned
//!   handle to a single physical page. Whoever holds the frame holds the
//!   memory behind it.
//! - `arch` carries the cache-maintenance primitives that operate on the
//!   kernel-virtual mapping of a page range.

#![no_std]

pub mod arch;
mod addr;
mod page;

pub use addr::{
    is_page_aligned, round_page_down, round_page_up, PageAddr, PageAddrIter, Pfn, PhysAddr,
    PAGE_SHIFT, PAGE_SIZE,
};
pub use page::PageFrame;

#[cfg(test)]
#[macro_use]
extern crate std;
