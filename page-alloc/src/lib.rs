// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Physical page allocation
//!
//! ## Key types
//!
//! - `MemMap` - Map of system RAM, used to determine the address ranges to
//!   create pages from and which of them the kernel image has already claimed.
//!   Built once at startup with `MemMapBuilder`.
//! - `PageMap` - Per-page ownership state for every page in the map. The state
//!   tag is the authoritative witness of who owns a page.
//! - `PageAllocator` - Hands out uniquely-owned `PageFrame`s from the pool of
//!   free pages and takes them back when their owners are done. Can be cloned
//!   and passed to every component that needs pages.

#![no_std]

extern crate alloc;

mod allocator;
mod mem_map;
mod page_map;

pub use allocator::{AllocFlags, PageAllocator};
pub use mem_map::Error as MemMapError;
pub use mem_map::Result as MemMapResult;
pub use mem_map::{MemMap, MemMapBuilder, MemRegion, MemRegionType, ReservedMemType};
pub use page_map::{PageMap, PageState};

#[cfg(test)]
#[macro_use]
extern crate std;
