// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Paged virtual-memory objects
//!
//! ## Key types
//!
//! - `VmObject` - An anonymous, byte-addressable container of physical memory
//!   pages. Pages are faulted in on first access, can be committed and
//!   decommitted in ranges, and are returned to the page allocator exactly
//!   once when the object goes away.
//! - `PageList` - The sparse offset-to-page mapping backing a `VmObject`.
//! - `VmRegion` - Implemented by address-space regions that map an object;
//!   the object calls back through it to keep mappings in sync when pages are
//!   removed.
//! - `UserPtr` - An untrusted pointer into user address space, with validated
//!   fault-reporting copy primitives.

#![no_std]

extern crate alloc;

mod page_list;
mod region;
mod usercopy;
mod vm_object;

pub use page_list::PageList;
pub use region::VmRegion;
pub use usercopy::{is_kernel_address, UserPtr};
pub use vm_object::{PageFaultFlags, VmObject};

/// Errors returned by memory-object operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The requested byte range exceeds or straddles the object's size.
    OutOfRange,

    /// The page allocator could not satisfy a request, or an absent page was
    /// found where a present one was required.
    NoMemory,

    /// Zero length where a non-zero one is required, or a pointer in the
    /// wrong address space.
    InvalidArgs,

    /// The output buffer cannot hold the result table.
    BufferTooSmall,

    /// A page is already present at the given offset.
    AlreadyExists,

    /// A user-space access faulted at the given address.
    Fault(u64),
}

/// Holds the result of memory-object operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
#[macro_use]
extern crate std;
