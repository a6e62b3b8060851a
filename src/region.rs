// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Weak;
use alloc::vec::Vec;

/// An address-space region that maps some byte range of a memory object.
///
/// Regions own (share) the object through a counted handle; the object talks
/// back through these callbacks to keep active mappings in sync when pages
/// leave it.
pub trait VmRegion: Send + Sync {
    /// Unmaps any portion of this region's mapping that overlaps the given
    /// byte range of the object. Called with the object's lock held, so the
    /// implementation must resolve without calling back into the same object.
    fn unmap_vmo_range_locked(&self, offset: u64, len: u64);
}

/// The set of regions currently mapping a memory object.
///
/// Membership is a weak back-reference: the set never extends a region's
/// lifetime, and the mapping layer must detach a region before destroying it.
/// A counted reference here would form a cycle with the mapping direction.
pub(crate) struct RegionSet {
    members: Vec<Weak<dyn VmRegion>>,
}

impl RegionSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    /// Records a back-reference to `region`.
    pub fn attach(&mut self, region: Weak<dyn VmRegion>) {
        self.members.push(region);
    }

    /// Forgets the back-reference to `region`. Returns false if it was not
    /// attached.
    pub fn detach(&mut self, region: &Weak<dyn VmRegion>) -> bool {
        let before = self.members.len();
        self.members.retain(|member| !same_region(member, region));
        self.members.len() != before
    }

    /// Calls `f` for every attached region. Order is unspecified.
    pub fn for_each<F: FnMut(&dyn VmRegion)>(&self, mut f: F) {
        for member in &self.members {
            if let Some(region) = member.upgrade() {
                f(region.as_ref());
            }
        }
    }

    /// Returns if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// Compares the object identity of two back-references. Comparing the data
// pointers alone sidesteps the vtable-identity pitfalls of wide-pointer
// equality.
fn same_region(a: &Weak<dyn VmRegion>, b: &Weak<dyn VmRegion>) -> bool {
    a.as_ptr() as *const u8 == b.as_ptr() as *const u8
}
