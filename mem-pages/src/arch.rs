// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Low-level cache maintenance operations.
//!
//! All operations take a kernel-virtual range. On RISC-V the data caches are
//! hardware-coherent, so clean and invalidate reduce to ordering fences; sync
//! additionally orders instruction fetch against prior writes for ranges that
//! may be executed.

#[cfg(target_arch = "riscv64")]
mod imp {
    use core::arch::asm;

    /// Writes back any dirty lines covering `[va, va + len)`.
    pub fn clean_cache_range(_va: *const u8, _len: usize) {
        // Safety: FENCE has no side effect beyond ordering memory accesses.
        unsafe { asm!("fence rw, rw") };
    }

    /// Drops any cached lines covering `[va, va + len)` without writing them
    /// back.
    pub fn invalidate_cache_range(_va: *const u8, _len: usize) {
        // Safety: FENCE has no side effect beyond ordering memory accesses.
        unsafe { asm!("fence rw, rw") };
    }

    /// Writes back and drops any cached lines covering `[va, va + len)`.
    pub fn clean_invalidate_cache_range(_va: *const u8, _len: usize) {
        // Safety: FENCE has no side effect beyond ordering memory accesses.
        unsafe { asm!("fence rw, rw") };
    }

    /// Makes prior writes to `[va, va + len)` visible to instruction fetch.
    pub fn sync_cache_range(_va: *const u8, _len: usize) {
        // Safety: FENCE and FENCE.I have no side effects beyond ordering
        // memory accesses and instruction fetch.
        unsafe {
            asm!("fence rw, rw");
            asm!("fence.i");
        }
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod imp {
    use core::sync::atomic::{compiler_fence, Ordering};

    // Hosted builds (tests) have no cache management to do; keep the compiler
    // from reordering accesses across the op.

    pub fn clean_cache_range(_va: *const u8, _len: usize) {
        compiler_fence(Ordering::SeqCst);
    }

    pub fn invalidate_cache_range(_va: *const u8, _len: usize) {
        compiler_fence(Ordering::SeqCst);
    }

    pub fn clean_invalidate_cache_range(_va: *const u8, _len: usize) {
        compiler_fence(Ordering::SeqCst);
    }

    pub fn sync_cache_range(_va: *const u8, _len: usize) {
        compiler_fence(Ordering::SeqCst);
    }
}

pub use imp::{
    clean_cache_range, clean_invalidate_cache_range, invalidate_cache_range, sync_cache_range,
};
