// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Kernel driver seam.
//!
//! A `Driver` issues the kernel calls a buffer manager needs.  Every call is synchronous and
//! blocks the calling thread until the kernel responds.

#[cfg(feature = "drm")]
pub mod exynos;
#[cfg(test)]
pub(crate) mod fake;

use super::fence::{Fence, FenceAccess};
use super::flags::{GemCacheFlags, GemFlags};
use super::types::{Mapping, Name, Size};
use super::utils;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

/// A cache operation request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheOp {
    /// CPU virtual address of the range, or 0.
    pub addr: u64,
    /// Size of the range, or 0.
    pub size: Size,
    /// Kernel cache operation flags.
    pub flags: GemCacheFlags,
    /// GEM handle of the range, or 0.
    pub handle: u32,
}

fn unsupported() -> io::Error {
    io::Error::from(io::ErrorKind::Unsupported)
}

/// A kernel memory-allocation driver.
pub trait Driver: Send + Sync {
    /// Creates a memory object and returns its GEM handle.
    fn gem_create(&self, size: Size, flags: GemFlags) -> io::Result<u32>;

    /// Releases a GEM handle.
    fn gem_close(&self, handle: u32) -> io::Result<()>;

    /// Returns the global name of a memory object, assigning one if needed.
    fn gem_flink(&self, handle: u32) -> io::Result<Name>;

    /// Opens a memory object by its global name.  Returns the new GEM handle and the size.
    fn gem_open(&self, name: Name) -> io::Result<(u32, Size)>;

    /// Queries the size and the flags of a memory object.
    fn gem_info(&self, handle: u32) -> io::Result<(Size, GemFlags)>;

    /// Maps a memory object for CPU access.
    fn gem_mmap(&self, handle: u32, size: Size) -> io::Result<Mapping>;

    /// Drops a CPU mapping returned by `gem_mmap`.
    fn gem_munmap(&self, mapping: Mapping) -> io::Result<()> {
        utils::munmap(mapping)
    }

    /// Converts a GEM handle to a dma-buf fd.
    fn prime_export(&self, handle: u32) -> io::Result<OwnedFd>;

    /// Performs a cache operation.
    fn cache_op(&self, _op: CacheOp) -> io::Result<()> {
        Err(unsupported())
    }

    /// Gets a fence on a dma-buf and returns its context.
    fn get_fence(&self, _dmabuf: BorrowedFd, _access: FenceAccess) -> io::Result<u64> {
        Err(unsupported())
    }

    /// Puts a fence returned by `get_fence`.
    fn put_fence(&self, _dmabuf: BorrowedFd, _fence: Fence) -> io::Result<()> {
        Err(unsupported())
    }
}
