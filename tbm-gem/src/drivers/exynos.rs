// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

use super::CacheOp;
use crate::fence::{Fence, FenceAccess};
use crate::flags::GemFlags;
use crate::types::{Mapping, Name, Size};
use crate::utils;
use drm::control::Device as DrmControlDevice;
use drm::Device as DrmDevice;
use log::{info, warn};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

struct Card(OwnedFd);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd {
        self.0.as_fd()
    }
}
impl DrmDevice for Card {}
impl DrmControlDevice for Card {}

/// The Exynos DRM driver.
pub struct Driver {
    card: Card,
}

impl Driver {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        let card = Card(fd);

        match card.get_driver() {
            Ok(drv) => info!("drm driver {} opened", drv.name().to_string_lossy()),
            Err(err) => warn!("failed to query the drm driver: {}", err),
        }

        Self { card }
    }
}

impl super::Driver for Driver {
    fn gem_create(&self, size: Size, flags: GemFlags) -> io::Result<u32> {
        utils::exynos_gem_create(&self.card, size, flags.bits())
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        utils::gem_close(&self.card, handle)
    }

    fn gem_flink(&self, handle: u32) -> io::Result<Name> {
        utils::gem_flink(&self.card, handle)
    }

    fn gem_open(&self, name: Name) -> io::Result<(u32, Size)> {
        utils::gem_open(&self.card, name)
    }

    fn gem_info(&self, handle: u32) -> io::Result<(Size, GemFlags)> {
        let (size, flags) = utils::exynos_gem_info(&self.card, handle)?;
        Ok((size, GemFlags::from_bits_retain(flags)))
    }

    fn gem_mmap(&self, handle: u32, size: Size) -> io::Result<Mapping> {
        utils::exynos_gem_mmap(&self.card, handle, size)
    }

    fn prime_export(&self, handle: u32) -> io::Result<OwnedFd> {
        let handle = drm::control::from_u32(handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;

        self.card
            .buffer_to_prime_fd(handle, drm::RDWR | drm::CLOEXEC)
    }

    fn cache_op(&self, op: CacheOp) -> io::Result<()> {
        utils::exynos_gem_cache_op(&self.card, op.addr, op.size, op.flags.bits(), op.handle)
    }

    fn get_fence(&self, dmabuf: BorrowedFd, access: FenceAccess) -> io::Result<u64> {
        utils::dma_buf_get_fence(dmabuf, access.bits())
    }

    fn put_fence(&self, dmabuf: BorrowedFd, fence: Fence) -> io::Result<()> {
        utils::dma_buf_put_fence(dmabuf, fence.ctx, fence.access.bits())
    }
}
