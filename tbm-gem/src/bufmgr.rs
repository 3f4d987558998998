// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Buffer manager types.
//!
//! This module defines `Bufmgr`, `Builder` and `Config`.

use super::bo::Bo;
use super::drivers::{CacheOp, Driver};
use super::fence::{FileLock, KernelFence, SyncStrategy, Ticket};
use super::flags;
use super::registry::Registry;
use super::types::{CacheFlags, DeviceClass, Error, Name, Result, Size};
use super::utils;
use log::{error, info};
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "drm")]
use std::os::fd::OwnedFd;

/// Path of the module parameter that tells whether kernel dma-buf fencing is enabled.
pub const DMA_FENCE_PARAM_PATH: &str = "/sys/module/dmabuf_sync/parameters/enabled";

/// Default number of locks a BO can hold at once.
pub const DEFAULT_FENCE_QUEUE_DEPTH: usize = 5;

/// Default size up to which scanout BOs are allocated non-contiguously.
pub const CONTIG_MIN_SIZE: Size = 4096;

bitflags::bitflags! {
    /// Capabilities reported to the host core.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct BackendFlags: u32 {
        /// The backend does cache maintenance.
        const CACHE_CTRL_BACKEND = 1 << 0;
        /// The backend does access locking.
        const LOCK_CTRL_BACKEND = 1 << 1;
    }
}

/// The configuration of a buffer manager.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct Config {
    /// Whether kernel dma-buf fencing is enabled.
    pub dma_fence: bool,
    /// The number of locks a BO can hold at once.
    pub fence_queue_depth: usize,
    /// How long a CPU lock waits before giving up.  `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Scanout BOs up to this size are allocated non-contiguously.
    pub contig_min_size: Size,
}

/// A buffer manager.
///
/// A buffer manager owns a kernel driver and the name registry shared by all of its BOs.
pub struct Bufmgr {
    driver: Box<dyn Driver>,
    config: Config,
    registry: Registry,
    kernel_fence: KernelFence,
    file_lock: FileLock,
}

impl Bufmgr {
    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the capabilities to report to the host core.
    pub fn backend_flags(&self) -> BackendFlags {
        if self.config.dma_fence {
            BackendFlags::LOCK_CTRL_BACKEND | BackendFlags::CACHE_CTRL_BACKEND
        } else {
            BackendFlags::empty()
        }
    }

    /// Returns the number of live BOs bound to a global name.
    pub fn refcount(&self, name: Name) -> u32 {
        self.registry.refcount(name)
    }

    /// Performs cache maintenance.
    ///
    /// With a BO, the operation covers the BO.  Range operations require the BO to be mapped for
    /// CPU access.  Without a BO, all caches are flushed.  This is a no-op when kernel fencing is
    /// enabled.
    pub fn cache_flush(&self, bo: Option<&Bo>, flags: CacheFlags) -> Result<()> {
        if self.config.dma_fence {
            return Ok(());
        }

        let op = match bo {
            Some(bo) => {
                if !ptr::eq(bo.bufmgr().as_ref(), self) {
                    return Error::user();
                }

                let addr = match bo.cpu_addr() {
                    Some(addr) => addr,
                    None if flags.contains(CacheFlags::ALL) => 0,
                    None => return Err(Error::NotMapped),
                };

                CacheOp {
                    addr,
                    size: bo.size(),
                    flags: flags::cache_op(flags),
                    handle: bo.gem_handle(),
                }
            }
            None => CacheOp {
                addr: 0,
                size: 0,
                flags: flags::cache_op(CacheFlags::FLUSH_ALL),
                handle: 0,
            },
        };

        self.driver.cache_op(op).map_err(|err| {
            error!("failed to flush caches with {:?}: {}", op.flags, err);
            Error::from(err)
        })
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn sync_strategy(&self, device: DeviceClass) -> Result<&dyn SyncStrategy> {
        match device {
            DeviceClass::G3d => Ok(&self.kernel_fence),
            DeviceClass::Cpu => Ok(&self.file_lock),
            _ => Err(Error::UnsupportedDevice(device)),
        }
    }

    pub(crate) fn strategy_for(&self, ticket: &Ticket) -> &dyn SyncStrategy {
        match ticket {
            Ticket::Fence(_) => &self.kernel_fence,
            Ticket::FileLock(_) => &self.file_lock,
        }
    }
}

#[cfg(feature = "drm")]
enum Node {
    Path(PathBuf),
    Fd(OwnedFd),
}

/// A buffer manager builder.
///
/// Exactly one of `driver`, `node_path` and `node_fd` must be given.
#[derive(Default)]
pub struct Builder {
    driver: Option<Box<dyn Driver>>,
    #[cfg(feature = "drm")]
    node: Option<Node>,
    dma_fence: Option<bool>,
    fence_param_path: Option<PathBuf>,
    fence_queue_depth: Option<usize>,
    lock_timeout: Option<Duration>,
    contig_min_size: Option<Size>,
}

impl Builder {
    /// Creates a buffer manager builder.
    pub fn new() -> Self {
        Default::default()
    }

    /// Uses a custom kernel driver.
    pub fn driver<T>(mut self, driver: T) -> Self
    where
        T: Driver + 'static,
    {
        self.driver = Some(Box::new(driver));
        self
    }

    /// Opens an Exynos DRM device node.
    #[cfg(feature = "drm")]
    pub fn node_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.node = Some(Node::Path(path.into()));
        self
    }

    /// Uses an opened Exynos DRM device node.
    #[cfg(feature = "drm")]
    pub fn node_fd(mut self, fd: OwnedFd) -> Self {
        self.node = Some(Node::Fd(fd));
        self
    }

    /// Overrides the detection of kernel dma-buf fencing.
    pub fn dma_fence(mut self, enabled: bool) -> Self {
        self.dma_fence = Some(enabled);
        self
    }

    /// Sets the module parameter to detect kernel dma-buf fencing from.
    pub fn fence_param_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fence_param_path = Some(path.into());
        self
    }

    /// Sets the number of locks a BO can hold at once.
    pub fn fence_queue_depth(mut self, depth: usize) -> Self {
        self.fence_queue_depth = Some(depth);
        self
    }

    /// Sets how long a CPU lock waits before giving up.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Sets the size up to which scanout BOs are allocated non-contiguously.
    pub fn contig_min_size(mut self, size: Size) -> Self {
        self.contig_min_size = Some(size);
        self
    }

    #[cfg(feature = "drm")]
    fn take_driver(&mut self) -> Result<Box<dyn Driver>> {
        let node_fd = match self.node.take() {
            Some(Node::Path(path)) => Some(utils::open(path)?),
            Some(Node::Fd(fd)) => Some(fd),
            None => None,
        };

        match (self.driver.take(), node_fd) {
            (Some(driver), None) => Ok(driver),
            (None, Some(fd)) => Ok(Box::new(super::drivers::exynos::Driver::new(fd))),
            _ => Error::user(),
        }
    }

    #[cfg(not(feature = "drm"))]
    fn take_driver(&mut self) -> Result<Box<dyn Driver>> {
        self.driver.take().ok_or(Error::Unsupported)
    }

    /// Builds a `Bufmgr`.
    pub fn build(mut self) -> Result<Arc<Bufmgr>> {
        let fence_queue_depth = self
            .fence_queue_depth
            .unwrap_or(DEFAULT_FENCE_QUEUE_DEPTH);
        if fence_queue_depth == 0 {
            return Error::user();
        }

        let driver = self.take_driver()?;

        let dma_fence = match self.dma_fence {
            Some(enabled) => enabled,
            None => {
                let path = self
                    .fence_param_path
                    .unwrap_or_else(|| PathBuf::from(DMA_FENCE_PARAM_PATH));
                utils::read_param(path)
            }
        };

        let config = Config {
            dma_fence,
            fence_queue_depth,
            lock_timeout: self.lock_timeout,
            contig_min_size: self.contig_min_size.unwrap_or(CONTIG_MIN_SIZE),
        };
        info!(
            "dma fence {}",
            if dma_fence { "enabled" } else { "disabled" }
        );

        let mgr = Bufmgr {
            driver,
            config,
            registry: Registry::default(),
            kernel_fence: KernelFence,
            file_lock: FileLock::new(self.lock_timeout),
        };

        Ok(Arc::new(mgr))
    }
}
