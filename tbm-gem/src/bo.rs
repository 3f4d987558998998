// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

use super::bufmgr::Bufmgr;
use super::fence::{FenceQueue, Ticket};
use super::flags::{self, GemFlags};
use super::types::{Access, CacheFlags, DeviceClass, Error, Flags, Mapping, Name, Result, Size};
use log::{debug, error, warn};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A device handle of a BO.
#[derive(Clone, Copy, Debug)]
pub enum BoHandle<'a> {
    /// The raw GEM handle.
    Gem(u32),
    /// A CPU mapping.
    Cpu(Mapping),
    /// A dma-buf fd owned by the BO.
    DmaBuf(BorrowedFd<'a>),
}

impl BoHandle<'_> {
    /// Returns the handle as an integer.
    pub fn as_u64(&self) -> u64 {
        match self {
            Self::Gem(handle) => u64::from(*handle),
            Self::Cpu(mapping) => mapping.addr(),
            Self::DmaBuf(fd) => fd.as_raw_fd() as u64,
        }
    }
}

// closes the GEM handle when dropped
struct GemObject {
    mgr: Arc<Bufmgr>,
    handle: u32,
}

impl Drop for GemObject {
    fn drop(&mut self) {
        if let Err(err) = self.mgr.driver().gem_close(self.handle) {
            error!("failed to close gem handle {}: {}", self.handle, err);
        }
    }
}

struct MappingState {
    refcount: u32,
    // handed out by `handle` and kept until free
    pinned: bool,
    mapping: Option<Mapping>,
}

/// A buffer object.
///
/// A BO owns one GEM handle for its lifetime, and lazily a global name, a CPU mapping and a
/// dma-buf fd.  Dropping a BO frees it.
pub struct Bo {
    gem: GemObject,
    size: Size,
    flags: Flags,
    gem_flags: GemFlags,

    name: Mutex<Option<Name>>,
    dmabuf: OnceLock<OwnedFd>,
    state: Mutex<MappingState>,
    fences: Mutex<FenceQueue>,
    // serializes changes to the file lock on the dma-buf
    file_lock: Mutex<()>,
}

impl Bo {
    /// Allocates a BO.
    ///
    /// Scanout BOs no larger than `Config::contig_min_size` are allocated non-contiguously.
    pub fn alloc(mgr: Arc<Bufmgr>, size: Size, flags: Flags) -> Result<Self> {
        if size == 0 {
            return Error::user();
        }

        let mut gem_flags = flags::to_gem(flags);
        if flags.contains(Flags::SCANOUT) && size <= mgr.config().contig_min_size {
            gem_flags |= GemFlags::NONCONTIG;
        }

        let handle = mgr
            .driver()
            .gem_create(size, gem_flags)
            .map_err(|source| {
                error!(
                    "failed to create gem object of size {} with {:?}: {}",
                    size, gem_flags, source
                );
                Error::Allocation {
                    size,
                    flags,
                    source,
                }
            })?;

        let gem = GemObject { mgr, handle };
        let bo = Self::with_gem(gem, size, flags, gem_flags);

        // a later export retries
        if let Err(err) = bo.export() {
            warn!("no global name for gem handle {}: {}", handle, err);
        }

        debug!(
            "alloc gem handle {} name {:?} size {} flags {:?} gem flags {:?}",
            handle,
            bo.name(),
            size,
            flags,
            gem_flags
        );

        Ok(bo)
    }

    /// Imports a BO by its global name.
    pub fn import(mgr: Arc<Bufmgr>, name: Name) -> Result<Self> {
        let (handle, size) = mgr.driver().gem_open(name).map_err(|source| {
            error!("failed to open name {}: {}", name, source);
            Error::Import { name, source }
        })?;

        let gem = GemObject { mgr, handle };
        let (_, gem_flags) = gem.mgr.driver().gem_info(handle).map_err(|source| {
            error!("failed to query gem handle {}: {}", handle, source);
            Error::Import { name, source }
        })?;

        let bo = Self::with_gem(gem, size, flags::from_gem(gem_flags), gem_flags);
        *guard(&bo.name) = Some(name);
        let count = bo.bufmgr().registry().acquire(name);

        debug!(
            "import name {} as gem handle {} size {} gem flags {:?} refcount {}",
            name, handle, size, gem_flags, count
        );

        Ok(bo)
    }

    fn with_gem(gem: GemObject, size: Size, flags: Flags, gem_flags: GemFlags) -> Self {
        let depth = gem.mgr.config().fence_queue_depth;

        Self {
            gem,
            size,
            flags,
            gem_flags,
            name: Mutex::new(None),
            dmabuf: OnceLock::new(),
            state: Mutex::new(MappingState {
                refcount: 0,
                pinned: false,
                mapping: None,
            }),
            fences: Mutex::new(FenceQueue::new(depth)),
            file_lock: Mutex::new(()),
        }
    }

    /// Returns the global name of the BO, assigning one if needed.
    pub fn export(&self) -> Result<Name> {
        let mut name = guard(&self.name);
        if let Some(name) = *name {
            return Ok(name);
        }

        let handle = self.gem.handle;
        let new_name = self
            .bufmgr()
            .driver()
            .gem_flink(handle)
            .map_err(|source| {
                error!("failed to flink gem handle {}: {}", handle, source);
                Error::Export { handle, source }
            })?;

        let count = self.bufmgr().registry().acquire(new_name);
        *name = Some(new_name);

        debug!(
            "export gem handle {} as name {} refcount {}",
            handle, new_name, count
        );

        Ok(new_name)
    }

    /// Returns the global name of the BO if it has one.
    pub fn name(&self) -> Option<Name> {
        *guard(&self.name)
    }

    /// Returns the size.
    pub fn size(&self) -> Size {
        self.size
    }

    /// Returns the flags.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Returns the kernel flags.
    pub fn gem_flags(&self) -> GemFlags {
        self.gem_flags
    }

    /// Returns the GEM handle.
    pub fn gem_handle(&self) -> u32 {
        self.gem.handle
    }

    /// Returns the buffer manager the BO belongs to.
    pub fn bufmgr(&self) -> &Arc<Bufmgr> {
        &self.gem.mgr
    }

    /// Returns the handle of the BO for a device class.
    ///
    /// A CPU handle maps the BO if it is not mapped.  The mapping then stays until the BO is
    /// freed, whatever `unmap` does.  A 3D or multimedia handle is a dma-buf fd owned by the BO.
    pub fn handle(&self, device: DeviceClass) -> Result<BoHandle<'_>> {
        let handle = match device {
            DeviceClass::Default | DeviceClass::G2d => BoHandle::Gem(self.gem.handle),
            DeviceClass::Cpu => {
                let mut state = guard(&self.state);
                let mapping = self.cpu_mapping(&mut state)?;
                state.pinned = true;
                BoHandle::Cpu(mapping)
            }
            DeviceClass::G3d | DeviceClass::Multimedia => BoHandle::DmaBuf(self.dma_buf(device)?),
        };

        Ok(handle)
    }

    /// Maps the BO for a device class and returns its handle.
    ///
    /// Mapping nests.  Each `map` must be paired with an `unmap`.
    pub fn map(&self, device: DeviceClass, _access: Access) -> Result<BoHandle<'_>> {
        let mut state = guard(&self.state);

        let handle = if device == DeviceClass::Cpu {
            BoHandle::Cpu(self.cpu_mapping(&mut state)?)
        } else {
            self.handle(device)?
        };
        state.refcount += 1;

        Ok(handle)
    }

    /// Undoes a `map`.  The CPU mapping is dropped by the last `unmap` unless `handle` handed it
    /// out.
    pub fn unmap(&self) -> Result<()> {
        let mut state = guard(&self.state);
        if state.refcount == 0 {
            return Err(Error::NotMapped);
        }

        state.refcount -= 1;
        if state.refcount == 0 && !state.pinned {
            if let Some(mapping) = state.mapping.take() {
                self.release_mapping(mapping);
            }
        }

        Ok(())
    }

    /// Returns the map nesting depth.
    pub fn map_count(&self) -> u32 {
        guard(&self.state).refcount
    }

    pub(crate) fn cpu_addr(&self) -> Option<u64> {
        guard(&self.state).mapping.map(|mapping| mapping.addr())
    }

    fn cpu_mapping(&self, state: &mut MappingState) -> Result<Mapping> {
        if let Some(mapping) = state.mapping {
            return Ok(mapping);
        }

        let handle = self.gem.handle;
        let mapping = self
            .bufmgr()
            .driver()
            .gem_mmap(handle, self.size)
            .map_err(|source| {
                error!("failed to map gem handle {}: {}", handle, source);
                Error::Map { handle, source }
            })?;
        state.mapping = Some(mapping);

        Ok(mapping)
    }

    fn release_mapping(&self, mapping: Mapping) {
        if let Err(err) = self.bufmgr().driver().gem_munmap(mapping) {
            warn!("failed to unmap gem handle {}: {}", self.gem.handle, err);
        }
    }

    fn dma_buf(&self, device: DeviceClass) -> Result<BorrowedFd<'_>> {
        if let Some(dmabuf) = self.dmabuf.get() {
            return Ok(dmabuf.as_fd());
        }

        let handle = self.gem.handle;
        let dmabuf = self
            .bufmgr()
            .driver()
            .prime_export(handle)
            .map_err(|source| {
                error!("failed to export gem handle {} as dma-buf: {}", handle, source);
                Error::HandleUnavailable {
                    device,
                    handle,
                    source,
                }
            })?;

        // a racing export may have won, in which case ours is closed
        Ok(self.dmabuf.get_or_init(|| dmabuf).as_fd())
    }

    /// Locks the BO for a device class.
    ///
    /// The 3D engine gets a kernel fence and the CPU gets an advisory file lock.  Locks queue up
    /// to `Config::fence_queue_depth` deep and are released oldest first by `unlock`.
    pub fn lock(&self, device: DeviceClass, access: Access) -> Result<()> {
        let mgr = self.bufmgr();
        if !mgr.config().dma_fence {
            return Err(Error::LockUnsupported);
        }

        let strategy = mgr.sync_strategy(device)?;

        let _serial = (device == DeviceClass::Cpu).then(|| guard(&self.file_lock));
        let held = {
            let mut fences = guard(&self.fences);
            fences.reserve().inspect_err(|_| {
                error!(
                    "fence queue of gem handle {} is full, cannot lock for {}",
                    self.gem.handle, device
                );
            })?;
            fences.file_lock_access()
        };

        let res = self
            .dma_buf(device)
            .and_then(|dmabuf| strategy.acquire(mgr.driver(), dmabuf, access, held));

        let mut fences = guard(&self.fences);
        match res {
            Ok(ticket) => {
                fences.commit(ticket);
                debug!(
                    "lock gem handle {} for {} {:?} depth {}",
                    self.gem.handle,
                    device,
                    access,
                    fences.len()
                );
                Ok(())
            }
            Err(err) => {
                fences.cancel();
                Err(err)
            }
        }
    }

    /// Releases the oldest lock.  A lock that fails to release stays the oldest.
    pub fn unlock(&self) -> Result<()> {
        let dmabuf = self.dmabuf.get().ok_or(Error::NotLocked)?;
        let mgr = self.bufmgr();

        loop {
            let is_file_lock = match guard(&self.fences).front() {
                Some(ticket) => matches!(ticket, Ticket::FileLock(_)),
                None => return Err(Error::NotLocked),
            };

            let _serial = is_file_lock.then(|| guard(&self.file_lock));
            let mut fences = guard(&self.fences);
            match fences.front() {
                None => return Err(Error::NotLocked),
                // raced with another unlock
                Some(Ticket::FileLock(_)) if !is_file_lock => continue,
                Some(_) => (),
            }
            let Some(ticket) = fences.pop() else {
                return Err(Error::NotLocked);
            };
            let held = fences.file_lock_access();
            drop(fences);

            let res = mgr
                .strategy_for(&ticket)
                .release(mgr.driver(), dmabuf.as_fd(), ticket, held);

            let mut fences = guard(&self.fences);
            match res {
                Ok(()) => {
                    fences.cancel();
                    debug!(
                        "unlock gem handle {} depth {}",
                        self.gem.handle,
                        fences.len()
                    );
                    return Ok(());
                }
                Err(err) => {
                    fences.requeue(ticket);
                    return Err(err);
                }
            }
        }
    }

    /// Returns the number of locks held.
    pub fn lock_depth(&self) -> usize {
        guard(&self.fences).len()
    }

    /// Performs cache maintenance on the BO.
    pub fn cache_flush(&self, flags: CacheFlags) -> Result<()> {
        self.bufmgr().cache_flush(Some(self), flags)
    }

    /// Frees the BO.
    pub fn free(self) {
        drop(self);
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        let mgr = &self.gem.mgr;
        let handle = self.gem.handle;

        let fences = self
            .fences
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if fences.len() > 0 {
            warn!("freeing gem handle {} with {} locks held", handle, fences.len());
        }
        if let Some(dmabuf) = self.dmabuf.get() {
            while let Some(ticket) = fences.pop() {
                let held = fences.file_lock_access();
                if let Err(err) = mgr
                    .strategy_for(&ticket)
                    .release(mgr.driver(), dmabuf.as_fd(), ticket, held)
                {
                    warn!("failed to release {:?} of gem handle {}: {}", ticket, handle, err);
                }
                fences.cancel();
            }
        }

        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(mapping) = state.mapping.take() {
            if let Err(err) = mgr.driver().gem_munmap(mapping) {
                warn!("failed to unmap gem handle {}: {}", handle, err);
            }
        }

        drop(self.dmabuf.take());

        let name = self
            .name
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(name) = name {
            if let Err(err) = mgr.registry().release(name) {
                warn!("{}", err);
            }
        }

        debug!("free gem handle {} name {:?}", handle, name);
    }
}
