// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! An in-process driver backed by memfds.

use super::CacheOp;
use crate::fence::{Fence, FenceAccess};
use crate::flags::GemFlags;
use crate::types::{Mapping, Name, Size};
use crate::utils;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A driver call that can be made to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Fail {
    Create,
    Flink,
    Open,
    Info,
    Mmap,
    PrimeExport,
    CacheOp,
    GetFence,
    PutFence,
}

struct Object {
    size: Size,
    flags: GemFlags,
    memfd: OwnedFd,
    name: Option<Name>,
}

struct State {
    objects: Vec<Object>,
    handles: HashMap<u32, usize>,
    names: HashMap<Name, usize>,
    next_handle: u32,
    next_name: Name,
    next_ctx: u64,
    fences: HashMap<u64, FenceAccess>,
    cache_ops: Vec<CacheOp>,
    mappings: usize,
    failures: HashSet<Fail>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            handles: HashMap::new(),
            names: HashMap::new(),
            next_handle: 1,
            next_name: 1,
            next_ctx: 1,
            fences: HashMap::new(),
            cache_ops: Vec::new(),
            mappings: 0,
            failures: HashSet::new(),
        }
    }
}

impl State {
    fn check(&self, fail: Fail) -> io::Result<()> {
        if self.failures.contains(&fail) {
            return Err(errno(libc::EIO));
        }
        Ok(())
    }

    fn object(&self, handle: u32) -> io::Result<&Object> {
        self.handles
            .get(&handle)
            .map(|&idx| &self.objects[idx])
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn new_handle(&mut self, idx: usize) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, idx);
        handle
    }
}

fn errno(err: libc::c_int) -> io::Error {
    io::Error::from_raw_os_error(err)
}

/// A fake driver.  Clones share the same kernel state, so a clone can be kept to inspect and
/// steer the driver owned by a buffer manager.
#[derive(Clone, Default)]
pub struct Driver {
    state: Arc<Mutex<State>>,
}

impl Driver {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fail(&self, fail: Fail, enabled: bool) {
        let mut state = self.state();
        if enabled {
            state.failures.insert(fail);
        } else {
            state.failures.remove(&fail);
        }
    }

    pub fn live_handles(&self) -> usize {
        self.state().handles.len()
    }

    pub fn live_mappings(&self) -> usize {
        self.state().mappings
    }

    pub fn outstanding_fences(&self) -> usize {
        self.state().fences.len()
    }

    pub fn cache_ops(&self) -> Vec<CacheOp> {
        self.state().cache_ops.clone()
    }

    /// Returns the flags a handle was created with.
    pub fn created_flags(&self, handle: u32) -> Option<GemFlags> {
        self.state().object(handle).ok().map(|obj| obj.flags)
    }
}

impl super::Driver for Driver {
    fn gem_create(&self, size: Size, flags: GemFlags) -> io::Result<u32> {
        let mut state = self.state();
        state.check(Fail::Create)?;

        let memfd = utils::memfd_create("fake-gem", size)?;
        state.objects.push(Object {
            size,
            flags,
            memfd,
            name: None,
        });
        let idx = state.objects.len() - 1;

        Ok(state.new_handle(idx))
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        self.state()
            .handles
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn gem_flink(&self, handle: u32) -> io::Result<Name> {
        let mut state = self.state();
        state.check(Fail::Flink)?;

        let idx = *state.handles.get(&handle).ok_or_else(|| errno(libc::ENOENT))?;
        if let Some(name) = state.objects[idx].name {
            return Ok(name);
        }

        let name = state.next_name;
        state.next_name += 1;
        state.objects[idx].name = Some(name);
        state.names.insert(name, idx);

        Ok(name)
    }

    fn gem_open(&self, name: Name) -> io::Result<(u32, Size)> {
        let mut state = self.state();
        state.check(Fail::Open)?;

        let idx = *state.names.get(&name).ok_or_else(|| errno(libc::ENOENT))?;
        let size = state.objects[idx].size;

        Ok((state.new_handle(idx), size))
    }

    fn gem_info(&self, handle: u32) -> io::Result<(Size, GemFlags)> {
        let state = self.state();
        state.check(Fail::Info)?;

        let obj = state.object(handle)?;
        Ok((obj.size, obj.flags))
    }

    fn gem_mmap(&self, handle: u32, size: Size) -> io::Result<Mapping> {
        let mut state = self.state();
        state.check(Fail::Mmap)?;

        let mapping = utils::mmap(&state.object(handle)?.memfd, size)?;
        state.mappings += 1;

        Ok(mapping)
    }

    fn gem_munmap(&self, mapping: Mapping) -> io::Result<()> {
        utils::munmap(mapping)?;
        self.state().mappings -= 1;

        Ok(())
    }

    fn prime_export(&self, handle: u32) -> io::Result<OwnedFd> {
        let state = self.state();
        state.check(Fail::PrimeExport)?;

        state.object(handle)?.memfd.try_clone()
    }

    fn cache_op(&self, op: CacheOp) -> io::Result<()> {
        let mut state = self.state();
        state.check(Fail::CacheOp)?;

        state.cache_ops.push(op);
        Ok(())
    }

    fn get_fence(&self, _dmabuf: BorrowedFd, access: FenceAccess) -> io::Result<u64> {
        let mut state = self.state();
        state.check(Fail::GetFence)?;

        let ctx = state.next_ctx;
        state.next_ctx += 1;
        state.fences.insert(ctx, access);

        Ok(ctx)
    }

    fn put_fence(&self, _dmabuf: BorrowedFd, fence: Fence) -> io::Result<()> {
        let mut state = self.state();
        state.check(Fail::PutFence)?;

        match state.fences.remove(&fence.ctx) {
            Some(access) if access == fence.access => Ok(()),
            _ => Err(errno(libc::EINVAL)),
        }
    }
}
