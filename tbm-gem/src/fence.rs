// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Access synchronization.
//!
//! A lock on a BO is either a kernel fence on its dma-buf or an advisory file lock on its
//! dma-buf fd.  Each BO keeps its locks in a bounded FIFO, and an unlock always releases the
//! oldest one.

use super::drivers::Driver;
use super::types::{Access, Error, Result};
use super::utils;
use log::{debug, error};
use std::collections::VecDeque;
use std::os::fd::BorrowedFd;
use std::time::Duration;

bitflags::bitflags! {
    /// Fence access type bits.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct FenceAccess: u32 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access.
        const WRITE = 1 << 1;
        /// Device access.
        const DMA = 1 << 2;
    }
}

impl FenceAccess {
    fn for_device(access: Access) -> Self {
        let rw = if access.writes() {
            Self::WRITE
        } else {
            Self::READ
        };
        rw | Self::DMA
    }
}

/// A kernel fence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fence {
    /// The kernel context of the fence.
    pub ctx: u64,
    /// The access type the fence was requested with.
    pub access: FenceAccess,
}

/// An acquired lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Ticket {
    Fence(Fence),
    FileLock(Access),
}

pub(crate) struct FenceQueue {
    tickets: VecDeque<Ticket>,
    reserved: usize,
    capacity: usize,
}

impl FenceQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tickets: VecDeque::with_capacity(capacity),
            reserved: 0,
            capacity,
        }
    }

    /// Reserves a slot for a lock that is being acquired.
    pub fn reserve(&mut self) -> Result<()> {
        if self.tickets.len() + self.reserved >= self.capacity {
            return Err(Error::FenceQueueFull);
        }
        self.reserved += 1;

        Ok(())
    }

    /// Fills a reserved slot.
    pub fn commit(&mut self, ticket: Ticket) {
        self.reserved -= 1;
        self.tickets.push_back(ticket);
    }

    /// Gives back a reserved slot.
    pub fn cancel(&mut self) {
        self.reserved -= 1;
    }

    /// Takes the oldest ticket.  Its slot stays reserved until `cancel` or `requeue`.
    pub fn pop(&mut self) -> Option<Ticket> {
        let ticket = self.tickets.pop_front()?;
        self.reserved += 1;

        Some(ticket)
    }

    /// Puts a popped ticket back in front.
    pub fn requeue(&mut self, ticket: Ticket) {
        self.reserved -= 1;
        self.tickets.push_front(ticket);
    }

    pub fn front(&self) -> Option<&Ticket> {
        self.tickets.front()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    /// Returns the access covering all queued file locks.
    pub fn file_lock_access(&self) -> Option<Access> {
        self.tickets
            .iter()
            .filter_map(|ticket| match ticket {
                Ticket::FileLock(access) => Some(*access),
                Ticket::Fence(_) => None,
            })
            .reduce(Access::union)
    }
}

/// A way to synchronize access to a dma-buf.
///
/// `held` is the access covering the file locks the BO keeps besides the one being acquired or
/// released.  File locks belong to the process, so a BO has at most one on its dma-buf.
pub(crate) trait SyncStrategy: Send + Sync {
    fn acquire(
        &self,
        driver: &dyn Driver,
        dmabuf: BorrowedFd,
        access: Access,
        held: Option<Access>,
    ) -> Result<Ticket>;

    fn release(
        &self,
        driver: &dyn Driver,
        dmabuf: BorrowedFd,
        ticket: Ticket,
        held: Option<Access>,
    ) -> Result<()>;
}

/// Kernel dma-buf fences, used by the 3D engine.
pub(crate) struct KernelFence;

impl SyncStrategy for KernelFence {
    fn acquire(
        &self,
        driver: &dyn Driver,
        dmabuf: BorrowedFd,
        access: Access,
        _held: Option<Access>,
    ) -> Result<Ticket> {
        let access = FenceAccess::for_device(access);
        let ctx = driver.get_fence(dmabuf, access).map_err(|err| {
            error!("failed to get a {:?} fence: {}", access, err);
            Error::from(err)
        })?;

        debug!("got fence ctx {:#x} type {:?}", ctx, access);

        Ok(Ticket::Fence(Fence { ctx, access }))
    }

    fn release(
        &self,
        driver: &dyn Driver,
        dmabuf: BorrowedFd,
        ticket: Ticket,
        _held: Option<Access>,
    ) -> Result<()> {
        let Ticket::Fence(fence) = ticket else {
            return Error::user();
        };

        driver.put_fence(dmabuf, fence).map_err(|err| {
            error!("failed to put fence ctx {:#x}: {}", fence.ctx, err);
            Error::from(err)
        })?;

        debug!("put fence ctx {:#x} type {:?}", fence.ctx, fence.access);

        Ok(())
    }
}

/// Advisory file locks, used by the CPU.
pub(crate) struct FileLock {
    timeout: Option<Duration>,
}

impl FileLock {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl SyncStrategy for FileLock {
    fn acquire(
        &self,
        _driver: &dyn Driver,
        dmabuf: BorrowedFd,
        access: Access,
        held: Option<Access>,
    ) -> Result<Ticket> {
        // never downgrade a lock that is still held
        let want = held.map_or(access, |held| held.union(access));
        utils::lock_file(dmabuf, want, self.timeout).inspect_err(|err| {
            error!("failed to lock dma-buf for {:?}: {}", want, err);
        })?;

        debug!("locked dma-buf for {:?}", want);

        Ok(Ticket::FileLock(access))
    }

    fn release(
        &self,
        _driver: &dyn Driver,
        dmabuf: BorrowedFd,
        ticket: Ticket,
        held: Option<Access>,
    ) -> Result<()> {
        let Ticket::FileLock(access) = ticket else {
            return Error::user();
        };

        match held {
            // a downgrade or a no-op, neither of which blocks
            Some(held) => utils::lock_file(dmabuf, held, None),
            None => utils::unlock_file(dmabuf),
        }
        .inspect_err(|err| {
            error!("failed to unlock dma-buf held for {:?}: {}", access, err);
        })?;

        debug!("unlocked dma-buf held for {:?}, still held {:?}", access, held);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::fake;
    use crate::drivers::Driver as _;
    use crate::flags::GemFlags;
    use std::os::fd::AsFd;

    #[test]
    fn test_fence_access() {
        assert_eq!(
            FenceAccess::for_device(Access::Write),
            FenceAccess::WRITE | FenceAccess::DMA
        );
        assert_eq!(
            FenceAccess::for_device(Access::ReadWrite).bits(),
            0x6
        );
        assert_eq!(
            FenceAccess::for_device(Access::Read),
            FenceAccess::READ | FenceAccess::DMA
        );
    }

    #[test]
    fn test_queue() {
        let mut queue = FenceQueue::new(2);

        queue.reserve().unwrap();
        queue.reserve().unwrap();
        assert!(matches!(queue.reserve(), Err(Error::FenceQueueFull)));

        queue.cancel();
        queue.commit(Ticket::FileLock(Access::Read));
        assert_eq!(queue.len(), 1);

        queue.reserve().unwrap();
        queue.commit(Ticket::FileLock(Access::Write));
        assert!(matches!(queue.reserve(), Err(Error::FenceQueueFull)));

        // a popped ticket keeps its slot until it is released
        let ticket = queue.pop().unwrap();
        assert_eq!(ticket, Ticket::FileLock(Access::Read));
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.reserve(), Err(Error::FenceQueueFull)));

        queue.requeue(ticket);
        assert_eq!(queue.front(), Some(&Ticket::FileLock(Access::Read)));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(Ticket::FileLock(Access::Read)));
        queue.cancel();
        assert_eq!(queue.pop(), Some(Ticket::FileLock(Access::Write)));
        queue.cancel();
        assert_eq!(queue.pop(), None);
        queue.reserve().unwrap();
        queue.reserve().unwrap();
    }

    #[test]
    fn test_file_lock_access() {
        let mut queue = FenceQueue::new(4);
        assert_eq!(queue.file_lock_access(), None);

        let fence = Ticket::Fence(Fence {
            ctx: 1,
            access: FenceAccess::WRITE | FenceAccess::DMA,
        });
        for ticket in [
            fence,
            Ticket::FileLock(Access::Read),
            Ticket::FileLock(Access::Write),
        ] {
            queue.reserve().unwrap();
            queue.commit(ticket);
        }
        assert_eq!(queue.file_lock_access(), Some(Access::ReadWrite));

        queue.pop();
        queue.cancel();
        queue.pop();
        queue.cancel();
        assert_eq!(queue.file_lock_access(), Some(Access::Write));
    }

    #[test]
    fn test_kernel_fence() {
        let driver = fake::Driver::default();
        let handle = driver.gem_create(4096, GemFlags::empty()).unwrap();
        let dmabuf = driver.prime_export(handle).unwrap();

        let ticket = KernelFence
            .acquire(&driver, dmabuf.as_fd(), Access::Write, None)
            .unwrap();
        assert!(matches!(
            ticket,
            Ticket::Fence(Fence { access, .. }) if access == FenceAccess::WRITE | FenceAccess::DMA
        ));
        assert_eq!(driver.outstanding_fences(), 1);

        KernelFence
            .release(&driver, dmabuf.as_fd(), ticket, None)
            .unwrap();
        assert_eq!(driver.outstanding_fences(), 0);

        assert!(KernelFence
            .release(&driver, dmabuf.as_fd(), Ticket::FileLock(Access::Read), None)
            .is_err());
    }

    #[test]
    fn test_file_lock() {
        let driver = fake::Driver::default();
        let handle = driver.gem_create(4096, GemFlags::empty()).unwrap();
        let dmabuf = driver.prime_export(handle).unwrap();
        let other = utils::reopen(&dmabuf).unwrap();

        let lock = FileLock::new(Some(Duration::from_millis(10)));
        let write = lock
            .acquire(&driver, dmabuf.as_fd(), Access::Write, None)
            .unwrap();
        assert_eq!(write, Ticket::FileLock(Access::Write));

        // a read lock on top keeps the write lock
        let read = lock
            .acquire(&driver, dmabuf.as_fd(), Access::Read, Some(Access::Write))
            .unwrap();
        assert_eq!(read, Ticket::FileLock(Access::Read));
        assert_eq!(utils::ofd_lock_type(&other).unwrap(), libc::F_WRLCK);

        // releasing the write lock downgrades to the remaining read lock
        lock.release(&driver, dmabuf.as_fd(), write, Some(Access::Read)).unwrap();
        assert_eq!(utils::ofd_lock_type(&other).unwrap(), libc::F_RDLCK);

        lock.release(&driver, dmabuf.as_fd(), read, None).unwrap();
        assert_eq!(utils::ofd_lock_type(&other).unwrap(), libc::F_UNLCK);

        let fence = Ticket::Fence(Fence {
            ctx: 1,
            access: FenceAccess::READ,
        });
        assert!(lock.release(&driver, dmabuf.as_fd(), fence, None).is_err());
    }
}
