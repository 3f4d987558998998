// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

use super::types::{Access, Error, Mapping, Result};
use nix::{fcntl, sys};
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::time::{Duration, Instant};
use std::{fs, io, mem, thread};

#[cfg(any(test, feature = "drm"))]
use super::types::Size;
#[cfg(feature = "drm")]
use std::os::fd::{FromRawFd, OwnedFd};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

fn invalid_data() -> io::Error {
    io::Error::from(io::ErrorKind::InvalidData)
}

#[cfg(feature = "drm")]
pub fn open(path: impl AsRef<Path>) -> Result<OwnedFd> {
    let oflag = fcntl::OFlag::O_RDWR | fcntl::OFlag::O_CLOEXEC;
    let mode = sys::stat::Mode::empty();

    let raw_fd = fcntl::open(path.as_ref(), oflag, mode)?;

    // SAFETY: raw_fd is valid
    let owned_fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

    Ok(owned_fd)
}

/// Reads a boolean module parameter.  An unreadable parameter reads as false.
pub fn read_param(path: impl AsRef<Path>) -> bool {
    match fs::read(path.as_ref()) {
        Ok(data) => data.first() == Some(&b'1'),
        Err(_) => false,
    }
}

#[cfg(test)]
pub fn mmap(fd: impl AsFd, size: Size) -> io::Result<Mapping> {
    let prot = sys::mman::ProtFlags::PROT_READ | sys::mman::ProtFlags::PROT_WRITE;
    let flags = sys::mman::MapFlags::MAP_SHARED;

    let len = usize::try_from(size).map_err(|_| invalid_data())?;
    let len = std::num::NonZeroUsize::new(len).ok_or_else(invalid_data)?;
    let ptr =
        // SAFETY: clients assume the responsibility
        unsafe { sys::mman::mmap(None, len, prot, flags, fd, 0) }?;
    let mapping = Mapping { ptr, len };

    Ok(mapping)
}

pub fn munmap(mapping: Mapping) -> io::Result<()> {
    // SAFETY: ptr and len are from a kernel mapping
    unsafe { sys::mman::munmap(mapping.ptr, mapping.len.into()) }?;

    Ok(())
}

#[cfg(test)]
pub fn memfd_create(name: &str, size: Size) -> io::Result<std::os::fd::OwnedFd> {
    let create_flags = sys::memfd::MemFdCreateFlag::MFD_CLOEXEC;

    let c_name = std::ffi::CString::new(name).map_err(|_| invalid_data())?;
    let memfd = sys::memfd::memfd_create(&c_name, create_flags)?;

    let len = libc::off_t::try_from(size).map_err(|_| invalid_data())?;
    nix::unistd::ftruncate(&memfd, len)?;

    Ok(memfd)
}

fn whole_file_lock(l_type: libc::c_int) -> libc::flock {
    // SAFETY: flock is plain old data
    let mut lock: libc::flock = unsafe { mem::zeroed() };
    lock.l_type = l_type as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = 0;
    lock.l_len = 0;

    lock
}

/// Takes an advisory lock on the whole file.
///
/// A write lock is taken when `access` writes and a read lock otherwise.  Without a timeout, this
/// blocks until the lock is acquired.
pub fn lock_file(fd: impl AsFd, access: Access, timeout: Option<Duration>) -> Result<()> {
    let l_type = if access.writes() {
        libc::F_WRLCK
    } else {
        libc::F_RDLCK
    };
    let lock = whole_file_lock(l_type);
    let fd = fd.as_fd().as_raw_fd();

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    loop {
        let arg = if deadline.is_some() {
            fcntl::FcntlArg::F_SETLK(&lock)
        } else {
            fcntl::FcntlArg::F_SETLKW(&lock)
        };

        match fcntl::fcntl(fd, arg) {
            Ok(_) => return Ok(()),
            Err(err) => {
                if err == nix::Error::EINTR {
                    continue;
                }

                let busy = err == nix::Error::EAGAIN || err == nix::Error::EACCES;
                match deadline {
                    Some(deadline) if busy => {
                        if Instant::now() >= deadline {
                            return Err(Error::Timeout);
                        }
                        thread::sleep(LOCK_POLL_INTERVAL);
                    }
                    _ => return Err(Error::from(err)),
                }
            }
        }
    }
}

/// Releases an advisory lock taken by `lock_file`.
pub fn unlock_file(fd: impl AsFd) -> Result<()> {
    let lock = whole_file_lock(libc::F_UNLCK);
    let fd = fd.as_fd().as_raw_fd();

    fcntl::fcntl(fd, fcntl::FcntlArg::F_SETLK(&lock))?;

    Ok(())
}

/// Opens the file behind `fd` again, as a separate open file description.
#[cfg(test)]
pub fn reopen(fd: impl AsFd) -> io::Result<fs::File> {
    let path = format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd());
    fs::OpenOptions::new().read(true).write(true).open(path)
}

/// Takes or drops a whole-file lock owned by the open file description of `fd`.  Such a lock
/// conflicts with the locks of `lock_file`, even within one process.
#[cfg(test)]
pub fn ofd_lock(fd: impl AsFd, l_type: libc::c_int) -> Result<()> {
    let lock = whole_file_lock(l_type);
    let fd = fd.as_fd().as_raw_fd();

    fcntl::fcntl(fd, fcntl::FcntlArg::F_OFD_SETLK(&lock))?;

    Ok(())
}

/// Returns the type of the lock that keeps the open file description of `fd` from write-locking
/// the whole file, or `F_UNLCK`.
#[cfg(test)]
pub fn ofd_lock_type(fd: impl AsFd) -> Result<libc::c_int> {
    let mut lock = whole_file_lock(libc::F_WRLCK);
    let fd = fd.as_fd().as_raw_fd();

    fcntl::fcntl(fd, fcntl::FcntlArg::F_OFD_GETLK(&mut lock))?;

    Ok(libc::c_int::from(lock.l_type))
}

#[cfg(feature = "drm")]
fn retry<F>(mut f: F) -> io::Result<libc::c_int>
where
    F: FnMut() -> nix::Result<libc::c_int>,
{
    loop {
        match f() {
            Ok(ret) => return Ok(ret),
            Err(err) => {
                if err == nix::Error::EINTR || err == nix::Error::EAGAIN {
                    continue;
                }
                return Err(io::Error::from(err));
            }
        }
    }
}

// Based on
//
//   $ bindgen --no-doc-comments --no-layout-tests \
//       --allowlist-item 'drm_gem_.*' \
//       /usr/include/drm/drm.h
#[cfg(feature = "drm")]
mod drm_gem {
    #![allow(non_camel_case_types)]

    use super::*;

    #[repr(C)]
    struct drm_gem_close {
        handle: u32,
        pad: u32,
    }

    #[repr(C)]
    struct drm_gem_flink {
        handle: u32,
        name: u32,
    }

    #[repr(C)]
    struct drm_gem_open {
        name: u32,
        handle: u32,
        size: u64,
    }

    const DRM_IOCTL_BASE: u8 = b'd';

    nix::ioctl_write_ptr!(drm_ioctl_gem_close, DRM_IOCTL_BASE, 0x09, drm_gem_close);
    nix::ioctl_readwrite!(drm_ioctl_gem_flink, DRM_IOCTL_BASE, 0x0a, drm_gem_flink);
    nix::ioctl_readwrite!(drm_ioctl_gem_open, DRM_IOCTL_BASE, 0x0b, drm_gem_open);

    pub fn gem_close(fd: impl AsFd, handle: u32) -> io::Result<()> {
        let fd = fd.as_fd().as_raw_fd();
        let arg = drm_gem_close { handle, pad: 0 };

        // SAFETY: fd and arg are valid
        retry(|| unsafe { drm_ioctl_gem_close(fd, &arg) })?;

        Ok(())
    }

    pub fn gem_flink(fd: impl AsFd, handle: u32) -> io::Result<u32> {
        let fd = fd.as_fd().as_raw_fd();
        let mut arg = drm_gem_flink { handle, name: 0 };

        // SAFETY: fd and arg are valid
        retry(|| unsafe { drm_ioctl_gem_flink(fd, &mut arg) })?;

        Ok(arg.name)
    }

    pub fn gem_open(fd: impl AsFd, name: u32) -> io::Result<(u32, Size)> {
        let fd = fd.as_fd().as_raw_fd();
        let mut arg = drm_gem_open {
            name,
            handle: 0,
            size: 0,
        };

        // SAFETY: fd and arg are valid
        retry(|| unsafe { drm_ioctl_gem_open(fd, &mut arg) })?;

        Ok((arg.handle, arg.size))
    }
}

#[cfg(feature = "drm")]
pub use drm_gem::{gem_close, gem_flink, gem_open};

// Based on
//
//   $ bindgen --no-doc-comments --no-layout-tests \
//       --allowlist-item 'drm_exynos_gem_.*' \
//       exynos_drm.h
#[cfg(feature = "drm")]
mod exynos {
    #![allow(non_camel_case_types)]

    use super::*;
    use std::{ffi, num, ptr};

    #[repr(C)]
    struct drm_exynos_gem_create {
        size: u64,
        flags: u32,
        handle: u32,
    }

    #[repr(C)]
    struct drm_exynos_gem_mmap {
        handle: u32,
        pad: u32,
        size: u64,
        mapped: u64,
    }

    #[repr(C)]
    struct drm_exynos_gem_info {
        handle: u32,
        flags: u32,
        size: u64,
    }

    #[repr(C)]
    struct drm_exynos_gem_cache_op {
        usr_addr: u64,
        size: u32,
        flags: u32,
        gem_handle: u32,
    }

    const DRM_IOCTL_BASE: u8 = b'd';
    const DRM_COMMAND_BASE: u8 = 0x40;

    nix::ioctl_readwrite!(
        exynos_ioctl_gem_create,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + 0x00,
        drm_exynos_gem_create
    );
    nix::ioctl_readwrite!(
        exynos_ioctl_gem_mmap,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + 0x02,
        drm_exynos_gem_mmap
    );
    nix::ioctl_readwrite!(
        exynos_ioctl_gem_get,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + 0x04,
        drm_exynos_gem_info
    );
    nix::ioctl_readwrite!(
        exynos_ioctl_gem_cache_op,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + 0x12,
        drm_exynos_gem_cache_op
    );

    pub fn exynos_gem_create(fd: impl AsFd, size: Size, flags: u32) -> io::Result<u32> {
        let fd = fd.as_fd().as_raw_fd();
        let mut arg = drm_exynos_gem_create {
            size,
            flags,
            handle: 0,
        };

        // SAFETY: fd and arg are valid
        retry(|| unsafe { exynos_ioctl_gem_create(fd, &mut arg) })?;

        Ok(arg.handle)
    }

    pub fn exynos_gem_mmap(fd: impl AsFd, handle: u32, size: Size) -> io::Result<Mapping> {
        let fd = fd.as_fd().as_raw_fd();
        let mut arg = drm_exynos_gem_mmap {
            handle,
            pad: 0,
            size,
            mapped: 0,
        };

        let len = usize::try_from(size).map_err(|_| invalid_data())?;
        let len = num::NonZeroUsize::new(len).ok_or_else(invalid_data)?;

        // SAFETY: fd and arg are valid
        retry(|| unsafe { exynos_ioctl_gem_mmap(fd, &mut arg) })?;

        let ptr = ptr::NonNull::new(arg.mapped as usize as *mut ffi::c_void)
            .ok_or_else(invalid_data)?;

        Ok(Mapping { ptr, len })
    }

    pub fn exynos_gem_info(fd: impl AsFd, handle: u32) -> io::Result<(Size, u32)> {
        let fd = fd.as_fd().as_raw_fd();
        let mut arg = drm_exynos_gem_info {
            handle,
            flags: 0,
            size: 0,
        };

        // SAFETY: fd and arg are valid
        retry(|| unsafe { exynos_ioctl_gem_get(fd, &mut arg) })?;

        Ok((arg.size, arg.flags))
    }

    pub fn exynos_gem_cache_op(
        fd: impl AsFd,
        addr: u64,
        size: Size,
        flags: u32,
        handle: u32,
    ) -> io::Result<()> {
        let fd = fd.as_fd().as_raw_fd();
        let mut arg = drm_exynos_gem_cache_op {
            usr_addr: addr,
            size: u32::try_from(size).map_err(|_| invalid_data())?,
            flags,
            gem_handle: handle,
        };

        // SAFETY: fd and arg are valid
        retry(|| unsafe { exynos_ioctl_gem_cache_op(fd, &mut arg) })?;

        Ok(())
    }
}

#[cfg(feature = "drm")]
pub use exynos::{exynos_gem_cache_op, exynos_gem_create, exynos_gem_info, exynos_gem_mmap};

// Based on the dmabuf-sync extension of linux/dma-buf.h shipped with the vendor kernel
#[cfg(feature = "drm")]
mod dma_buf_sync {
    #![allow(non_camel_case_types)]

    use super::*;

    #[repr(C)]
    struct dma_buf_fence {
        ctx: libc::c_ulong,
        ty: u32,
    }

    const DMABUF_IOCTL_BASE: u8 = b'F';

    nix::ioctl_readwrite!(dma_buf_ioctl_get_fence, DMABUF_IOCTL_BASE, 0x01, dma_buf_fence);
    nix::ioctl_readwrite!(dma_buf_ioctl_put_fence, DMABUF_IOCTL_BASE, 0x02, dma_buf_fence);

    pub fn dma_buf_get_fence(dmabuf: impl AsFd, ty: u32) -> io::Result<u64> {
        let dmabuf = dmabuf.as_fd().as_raw_fd();
        let mut arg = dma_buf_fence { ctx: 0, ty };

        // SAFETY: dmabuf and arg are valid
        retry(|| unsafe { dma_buf_ioctl_get_fence(dmabuf, &mut arg) })?;

        Ok(u64::from(arg.ctx))
    }

    pub fn dma_buf_put_fence(dmabuf: impl AsFd, ctx: u64, ty: u32) -> io::Result<()> {
        let dmabuf = dmabuf.as_fd().as_raw_fd();
        let ctx = libc::c_ulong::try_from(ctx).map_err(|_| invalid_data())?;
        let mut arg = dma_buf_fence { ctx, ty };

        // SAFETY: dmabuf and arg are valid
        retry(|| unsafe { dma_buf_ioctl_put_fence(dmabuf, &mut arg) })?;

        Ok(())
    }
}

#[cfg(feature = "drm")]
pub use dma_buf_sync::{dma_buf_get_fence, dma_buf_put_fence};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_param() {
        let dir = std::env::temp_dir();

        let enabled = dir.join(format!("tbm-gem-param-on-{}", std::process::id()));
        fs::write(&enabled, b"1\n").unwrap();
        assert!(read_param(&enabled));

        let disabled = dir.join(format!("tbm-gem-param-off-{}", std::process::id()));
        fs::write(&disabled, b"0\n").unwrap();
        assert!(!read_param(&disabled));

        assert!(!read_param(dir.join("tbm-gem-param-missing")));

        let _ = fs::remove_file(enabled);
        let _ = fs::remove_file(disabled);
    }

    #[test]
    fn test_mmap() {
        let memfd = memfd_create("test", 8192).unwrap();
        let mapping = mmap(&memfd, 8192).unwrap();
        assert_eq!(mapping.len.get(), 8192);
        assert!(mapping.addr() != 0);
        munmap(mapping).unwrap();

        assert!(mmap(&memfd, 0).is_err());
    }

    #[test]
    fn test_lock_file() {
        let memfd = memfd_create("test", 4096).unwrap();

        lock_file(&memfd, Access::Write, None).unwrap();
        unlock_file(&memfd).unwrap();

        lock_file(&memfd, Access::Read, Some(Duration::from_millis(10))).unwrap();
        // locks of the same process never conflict
        lock_file(&memfd, Access::ReadWrite, Some(Duration::from_millis(10))).unwrap();
        unlock_file(&memfd).unwrap();
    }

    #[test]
    fn test_lock_file_contended() {
        let memfd = memfd_create("test", 4096).unwrap();
        let other = reopen(&memfd).unwrap();

        ofd_lock(&other, libc::F_RDLCK).unwrap();
        lock_file(&memfd, Access::Read, Some(Duration::from_millis(10))).unwrap();
        assert!(matches!(
            lock_file(&memfd, Access::Write, Some(Duration::from_millis(20))),
            Err(Error::Timeout)
        ));
        // a failed upgrade keeps the read lock
        assert_eq!(ofd_lock_type(&other).unwrap(), libc::F_RDLCK);
        unlock_file(&memfd).unwrap();
        assert_eq!(ofd_lock_type(&other).unwrap(), libc::F_UNLCK);

        ofd_lock(&other, libc::F_WRLCK).unwrap();
        assert!(matches!(
            lock_file(&memfd, Access::Read, Some(Duration::from_millis(20))),
            Err(Error::Timeout)
        ));

        ofd_lock(&other, libc::F_UNLCK).unwrap();
        lock_file(&memfd, Access::Write, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(ofd_lock_type(&other).unwrap(), libc::F_WRLCK);
        // downgrades in place
        lock_file(&memfd, Access::Read, None).unwrap();
        assert_eq!(ofd_lock_type(&other).unwrap(), libc::F_RDLCK);
        unlock_file(&memfd).unwrap();
        assert_eq!(ofd_lock_type(&other).unwrap(), libc::F_UNLCK);
    }
}
