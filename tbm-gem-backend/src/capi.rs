// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The C API.
//!
//! All functions treat NULL pointers and out-of-range enums as caller bugs.  They are logged and
//! reported as `TBM_GEM_ERROR_INVALID_PARAM`, NULL, or 0.

#![allow(non_camel_case_types)]

use log::error;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::{ffi, ptr};
use tbm_gem::{Access, BoHandle, CacheFlags, DeviceClass, Error, Flags};

pub const TBM_GEM_SUCCESS: i32 = 0;
pub const TBM_GEM_ERROR_INVALID_PARAM: i32 = -1;
pub const TBM_GEM_ERROR_UNSUPPORTED: i32 = -2;
pub const TBM_GEM_ERROR_DEVICE: i32 = -3;
pub const TBM_GEM_ERROR_PROTOCOL: i32 = -4;
pub const TBM_GEM_ERROR_BUSY: i32 = -5;

pub const TBM_GEM_BO_SCANOUT: u32 = 1 << 0;
pub const TBM_GEM_BO_NONCACHABLE: u32 = 1 << 1;
pub const TBM_GEM_BO_WC: u32 = 1 << 2;

pub const TBM_GEM_DEVICE_DEFAULT: i32 = 0;
pub const TBM_GEM_DEVICE_CPU: i32 = 1;
pub const TBM_GEM_DEVICE_2D: i32 = 2;
pub const TBM_GEM_DEVICE_3D: i32 = 3;
pub const TBM_GEM_DEVICE_MM: i32 = 4;

pub const TBM_GEM_OPTION_READ: u32 = 1 << 0;
pub const TBM_GEM_OPTION_WRITE: u32 = 1 << 1;

pub const TBM_GEM_CACHE_INV: u32 = 0x01;
pub const TBM_GEM_CACHE_CLN: u32 = 0x02;
pub const TBM_GEM_CACHE_ALL: u32 = 0x10;
pub const TBM_GEM_CACHE_FLUSH: u32 = TBM_GEM_CACHE_INV | TBM_GEM_CACHE_CLN;
pub const TBM_GEM_CACHE_FLUSH_ALL: u32 = TBM_GEM_CACHE_FLUSH | TBM_GEM_CACHE_ALL;

pub const TBM_GEM_CACHE_CTRL_BACKEND: u32 = 1 << 0;
pub const TBM_GEM_LOCK_CTRL_BACKEND: u32 = 1 << 1;

pub const TBM_GEM_LOG_OFF: i32 = 0;
pub const TBM_GEM_LOG_ERROR: i32 = 1;
pub const TBM_GEM_LOG_WARN: i32 = 2;
pub const TBM_GEM_LOG_INFO: i32 = 3;
pub const TBM_GEM_LOG_DEBUG: i32 = 4;

pub type tbm_gem_log_callback =
    Option<unsafe extern "C" fn(lv: i32, msg: *const ffi::c_char, cb_data: *mut ffi::c_void)>;

#[repr(C)]
pub struct tbm_gem_bufmgr {
    _data: [u8; 0],
}

impl tbm_gem_bufmgr {
    fn from(mgr: Arc<tbm_gem::Bufmgr>) -> *mut tbm_gem_bufmgr {
        let mgr = Box::new(mgr);
        Box::into_raw(mgr) as *mut tbm_gem_bufmgr
    }

    fn into(mgr: *mut Self) -> Option<Box<Arc<tbm_gem::Bufmgr>>> {
        if mgr.is_null() {
            return None;
        }

        // SAFETY: mgr was created by Self::from
        Some(unsafe { Box::from_raw(mgr as *mut Arc<tbm_gem::Bufmgr>) })
    }

    fn as_ref<'a>(mgr: *mut Self) -> Option<&'a Arc<tbm_gem::Bufmgr>> {
        // SAFETY: mgr is NULL or was created by Self::from
        unsafe { (mgr as *const Arc<tbm_gem::Bufmgr>).as_ref() }
    }
}

#[repr(C)]
pub struct tbm_gem_bo {
    _data: [u8; 0],
}

impl tbm_gem_bo {
    fn from(bo: tbm_gem::Bo) -> *mut tbm_gem_bo {
        let bo = Box::new(bo);
        Box::into_raw(bo) as *mut tbm_gem_bo
    }

    fn into(bo: *mut Self) -> Option<Box<tbm_gem::Bo>> {
        if bo.is_null() {
            return None;
        }

        // SAFETY: bo was created by Self::from
        Some(unsafe { Box::from_raw(bo as *mut tbm_gem::Bo) })
    }

    fn as_ref<'a>(bo: *mut Self) -> Option<&'a tbm_gem::Bo> {
        // SAFETY: bo is NULL or was created by Self::from
        unsafe { (bo as *const tbm_gem::Bo).as_ref() }
    }
}

/// A BO handle.  `ptr` is valid for CPU handles, `u32` for GEM handles and `s32` for dma-buf fds.
#[derive(Clone, Copy)]
#[repr(C)]
pub union tbm_gem_bo_handle {
    pub ptr: *mut ffi::c_void,
    pub s32: i32,
    pub u32: u32,
    pub s64: i64,
    pub u64: u64,
}

impl tbm_gem_bo_handle {
    fn from(handle: BoHandle) -> Self {
        match handle {
            BoHandle::Cpu(mapping) => Self {
                ptr: mapping.ptr.as_ptr(),
            },
            _ => Self {
                u64: handle.as_u64(),
            },
        }
    }

    fn write(handle: BoHandle, out_handle: *mut Self) {
        // SAFETY: out_handle is non-NULL
        unsafe { out_handle.write(Self::from(handle)) };
    }
}

/// The backend function table registered with the host core.
#[repr(C)]
pub struct tbm_gem_backend {
    pub flags: u32,
    pub bufmgr_deinit: Option<unsafe extern "C" fn(mgr: *mut tbm_gem_bufmgr)>,
    pub bufmgr_cache_flush: Option<unsafe extern "C" fn(mgr: *mut tbm_gem_bufmgr, flags: u32) -> i32>,
    pub bo_alloc:
        Option<unsafe extern "C" fn(mgr: *mut tbm_gem_bufmgr, size: u64, flags: u32) -> *mut tbm_gem_bo>,
    pub bo_free: Option<unsafe extern "C" fn(bo: *mut tbm_gem_bo)>,
    pub bo_import: Option<unsafe extern "C" fn(mgr: *mut tbm_gem_bufmgr, key: u32) -> *mut tbm_gem_bo>,
    pub bo_export: Option<unsafe extern "C" fn(bo: *mut tbm_gem_bo) -> u32>,
    pub bo_size: Option<unsafe extern "C" fn(bo: *mut tbm_gem_bo) -> u64>,
    pub bo_get_handle: Option<
        unsafe extern "C" fn(bo: *mut tbm_gem_bo, device: i32, out_handle: *mut tbm_gem_bo_handle) -> i32,
    >,
    pub bo_map: Option<
        unsafe extern "C" fn(
            bo: *mut tbm_gem_bo,
            device: i32,
            opt: u32,
            out_handle: *mut tbm_gem_bo_handle,
        ) -> i32,
    >,
    pub bo_unmap: Option<unsafe extern "C" fn(bo: *mut tbm_gem_bo) -> i32>,
    pub bo_lock: Option<unsafe extern "C" fn(bo: *mut tbm_gem_bo, device: i32, opt: u32) -> i32>,
    pub bo_unlock: Option<unsafe extern "C" fn(bo: *mut tbm_gem_bo) -> i32>,
    pub bo_cache_flush: Option<unsafe extern "C" fn(bo: *mut tbm_gem_bo, flags: u32) -> i32>,
    pub bo_get_global_key: Option<unsafe extern "C" fn(bo: *mut tbm_gem_bo) -> u32>,
}

fn status(err: &Error) -> i32 {
    match err {
        Error::User => TBM_GEM_ERROR_INVALID_PARAM,
        Error::Unsupported | Error::UnsupportedDevice(_) | Error::LockUnsupported => {
            TBM_GEM_ERROR_UNSUPPORTED
        }
        Error::NotLocked | Error::NotMapped => TBM_GEM_ERROR_PROTOCOL,
        Error::FenceQueueFull | Error::Timeout => TBM_GEM_ERROR_BUSY,
        _ => TBM_GEM_ERROR_DEVICE,
    }
}

fn to_status(res: Result<(), Error>) -> i32 {
    match res {
        Ok(()) => TBM_GEM_SUCCESS,
        Err(err) => status(&err),
    }
}

fn invalid_param(what: &str) -> i32 {
    error!("invalid {}", what);
    TBM_GEM_ERROR_INVALID_PARAM
}

fn device_from(device: i32) -> Option<DeviceClass> {
    DeviceClass::try_from(device).ok()
}

fn flags_from(flags: u32) -> Flags {
    Flags::from_bits_truncate(flags)
}

fn cache_flags_from(flags: u32) -> Option<CacheFlags> {
    let flags = CacheFlags::from_bits_truncate(flags);
    if flags.intersects(CacheFlags::FLUSH) {
        Some(flags)
    } else {
        None
    }
}

// unknown levels log errors only
fn level_filter(lv: i32) -> log::LevelFilter {
    match lv {
        TBM_GEM_LOG_OFF => log::LevelFilter::Off,
        TBM_GEM_LOG_ERROR => log::LevelFilter::Error,
        TBM_GEM_LOG_WARN => log::LevelFilter::Warn,
        TBM_GEM_LOG_INFO => log::LevelFilter::Info,
        TBM_GEM_LOG_DEBUG => log::LevelFilter::Debug,
        _ => log::LevelFilter::Error,
    }
}

/// # Safety
///
/// `log_cb` must be safe to call from any thread with `cb_data` until the next call.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_log_init(
    max_lv: i32,
    log_cb: tbm_gem_log_callback,
    cb_data: *mut ffi::c_void,
) {
    let filter = level_filter(max_lv);

    let log_cb = match log_cb {
        Some(log_cb) if filter != log::LevelFilter::Off => log_cb,
        _ => {
            super::log::init(log::LevelFilter::Off, Box::new(|_| {}));
            return;
        }
    };

    let cb_data = cb_data as usize;
    let cb = move |rec: &log::Record| {
        let lv = match rec.level() {
            log::Level::Error => TBM_GEM_LOG_ERROR,
            log::Level::Warn => TBM_GEM_LOG_WARN,
            log::Level::Info => TBM_GEM_LOG_INFO,
            log::Level::Debug => TBM_GEM_LOG_DEBUG,
            log::Level::Trace => TBM_GEM_LOG_DEBUG,
        };
        let msg = format!("{}", rec.args());
        if let Ok(c_msg) = ffi::CString::new(msg) {
            // SAFETY: we trust the client
            unsafe { log_cb(lv, c_msg.as_ptr(), cb_data as *mut ffi::c_void) };
        }
    };

    super::log::init(filter, Box::new(cb));
}

/// Creates a buffer manager for an opened DRM device node.
///
/// `fd` is duplicated and the caller keeps ownership of it.  When `out_table` is non-NULL, it is
/// filled with the backend function table.  `bo_lock` and `bo_unlock` are NULL when the kernel
/// does not support dma-buf fencing.
///
/// # Safety
///
/// `fd` must be an open fd.  `out_table` must be NULL or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bufmgr_init(
    fd: i32,
    out_table: *mut tbm_gem_backend,
) -> *mut tbm_gem_bufmgr {
    if fd < 0 {
        invalid_param("fd");
        return ptr::null_mut();
    }

    // SAFETY: fd is open by contract
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let fd = match fd.try_clone_to_owned() {
        Ok(fd) => fd,
        Err(err) => {
            error!("failed to dup drm fd: {}", err);
            return ptr::null_mut();
        }
    };

    let mgr = match tbm_gem::Builder::new().node_fd(fd).build() {
        Ok(mgr) => mgr,
        Err(err) => {
            error!("failed to create bufmgr: {}", err);
            return ptr::null_mut();
        }
    };

    if !out_table.is_null() {
        let fenced = mgr.config().dma_fence;
        let table = tbm_gem_backend {
            flags: mgr.backend_flags().bits(),
            bufmgr_deinit: Some(tbm_gem_bufmgr_deinit),
            bufmgr_cache_flush: Some(tbm_gem_bufmgr_cache_flush),
            bo_alloc: Some(tbm_gem_bo_alloc),
            bo_free: Some(tbm_gem_bo_free),
            bo_import: Some(tbm_gem_bo_import),
            bo_export: Some(tbm_gem_bo_export),
            bo_size: Some(tbm_gem_bo_size),
            bo_get_handle: Some(tbm_gem_bo_get_handle),
            bo_map: Some(tbm_gem_bo_map),
            bo_unmap: Some(tbm_gem_bo_unmap),
            bo_lock: if fenced { Some(tbm_gem_bo_lock) } else { None },
            bo_unlock: if fenced { Some(tbm_gem_bo_unlock) } else { None },
            bo_cache_flush: Some(tbm_gem_bo_cache_flush),
            bo_get_global_key: Some(tbm_gem_bo_get_global_key),
        };

        // SAFETY: out_table is non-NULL and valid for writes by contract
        unsafe { out_table.write(table) };
    }

    tbm_gem_bufmgr::from(mgr)
}

/// Destroys a buffer manager.  Live BOs keep the underlying device open until they are freed.
///
/// # Safety
///
/// `mgr` must be NULL or from `tbm_gem_bufmgr_init`, and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bufmgr_deinit(mgr: *mut tbm_gem_bufmgr) {
    if tbm_gem_bufmgr::into(mgr).is_none() {
        invalid_param("bufmgr");
    }
}

/// # Safety
///
/// `mgr` must be NULL or from `tbm_gem_bufmgr_init`.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bufmgr_flags(mgr: *mut tbm_gem_bufmgr) -> u32 {
    match tbm_gem_bufmgr::as_ref(mgr) {
        Some(mgr) => mgr.backend_flags().bits(),
        None => {
            invalid_param("bufmgr");
            0
        }
    }
}

/// Flushes all caches.
///
/// # Safety
///
/// `mgr` must be NULL or from `tbm_gem_bufmgr_init`.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bufmgr_cache_flush(mgr: *mut tbm_gem_bufmgr, flags: u32) -> i32 {
    let Some(mgr) = tbm_gem_bufmgr::as_ref(mgr) else {
        return invalid_param("bufmgr");
    };
    let Some(flags) = cache_flags_from(flags) else {
        return invalid_param("cache flags");
    };

    to_status(mgr.cache_flush(None, flags))
}

/// # Safety
///
/// `mgr` must be NULL or from `tbm_gem_bufmgr_init`.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_alloc(
    mgr: *mut tbm_gem_bufmgr,
    size: u64,
    flags: u32,
) -> *mut tbm_gem_bo {
    let Some(mgr) = tbm_gem_bufmgr::as_ref(mgr) else {
        invalid_param("bufmgr");
        return ptr::null_mut();
    };

    match tbm_gem::Bo::alloc(mgr.clone(), size, flags_from(flags)) {
        Ok(bo) => tbm_gem_bo::from(bo),
        Err(_) => ptr::null_mut(),
    }
}

/// # Safety
///
/// `bo` must be NULL or from `tbm_gem_bo_alloc` or `tbm_gem_bo_import`, and must not be used
/// afterwards.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_free(bo: *mut tbm_gem_bo) {
    match tbm_gem_bo::into(bo) {
        Some(bo) => bo.free(),
        None => {
            invalid_param("bo");
        }
    }
}

/// # Safety
///
/// `mgr` must be NULL or from `tbm_gem_bufmgr_init`.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_import(mgr: *mut tbm_gem_bufmgr, key: u32) -> *mut tbm_gem_bo {
    let Some(mgr) = tbm_gem_bufmgr::as_ref(mgr) else {
        invalid_param("bufmgr");
        return ptr::null_mut();
    };

    match tbm_gem::Bo::import(mgr.clone(), key) {
        Ok(bo) => tbm_gem_bo::from(bo),
        Err(_) => ptr::null_mut(),
    }
}

/// Returns the global name of a BO, or 0 on errors.
///
/// # Safety
///
/// `bo` must be NULL or a live BO.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_export(bo: *mut tbm_gem_bo) -> u32 {
    let Some(bo) = tbm_gem_bo::as_ref(bo) else {
        invalid_param("bo");
        return 0;
    };

    bo.export().unwrap_or(0)
}

/// Same as `tbm_gem_bo_export`.
///
/// # Safety
///
/// `bo` must be NULL or a live BO.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_get_global_key(bo: *mut tbm_gem_bo) -> u32 {
    // SAFETY: same contract
    unsafe { tbm_gem_bo_export(bo) }
}

/// # Safety
///
/// `bo` must be NULL or a live BO.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_size(bo: *mut tbm_gem_bo) -> u64 {
    match tbm_gem_bo::as_ref(bo) {
        Some(bo) => bo.size(),
        None => {
            invalid_param("bo");
            0
        }
    }
}

/// # Safety
///
/// `bo` must be NULL or a live BO.  `out_handle` must be NULL or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_get_handle(
    bo: *mut tbm_gem_bo,
    device: i32,
    out_handle: *mut tbm_gem_bo_handle,
) -> i32 {
    let Some(bo) = tbm_gem_bo::as_ref(bo) else {
        return invalid_param("bo");
    };
    let Some(device) = device_from(device) else {
        return invalid_param("device");
    };
    if out_handle.is_null() {
        return invalid_param("out handle");
    }

    match bo.handle(device) {
        Ok(handle) => {
            tbm_gem_bo_handle::write(handle, out_handle);
            TBM_GEM_SUCCESS
        }
        Err(err) => status(&err),
    }
}

/// # Safety
///
/// `bo` must be NULL or a live BO.  `out_handle` must be NULL or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_map(
    bo: *mut tbm_gem_bo,
    device: i32,
    opt: u32,
    out_handle: *mut tbm_gem_bo_handle,
) -> i32 {
    let Some(bo) = tbm_gem_bo::as_ref(bo) else {
        return invalid_param("bo");
    };
    let Some(device) = device_from(device) else {
        return invalid_param("device");
    };
    let Some(access) = Access::from_bits(opt) else {
        return invalid_param("access option");
    };
    if out_handle.is_null() {
        return invalid_param("out handle");
    }

    match bo.map(device, access) {
        Ok(handle) => {
            tbm_gem_bo_handle::write(handle, out_handle);
            TBM_GEM_SUCCESS
        }
        Err(err) => status(&err),
    }
}

/// # Safety
///
/// `bo` must be NULL or a live BO.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_unmap(bo: *mut tbm_gem_bo) -> i32 {
    let Some(bo) = tbm_gem_bo::as_ref(bo) else {
        return invalid_param("bo");
    };

    to_status(bo.unmap())
}

/// # Safety
///
/// `bo` must be NULL or a live BO.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_lock(bo: *mut tbm_gem_bo, device: i32, opt: u32) -> i32 {
    let Some(bo) = tbm_gem_bo::as_ref(bo) else {
        return invalid_param("bo");
    };
    let Some(device) = device_from(device) else {
        return invalid_param("device");
    };
    let Some(access) = Access::from_bits(opt) else {
        return invalid_param("access option");
    };

    to_status(bo.lock(device, access))
}

/// # Safety
///
/// `bo` must be NULL or a live BO.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_unlock(bo: *mut tbm_gem_bo) -> i32 {
    let Some(bo) = tbm_gem_bo::as_ref(bo) else {
        return invalid_param("bo");
    };

    to_status(bo.unlock())
}

/// # Safety
///
/// `bo` must be NULL or a live BO.
#[no_mangle]
pub unsafe extern "C" fn tbm_gem_bo_cache_flush(bo: *mut tbm_gem_bo, flags: u32) -> i32 {
    let Some(bo) = tbm_gem_bo::as_ref(bo) else {
        return invalid_param("bo");
    };
    let Some(flags) = cache_flags_from(flags) else {
        return invalid_param("cache flags");
    };

    to_status(bo.cache_flush(flags))
}
