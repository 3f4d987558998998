// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

#![warn(missing_docs)]

//! TBM-GEM is a buffer object backend for Exynos DRM/GEM devices.
//!
//! This crate provides a library to allocate, share by global name, map, lock, and flush buffer
//! objects (BOs).
//!
//! A `Bufmgr` owns the kernel driver and the name registry.  A `Bo` owns one GEM handle and
//! resolves it lazily to the handle each consumer device class needs: the raw GEM handle, a CPU
//! mapping, or a dma-buf fd.  Access is synchronized by kernel dma-buf fences for the 3D engine
//! and by advisory file locks for the CPU, when the kernel supports fencing.

mod bo;
mod bufmgr;
mod drivers;
mod fence;
mod flags;
mod registry;
mod types;
mod utils;

pub use bo::*;
pub use bufmgr::*;
pub use drivers::*;
pub use fence::{Fence, FenceAccess};
pub use flags::{GemCacheFlags, GemFlags};
pub use types::*;
