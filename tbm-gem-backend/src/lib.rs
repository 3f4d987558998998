// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! A TBM-GEM C API for buffer manager hosts.
//!
//! This crate exposes `tbm-gem` through a C ABI.  A host initializes a buffer manager with an
//! opened DRM fd and receives a table of backend functions.  The generated header is written to
//! `OUT_DIR`.

#[cfg(feature = "capi")]
pub mod capi;
mod log;
