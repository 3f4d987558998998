// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Simple types.
//!
//! This module defines simple backend-specific types.

use std::{ffi, fmt, io, num, ptr, result};

/// The error type for buffer object operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The kernel failed to create a memory object.
    #[error("failed to allocate {size} bytes with {flags:?}")]
    Allocation {
        /// The requested size.
        size: Size,
        /// The requested flags.
        flags: Flags,
        /// The kernel error.
        #[source]
        source: io::Error,
    },
    /// The kernel failed to open or query a memory object by its global name.
    #[error("failed to import name {name}")]
    Import {
        /// The global name.
        name: Name,
        /// The kernel error.
        #[source]
        source: io::Error,
    },
    /// The kernel failed to assign a global name.
    #[error("failed to export gem handle {handle}")]
    Export {
        /// The GEM handle.
        handle: u32,
        /// The kernel error.
        #[source]
        source: io::Error,
    },
    /// The kernel failed to map a memory object for CPU access.
    #[error("failed to map gem handle {handle}")]
    Map {
        /// The GEM handle.
        handle: u32,
        /// The kernel error.
        #[source]
        source: io::Error,
    },
    /// A device handle could not be materialized.
    #[error("no {device:?} handle for gem handle {handle}")]
    HandleUnavailable {
        /// The consumer device class.
        device: DeviceClass,
        /// The GEM handle.
        handle: u32,
        /// The kernel error.
        #[source]
        source: io::Error,
    },
    /// The operation does not support the device class.
    #[error("unsupported device {0:?}")]
    UnsupportedDevice(DeviceClass),
    /// Kernel fencing is disabled for this backend instance.
    #[error("dma fence is not supported")]
    LockUnsupported,
    /// The per-object fence queue has no free slot.
    #[error("fence queue is full")]
    FenceQueueFull,
    /// Unlocking an object that holds no lock.
    #[error("not locked")]
    NotLocked,
    /// Unmapping an object that is not mapped.
    #[error("not mapped")]
    NotMapped,
    /// The name registry has no entry for a name that should be bound.
    #[error("name {0} is missing from the registry")]
    RegistryInconsistency(Name),
    /// A lock was not acquired within the configured timeout.
    #[error("timed out")]
    Timeout,
    /// A validation error indicating a bad user input.
    #[error("bad user input")]
    User,
    /// Indicates an unsupported operation.
    #[error("unsupported")]
    Unsupported,
    #[error("{0}")]
    /// A generic IO error.
    Io(#[from] io::Error),
    /// A validation error indicating a bad integer.
    #[error("bad integer conversion")]
    IntegerConversion,
}

impl Error {
    pub(crate) fn user<T>() -> Result<T> {
        Err(Error::User)
    }
}

impl From<num::TryFromIntError> for Error {
    fn from(_err: num::TryFromIntError) -> Self {
        Self::IntegerConversion
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::from(io::Error::from(err))
    }
}

/// A specialized `Result` type for buffer object operations.
pub(crate) type Result<T> = result::Result<T, Error>;

/// The type for the BO size.
pub type Size = u64;

/// A process-independent global name of a GEM object.
pub type Name = u32;

bitflags::bitflags! {
    /// Abstract BO flags as seen by the buffer manager.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct Flags: u32 {
        /// Physically contiguous, usable for scanout.
        const SCANOUT = 1 << 0;
        /// Uncached CPU access.
        const NONCACHABLE = 1 << 1;
        /// Write-combined CPU access.
        const WC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Cache maintenance flags.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct CacheFlags: u32 {
        /// Invalidate.
        const INV = 0x01;
        /// Clean.
        const CLN = 0x02;
        /// Apply to all caches rather than an address range.
        const ALL = 0x10;
        /// Invalidate and clean.
        const FLUSH = Self::INV.bits() | Self::CLN.bits();
        /// Invalidate and clean all caches.
        const FLUSH_ALL = Self::FLUSH.bits() | Self::ALL.bits();
    }
}

/// A consumer device class.
///
/// Each class resolves a BO to a different kind of handle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(i32)]
pub enum DeviceClass {
    /// The raw GEM handle.
    Default = 0,
    /// The CPU, which uses a virtual address.
    Cpu = 1,
    /// The 2D engine, which uses the raw GEM handle.
    G2d = 2,
    /// The 3D engine, which uses a dma-buf fd.
    G3d = 3,
    /// Multimedia and display, which use a dma-buf fd.
    Multimedia = 4,
}

impl TryFrom<i32> for DeviceClass {
    type Error = Error;

    fn try_from(val: i32) -> Result<Self> {
        let device = match val {
            0 => Self::Default,
            1 => Self::Cpu,
            2 => Self::G2d,
            3 => Self::G3d,
            4 => Self::Multimedia,
            _ => return Error::user(),
        };

        Ok(device)
    }
}

/// An access type for mapping and locking.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Access {
    /// Read-only access.
    Read,
    /// Write-only access.
    Write,
    /// Read and write access.
    ReadWrite,
}

impl Access {
    /// Read access bit of the host option mask.
    pub const READ_BIT: u32 = 1 << 0;
    /// Write access bit of the host option mask.
    pub const WRITE_BIT: u32 = 1 << 1;

    /// Converts a host option mask.  Returns `None` when neither bit is set.
    pub fn from_bits(bits: u32) -> Option<Self> {
        let read = bits & Self::READ_BIT != 0;
        let write = bits & Self::WRITE_BIT != 0;

        match (read, write) {
            (true, true) => Some(Self::ReadWrite),
            (false, true) => Some(Self::Write),
            (true, false) => Some(Self::Read),
            (false, false) => None,
        }
    }

    fn reads(&self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub(crate) fn writes(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    /// Returns the access covering both.
    pub(crate) fn union(self, other: Self) -> Self {
        match (self.reads() || other.reads(), self.writes() || other.writes()) {
            (true, true) => Self::ReadWrite,
            (true, false) => Self::Read,
            (false, _) => Self::Write,
        }
    }
}

/// A CPU memory mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Mapping {
    /// Pointer of a mapping.
    pub ptr: ptr::NonNull<ffi::c_void>,
    /// Size of a mapping.
    pub len: num::NonZeroUsize,
}

impl Mapping {
    /// Returns the address of the mapping.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as usize as u64
    }
}

// SAFETY: a mapping is address bookkeeping; dereferencing it is up to the clients
unsafe impl Send for Mapping {}
// SAFETY: see above
unsafe impl Sync for Mapping {}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Default => "DEF",
            Self::Cpu => "CPU",
            Self::G2d => "2D",
            Self::G3d => "3D",
            Self::Multimedia => "MM",
        };
        write!(f, "{}", name)
    }
}
