// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

use super::types::{CacheFlags, Flags};

// from exynos_drm.h
mod consts {
    pub const EXYNOS_BO_NONCONTIG: u32 = 1 << 0;
    pub const EXYNOS_BO_CACHABLE: u32 = 1 << 1;
    pub const EXYNOS_BO_WC: u32 = 1 << 2;

    pub const EXYNOS_DRM_L1_CACHE: u32 = 1 << 0;
    pub const EXYNOS_DRM_L2_CACHE: u32 = 1 << 1;
    pub const EXYNOS_DRM_ALL_CORES: u32 = 1 << 2;

    pub const EXYNOS_DRM_CACHE_INV_ALL: u32 = 1 << 3;
    pub const EXYNOS_DRM_CACHE_INV_RANGE: u32 = 1 << 4;
    pub const EXYNOS_DRM_CACHE_CLN_ALL: u32 = 1 << 5;
    pub const EXYNOS_DRM_CACHE_CLN_RANGE: u32 = 1 << 6;
}

bitflags::bitflags! {
    /// Kernel memory object flags.
    ///
    /// Contiguous and non-cachable memory are indicated by the absence of `NONCONTIG` and
    /// `CACHABLE` respectively.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct GemFlags: u32 {
        /// Physically non-contiguous.
        const NONCONTIG = consts::EXYNOS_BO_NONCONTIG;
        /// Cached CPU access.
        const CACHABLE = consts::EXYNOS_BO_CACHABLE;
        /// Write-combined CPU access.
        const WC = consts::EXYNOS_BO_WC;
    }
}

bitflags::bitflags! {
    /// Kernel cache operation flags.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct GemCacheFlags: u32 {
        /// L1 cache.
        const L1 = consts::EXYNOS_DRM_L1_CACHE;
        /// L2 cache.
        const L2 = consts::EXYNOS_DRM_L2_CACHE;
        /// All cores.
        const ALL_CORES = consts::EXYNOS_DRM_ALL_CORES;
        /// Invalidate all.
        const INV_ALL = consts::EXYNOS_DRM_CACHE_INV_ALL;
        /// Invalidate a range.
        const INV_RANGE = consts::EXYNOS_DRM_CACHE_INV_RANGE;
        /// Clean all.
        const CLN_ALL = consts::EXYNOS_DRM_CACHE_CLN_ALL;
        /// Clean a range.
        const CLN_RANGE = consts::EXYNOS_DRM_CACHE_CLN_RANGE;

        /// All caches of all cores.
        const ALL_CACHES_CORES = Self::L1.bits() | Self::L2.bits() | Self::ALL_CORES.bits();
    }
}

pub fn to_gem(flags: Flags) -> GemFlags {
    let mut gem_flags = GemFlags::empty();

    if !flags.contains(Flags::SCANOUT) {
        gem_flags |= GemFlags::NONCONTIG;
    }

    if flags.contains(Flags::WC) {
        gem_flags |= GemFlags::WC;
    } else if !flags.contains(Flags::NONCACHABLE) {
        gem_flags |= GemFlags::CACHABLE;
    }

    gem_flags
}

pub fn from_gem(gem_flags: GemFlags) -> Flags {
    let mut flags = Flags::empty();

    if !gem_flags.contains(GemFlags::NONCONTIG) {
        flags |= Flags::SCANOUT;
    }

    if gem_flags.contains(GemFlags::WC) {
        flags |= Flags::WC;
    } else if !gem_flags.contains(GemFlags::CACHABLE) {
        flags |= Flags::NONCACHABLE;
    }

    flags
}

pub fn cache_op(flags: CacheFlags) -> GemCacheFlags {
    let all = flags.contains(CacheFlags::ALL);
    let mut op = GemCacheFlags::empty();

    if flags.contains(CacheFlags::INV) {
        op |= if all {
            GemCacheFlags::INV_ALL
        } else {
            GemCacheFlags::INV_RANGE
        };
    }

    if flags.contains(CacheFlags::CLN) {
        op |= if all {
            GemCacheFlags::CLN_ALL
        } else {
            GemCacheFlags::CLN_RANGE
        };
    }

    if all {
        op |= GemCacheFlags::ALL_CACHES_CORES;
    }

    op
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consts() {
        assert_eq!(GemCacheFlags::ALL_CACHES_CORES.bits(), 0x7);
        assert_eq!(
            (GemCacheFlags::INV_ALL | GemCacheFlags::CLN_ALL).bits(),
            0x28
        );
        assert_eq!(
            (GemCacheFlags::INV_RANGE | GemCacheFlags::CLN_RANGE).bits(),
            0x50
        );
    }

    #[test]
    fn to_gem() {
        assert_eq!(
            super::to_gem(Flags::empty()),
            GemFlags::NONCONTIG | GemFlags::CACHABLE
        );
        assert_eq!(super::to_gem(Flags::SCANOUT), GemFlags::CACHABLE);
        assert_eq!(super::to_gem(Flags::NONCACHABLE), GemFlags::NONCONTIG);
        assert_eq!(
            super::to_gem(Flags::SCANOUT | Flags::WC),
            GemFlags::WC
        );
        // write-combine wins over non-cachable
        assert_eq!(
            super::to_gem(Flags::WC | Flags::NONCACHABLE),
            GemFlags::NONCONTIG | GemFlags::WC
        );
    }

    #[test]
    fn round_trip() {
        let all = [
            Flags::empty(),
            Flags::SCANOUT,
            Flags::NONCACHABLE,
            Flags::WC,
            Flags::SCANOUT | Flags::NONCACHABLE,
            Flags::SCANOUT | Flags::WC,
        ];
        for flags in all {
            assert_eq!(from_gem(super::to_gem(flags)), flags);
        }
    }

    #[test]
    fn cache_op() {
        assert_eq!(
            super::cache_op(CacheFlags::INV),
            GemCacheFlags::INV_RANGE
        );
        assert_eq!(
            super::cache_op(CacheFlags::FLUSH),
            GemCacheFlags::INV_RANGE | GemCacheFlags::CLN_RANGE
        );
        assert_eq!(
            super::cache_op(CacheFlags::FLUSH_ALL),
            GemCacheFlags::INV_ALL | GemCacheFlags::CLN_ALL | GemCacheFlags::ALL_CACHES_CORES
        );
        assert_eq!(
            super::cache_op(CacheFlags::CLN | CacheFlags::ALL),
            GemCacheFlags::CLN_ALL | GemCacheFlags::ALL_CACHES_CORES
        );
    }
}
