//! Checked conversions between index types and the fixed-width integers of
//! the persisted formats.
//!
//! Kernel shapes and slot counts live as `usize` in memory but as `i32`/`u32`
//! on disk and in flattened structs. These helpers keep the conversions (and
//! their `allow` noise) in one place.

use crate::error::{CacheError, CacheResult};

/// Convert an in-memory extent to the `i32` used by headers and flat structs.
pub(crate) fn i32_from_usize(value: usize, what: &'static str) -> CacheResult<i32> {
    i32::try_from(value)
        .map_err(|_| CacheError::invalid_argument(what, format!("{value} exceeds i32::MAX")))
}

/// Convert a persisted extent back to `usize`, rejecting negatives.
pub(crate) fn usize_from_i32(value: i32) -> Option<usize> {
    usize::try_from(value).ok()
}

/// Convert an in-memory length to a `u32` length prefix.
pub(crate) fn u32_from_usize(value: usize, what: &'static str) -> CacheResult<u32> {
    u32::try_from(value)
        .map_err(|_| CacheError::invalid_argument(what, format!("{value} exceeds u32::MAX")))
}

/// Widen a `u64` length read from disk, rejecting values this platform
/// cannot address.
pub(crate) fn usize_from_u64(value: u64) -> Option<usize> {
    usize::try_from(value).ok()
}

/// Lossless on every supported target.
pub(crate) const fn u64_from_usize(value: usize) -> u64 {
    value as u64
}

/// Channel counter to `f64` for frequency arithmetic.
pub(crate) const fn usize_to_f64(value: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        value as f64
    }
}
