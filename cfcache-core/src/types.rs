//! Cache key types
//!
//! A cache key identifies the physical configuration a buffer of kernels was
//! computed for. The store only needs equality, hashing and a stable
//! directory name; everything else about the key belongs to the caller.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Longest storage name accepted for a key directory.
pub const MAX_STORAGE_NAME_LEN: usize = 128;

/// Opaque, caller-defined identifier for one kernel buffer.
pub trait CacheKey: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static {
    /// Deterministic directory name under the cache root.
    ///
    /// Two keys that compare unequal must return different names, otherwise
    /// their persisted buffers overwrite each other.
    fn storage_name(&self) -> String;
}

impl CacheKey for String {
    fn storage_name(&self) -> String {
        self.clone()
    }
}

/// Check that a storage name is a single, portable path component.
///
/// # Errors
///
/// Returns [`CacheError::InvalidKey`] when the name is empty, too long, a
/// relative path component, or contains characters outside `[A-Za-z0-9_.+-]`.
pub fn validate_storage_name(name: &str) -> CacheResult<()> {
    let reject = |reason: &str| {
        Err(CacheError::InvalidKey {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return reject("name is empty");
    }
    if name.len() > MAX_STORAGE_NAME_LEN {
        return reject("name is longer than 128 characters");
    }
    if name == "." || name == ".." {
        return reject("name is a relative path component");
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+')))
    {
        return reject(&format!("character {bad:?} is not allowed"));
    }
    Ok(())
}

/// Which family of kernels a buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelRole {
    /// Gridding convolution functions.
    Convolution,
    /// Weight kernels built alongside the convolution functions.
    Weight,
}

impl fmt::Display for KernelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Convolution => f.write_str("conv"),
            Self::Weight => f.write_str("wt"),
        }
    }
}

/// Polarization basis of the feeds the kernels were computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolarizationBasis {
    Linear,
    Circular,
}

impl fmt::Display for PolarizationBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => f.write_str("linear"),
            Self::Circular => f.write_str("circular"),
        }
    }
}

/// Key for a set of kernels computed for one baseline class at one
/// parallactic angle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelSetKey {
    pub role: KernelRole,
    /// Antenna types of the two baseline ends.
    pub antenna_types: (u16, u16),
    pub basis: PolarizationBasis,
    /// Parallactic angle quantised by the step given to
    /// [`KernelSetKey::with_parallactic_angle`].
    pub parallactic_angle_bin: i32,
}

impl KernelSetKey {
    #[must_use]
    pub const fn new(role: KernelRole, ant1: u16, ant2: u16, basis: PolarizationBasis) -> Self {
        Self {
            role,
            antenna_types: (ant1, ant2),
            basis,
            parallactic_angle_bin: 0,
        }
    }

    /// Bin the parallactic angle (radians) with the given step (radians).
    ///
    /// A non-positive or non-finite step leaves the key in bin 0, which is
    /// what a caller that ignores parallactic-angle dependence wants.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_parallactic_angle(mut self, angle_rad: f64, step_rad: f64) -> Self {
        let binnable = step_rad.is_finite() && step_rad > 0.0 && angle_rad.is_finite();
        self.parallactic_angle_bin = if binnable {
            (angle_rad / step_rad).round() as i32
        } else {
            0
        };
        self
    }

    /// The weight-kernel key matching this convolution key.
    #[must_use]
    pub fn weights(&self) -> Self {
        Self {
            role: KernelRole::Weight,
            ..self.clone()
        }
    }
}

impl fmt::Display for KernelSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-pa{:+05}-ant{}x{}-{}",
            self.role,
            self.parallactic_angle_bin,
            self.antenna_types.0,
            self.antenna_types.1,
            self.basis
        )
    }
}

impl CacheKey for KernelSetKey {
    fn storage_name(&self) -> String {
        self.to_string()
    }
}
