//! Error types for kernel cache operations
//!
//! Every error names what was expected, what to do about it, and an example
//! of the correct call, so that an imaging run that fails can report which
//! cache key or kernel coordinate was at fault.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of [`CacheError`] values.
///
/// Callers that only need to decide between "compute and insert",
/// "programmer error", "disk trouble" and "throw the key away" can branch on
/// this instead of matching individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A lookup found no matching entry; recover by computing and inserting.
    NotFound,
    /// An operation ran before its buffer reached the required lifecycle state.
    InvalidState,
    /// Arguments were rejected (bad layout tables, unsafe key names, ...).
    InvalidArgument,
    /// A disk read or write failed.
    Io,
    /// Persisted data for a key is incomplete or fails integrity checks.
    CorruptCache,
    /// Configuration could not be parsed.
    Configuration,
}

/// Errors raised by kernel cells, kernel buffers and the cache store.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(
        "No kernel cell tagged (frequency={frequency}, w={w}, mueller={mueller_element})\n  Expected: Coordinate previously introduced through resize\n  Suggestion: Compute the kernel and resize the buffer to include this coordinate\n  Example: buffer.resize(layout_with_new_coordinate)?; buffer.fill_cell(slot, samples)?;"
    )]
    CellNotFound {
        frequency: f64,
        w: f64,
        mueller_element: i32,
    },

    #[error(
        "Kernel slot {slot:?} is outside buffer shape {shape:?}\n  Expected: Slot index below the buffer shape on every axis\n  Suggestion: Resolve slots through buffer.get_index() instead of hand-built indices\n  Example: let slot = buffer.get_index(freq, w, mueller)?;"
    )]
    SlotOutOfRange { slot: [usize; 3], shape: [usize; 3] },

    #[error(
        "Channel {channel} of spectral window {spw} has no mapped frequency slot\n  Expected: Spectral window and channel covered by the selection passed to init_maps\n  Suggestion: Include this window in the frequency selection and rebuild the maps\n  Example: buffer.init_maps(&selection.with_window(spw, min, max, incr))?;"
    )]
    ChannelNotMapped { spw: i32, channel: usize },

    #[error(
        "Mueller element {mueller_element} has no polarization slot\n  Expected: Element listed in the buffer's polarization tables\n  Suggestion: Resize the buffer with tables that include this element\n  Example: PolarizationTables::from_elements(&[0, 1, 2, 3])"
    )]
    MuellerElementNotFound { mueller_element: i32 },

    #[error(
        "Cache key '{key}' not found in memory or under '{root}'\n  Expected: Buffer inserted with put() or persisted earlier\n  Suggestion: Compute the kernels for this key and insert them\n  Example: store.put(key.clone(), buffer); store.persist(&key)?;"
    )]
    KeyNotFound { key: String, root: PathBuf },

    #[error(
        "Cannot {operation}: {actual}\n  Expected: {expected}\n  Suggestion: Complete the build phase (resize, fill, prime) before reading\n  Example: buffer.resize(layout)?; buffer.prime_the_cache()?;"
    )]
    InvalidState {
        operation: &'static str,
        expected: String,
        actual: String,
    },

    #[error(
        "Invalid argument to {operation}: {reason}\n  Expected: Sorted finite axes and consistent polarization tables\n  Suggestion: Check the layout handed to the kernel buffer"
    )]
    InvalidArgument {
        operation: &'static str,
        reason: String,
    },

    #[error(
        "Cache key storage name '{name}' is not usable: {reason}\n  Expected: 1-128 characters from [A-Za-z0-9_.+-]\n  Suggestion: Derive storage names from numeric ids and short labels\n  Example: format!(\"conv-pa{{bin}}-ant{{a}}x{{b}}\")"
    )]
    InvalidKey { name: String, reason: String },

    #[error(
        "IO operation failed: {operation} on '{path}'\n  Expected: Readable and writable cache directory\n  Suggestion: Check permissions and free space under the cache root"
    )]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Persisted kernel cache for '{key}' is corrupt: {detail}\n  Expected: Manifest and cell files written by one complete persist\n  Suggestion: Discard this key and recompute its kernels from scratch\n  Example: store.remove(&key); store.put(key.clone(), recomputed); store.persist(&key)?;"
    )]
    CorruptCache { key: String, detail: String },

    #[error(
        "Failed to encode {context}\n  Expected: Serializable kernel metadata\n  Suggestion: Check coordinate descriptors for oversized axes"
    )]
    Encoding {
        context: &'static str,
        #[source]
        source: bincode::Error,
    },

    #[error(
        "Invalid cache configuration at '{path}': {reason}\n  Expected: TOML with [root, fsync_mode, prime_on_load] keys\n  Suggestion: Compare against CacheConfig::default() serialized with toml"
    )]
    Configuration { path: PathBuf, reason: String },
}

impl CacheError {
    /// Taxonomy bucket for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CellNotFound { .. }
            | Self::SlotOutOfRange { .. }
            | Self::ChannelNotMapped { .. }
            | Self::MuellerElementNotFound { .. }
            | Self::KeyNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InvalidArgument { .. } | Self::InvalidKey { .. } | Self::Encoding { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::Io { .. } => ErrorKind::Io,
            Self::CorruptCache { .. } => ErrorKind::CorruptCache,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// True for every `NotFound` flavoured variant.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    pub(crate) fn io(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::CorruptCache {
            key: key.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_argument(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(
        operation: &'static str,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            operation,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Re-attribute a corruption found while reading a single file to the
    /// cache key that owns it.
    #[must_use]
    pub(crate) fn for_key(self, key: &str) -> Self {
        match self {
            Self::CorruptCache { key: file, detail } => Self::CorruptCache {
                key: key.to_string(),
                detail: format!("{file}: {detail}"),
            },
            other => other,
        }
    }
}

/// Result type for kernel cache operations
pub type CacheResult<T> = Result<T, CacheError>;
