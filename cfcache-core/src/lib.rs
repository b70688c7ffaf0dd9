//! Convolution-function kernel cache for gridding and degridding.
//!
//! Kernels are stored per cache key in a [`KernelBuffer`], a three-axis grid
//! of [`KernelCell`]s indexed by frequency, w and Mueller element. The
//! [`CacheStore`] keeps buffers in memory for the lifetime of an imaging run
//! and persists them under a directory root with integrity checks, so a
//! later run can reload them instead of recomputing.
//!
//! ```no_run
//! use cfcache_core::{BufferLayout, CacheStore, KernelBuffer, PolarizationTables};
//!
//! # fn main() -> cfcache_core::CacheResult<()> {
//! let store: CacheStore<String> = CacheStore::open("/tmp/cfcache")?;
//! let layout = BufferLayout::new(
//!     1.0e6,
//!     50.0,
//!     vec![1.0e9, 2.0e9],
//!     vec![0.0, 100.0],
//!     PolarizationTables::from_elements(&[0, 1]),
//! );
//! let mut buffer = KernelBuffer::with_layout(layout)?;
//! // ... fill every cell, then
//! buffer.prime_the_cache()?;
//! store.put("conv-band-l".to_string(), buffer);
//! store.persist(&"conv-band-l".to_string())?;
//! # Ok(())
//! # }
//! ```

// Safety-focused Clippy lints to prevent unsafe error handling regression
#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]
#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod error;
pub mod kernel;
mod numeric;
pub mod storage;
pub mod types;

pub use config::CacheConfig;
pub use error::{CacheError, CacheResult, ErrorKind};
pub use kernel::{
    BufferLayout, BufferState, BufferStruct, CellParams, CellStruct, Complex32,
    CoordinateDescriptor, FrequencySelection, KernelBuffer, KernelCell, KernelSamples, MapState,
    PolarizationTable, PolarizationTables, SampleKind, Slot, SpwRange,
};
pub use storage::{CacheMetrics, CacheStore, FsyncMode, IntegrityReport, Manifest, PersistReport};
pub use types::{CacheKey, KernelRole, KernelSetKey, PolarizationBasis, validate_storage_name};
