//! On-disk persistence and the keyed cache store
//!
//! Each persisted buffer lives in its own directory under the cache root:
//!
//! - `manifest.cfm` lists the buffer layout and every expected cell slot
//! - `cell-IIII-JJJJ-KKKK.cfc` holds one kernel cell
//!
//! Both file kinds carry a magic number, a format version and CRC32C
//! checksums. A reload only succeeds when the manifest and the cell files
//! agree exactly.

pub mod format;
pub mod manifest;
pub mod store;

pub use manifest::{Manifest, ManifestEntry};
pub use store::CacheStore;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::kernel::Slot;

/// Manifest file name inside a key directory.
pub const MANIFEST_FILE: &str = "manifest.cfm";

/// Extension of persisted cell files.
pub const CELL_EXTENSION: &str = "cfc";

/// File synchronization modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncMode {
    /// Sync every file before it is renamed into place (safest, slowest)
    PerWrite,
    /// Sync the manifest and the key directory once per persist
    #[default]
    PerBatch,
    /// No explicit sync (testing only)
    None,
}

impl FsyncMode {
    pub(crate) const fn sync_each_file(self) -> bool {
        matches!(self, Self::PerWrite)
    }

    pub(crate) const fn sync_batch(self) -> bool {
        matches!(self, Self::PerWrite | Self::PerBatch)
    }
}

/// File stem of the cell persisted for `slot`.
#[must_use]
pub fn cell_file_stem(slot: Slot) -> String {
    format!("cell-{:04}-{:04}-{:04}", slot[0], slot[1], slot[2])
}

/// File name of the cell persisted for `slot`.
#[must_use]
pub fn cell_file_name(slot: Slot) -> String {
    format!("{}.{CELL_EXTENSION}", cell_file_stem(slot))
}

/// Outcome of [`CacheStore::persist`].
#[derive(Debug, Clone)]
pub struct PersistReport {
    pub directory: PathBuf,
    pub cells_written: usize,
    pub bytes_written: u64,
}

/// Outcome of a successful integrity check of one persisted key.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub directory: PathBuf,
    pub cells_checked: usize,
    pub bytes_checked: u64,
    pub persisted_at: DateTime<Utc>,
}

/// Performance counters for cache operations
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub memory_hits: AtomicU64,
    pub memory_misses: AtomicU64,
    pub disk_loads: AtomicU64,
    pub corrupt_detected: AtomicU64,
    pub cells_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
}

impl CacheMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_load(&self, bytes: u64) {
        self.disk_loads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_corruption(&self) {
        self.corrupt_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cell_write(&self, bytes: u64) {
        self.cells_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Fraction of `get` calls served from memory.
    #[must_use]
    pub fn hit_rate(&self) -> f32 {
        let hits = self.memory_hits.load(Ordering::Relaxed);
        let misses = self.memory_misses.load(Ordering::Relaxed);

        if hits + misses == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                hits as f32 / (hits + misses) as f32
            }
        }
    }
}

/// Flush directory entries so renames inside `dir` survive a crash.
pub(crate) fn sync_directory(dir: &Path) -> CacheResult<()> {
    #[cfg(unix)]
    {
        std::fs::File::open(dir)
            .and_then(|handle| handle.sync_all())
            .map_err(|e| CacheError::io("sync cache directory", dir, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
