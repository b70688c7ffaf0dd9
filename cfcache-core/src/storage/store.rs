//! Keyed cache of kernel buffers backed by a persistence directory.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::manifest::Manifest;
use super::{
    CELL_EXTENSION, CacheMetrics, IntegrityReport, MANIFEST_FILE, PersistReport, cell_file_stem,
    format, sync_directory,
};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult, ErrorKind};
use crate::kernel::{BufferState, KernelBuffer};
use crate::types::{CacheKey, validate_storage_name};

/// Process-scoped map from cache key to kernel buffer.
///
/// Buffers are handed out as `Arc`s so gridding workers can hold them while
/// the store keeps serving other keys. There is no eviction; [`Self::clear`]
/// is the explicit teardown at the end of an imaging run.
pub struct CacheStore<K: CacheKey> {
    entries: DashMap<K, Arc<KernelBuffer>>,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
    /// Serializes disk loads so a key is read at most once.
    load_lock: Mutex<()>,
}

impl<K: CacheKey> CacheStore<K> {
    /// Create a store, making sure the configured root exists.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the root cannot be created.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        std::fs::create_dir_all(&config.root)
            .map_err(|e| CacheError::io("create cache root", &config.root, e))?;
        Ok(Self {
            entries: DashMap::new(),
            config,
            metrics: Arc::new(CacheMetrics::new()),
            load_lock: Mutex::new(()),
        })
    }

    /// Store rooted at `root` with default settings.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn open<P: Into<PathBuf>>(root: P) -> CacheResult<Self> {
        Self::new(CacheConfig::with_root(root))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Directory holding the persisted files of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidKey`] if the key's storage name is not a
    /// safe single path component.
    pub fn key_directory(&self, key: &K) -> CacheResult<PathBuf> {
        let name = key.storage_name();
        validate_storage_name(&name)?;
        Ok(self.config.root.join(name))
    }

    /// Buffer for `key`, from memory or else from disk.
    ///
    /// Never computes kernels. A buffer read from disk is rebuilt completely
    /// or not at all.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::KeyNotFound`] when neither memory nor disk holds
    /// the key, [`CacheError::CorruptCache`] when the persisted files are
    /// incomplete or fail their checksums, and [`CacheError::Io`] on read
    /// failures.
    pub fn get(&self, key: &K) -> CacheResult<Arc<KernelBuffer>> {
        if let Some(existing) = self.entries.get(key) {
            self.metrics.record_hit();
            return Ok(Arc::clone(existing.value()));
        }

        let _guard = self.load_lock.lock();

        if let Some(existing) = self.entries.get(key) {
            self.metrics.record_hit();
            return Ok(Arc::clone(existing.value()));
        }

        self.metrics.record_miss();
        debug!(key = %key, "Kernel buffer not in memory, reading from disk");

        let (mut buffer, report) = self.load_from_disk(key)?;
        if self.config.prime_on_load {
            buffer.prime_the_cache()?;
        }
        self.metrics.record_disk_load(report.bytes_checked);

        let buffer = Arc::new(buffer);
        self.entries.insert(key.clone(), Arc::clone(&buffer));
        info!(
            key = %key,
            cells = report.cells_checked,
            bytes = report.bytes_checked,
            persisted_at = %report.persisted_at,
            "Loaded kernel buffer from disk"
        );
        Ok(buffer)
    }

    /// Insert or replace the in-memory buffer for `key`. Nothing is written
    /// to disk. Returns the replaced buffer.
    pub fn put(&self, key: K, buffer: KernelBuffer) -> Option<Arc<KernelBuffer>> {
        self.entries.insert(key, Arc::new(buffer))
    }

    /// Write the in-memory buffer for `key` below the cache root, replacing
    /// any earlier persist of the same key.
    ///
    /// The manifest goes first, then one file per cell, so an interrupted
    /// persist is detected as corrupt on the next load.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::KeyNotFound`] if `key` is not in memory,
    /// [`CacheError::InvalidState`] for an empty buffer,
    /// [`CacheError::InvalidKey`] for an unsafe storage name and
    /// [`CacheError::Io`] on write failures.
    pub fn persist(&self, key: &K) -> CacheResult<PersistReport> {
        let buffer = self
            .entries
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| self.not_found(key))?;
        if buffer.state() == BufferState::Empty {
            return Err(CacheError::invalid_state(
                "persist",
                "buffer laid out by resize",
                "buffer is empty",
            ));
        }

        let name = key.storage_name();
        validate_storage_name(&name)?;
        let directory = self.config.root.join(&name);
        if directory.exists() {
            std::fs::remove_dir_all(&directory)
                .map_err(|e| CacheError::io("remove previous persist", &directory, e))?;
        }
        std::fs::create_dir_all(&directory)
            .map_err(|e| CacheError::io("create key directory", &directory, e))?;

        let fsync = self.config.fsync_mode;
        let manifest = Manifest::from_buffer(&name, &buffer);
        let mut bytes_written =
            format::write_manifest(&directory.join(MANIFEST_FILE), &manifest, fsync)?;

        for (slot, cell) in buffer.cells() {
            let (_, written) =
                format::write_cell(&directory.join(cell_file_stem(slot)), cell, fsync)?;
            self.metrics.record_cell_write(written);
            bytes_written += written;
        }

        if fsync.sync_batch() {
            sync_directory(&directory)?;
            sync_directory(&self.config.root)?;
        }

        info!(
            key = %key,
            cells = manifest.cells.len(),
            bytes = bytes_written,
            path = %directory.display(),
            "Persisted kernel buffer"
        );
        Ok(PersistReport {
            directory,
            cells_written: manifest.cells.len(),
            bytes_written,
        })
    }

    /// Check the persisted files of `key` without loading them into memory.
    ///
    /// # Errors
    ///
    /// Same as the disk path of [`Self::get`].
    pub fn verify(&self, key: &K) -> CacheResult<IntegrityReport> {
        self.load_from_disk(key).map(|(_, report)| report)
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop the in-memory buffer for `key`; persisted files stay.
    pub fn remove(&self, key: &K) -> Option<Arc<KernelBuffer>> {
        self.entries.remove(key).map(|(_, buffer)| buffer)
    }

    /// Keys currently held in memory.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every in-memory buffer.
    pub fn clear(&self) {
        let released = self.entries.len();
        self.entries.clear();
        debug!(buffers = released, "Cleared kernel cache");
    }

    /// Bytes held by the samples of every in-memory buffer.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().memory_usage()).sum()
    }

    fn not_found(&self, key: &K) -> CacheError {
        CacheError::KeyNotFound {
            key: key.to_string(),
            root: self.config.root.clone(),
        }
    }

    fn load_from_disk(&self, key: &K) -> CacheResult<(KernelBuffer, IntegrityReport)> {
        let name = key.storage_name();
        validate_storage_name(&name)?;
        let directory = self.config.root.join(&name);
        let manifest_path = directory.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(self.not_found(key));
        }

        read_buffer(&name, &directory, &manifest_path).inspect_err(|err| {
            if err.kind() == ErrorKind::CorruptCache {
                self.metrics.record_corruption();
                warn!(key = %key, error = %err, "Persisted kernel buffer is corrupt");
            }
        })
    }
}

/// Rebuild a buffer from a key directory, or report why it cannot be trusted.
fn read_buffer(
    name: &str,
    directory: &Path,
    manifest_path: &Path,
) -> CacheResult<(KernelBuffer, IntegrityReport)> {
    let manifest = format::read_manifest(manifest_path).map_err(|e| e.for_key(name))?;
    if manifest.key != name {
        return Err(CacheError::corrupt(
            name,
            format!("manifest belongs to key '{}'", manifest.key),
        ));
    }
    manifest
        .check_complete()
        .map_err(|detail| CacheError::corrupt(name, detail))?;

    let expected = manifest.expected_files();
    let present = cell_files(directory)?;
    let missing: Vec<&String> = expected.difference(&present).collect();
    if let Some(first) = missing.first() {
        return Err(CacheError::corrupt(
            name,
            format!("{} of {} cell files missing, first {first}", missing.len(), expected.len()),
        ));
    }
    let unexpected: Vec<&String> = present.difference(&expected).collect();
    if let Some(first) = unexpected.first() {
        return Err(CacheError::corrupt(
            name,
            format!("{} unexpected cell files, first {first}", unexpected.len()),
        ));
    }

    let mut buffer = KernelBuffer::with_layout(manifest.layout.clone())
        .map_err(|e| {
            CacheError::corrupt(name, format!("manifest layout rejected: {}", reason(e)))
        })?;
    buffer.set_pointing_offset(manifest.pointing_offset);

    let mut bytes_checked = 0u64;
    for entry in &manifest.cells {
        let (cell, len) =
            format::read_cell(&directory.join(&entry.file_name)).map_err(|e| e.for_key(name))?;
        if cell.sample_kind() != entry.sample_kind {
            return Err(CacheError::corrupt(
                name,
                format!(
                    "{} holds {:?} samples, manifest expects {:?}",
                    entry.file_name,
                    cell.sample_kind(),
                    entry.sample_kind
                ),
            ));
        }
        buffer
            .place_cell(entry.slot, cell)
            .map_err(|e| CacheError::corrupt(name, format!("{}: {}", entry.file_name, reason(e))))?;
        bytes_checked += len;
    }

    let report = IntegrityReport {
        directory: directory.to_path_buf(),
        cells_checked: manifest.cells.len(),
        bytes_checked,
        persisted_at: manifest.persisted_at,
    };
    Ok((buffer, report))
}

/// Names of the cell files in `directory`. Temporary files are ignored.
fn cell_files(directory: &Path) -> CacheResult<BTreeSet<String>> {
    let entries = std::fs::read_dir(directory)
        .map_err(|e| CacheError::io("list key directory", directory, e))?;
    let mut names = BTreeSet::new();
    for entry in entries {
        let path = entry
            .map_err(|e| CacheError::io("list key directory", directory, e))?
            .path();
        if !path.extension().is_some_and(|ext| ext == CELL_EXTENSION) {
            continue;
        }
        if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
            names.insert(file_name.to_string());
        }
    }
    Ok(names)
}

fn reason(err: CacheError) -> String {
    match err {
        CacheError::InvalidArgument { reason, .. } => reason,
        other => other.to_string(),
    }
}
