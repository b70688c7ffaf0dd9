//! Integration tests for persisting kernel buffers and reloading them
//!
//! Tests verify:
//! - Bit-identical reload in a fresh store over the same root
//! - Missing, extra and damaged cell files are reported as corrupt
//! - Corrupt keys are never inserted into memory
//! - Verification without loading
//! - Unwritable targets surface as I/O errors
//! - Concurrent readers share one primed buffer

use std::fs;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, ensure};
use cfcache_core::storage::{MANIFEST_FILE, cell_file_name};
use cfcache_core::{
    BufferLayout, BufferState, CacheConfig, CacheError, CacheStore, Complex32, CoordinateDescriptor,
    ErrorKind, FsyncMode, KernelBuffer, KernelCell, KernelRole, KernelSamples, KernelSetKey,
    PolarizationBasis, PolarizationTables,
};
use ndarray::{ArrayD, IxDyn};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(dir: &TempDir, fsync_mode: FsyncMode) -> CacheConfig {
    let mut config = CacheConfig::with_root(dir.path().join("cache"));
    config.fsync_mode = fsync_mode;
    config
}

fn key() -> KernelSetKey {
    KernelSetKey::new(KernelRole::Convolution, 1, 2, PolarizationBasis::Circular)
        .with_parallactic_angle(0.31, 0.1)
}

/// 2 frequencies x 2 w planes x 2 polarizations, mixing real and complex
/// kernels with per-cell coordinate descriptors.
fn primed_buffer() -> Result<KernelBuffer> {
    let layout = BufferLayout::new(
        1.0e6,
        100.0,
        vec![1.0e9, 2.0e9],
        vec![0.0, 100.0],
        PolarizationTables::from_elements(&[0, 3]),
    );
    let mut buffer = KernelBuffer::with_layout(layout)?;
    buffer.set_pointing_offset([1.5e-5, -2.5e-5]);

    let slots: Vec<_> = buffer.cells().map(|(slot, _)| slot).collect();
    for (n, slot) in slots.into_iter().enumerate() {
        let mut params = buffer.cell(slot)?.params();
        params.sampling_rate = 4.0;
        params.x_support = 2;
        params.y_support = 1 + (n % 2) as i32;
        params.coordinates = CoordinateDescriptor {
            reference_pixel: vec![8.0, 8.0],
            reference_value: vec![0.0, params.frequency_value],
            increment: vec![-1.0e-6 * (n + 1) as f64, 1.0e-6],
            axis_names: vec!["UU".into(), "VV".into()],
        };
        buffer.set_cell_params(slot, params)?;

        let seed = n as f32;
        let samples = if slot[2] == 0 {
            KernelSamples::Real(ArrayD::from_shape_fn(IxDyn(&[5, 5]), |ix| {
                seed + 0.1 * (ix[0] * 5 + ix[1]) as f32
            }))
        } else {
            KernelSamples::Complex(ArrayD::from_shape_fn(IxDyn(&[4, 4, 2]), |ix| {
                Complex32::new(seed - ix[0] as f32, 1.0 / (1.0 + (ix[1] + ix[2]) as f32))
            }))
        };
        buffer.fill_cell(slot, samples)?;
    }
    buffer.prime_the_cache()?;
    Ok(buffer)
}

fn persisted_store(dir: &TempDir) -> Result<(CacheStore<KernelSetKey>, KernelBuffer)> {
    let store = CacheStore::new(config(dir, FsyncMode::None))?;
    let buffer = primed_buffer()?;
    store.put(key(), buffer.clone());
    store.persist(&key())?;
    Ok((store, buffer))
}

#[test]
fn test_reload_is_bit_identical() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let (first, original) = persisted_store(&dir)?;
    ensure!(original.state() == BufferState::Primed);
    drop(first);

    // a fresh store over the same root stands in for a new process
    let store: CacheStore<KernelSetKey> = CacheStore::new(config(&dir, FsyncMode::None))?;
    let reloaded = store.get(&key()).context("reload failed")?;

    ensure!(reloaded.shape() == original.shape());
    ensure!(reloaded.coordinates() == original.coordinates());
    ensure!(reloaded.pointing_offset() == original.pointing_offset());
    ensure!(reloaded.state() == BufferState::Primed);
    for (slot, cell) in original.cells() {
        let other = reloaded.cell(slot)?;
        ensure!(cell.bitwise_eq(other), "cell {slot:?} differs after reload");
    }

    ensure!(store.metrics().disk_loads.load(Ordering::Relaxed) == 1);
    let again = store.get(&key())?;
    ensure!(std::sync::Arc::ptr_eq(&again, &reloaded), "second get must be served from memory");
    Ok(())
}

#[test]
fn test_per_write_fsync_persists_the_same_files() -> Result<()> {
    let dir = TempDir::new()?;
    let store = CacheStore::new(config(&dir, FsyncMode::PerWrite))?;
    store.put(key(), primed_buffer()?);
    let report = store.persist(&key())?;

    ensure!(report.cells_written == 8);
    ensure!(report.directory.join(MANIFEST_FILE).is_file());
    ensure!(report.directory.join(cell_file_name([1, 1, 1])).is_file());
    ensure!(store.metrics().cells_written.load(Ordering::Relaxed) == 8);

    let integrity = store.verify(&key())?;
    ensure!(integrity.cells_checked == 8);
    ensure!(integrity.bytes_checked < report.bytes_written, "manifest is not a cell");
    Ok(())
}

#[test]
fn test_missing_cell_file_is_corrupt() -> Result<()> {
    let dir = TempDir::new()?;
    let (store, _) = persisted_store(&dir)?;
    let directory = store.key_directory(&key())?;
    fs::remove_file(directory.join(cell_file_name([1, 0, 1])))?;

    store.remove(&key());
    let err = store.get(&key()).err().context("load should fail")?;
    ensure!(err.kind() == ErrorKind::CorruptCache, "{err}");
    ensure!(err.to_string().contains("cell-0001-0000-0001.cfc"), "{err}");
    ensure!(!store.contains(&key()), "corrupt key must not be cached");
    ensure!(store.metrics().corrupt_detected.load(Ordering::Relaxed) == 1);
    Ok(())
}

#[test]
fn test_extra_cell_file_is_corrupt() -> Result<()> {
    let dir = TempDir::new()?;
    let (store, _) = persisted_store(&dir)?;
    let directory = store.key_directory(&key())?;
    fs::copy(
        directory.join(cell_file_name([0, 0, 0])),
        directory.join(cell_file_name([7, 0, 0])),
    )?;

    let err = store.verify(&key()).err().context("verify should fail")?;
    ensure!(matches!(err, CacheError::CorruptCache { .. }), "{err}");
    ensure!(err.to_string().contains("unexpected"), "{err}");
    Ok(())
}

#[test]
fn test_leftover_temporary_files_are_ignored() -> Result<()> {
    let dir = TempDir::new()?;
    let (store, _) = persisted_store(&dir)?;
    let directory = store.key_directory(&key())?;
    fs::write(directory.join("cell-0000-0000-0000.cfc.tmp"), b"half written")?;

    ensure!(store.verify(&key())?.cells_checked == 8);
    Ok(())
}

#[test]
fn test_damaged_cell_file_is_corrupt() -> Result<()> {
    let dir = TempDir::new()?;
    let (store, _) = persisted_store(&dir)?;
    let path = store.key_directory(&key())?.join(cell_file_name([0, 1, 0]));
    let mut bytes = fs::read(&path)?;
    let middle = bytes.len() - 20;
    bytes[middle] ^= 0x01;
    fs::write(&path, bytes)?;

    store.clear();
    let err = store.get(&key()).err().context("load should fail")?;
    ensure!(err.kind() == ErrorKind::CorruptCache, "{err}");
    ensure!(err.to_string().contains("checksum"), "{err}");
    Ok(())
}

#[test]
fn test_damaged_manifest_is_corrupt() -> Result<()> {
    let dir = TempDir::new()?;
    let (store, _) = persisted_store(&dir)?;
    let path = store.key_directory(&key())?.join(MANIFEST_FILE);
    let mut bytes = fs::read(&path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, bytes)?;

    let err = store.verify(&key()).err().context("verify should fail")?;
    ensure!(err.kind() == ErrorKind::CorruptCache, "{err}");
    Ok(())
}

#[test]
fn test_cell_moved_to_another_slot_is_corrupt() -> Result<()> {
    let dir = TempDir::new()?;
    let (store, _) = persisted_store(&dir)?;
    let directory = store.key_directory(&key())?;
    // same sample kind, different tags
    fs::copy(
        directory.join(cell_file_name([0, 0, 0])),
        directory.join(cell_file_name([1, 0, 0])),
    )?;

    let err = store.verify(&key()).err().context("verify should fail")?;
    ensure!(err.kind() == ErrorKind::CorruptCache, "{err}");
    ensure!(err.to_string().contains("does not belong"), "{err}");
    Ok(())
}

#[test]
fn test_unknown_key_is_not_found() -> Result<()> {
    let dir = TempDir::new()?;
    let (store, _) = persisted_store(&dir)?;
    let other = key().weights();
    let err = store.get(&other).err().context("weights were never stored")?;
    ensure!(err.is_not_found(), "{err}");
    ensure!(err.to_string().contains(&other.to_string()));
    Ok(())
}

#[test]
fn test_persist_replaces_previous_files() -> Result<()> {
    let dir = TempDir::new()?;
    let (store, _) = persisted_store(&dir)?;

    let mut smaller = KernelBuffer::with_layout(BufferLayout::new(
        1.0e6,
        100.0,
        vec![1.0e9],
        vec![0.0],
        PolarizationTables::from_elements(&[0]),
    ))?;
    smaller.fill_cell([0, 0, 0], KernelSamples::Real(ArrayD::ones(IxDyn(&[3, 3]))))?;
    store.put(key(), smaller);
    store.persist(&key())?;

    let report = store.verify(&key())?;
    ensure!(report.cells_checked == 1);
    ensure!(!report.directory.join(cell_file_name([1, 1, 1])).exists());
    Ok(())
}

#[test]
fn test_empty_cells_survive_reload() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = config(&dir, FsyncMode::PerBatch);
    config.prime_on_load = false;
    let store: CacheStore<String> = CacheStore::new(config.clone())?;

    let mut buffer = KernelBuffer::with_layout(BufferLayout::new(
        1.0,
        1.0,
        vec![1.0e9, 2.0e9],
        vec![0.0],
        PolarizationTables::from_elements(&[0]),
    ))?;
    buffer.fill_cell([1, 0, 0], KernelSamples::Real(ArrayD::zeros(IxDyn(&[2, 2]))))?;
    let name = "partial-buffer".to_string();
    store.put(name.clone(), buffer);
    store.persist(&name)?;

    let fresh: CacheStore<String> = CacheStore::new(config)?;
    let reloaded = fresh.get(&name)?;
    ensure!(reloaded.state() == BufferState::Sized);
    ensure!(reloaded.cell([0, 0, 0])?.is_empty());
    ensure!(!reloaded.cell([1, 0, 0])?.is_primed());
    Ok(())
}

#[test]
fn test_single_cell_persistence() -> Result<()> {
    let dir = TempDir::new()?;
    let buffer = primed_buffer()?;
    let cell = buffer.cell([1, 1, 1])?;

    let path = cell.make_persistent(&dir.path().join("single"), FsyncMode::None)?;
    let loaded = KernelCell::load(&path)?;
    ensure!(loaded.bitwise_eq(cell));
    ensure!(loaded.memory_usage() == 4 * 4 * 2 * 8);
    Ok(())
}

#[test]
fn test_make_persistent_into_missing_directory_is_io_error() -> Result<()> {
    let dir = TempDir::new()?;
    let buffer = primed_buffer()?;
    let cell = buffer.cell([0, 1, 0])?;

    let err = cell
        .make_persistent(&dir.path().join("no/such/dir/cell"), FsyncMode::PerWrite)
        .err()
        .context("write into a missing directory should fail")?;
    ensure!(err.kind() == ErrorKind::Io, "{err}");
    ensure!(matches!(err, CacheError::Io { .. }), "{err}");

    let leftovers: Vec<_> = fs::read_dir(dir.path())?.collect::<std::io::Result<_>>()?;
    ensure!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    Ok(())
}

#[test]
fn test_primed_buffer_is_shared_by_concurrent_readers() -> Result<()> {
    let dir = TempDir::new()?;
    let (writer, original) = persisted_store(&dir)?;
    drop(writer);

    let store: CacheStore<KernelSetKey> = CacheStore::new(config(&dir, FsyncMode::None))?;
    let expected: Vec<_> = original
        .cells()
        .map(|(_, cell)| (cell.frequency_value(), cell.w_value(), cell.mueller_element()))
        .collect();

    let handles: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| -> Result<std::sync::Arc<KernelBuffer>> {
                    let buffer = store.get(&key())?;
                    for &(frequency, w, mueller) in &expected {
                        let cell = buffer.cell_by_key(frequency, w, mueller)?;
                        let slot = buffer.get_index(frequency, w, mueller)?;
                        ensure!(cell.bitwise_eq(original.cell(slot)?), "cell {slot:?} differs");
                    }
                    Ok(buffer)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().map_err(|_| anyhow::anyhow!("reader panicked"))?)
            .collect::<Result<_>>()
    })?;

    ensure!(handles.len() == 4);
    for handle in &handles[1..] {
        ensure!(std::sync::Arc::ptr_eq(handle, &handles[0]), "readers saw different buffers");
    }
    ensure!(store.metrics().disk_loads.load(Ordering::Relaxed) == 1);
    Ok(())
}
