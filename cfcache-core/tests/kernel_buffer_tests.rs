//! Integration tests for kernel buffer layout, lookup and mapping
//!
//! Tests verify:
//! - Resize keeps cells at surviving coordinates (same storage allocation)
//! - Deep clones of cells and buffers
//! - Exact-match indexing and nearest-frequency tie-breaking
//! - Conjugate frequency maps
//! - End-to-end build of a 2x2x2 buffer

use anyhow::{Context, Result, ensure};
use cfcache_core::{
    BufferLayout, BufferState, CacheError, ErrorKind, FrequencySelection, KernelBuffer,
    KernelSamples, PolarizationTables, Slot,
};
use ndarray::{Array2, ArrayD, IxDyn};

fn layout(frequencies: &[f64], ws: &[f64], elements: &[i32]) -> BufferLayout {
    BufferLayout::new(
        1.0e6,
        50.0,
        frequencies.to_vec(),
        ws.to_vec(),
        PolarizationTables::from_elements(elements),
    )
}

/// Distinct 3x3 kernel for a slot: value = 100 * flat slot + position.
fn kernel_for(slot: Slot, shape: Slot) -> ArrayD<f32> {
    let flat = (slot[0] * shape[1] + slot[1]) * shape[2] + slot[2];
    let base = 100.0 * flat as f32;
    Array2::from_shape_fn((3, 3), |(x, y)| base + (x * 3 + y) as f32).into_dyn()
}

fn fill_all(buffer: &mut KernelBuffer) -> Result<()> {
    let shape = buffer.shape();
    let slots: Vec<Slot> = buffer.cells().map(|(slot, _)| slot).collect();
    for slot in slots {
        let mut params = buffer.cell(slot)?.params();
        params.x_support = 1;
        params.y_support = 1;
        params.sampling_rate = 1.0;
        buffer.set_cell_params(slot, params)?;
        buffer.fill_cell(slot, KernelSamples::Real(kernel_for(slot, shape)))?;
    }
    Ok(())
}

fn real_samples(
    buffer: &KernelBuffer,
    frequency: f64,
    w: f64,
    mueller: i32,
) -> Result<ArrayD<f32>> {
    buffer
        .cell_by_key(frequency, w, mueller)?
        .samples()
        .and_then(KernelSamples::as_real)
        .cloned()
        .context("cell has no real samples")
}

#[test]
fn test_resize_retains_cells_at_surviving_coordinates() -> Result<()> {
    let mut buffer = KernelBuffer::with_layout(layout(&[1.0e9, 2.0e9], &[0.0], &[0]))?;
    fill_all(&mut buffer)?;

    let before: Vec<(f64, f64, i32, *const f32, ArrayD<f32>)> = buffer
        .cells()
        .map(|(_, cell)| {
            let real = cell.samples().and_then(KernelSamples::as_real);
            let samples = real.cloned().unwrap_or_default();
            let ptr = real.map_or(std::ptr::null(), |a| a.as_ptr());
            (cell.frequency_value(), cell.w_value(), cell.mueller_element(), ptr, samples)
        })
        .collect();

    buffer.resize(layout(&[0.5e9, 1.0e9, 1.5e9, 2.0e9], &[0.0, 100.0], &[0, 1]))?;
    ensure!(buffer.shape() == [4, 2, 2], "unexpected shape {:?}", buffer.shape());

    for (frequency, w, mueller, ptr, samples) in before {
        let cell = buffer.cell_by_key(frequency, w, mueller)?;
        let array = cell
            .samples()
            .and_then(KernelSamples::as_real)
            .context("retained cell lost its samples")?;
        ensure!(array.as_ptr() == ptr, "cell at {frequency} was reallocated");
        ensure!(*array == samples, "cell at {frequency} changed contents");
    }

    let fresh = buffer.cell_by_key(1.5e9, 100.0, 1)?;
    ensure!(fresh.is_empty());
    ensure!(fresh.frequency_increment() == 1.0e6);
    ensure!(buffer.state() == BufferState::Sized);
    Ok(())
}

#[test]
fn test_cell_clone_is_independent() -> Result<()> {
    let mut buffer = KernelBuffer::with_layout(layout(&[1.0e9], &[0.0], &[0]))?;
    fill_all(&mut buffer)?;
    let source = buffer.cell([0, 0, 0])?.clone();

    let mut copy = source.clone();
    if let Some(KernelSamples::Real(array)) = copy.samples_mut() {
        array[IxDyn(&[1, 1])] = -7.0;
    }
    let mut params = copy.params();
    params.sampling_rate = 9.0;
    copy.set_params(params);

    let original = source.samples().and_then(KernelSamples::as_real).context("no samples")?;
    ensure!(original[IxDyn(&[1, 1])] == 4.0);
    ensure!(source.sampling_rate() == 1.0);
    ensure!(buffer.cell([0, 0, 0])?.bitwise_eq(&source));
    Ok(())
}

#[test]
fn test_buffer_clone_is_independent() -> Result<()> {
    let mut source = KernelBuffer::with_layout(layout(&[1.0e9, 2.0e9], &[0.0], &[0]))?;
    fill_all(&mut source)?;
    source.prime_the_cache()?;

    let mut copy = source.clone();
    ensure!(copy == source);

    copy.fill_cell([1, 0, 0], KernelSamples::Real(ArrayD::zeros(IxDyn(&[3, 3]))))?;
    copy.set_pointing_offset([1.0, 2.0]);
    copy.resize(layout(&[1.0e9, 2.0e9, 3.0e9], &[0.0], &[0]))?;

    ensure!(source.shape() == [2, 1, 1]);
    ensure!(source.pointing_offset() == [0.0, 0.0]);
    ensure!(source.state() == BufferState::Primed);
    ensure!(real_samples(&source, 2.0e9, 0.0, 0)? == kernel_for([1, 0, 0], [2, 1, 1]));

    // and the other way round
    source.fill_cell([0, 0, 0], KernelSamples::Real(ArrayD::zeros(IxDyn(&[3, 3]))))?;
    ensure!(real_samples(&copy, 1.0e9, 0.0, 0)? == kernel_for([0, 0, 0], [2, 1, 1]));
    Ok(())
}

#[test]
fn test_get_index_round_trips_every_cell() -> Result<()> {
    let layout = layout(&[1.0e9, 1.1e9, 1.2e9], &[-50.0, 0.0, 50.0], &[0, 5, 10, 15]);
    let buffer = KernelBuffer::with_layout(layout)?;
    for (slot, cell) in buffer.cells() {
        let found =
            buffer.get_index(cell.frequency_value(), cell.w_value(), cell.mueller_element())?;
        ensure!(found == slot, "{found:?} != {slot:?}");
    }
    Ok(())
}

#[test]
fn test_get_index_never_matches_nearest() -> Result<()> {
    let buffer = KernelBuffer::with_layout(layout(&[1.0e9, 1.1e9], &[0.0], &[0]))?;
    let result = buffer.get_index(1.05e9, 0.0, 0);
    ensure!(matches!(result, Err(CacheError::CellNotFound { .. })), "{result:?}");
    ensure!(buffer.cell_by_key(1.0e9, 0.0, 1).is_err_and(|e| e.kind() == ErrorKind::NotFound));
    Ok(())
}

#[test]
fn test_nearest_frequency_slot_ties_to_lower_index() -> Result<()> {
    let buffer = KernelBuffer::with_layout(layout(&[100.0, 200.0, 300.0], &[0.0], &[0]))?;
    ensure!(buffer.nearest_frequency_slot(149.0) == Some(0));
    ensure!(buffer.nearest_frequency_slot(151.0) == Some(1));
    ensure!(buffer.nearest_frequency_slot(150.0) == Some(0));
    ensure!(buffer.nearest_frequency_slot(250.0) == Some(1));
    ensure!(buffer.nearest_frequency_slot(-1.0e12) == Some(0));
    ensure!(buffer.nearest_frequency_slot(1.0e12) == Some(2));
    ensure!(buffer.nearest_frequency_slot(f64::NAN).is_none());
    Ok(())
}

#[test]
fn test_conjugate_map_uses_conjugate_frequency() -> Result<()> {
    let mut buffer = KernelBuffer::with_layout(layout(&[100.0, 150.0, 200.0], &[0.0], &[0]))?;
    let selection = FrequencySelection::new(150.0).with_window(0, 100.0, 100.0, 0.0);
    buffer.init_maps(&selection)?;

    let conjugate = (2.0f64 * 150.0 * 150.0 - 100.0 * 100.0).sqrt();
    ensure!((conjugate - 187.08).abs() < 0.01);

    let direct_slot = buffer.mapped_frequency_slot(&selection, 0, 0)?;
    let conjugate_slot = buffer.mapped_conjugate_frequency_slot(&selection, 0, 0)?;
    ensure!(direct_slot == 0);
    ensure!(Some(conjugate_slot) == buffer.nearest_frequency_slot(conjugate));
    ensure!(conjugate_slot == 2);
    Ok(())
}

#[test]
fn test_maps_cover_every_channel_of_every_window() -> Result<()> {
    let mut buffer = KernelBuffer::with_layout(layout(&[1.0e9, 1.5e9, 2.0e9], &[0.0], &[0]))?;
    let selection = FrequencySelection::new(1.5e9)
        .with_window(0, 1.0e9, 1.2e9, 0.1e9)
        .with_window(7, 1.8e9, 2.0e9, 0.05e9);
    buffer.init_maps(&selection)?;
    buffer.init_pol_maps(vec![vec![0]], vec![vec![0]])?;

    let maps = buffer.frequency_maps().context("maps missing")?;
    ensure!(maps.direct()[&0] == vec![0, 0, 0]);
    ensure!(maps.direct()[&7] == vec![2, 2, 2, 2, 2]);
    ensure!(maps.conjugate()[&7].len() == 5);
    ensure!(buffer.map_state() == cfcache_core::MapState::Mapped);
    Ok(())
}

#[test]
fn test_end_to_end_two_by_two_by_two() -> Result<()> {
    let mut buffer = KernelBuffer::with_layout(layout(&[1.0e9, 2.0e9], &[0.0, 100.0], &[0, 1]))?;
    ensure!(buffer.len() == 8);
    fill_all(&mut buffer)?;
    ensure!(buffer.state() == BufferState::Populated);
    buffer.prime_the_cache()?;
    ensure!(buffer.state() == BufferState::Primed);

    let expected = kernel_for([0, 1, 1], buffer.shape());
    let cell = buffer.cell_by_key(1.0e9, 100.0, 1)?;
    ensure!(cell.x_support() == 1 && cell.y_support() == 1);
    let got = cell.real_slice().context("primed cell is not contiguous")?;
    ensure!(got == expected.as_slice().context("expected is not contiguous")?);

    for (slot, other) in buffer.cells() {
        if slot == [0, 1, 1] {
            continue;
        }
        ensure!(other.real_slice() != Some(got), "slot {slot:?} shares the kernel");
    }
    Ok(())
}
