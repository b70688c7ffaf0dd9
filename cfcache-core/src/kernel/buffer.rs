//! Three-axis buffer of kernel cells indexed by frequency, w and Mueller
//! element.
//!
//! A buffer moves through `Empty -> Sized -> Populated -> Primed`. One
//! builder performs every structural mutation; once primed, cells are read
//! concurrently through shared references.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Slot;
use super::cell::{CellParams, KernelCell, KernelSamples};
use crate::error::{CacheError, CacheResult};
use crate::numeric::{usize_from_i32, usize_to_f64};

/// Rows of Mueller elements or polarization slot indices.
pub type PolarizationTable = Vec<Vec<i32>>;

/// Upper bound on channels generated for one spectral window.
pub const MAX_CHANNELS_PER_WINDOW: usize = 1 << 24;

const CHANNEL_BOUND_TOLERANCE: f64 = 1e-9;

/// Mapping between polarization-matrix positions and polarization slots.
///
/// `mueller_elements[r][c]` is the element stored at position `(r, c)` and
/// `mueller_element_index[r][c]` the slot it occupies along the third axis.
/// The conjugate pair plays the same role for conjugate-symmetric lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolarizationTables {
    pub mueller_elements: PolarizationTable,
    pub mueller_element_index: PolarizationTable,
    pub conjugate_mueller_elements: PolarizationTable,
    pub conjugate_mueller_element_index: PolarizationTable,
}

impl PolarizationTables {
    /// Single-row tables placing `elements[k]` at slot `k`, with identical
    /// conjugate tables.
    #[must_use]
    pub fn from_elements(elements: &[i32]) -> Self {
        let index: Vec<i32> = (0..elements.len())
            .map(|k| i32::try_from(k).unwrap_or(i32::MAX))
            .collect();
        Self {
            mueller_elements: vec![elements.to_vec()],
            mueller_element_index: vec![index.clone()],
            conjugate_mueller_elements: vec![elements.to_vec()],
            conjugate_mueller_element_index: vec![index],
        }
    }

    /// Total polarization slots: the number of entries in the direct index table.
    #[must_use]
    pub fn total_slots(&self) -> usize {
        self.mueller_element_index.iter().map(Vec::len).sum()
    }

    /// Check table consistency and return the Mueller element of every slot.
    fn slot_elements(&self) -> CacheResult<Vec<i32>> {
        const OP: &str = "resize";
        check_same_shape(
            OP,
            "mueller element tables",
            &self.mueller_elements,
            &self.mueller_element_index,
        )?;
        check_same_shape(
            OP,
            "conjugate mueller element tables",
            &self.conjugate_mueller_elements,
            &self.conjugate_mueller_element_index,
        )?;

        let total = self.total_slots();
        if total == 0 {
            return Err(CacheError::invalid_argument(OP, "polarization axis is empty"));
        }

        let mut slots: Vec<Option<i32>> = vec![None; total];
        let mut seen = HashSet::with_capacity(total);
        let pairs = self
            .mueller_elements
            .iter()
            .flatten()
            .zip(self.mueller_element_index.iter().flatten());
        for (&element, &index) in pairs {
            let slot = usize_from_i32(index).filter(|&k| k < total).ok_or_else(|| {
                CacheError::invalid_argument(
                    OP,
                    format!("polarization index {index} outside 0..{total}"),
                )
            })?;
            if slots[slot].is_some() {
                return Err(CacheError::invalid_argument(
                    OP,
                    format!("polarization slot {slot} assigned twice"),
                ));
            }
            if !seen.insert(element) {
                return Err(CacheError::invalid_argument(
                    OP,
                    format!("mueller element {element} listed twice"),
                ));
            }
            slots[slot] = Some(element);
        }

        if let Some(&bad) = self
            .conjugate_mueller_element_index
            .iter()
            .flatten()
            .find(|&&index| usize_from_i32(index).is_none_or(|k| k >= total))
        {
            return Err(CacheError::invalid_argument(
                OP,
                format!("conjugate polarization index {bad} outside 0..{total}"),
            ));
        }

        // `total` distinct in-range indices cover every slot
        Ok(slots.into_iter().flatten().collect())
    }
}

/// Everything `resize` needs to lay out a buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferLayout {
    pub frequency_increment: f64,
    pub w_increment: f64,
    /// Strictly ascending.
    pub frequency_values: Vec<f64>,
    /// Strictly ascending.
    pub w_values: Vec<f64>,
    pub polarization: PolarizationTables,
}

impl BufferLayout {
    #[must_use]
    pub const fn new(
        frequency_increment: f64,
        w_increment: f64,
        frequency_values: Vec<f64>,
        w_values: Vec<f64>,
        polarization: PolarizationTables,
    ) -> Self {
        Self {
            frequency_increment,
            w_increment,
            frequency_values,
            w_values,
            polarization,
        }
    }
}

/// One spectral window of a frequency selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpwRange {
    pub spw: i32,
    pub min_frequency: f64,
    pub max_frequency: f64,
    pub increment: f64,
}

impl SpwRange {
    /// Channel frequencies `min + c * increment` up to `max`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidArgument`] for non-finite or inverted
    /// bounds, a non-finite increment, a non-positive increment over a
    /// non-degenerate range, or
    /// more than [`MAX_CHANNELS_PER_WINDOW`] channels.
    #[allow(clippy::float_cmp)]
    pub fn channel_frequencies(&self) -> CacheResult<Vec<f64>> {
        const OP: &str = "init_maps";
        let (min, max, step) = (self.min_frequency, self.max_frequency, self.increment);
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(CacheError::invalid_argument(
                OP,
                format!("spw {} has invalid range [{min}, {max}]", self.spw),
            ));
        }
        if !step.is_finite() {
            return Err(CacheError::invalid_argument(
                OP,
                format!("spw {} has non-finite increment {step}", self.spw),
            ));
        }
        if step <= 0.0 {
            return if min == max {
                Ok(vec![min])
            } else {
                Err(CacheError::invalid_argument(
                    OP,
                    format!("spw {} has increment {step} over a non-empty range", self.spw),
                ))
            };
        }

        let bound = max + max.abs().max(min.abs()) * CHANNEL_BOUND_TOLERANCE;
        let mut frequencies = Vec::new();
        loop {
            let frequency = min + usize_to_f64(frequencies.len()) * step;
            if frequency > bound {
                break;
            }
            if frequencies.len() == MAX_CHANNELS_PER_WINDOW {
                return Err(CacheError::invalid_argument(
                    OP,
                    format!("spw {} has more than {MAX_CHANNELS_PER_WINDOW} channels", self.spw),
                ));
            }
            frequencies.push(frequency);
        }
        Ok(frequencies)
    }
}

/// Spectral windows plus the image reference frequency used for conjugate
/// frequencies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencySelection {
    pub windows: Vec<SpwRange>,
    pub reference_frequency: f64,
}

impl FrequencySelection {
    #[must_use]
    pub const fn new(reference_frequency: f64) -> Self {
        Self {
            windows: Vec::new(),
            reference_frequency,
        }
    }

    #[must_use]
    pub fn with_window(
        mut self,
        spw: i32,
        min_frequency: f64,
        max_frequency: f64,
        increment: f64,
    ) -> Self {
        self.windows.push(SpwRange {
            spw,
            min_frequency,
            max_frequency,
            increment,
        });
        self
    }
}

/// Frequency `sqrt(2 ref^2 - f^2)`, clamped at zero.
#[must_use]
pub fn conjugate_frequency(reference_frequency: f64, frequency: f64) -> f64 {
    let radicand =
        2.0f64.mul_add(reference_frequency * reference_frequency, -(frequency * frequency));
    radicand.max(0.0).sqrt()
}

/// Channel-to-slot maps built by [`KernelBuffer::init_maps`].
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyMaps {
    selection: FrequencySelection,
    direct: BTreeMap<i32, Vec<usize>>,
    conjugate: BTreeMap<i32, Vec<usize>>,
}

impl FrequencyMaps {
    /// Selection these maps are valid for.
    #[must_use]
    pub const fn selection(&self) -> &FrequencySelection {
        &self.selection
    }

    #[must_use]
    pub const fn direct(&self) -> &BTreeMap<i32, Vec<usize>> {
        &self.direct
    }

    #[must_use]
    pub const fn conjugate(&self) -> &BTreeMap<i32, Vec<usize>> {
        &self.conjugate
    }
}

/// Polarization index tables recorded by [`KernelBuffer::init_pol_maps`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolarizationMaps {
    pub direct: PolarizationTable,
    pub conjugate: PolarizationTable,
}


/// Build-phase lifecycle of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BufferState {
    /// No layout yet.
    Empty,
    /// Laid out; some cells still lack storage.
    Sized,
    /// Every cell has storage.
    Populated,
    /// Populated and warmed by [`KernelBuffer::prime_the_cache`].
    Primed,
}

/// Whether channel and polarization maps are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    Unmapped,
    /// Both `init_maps` and `init_pol_maps` succeeded since the last resize.
    Mapped,
}

/// Frequency x w x polarization grid of kernel cells.
///
/// Cells are stored flat in row-major slot order. Every cell's
/// `(frequency, w, mueller_element)` tags match the slot it occupies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelBuffer {
    cells: Vec<KernelCell>,
    shape: Slot,
    layout: BufferLayout,
    /// Mueller element held by each polarization slot.
    slot_elements: Vec<i32>,
    pointing_offset: [f64; 2],
    primed: bool,
    frequency_maps: Option<FrequencyMaps>,
    polarization_maps: Option<PolarizationMaps>,
}

impl KernelBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer resized to `layout`, every cell empty.
    ///
    /// # Errors
    ///
    /// See [`Self::resize`].
    pub fn with_layout(layout: BufferLayout) -> CacheResult<Self> {
        let mut buffer = Self::new();
        buffer.resize(layout)?;
        Ok(buffer)
    }

    /// Lay the buffer out on new axes and polarization tables.
    ///
    /// Cells whose `(frequency, w, mueller_element)` coordinate survives keep
    /// their identity and storage. New coordinates get empty cells tagged
    /// with the layout's frequency increment; cells at vanished coordinates
    /// are dropped. Frequency and polarization maps are discarded and the
    /// buffer is no longer primed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidArgument`] if an axis is empty, not
    /// finite or not strictly ascending, or if the polarization tables are
    /// inconsistent. The buffer is unchanged on error.
    pub fn resize(&mut self, layout: BufferLayout) -> CacheResult<()> {
        check_axis("frequency", &layout.frequency_values)?;
        check_axis("w", &layout.w_values)?;
        let slot_elements = layout.polarization.slot_elements()?;
        let shape = [layout.frequency_values.len(), layout.w_values.len(), slot_elements.len()];
        let total = shape
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .ok_or_else(|| {
                CacheError::invalid_argument("resize", format!("shape {shape:?} overflows"))
            })?;

        let mut previous: HashMap<Coordinate, KernelCell> = self
            .cells
            .drain(..)
            .map(|cell| (Coordinate::of(&cell), cell))
            .collect();

        let mut cells = Vec::with_capacity(total);
        let mut retained = 0usize;
        for &frequency in &layout.frequency_values {
            for &w in &layout.w_values {
                for &element in &slot_elements {
                    match previous.remove(&Coordinate::new(frequency, w, element)) {
                        Some(cell) => {
                            retained += 1;
                            cells.push(cell);
                        }
                        None => cells.push(KernelCell::tagged(
                            frequency,
                            layout.frequency_increment,
                            w,
                            element,
                        )),
                    }
                }
            }
        }

        debug!(
            retained,
            created = total - retained,
            dropped = previous.len(),
            shape = ?shape,
            "Resized kernel buffer"
        );

        self.cells = cells;
        self.shape = shape;
        self.layout = layout;
        self.slot_elements = slot_elements;
        self.primed = false;
        self.frequency_maps = None;
        self.polarization_maps = None;
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> BufferState {
        if self.cells.is_empty() {
            BufferState::Empty
        } else if self.cells.iter().any(KernelCell::is_empty) {
            BufferState::Sized
        } else if self.primed {
            BufferState::Primed
        } else {
            BufferState::Populated
        }
    }

    #[must_use]
    pub const fn map_state(&self) -> MapState {
        if self.frequency_maps.is_some() && self.polarization_maps.is_some() {
            MapState::Mapped
        } else {
            MapState::Unmapped
        }
    }

    /// `[frequency slots, w slots, polarization slots]`.
    #[must_use]
    pub const fn shape(&self) -> Slot {
        self.shape
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Axes, increments and polarization tables of the current layout.
    #[must_use]
    pub const fn coordinates(&self) -> &BufferLayout {
        &self.layout
    }

    #[must_use]
    pub fn frequency_values(&self) -> &[f64] {
        &self.layout.frequency_values
    }

    #[must_use]
    pub fn w_values(&self) -> &[f64] {
        &self.layout.w_values
    }

    /// Mueller element held by each polarization slot.
    #[must_use]
    pub fn slot_elements(&self) -> &[i32] {
        &self.slot_elements
    }

    #[must_use]
    pub const fn pointing_offset(&self) -> [f64; 2] {
        self.pointing_offset
    }

    pub const fn set_pointing_offset(&mut self, offset: [f64; 2]) {
        self.pointing_offset = offset;
    }

    #[must_use]
    pub const fn frequency_maps(&self) -> Option<&FrequencyMaps> {
        self.frequency_maps.as_ref()
    }

    #[must_use]
    pub const fn polarization_maps(&self) -> Option<&PolarizationMaps> {
        self.polarization_maps.as_ref()
    }

    /// Exact-match slot of a coordinate. Never inserts.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidState`] on an empty buffer and
    /// [`CacheError::CellNotFound`] when any of the three tags is absent.
    #[allow(clippy::float_cmp)]
    pub fn get_index(&self, frequency: f64, w: f64, mueller_element: i32) -> CacheResult<Slot> {
        self.require_sized("get_index")?;
        let not_found = || CacheError::CellNotFound {
            frequency,
            w,
            mueller_element,
        };
        let i = self
            .layout
            .frequency_values
            .iter()
            .position(|&value| value == frequency)
            .ok_or_else(not_found)?;
        let j = self
            .layout
            .w_values
            .iter()
            .position(|&value| value == w)
            .ok_or_else(not_found)?;
        let k = self
            .slot_elements
            .iter()
            .position(|&element| element == mueller_element)
            .ok_or_else(not_found)?;
        Ok([i, j, k])
    }

    /// Frequency slot closest to `query`; exact midpoints go to the lower
    /// slot. `None` for an empty buffer or a NaN query.
    #[must_use]
    pub fn nearest_frequency_slot(&self, query: f64) -> Option<usize> {
        nearest_slot(&self.layout.frequency_values, query)
    }

    /// # Errors
    ///
    /// Returns [`CacheError::InvalidState`] on an empty buffer and
    /// [`CacheError::SlotOutOfRange`] outside the buffer shape.
    pub fn cell(&self, slot: Slot) -> CacheResult<&KernelCell> {
        let index = self.flat_index("get cell", slot)?;
        Ok(&self.cells[index])
    }

    /// [`Self::get_index`] followed by [`Self::cell`].
    ///
    /// # Errors
    ///
    /// See [`Self::get_index`].
    pub fn cell_by_key(
        &self,
        frequency: f64,
        w: f64,
        mueller_element: i32,
    ) -> CacheResult<&KernelCell> {
        let slot = self.get_index(frequency, w, mueller_element)?;
        self.cell(slot)
    }

    /// Iterate over every cell with its slot, in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = (Slot, &KernelCell)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .map(move |(index, cell)| (self.slot_at(index), cell))
    }

    /// Record metadata for the cell at `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidArgument`] if the frequency, w or Mueller
    /// tags in `params` differ from the slot's coordinate or either support
    /// is negative, plus the errors of [`Self::cell`].
    pub fn set_cell_params(&mut self, slot: Slot, params: CellParams) -> CacheResult<()> {
        let index = self.flat_index("set cell params", slot)?;
        let cell = &mut self.cells[index];
        let requested =
            Coordinate::new(params.frequency_value, params.w_value, params.mueller_element);
        if requested != Coordinate::of(cell) {
            return Err(CacheError::invalid_argument(
                "set_cell_params",
                format!(
                    "tags (frequency={}, w={}, mueller={}) do not match slot {slot:?} tagged \
                     (frequency={}, w={}, mueller={})",
                    params.frequency_value,
                    params.w_value,
                    params.mueller_element,
                    cell.frequency_value(),
                    cell.w_value(),
                    cell.mueller_element()
                ),
            ));
        }
        if params.x_support < 0 || params.y_support < 0 {
            return Err(CacheError::invalid_argument(
                "set_cell_params",
                format!(
                    "negative support (x={}, y={}) for slot {slot:?}",
                    params.x_support, params.y_support
                ),
            ));
        }
        cell.set_params(params);
        self.primed = false;
        Ok(())
    }

    /// Attach samples to the cell at `slot`.
    ///
    /// # Errors
    ///
    /// See [`Self::cell`].
    pub fn fill_cell(&mut self, slot: Slot, samples: KernelSamples) -> CacheResult<()> {
        let index = self.flat_index("fill cell", slot)?;
        self.cells[index].set_samples(samples);
        self.primed = false;
        Ok(())
    }

    /// Replace the cell at `slot` with one read back from disk.
    pub(crate) fn place_cell(&mut self, slot: Slot, cell: KernelCell) -> CacheResult<()> {
        let index = self.flat_index("place cell", slot)?;
        if Coordinate::of(&cell) != Coordinate::of(&self.cells[index]) {
            return Err(CacheError::invalid_argument(
                "place cell",
                format!(
                    "cell tagged (frequency={}, w={}, mueller={}) does not belong at slot {slot:?}",
                    cell.frequency_value(),
                    cell.w_value(),
                    cell.mueller_element()
                ),
            ));
        }
        self.cells[index] = cell;
        self.primed = false;
        Ok(())
    }

    /// Build channel-to-slot maps for every window of `selection`,
    /// replacing any previous maps.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidState`] on an empty buffer and
    /// [`CacheError::InvalidArgument`] for a non-finite reference frequency,
    /// a repeated spectral window or an invalid window range.
    pub fn init_maps(&mut self, selection: &FrequencySelection) -> CacheResult<()> {
        const OP: &str = "init_maps";
        self.require_sized(OP)?;
        let reference = selection.reference_frequency;
        if !reference.is_finite() {
            return Err(CacheError::invalid_argument(
                OP,
                format!("reference frequency {reference} is not finite"),
            ));
        }

        let nearest = |frequency: f64| {
            self.nearest_frequency_slot(frequency).ok_or_else(|| {
                CacheError::invalid_argument(
                    OP,
                    format!("frequency {frequency} has no nearest slot"),
                )
            })
        };

        let mut direct = BTreeMap::new();
        let mut conjugate = BTreeMap::new();
        for window in &selection.windows {
            if direct.contains_key(&window.spw) {
                return Err(CacheError::invalid_argument(
                    OP,
                    format!("spectral window {} listed twice", window.spw),
                ));
            }
            let channels = window.channel_frequencies()?;
            let mut slots = Vec::with_capacity(channels.len());
            let mut conjugate_slots = Vec::with_capacity(channels.len());
            for &frequency in &channels {
                slots.push(nearest(frequency)?);
                conjugate_slots.push(nearest(conjugate_frequency(reference, frequency))?);
            }
            direct.insert(window.spw, slots);
            conjugate.insert(window.spw, conjugate_slots);
        }

        debug!(
            windows = selection.windows.len(),
            reference_frequency = reference,
            "Rebuilt frequency maps"
        );
        self.frequency_maps = Some(FrequencyMaps {
            selection: selection.clone(),
            direct,
            conjugate,
        });
        Ok(())
    }

    /// Frequency slot mapped for `channel` of `spw`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidState`] unless the maps were built for
    /// exactly `selection`, and [`CacheError::ChannelNotMapped`] for an
    /// unknown window or channel.
    pub fn mapped_frequency_slot(
        &self,
        selection: &FrequencySelection,
        spw: i32,
        channel: usize,
    ) -> CacheResult<usize> {
        let maps = self.maps_for("look up mapped frequency slot", selection)?;
        mapped_slot(&maps.direct, spw, channel)
    }

    /// Frequency slot mapped for the conjugate frequency of `channel`.
    ///
    /// # Errors
    ///
    /// See [`Self::mapped_frequency_slot`].
    pub fn mapped_conjugate_frequency_slot(
        &self,
        selection: &FrequencySelection,
        spw: i32,
        channel: usize,
    ) -> CacheResult<usize> {
        let maps = self.maps_for("look up mapped conjugate frequency slot", selection)?;
        mapped_slot(&maps.conjugate, spw, channel)
    }

    /// Record polarization index tables verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidState`] on an empty buffer and
    /// [`CacheError::InvalidArgument`] when either table's row lengths
    /// differ from the layout's polarization index table.
    pub fn init_pol_maps(
        &mut self,
        direct: PolarizationTable,
        conjugate: PolarizationTable,
    ) -> CacheResult<()> {
        const OP: &str = "init_pol_maps";
        self.require_sized(OP)?;
        let expected = row_lengths(&self.layout.polarization.mueller_element_index);
        let tables = [
            ("polarization map", &direct),
            ("conjugate polarization map", &conjugate),
        ];
        for (name, table) in tables {
            let actual = row_lengths(table);
            if actual != expected {
                return Err(CacheError::invalid_argument(
                    OP,
                    format!("{name} has row lengths {actual:?}, buffer expects {expected:?}"),
                ));
            }
        }
        self.polarization_maps = Some(PolarizationMaps { direct, conjugate });
        Ok(())
    }

    /// Polarization slot holding `mueller_element`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::MuellerElementNotFound`] for an unknown element.
    pub fn polarization_slot(&self, mueller_element: i32) -> CacheResult<usize> {
        self.slot_elements
            .iter()
            .position(|&element| element == mueller_element)
            .ok_or(CacheError::MuellerElementNotFound { mueller_element })
    }

    /// Polarization slot from the conjugate tables.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidState`] on an empty buffer and
    /// [`CacheError::MuellerElementNotFound`] when the conjugate tables do
    /// not list `mueller_element`.
    pub fn conjugate_slot(&self, mueller_element: i32) -> CacheResult<usize> {
        self.require_sized("conjugate_slot")?;
        let tables = &self.layout.polarization;
        tables
            .conjugate_mueller_elements
            .iter()
            .flatten()
            .zip(tables.conjugate_mueller_element_index.iter().flatten())
            .find(|&(&element, _)| element == mueller_element)
            .and_then(|(_, &index)| usize_from_i32(index))
            .ok_or(CacheError::MuellerElementNotFound { mueller_element })
    }

    /// Warm every cell for the gridding loop.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidState`] on an empty buffer.
    pub fn prime_the_cache(&mut self) -> CacheResult<()> {
        self.require_sized("prime the cache")?;
        for cell in &mut self.cells {
            cell.init_cache();
        }
        self.primed = true;
        debug!(cells = self.cells.len(), bytes = self.memory_usage(), "Primed kernel buffer");
        Ok(())
    }

    /// Bytes held by cell storage.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.cells.iter().map(KernelCell::memory_usage).sum()
    }

    /// Dump buffer metadata, then every cell. Write failures are ignored.
    pub fn show(&self, label: &str, sink: &mut dyn Write) {
        let layout = &self.layout;
        let _ = writeln!(
            sink,
            "{label}KernelBuffer: shape={:?} state={:?} maps={:?} bytes={}",
            self.shape,
            self.state(),
            self.map_state(),
            self.memory_usage()
        );
        let _ = writeln!(
            sink,
            "{label}  frequencies={:?} (incr {})",
            layout.frequency_values, layout.frequency_increment
        );
        let _ = writeln!(sink, "{label}  w={:?} (incr {})", layout.w_values, layout.w_increment);
        let _ = writeln!(
            sink,
            "{label}  mueller elements={:?} index={:?}",
            layout.polarization.mueller_elements, layout.polarization.mueller_element_index
        );
        let _ = writeln!(
            sink,
            "{label}  conjugate mueller elements={:?} index={:?}",
            layout.polarization.conjugate_mueller_elements,
            layout.polarization.conjugate_mueller_element_index
        );
        let _ = writeln!(sink, "{label}  pointing offset={:?}", self.pointing_offset);
        if let Some(maps) = &self.frequency_maps {
            for (spw, slots) in &maps.direct {
                let _ = writeln!(sink, "{label}  spw {spw}: {} channels -> {slots:?}", slots.len());
            }
        }
        for (slot, cell) in self.cells() {
            cell.show(&format!("{label}  {slot:?} "), sink);
        }
    }

    fn require_sized(&self, operation: &'static str) -> CacheResult<()> {
        if self.cells.is_empty() {
            Err(CacheError::invalid_state(
                operation,
                "buffer laid out by resize",
                "buffer is empty",
            ))
        } else {
            Ok(())
        }
    }

    fn flat_index(&self, operation: &'static str, slot: Slot) -> CacheResult<usize> {
        self.require_sized(operation)?;
        if slot.iter().zip(&self.shape).any(|(index, extent)| index >= extent) {
            return Err(CacheError::SlotOutOfRange {
                slot,
                shape: self.shape,
            });
        }
        Ok((slot[0] * self.shape[1] + slot[1]) * self.shape[2] + slot[2])
    }

    const fn slot_at(&self, index: usize) -> Slot {
        let [_, nw, np] = self.shape;
        [index / (nw * np), (index / np) % nw, index % np]
    }

    fn maps_for(
        &self,
        operation: &'static str,
        selection: &FrequencySelection,
    ) -> CacheResult<&FrequencyMaps> {
        match &self.frequency_maps {
            Some(maps) if maps.selection == *selection => Ok(maps),
            Some(_) => Err(CacheError::invalid_state(
                operation,
                "maps built for the queried frequency selection",
                "maps were built for a different frequency selection",
            )),
            None => Err(CacheError::invalid_state(
                operation,
                "frequency maps built by init_maps",
                "buffer is unmapped",
            )),
        }
    }
}

/// Cell coordinate with `-0.0` folded onto `0.0` so it can be hashed.
#[derive(Debug, PartialEq, Eq, Hash)]
struct Coordinate {
    frequency: u64,
    w: u64,
    mueller_element: i32,
}

impl Coordinate {
    fn new(frequency: f64, w: f64, mueller_element: i32) -> Self {
        Self {
            frequency: tag_bits(frequency),
            w: tag_bits(w),
            mueller_element,
        }
    }

    fn of(cell: &KernelCell) -> Self {
        Self::new(cell.frequency_value(), cell.w_value(), cell.mueller_element())
    }
}

#[allow(clippy::float_cmp)]
fn tag_bits(value: f64) -> u64 {
    if value == 0.0 { 0 } else { value.to_bits() }
}

fn check_axis(name: &str, values: &[f64]) -> CacheResult<()> {
    if values.is_empty() {
        return Err(CacheError::invalid_argument("resize", format!("{name} axis is empty")));
    }
    if let Some(bad) = values.iter().find(|value| !value.is_finite()) {
        return Err(CacheError::invalid_argument(
            "resize",
            format!("{name} axis holds non-finite value {bad}"),
        ));
    }
    if let Some(at) = values.windows(2).position(|pair| pair[0] >= pair[1]) {
        return Err(CacheError::invalid_argument(
            "resize",
            format!(
                "{name} axis is not strictly ascending at position {}: {} then {}",
                at + 1,
                values[at],
                values[at + 1]
            ),
        ));
    }
    Ok(())
}

fn row_lengths(table: &PolarizationTable) -> Vec<usize> {
    table.iter().map(Vec::len).collect()
}

fn check_same_shape(
    operation: &'static str,
    what: &str,
    elements: &PolarizationTable,
    index: &PolarizationTable,
) -> CacheResult<()> {
    let (a, b) = (row_lengths(elements), row_lengths(index));
    if a == b {
        Ok(())
    } else {
        Err(CacheError::invalid_argument(
            operation,
            format!("{what} differ in shape: {a:?} vs {b:?}"),
        ))
    }
}

fn nearest_slot(values: &[f64], query: f64) -> Option<usize> {
    if query.is_nan() || values.is_empty() {
        return None;
    }
    if query.is_infinite() {
        return Some(if query > 0.0 { values.len() - 1 } else { 0 });
    }
    let mut best: Option<(usize, f64)> = None;
    for (index, &value) in values.iter().enumerate() {
        let distance = (value - query).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {
                // ascending values only move further away past the query
                if value > query {
                    break;
                }
            }
            _ => best = Some((index, distance)),
        }
    }
    best.map(|(index, _)| index)
}

fn mapped_slot(map: &BTreeMap<i32, Vec<usize>>, spw: i32, channel: usize) -> CacheResult<usize> {
    map.get(&spw)
        .and_then(|slots| slots.get(channel))
        .copied()
        .ok_or(CacheError::ChannelNotMapped { spw, channel })
}
