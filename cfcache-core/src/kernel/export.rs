//! Flat exports of cells and buffers
//!
//! Every export owns fresh allocations made for that call only: plain
//! vectors and scalars, no references back into the source. They are meant
//! to cross a process or FFI boundary, so nested tables are flattened into
//! value arrays plus row lengths.

use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use super::buffer::{KernelBuffer, PolarizationTable};
use super::cell::{
    CellParams, Complex32, CoordinateDescriptor, KernelCell, KernelSamples, SampleKind,
};
use crate::error::{CacheError, CacheResult};
use crate::numeric::{i32_from_usize, usize_from_i32};

/// Flattened [`KernelCell`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellStruct {
    pub sample_kind: SampleKind,
    pub shape: Vec<i32>,
    /// Row-major samples; complex samples interleave real and imaginary parts.
    pub data: Vec<f32>,
    pub sampling_rate: f32,
    pub x_support: i32,
    pub y_support: i32,
    pub frequency_value: f64,
    pub frequency_increment: f64,
    pub w_value: f64,
    pub mueller_element: i32,
    pub reference_pixel: Vec<f64>,
    pub reference_value: Vec<f64>,
    pub increment: Vec<f64>,
    pub axis_names: Vec<String>,
}

/// Ragged `i32` table stored as concatenated rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatTable {
    pub values: Vec<i32>,
    pub row_lengths: Vec<i32>,
}

impl FlatTable {
    fn from_table(table: &PolarizationTable) -> CacheResult<Self> {
        Ok(Self {
            values: table.iter().flatten().copied().collect(),
            row_lengths: table
                .iter()
                .map(|row| i32_from_usize(row.len(), "polarization table row"))
                .collect::<CacheResult<_>>()?,
        })
    }

    /// Rebuild the nested table.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidArgument`] when the row lengths are
    /// negative or do not add up to the number of values.
    pub fn to_table(&self) -> CacheResult<PolarizationTable> {
        let mut rest = self.values.as_slice();
        let mut table = Vec::with_capacity(self.row_lengths.len());
        for &length in &self.row_lengths {
            let length = usize_from_i32(length)
                .filter(|&n| n <= rest.len())
                .ok_or_else(|| {
                    CacheError::invalid_argument(
                        "FlatTable::to_table",
                        format!("bad row length {length}"),
                    )
                })?;
            let (row, tail) = rest.split_at(length);
            table.push(row.to_vec());
            rest = tail;
        }
        if rest.is_empty() {
            Ok(table)
        } else {
            Err(CacheError::invalid_argument(
                "FlatTable::to_table",
                format!("{} values left over after the last row", rest.len()),
            ))
        }
    }
}

/// Per-spectral-window slot lists. Window `spws[n]` owns
/// `slots[offsets[n]..offsets[n + 1]]`, one entry per channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatFrequencyMap {
    pub spws: Vec<i32>,
    pub offsets: Vec<i32>,
    pub slots: Vec<i32>,
}

impl FlatFrequencyMap {
    fn from_map(map: &BTreeMap<i32, Vec<usize>>) -> CacheResult<Self> {
        let mut flat = Self {
            spws: Vec::with_capacity(map.len()),
            offsets: vec![0],
            slots: Vec::new(),
        };
        for (&spw, slots) in map {
            flat.spws.push(spw);
            for &slot in slots {
                flat.slots.push(i32_from_usize(slot, "frequency map slot")?);
            }
            flat.offsets.push(i32_from_usize(flat.slots.len(), "frequency map offset")?);
        }
        Ok(flat)
    }

    /// Slots mapped for `spw`, if the window is present.
    #[must_use]
    pub fn window(&self, spw: i32) -> Option<&[i32]> {
        let n = self.spws.iter().position(|&s| s == spw)?;
        let start = usize_from_i32(*self.offsets.get(n)?)?;
        let end = usize_from_i32(*self.offsets.get(n + 1)?)?;
        self.slots.get(start..end)
    }
}

/// Flattened [`KernelBuffer`]. Cells are listed in row-major slot order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferStruct {
    pub shape: [i32; 3],
    pub frequency_increment: f64,
    pub w_increment: f64,
    pub cells: Vec<CellStruct>,
    pub pointing_offset: [f64; 2],
    pub frequency_values: Vec<f64>,
    pub w_values: Vec<f64>,
    pub mueller_elements: FlatTable,
    pub mueller_element_index: FlatTable,
    pub conjugate_mueller_elements: FlatTable,
    pub conjugate_mueller_element_index: FlatTable,
    /// Reference frequency of the mapped selection; `None` when unmapped.
    pub reference_frequency: Option<f64>,
    pub frequency_map: FlatFrequencyMap,
    pub conjugate_frequency_map: FlatFrequencyMap,
}

impl KernelCell {
    /// Flatten into freshly allocated vectors.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidArgument`] if an extent exceeds `i32`.
    pub fn to_struct(&self) -> CacheResult<CellStruct> {
        let shape = self
            .shape()
            .iter()
            .map(|&extent| i32_from_usize(extent, "cell shape"))
            .collect::<CacheResult<Vec<_>>>()?;
        let data = match self.samples() {
            None => Vec::new(),
            Some(KernelSamples::Real(array)) => array.iter().copied().collect(),
            Some(KernelSamples::Complex(array)) => {
                array.iter().flat_map(|c| [c.re, c.im]).collect()
            }
        };
        let coordinates = self.coordinates().clone();
        Ok(CellStruct {
            sample_kind: self.sample_kind(),
            shape,
            data,
            sampling_rate: self.sampling_rate(),
            x_support: self.x_support(),
            y_support: self.y_support(),
            frequency_value: self.frequency_value(),
            frequency_increment: self.frequency_increment(),
            w_value: self.w_value(),
            mueller_element: self.mueller_element(),
            reference_pixel: coordinates.reference_pixel,
            reference_value: coordinates.reference_value,
            increment: coordinates.increment,
            axis_names: coordinates.axis_names,
        })
    }

    /// Rebuild a cell from [`Self::to_struct`] output.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidArgument`] when the shape is negative or
    /// does not match the number of values.
    pub fn from_struct(flat: &CellStruct) -> CacheResult<Self> {
        const OP: &str = "KernelCell::from_struct";
        let shape = flat
            .shape
            .iter()
            .map(|&extent| {
                usize_from_i32(extent).ok_or_else(|| {
                    CacheError::invalid_argument(OP, format!("negative extent {extent}"))
                })
            })
            .collect::<CacheResult<Vec<_>>>()?;

        let values_per_sample = match flat.sample_kind {
            SampleKind::Empty => 0,
            SampleKind::Real => 1,
            SampleKind::Complex => 2,
        };
        let expected = if flat.sample_kind == SampleKind::Empty {
            shape.is_empty().then_some(0)
        } else {
            shape
                .iter()
                .try_fold(1usize, |acc, &n| acc.checked_mul(n))
                .and_then(|count| count.checked_mul(values_per_sample))
        };
        if expected != Some(flat.data.len()) {
            return Err(CacheError::invalid_argument(
                OP,
                format!(
                    "{} values do not fill {:?} samples of shape {shape:?}",
                    flat.data.len(),
                    flat.sample_kind
                ),
            ));
        }

        let shape_error = |e: ndarray::ShapeError| CacheError::invalid_argument(OP, e.to_string());
        let samples = match flat.sample_kind {
            SampleKind::Empty => None,
            SampleKind::Real => Some(KernelSamples::Real(
                ArrayD::from_shape_vec(IxDyn(&shape), flat.data.clone()).map_err(shape_error)?,
            )),
            SampleKind::Complex => {
                let data: Vec<Complex32> = flat
                    .data
                    .chunks_exact(2)
                    .map(|pair| Complex32::new(pair[0], pair[1]))
                    .collect();
                Some(KernelSamples::Complex(
                    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(shape_error)?,
                ))
            }
        };

        let params = CellParams {
            sampling_rate: flat.sampling_rate,
            x_support: flat.x_support,
            y_support: flat.y_support,
            frequency_value: flat.frequency_value,
            frequency_increment: flat.frequency_increment,
            w_value: flat.w_value,
            mueller_element: flat.mueller_element,
            coordinates: CoordinateDescriptor {
                reference_pixel: flat.reference_pixel.clone(),
                reference_value: flat.reference_value.clone(),
                increment: flat.increment.clone(),
                axis_names: flat.axis_names.clone(),
            },
        };
        Ok(Self::from_parts(params, samples))
    }
}

impl KernelBuffer {
    /// Flatten the whole buffer. The source is only read.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidArgument`] if an extent or slot index
    /// exceeds `i32`.
    pub fn to_struct(&self) -> CacheResult<BufferStruct> {
        let layout = self.coordinates();
        let [nf, nw, np] = self.shape();
        let cells = self
            .cells()
            .map(|(_, cell)| cell.to_struct())
            .collect::<CacheResult<Vec<_>>>()?;
        let maps = self.frequency_maps();
        let empty = BTreeMap::new();

        Ok(BufferStruct {
            shape: [
                i32_from_usize(nf, "buffer shape")?,
                i32_from_usize(nw, "buffer shape")?,
                i32_from_usize(np, "buffer shape")?,
            ],
            frequency_increment: layout.frequency_increment,
            w_increment: layout.w_increment,
            cells,
            pointing_offset: self.pointing_offset(),
            frequency_values: layout.frequency_values.clone(),
            w_values: layout.w_values.clone(),
            mueller_elements: FlatTable::from_table(&layout.polarization.mueller_elements)?,
            mueller_element_index: FlatTable::from_table(
                &layout.polarization.mueller_element_index,
            )?,
            conjugate_mueller_elements: FlatTable::from_table(
                &layout.polarization.conjugate_mueller_elements,
            )?,
            conjugate_mueller_element_index: FlatTable::from_table(
                &layout.polarization.conjugate_mueller_element_index,
            )?,
            reference_frequency: maps.map(|m| m.selection().reference_frequency),
            frequency_map: FlatFrequencyMap::from_map(maps.map_or(&empty, |m| m.direct()))?,
            conjugate_frequency_map: FlatFrequencyMap::from_map(
                maps.map_or(&empty, |m| m.conjugate()),
            )?,
        })
    }
}
