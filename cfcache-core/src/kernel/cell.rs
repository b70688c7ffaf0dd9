//! A single convolution-function kernel and its tag metadata.

use std::io::Write;
use std::path::{Path, PathBuf};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::CacheResult;
use crate::storage::{FsyncMode, format};

/// Complex sample type used by complex-valued kernels.
pub type Complex32 = num_complex::Complex<f32>;

/// Discriminant for the sample payload of a cell, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SampleKind {
    /// No storage attached yet.
    Empty = 0,
    Real = 1,
    Complex = 2,
}

impl SampleKind {
    pub(crate) const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Empty),
            1 => Some(Self::Real),
            2 => Some(Self::Complex),
            _ => None,
        }
    }

    /// Bytes per persisted sample.
    #[must_use]
    pub const fn sample_bytes(self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Real => 4,
            Self::Complex => 8,
        }
    }
}

/// Owned N-dimensional kernel samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelSamples {
    Real(ArrayD<f32>),
    Complex(ArrayD<Complex32>),
}

impl KernelSamples {
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Real(a) => a.shape(),
            Self::Complex(a) => a.shape(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Real(a) => a.len(),
            Self::Complex(a) => a.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn kind(&self) -> SampleKind {
        match self {
            Self::Real(_) => SampleKind::Real,
            Self::Complex(_) => SampleKind::Complex,
        }
    }

    #[must_use]
    pub const fn as_real(&self) -> Option<&ArrayD<f32>> {
        match self {
            Self::Real(a) => Some(a),
            Self::Complex(_) => None,
        }
    }

    #[must_use]
    pub const fn as_complex(&self) -> Option<&ArrayD<Complex32>> {
        match self {
            Self::Complex(a) => Some(a),
            Self::Real(_) => None,
        }
    }

    /// Bytes held by the sample buffer.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.len() * self.kind().sample_bytes()
    }

    /// Re-lay the samples out contiguously in row-major order if they are not
    /// already; logical contents are unchanged.
    fn make_standard_layout(&mut self) {
        match self {
            Self::Real(a) if !a.is_standard_layout() => *a = a.as_standard_layout().into_owned(),
            Self::Complex(a) if !a.is_standard_layout() => {
                *a = a.as_standard_layout().into_owned();
            }
            _ => {}
        }
    }
}

/// Reference-pixel / reference-value / increment metadata used to re-tag
/// output images. Carried verbatim; the cache never interprets it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinateDescriptor {
    pub reference_pixel: Vec<f64>,
    pub reference_value: Vec<f64>,
    pub increment: Vec<f64>,
    pub axis_names: Vec<String>,
}

/// Scalar metadata recorded by [`KernelCell::set_params`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellParams {
    pub sampling_rate: f32,
    pub x_support: i32,
    pub y_support: i32,
    pub frequency_value: f64,
    pub frequency_increment: f64,
    pub w_value: f64,
    pub mueller_element: i32,
    pub coordinates: CoordinateDescriptor,
}

/// Derived layout state computed by [`KernelCell::init_cache`] for the
/// gridding inner loop.
///
/// The first two axes are the kernel's u/v axes; any trailing axes are
/// folded into `planes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellAccessor {
    nx: usize,
    ny: usize,
    planes: usize,
    center: (usize, usize),
    /// Reach from the center, in samples, covered by the support radius.
    reach: (usize, usize),
}

impl CellAccessor {
    fn new(shape: &[usize], sampling_rate: f32, x_support: i32, y_support: i32) -> Option<Self> {
        let (&nx, rest) = shape.split_first()?;
        let ny = rest.first().copied().unwrap_or(1);
        let planes = rest.iter().skip(1).product::<usize>();
        if nx == 0 || ny == 0 || planes == 0 {
            return None;
        }
        let center = (nx / 2, ny / 2);
        let reach = |support: i32, limit: usize| {
            let samples = f64::from(support.max(0)) * f64::from(sampling_rate.max(0.0));
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let samples = samples.ceil().min(f64::from(u32::MAX)) as usize;
            samples.min(limit)
        };
        Some(Self {
            nx,
            ny,
            planes,
            center,
            reach: (
                reach(x_support, center.0.min(nx - 1 - center.0)),
                reach(y_support, center.1.min(ny - 1 - center.1)),
            ),
        })
    }

    #[must_use]
    pub const fn extent(&self) -> (usize, usize) {
        (self.nx, self.ny)
    }

    #[must_use]
    pub const fn center(&self) -> (usize, usize) {
        self.center
    }

    #[must_use]
    pub const fn reach(&self) -> (usize, usize) {
        self.reach
    }

    #[must_use]
    pub const fn planes(&self) -> usize {
        self.planes
    }

    /// Row-major offset of the sample at `(center + dx, center + dy)` in
    /// `plane`, or `None` when it falls outside the support reach.
    #[inline]
    #[must_use]
    pub fn flat_index(&self, dx: isize, dy: isize, plane: usize) -> Option<usize> {
        if dx.unsigned_abs() > self.reach.0
            || dy.unsigned_abs() > self.reach.1
            || plane >= self.planes
        {
            return None;
        }
        let x = self.center.0.checked_add_signed(dx)?;
        let y = self.center.1.checked_add_signed(dy)?;
        Some((x * self.ny + y) * self.planes + plane)
    }
}

/// One convolution-function kernel plus the tags that place it in a buffer.
#[derive(Debug, Clone, Default)]
pub struct KernelCell {
    samples: Option<KernelSamples>,
    frequency_value: f64,
    frequency_increment: f64,
    w_value: f64,
    mueller_element: i32,
    sampling_rate: f32,
    x_support: i32,
    y_support: i32,
    coordinates: CoordinateDescriptor,
    accessor: Option<CellAccessor>,
}

impl KernelCell {
    /// An empty cell carrying only its coordinate tags.
    #[must_use]
    pub fn tagged(
        frequency_value: f64,
        frequency_increment: f64,
        w_value: f64,
        mueller_element: i32,
    ) -> Self {
        Self {
            frequency_value,
            frequency_increment,
            w_value,
            mueller_element,
            ..Self::default()
        }
    }

    /// Record all scalar metadata. Storage is left untouched.
    pub fn set_params(&mut self, params: CellParams) {
        self.sampling_rate = params.sampling_rate;
        self.x_support = params.x_support;
        self.y_support = params.y_support;
        self.frequency_value = params.frequency_value;
        self.frequency_increment = params.frequency_increment;
        self.w_value = params.w_value;
        self.mueller_element = params.mueller_element;
        self.coordinates = params.coordinates;
        self.accessor = None;
    }

    /// Current scalar metadata.
    #[must_use]
    pub fn params(&self) -> CellParams {
        CellParams {
            sampling_rate: self.sampling_rate,
            x_support: self.x_support,
            y_support: self.y_support,
            frequency_value: self.frequency_value,
            frequency_increment: self.frequency_increment,
            w_value: self.w_value,
            mueller_element: self.mueller_element,
            coordinates: self.coordinates.clone(),
        }
    }

    /// Attach kernel samples, replacing any previous storage.
    pub fn set_samples(&mut self, samples: KernelSamples) {
        self.samples = Some(samples);
        self.accessor = None;
    }

    #[must_use]
    pub const fn samples(&self) -> Option<&KernelSamples> {
        self.samples.as_ref()
    }

    /// Mutable access to the samples. Discards derived state; call
    /// [`Self::init_cache`] again afterwards.
    pub fn samples_mut(&mut self) -> Option<&mut KernelSamples> {
        self.accessor = None;
        self.samples.as_mut()
    }

    /// Contiguous real samples, available once the cell has been primed.
    #[must_use]
    pub fn real_slice(&self) -> Option<&[f32]> {
        self.samples.as_ref()?.as_real()?.as_slice()
    }

    /// Contiguous complex samples, available once the cell has been primed.
    #[must_use]
    pub fn complex_slice(&self) -> Option<&[Complex32]> {
        self.samples.as_ref()?.as_complex()?.as_slice()
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match &self.samples {
            Some(samples) => samples.shape(),
            None => &[],
        }
    }

    #[must_use]
    pub fn sample_kind(&self) -> SampleKind {
        self.samples.as_ref().map_or(SampleKind::Empty, KernelSamples::kind)
    }

    /// True while no storage is attached.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.samples.is_none()
    }

    #[must_use]
    pub const fn frequency_value(&self) -> f64 {
        self.frequency_value
    }

    #[must_use]
    pub const fn frequency_increment(&self) -> f64 {
        self.frequency_increment
    }

    #[must_use]
    pub const fn w_value(&self) -> f64 {
        self.w_value
    }

    #[must_use]
    pub const fn mueller_element(&self) -> i32 {
        self.mueller_element
    }

    #[must_use]
    pub const fn sampling_rate(&self) -> f32 {
        self.sampling_rate
    }

    #[must_use]
    pub const fn x_support(&self) -> i32 {
        self.x_support
    }

    #[must_use]
    pub const fn y_support(&self) -> i32 {
        self.y_support
    }

    #[must_use]
    pub const fn coordinates(&self) -> &CoordinateDescriptor {
        &self.coordinates
    }

    #[must_use]
    pub const fn accessor(&self) -> Option<&CellAccessor> {
        self.accessor.as_ref()
    }

    #[must_use]
    pub const fn is_primed(&self) -> bool {
        self.accessor.is_some()
    }

    /// Warm the derived state used by the gridding loop: contiguous layout
    /// and the bounds accessor.
    ///
    /// Does nothing when no storage is attached yet. Calling it again leaves
    /// the same observable state.
    pub fn init_cache(&mut self) {
        let Some(samples) = self.samples.as_mut() else {
            return;
        };
        samples.make_standard_layout();
        self.accessor = CellAccessor::new(
            samples.shape(),
            self.sampling_rate,
            self.x_support,
            self.y_support,
        );
    }

    /// Bytes held by the sample storage.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.samples.as_ref().map_or(0, KernelSamples::memory_usage)
    }

    /// Write this cell as one file at `path_prefix` plus the cell extension.
    ///
    /// Returns the path written.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CacheError::Io`] if the file cannot be created or
    /// written, and [`crate::CacheError::Encoding`] if the coordinate
    /// descriptor cannot be encoded.
    pub fn make_persistent(&self, path_prefix: &Path, fsync: FsyncMode) -> CacheResult<PathBuf> {
        let (path, _) = format::write_cell(path_prefix, self, fsync)?;
        Ok(path)
    }

    /// Read a cell written by [`Self::make_persistent`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::CacheError::Io`] when the file cannot be read and
    /// [`crate::CacheError::CorruptCache`] when its checksums or layout do
    /// not verify.
    pub fn load(path: &Path) -> CacheResult<Self> {
        format::read_cell(path).map(|(cell, _)| cell)
    }

    /// Human-readable metadata dump. Write failures are ignored.
    pub fn show(&self, label: &str, sink: &mut dyn Write) {
        let _ = writeln!(
            sink,
            "{label}KernelCell: freq={} (incr {}) w={} mueller={} sampling={} support=({}, {}) \
             shape={:?} kind={:?} bytes={} primed={}",
            self.frequency_value,
            self.frequency_increment,
            self.w_value,
            self.mueller_element,
            self.sampling_rate,
            self.x_support,
            self.y_support,
            self.shape(),
            self.sample_kind(),
            self.memory_usage(),
            self.is_primed(),
        );
        if !self.coordinates.reference_value.is_empty() {
            let _ = writeln!(
                sink,
                "{label}  coordinates: refpix={:?} refval={:?} incr={:?} axes={:?}",
                self.coordinates.reference_pixel,
                self.coordinates.reference_value,
                self.coordinates.increment,
                self.coordinates.axis_names,
            );
        }
    }

    /// Bitwise comparison of metadata and samples; derived state is ignored.
    #[must_use]
    pub fn bitwise_eq(&self, other: &Self) -> bool {
        let samples_eq = match (&self.samples, &other.samples) {
            (None, None) => true,
            (Some(KernelSamples::Real(a)), Some(KernelSamples::Real(b))) => {
                a.shape() == b.shape()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Some(KernelSamples::Complex(a)), Some(KernelSamples::Complex(b))) => {
                a.shape() == b.shape()
                    && a.iter().zip(b.iter()).all(|(x, y)| {
                        x.re.to_bits() == y.re.to_bits() && x.im.to_bits() == y.im.to_bits()
                    })
            }
            _ => false,
        };
        samples_eq
            && self.frequency_value.to_bits() == other.frequency_value.to_bits()
            && self.frequency_increment.to_bits() == other.frequency_increment.to_bits()
            && self.w_value.to_bits() == other.w_value.to_bits()
            && self.mueller_element == other.mueller_element
            && self.sampling_rate.to_bits() == other.sampling_rate.to_bits()
            && self.x_support == other.x_support
            && self.y_support == other.y_support
            && self.coordinates == other.coordinates
    }

    pub(crate) fn from_parts(params: CellParams, samples: Option<KernelSamples>) -> Self {
        let mut cell = Self::default();
        cell.set_params(params);
        cell.samples = samples;
        cell
    }
}

impl PartialEq for KernelCell {
    fn eq(&self, other: &Self) -> bool {
        self.samples == other.samples
            && self.frequency_value == other.frequency_value
            && self.frequency_increment == other.frequency_increment
            && self.w_value == other.w_value
            && self.mueller_element == other.mueller_element
            && self.sampling_rate == other.sampling_rate
            && self.x_support == other.x_support
            && self.y_support == other.y_support
            && self.coordinates == other.coordinates
    }
}
