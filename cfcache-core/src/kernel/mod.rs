//! Kernel cells and the three-axis buffers that hold them

pub mod buffer;
pub mod cell;
pub mod export;

pub use buffer::{
    BufferLayout, BufferState, FrequencyMaps, FrequencySelection, KernelBuffer, MapState,
    PolarizationMaps, PolarizationTable, PolarizationTables, SpwRange, conjugate_frequency,
};
pub use cell::{
    CellAccessor, CellParams, Complex32, CoordinateDescriptor, KernelCell, KernelSamples,
    SampleKind,
};
pub use export::{BufferStruct, CellStruct, FlatFrequencyMap, FlatTable};

/// `[frequency, w, polarization]` position of a cell in a buffer.
pub type Slot = [usize; 3];
