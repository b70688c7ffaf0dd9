//! Buffer manifest: the complete list of cells one persist wrote.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cell_file_name;
use crate::kernel::{BufferLayout, KernelBuffer, SampleKind, Slot};

/// One expected cell file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub slot: Slot,
    pub file_name: String,
    pub sample_kind: SampleKind,
}

/// Everything needed to rebuild a buffer and to tell whether the cell files
/// on disk are the ones a single persist produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Storage name of the key the buffer was persisted under.
    pub key: String,
    pub persisted_at: DateTime<Utc>,
    pub shape: Slot,
    pub layout: BufferLayout,
    pub pointing_offset: [f64; 2],
    /// Row-major, one entry per slot.
    pub cells: Vec<ManifestEntry>,
}

impl Manifest {
    /// Describe `buffer` as it is about to be persisted under `key`.
    #[must_use]
    pub fn from_buffer(key: &str, buffer: &KernelBuffer) -> Self {
        Self {
            key: key.to_string(),
            persisted_at: Utc::now(),
            shape: buffer.shape(),
            layout: buffer.coordinates().clone(),
            pointing_offset: buffer.pointing_offset(),
            cells: buffer
                .cells()
                .map(|(slot, cell)| ManifestEntry {
                    slot,
                    file_name: cell_file_name(slot),
                    sample_kind: cell.sample_kind(),
                })
                .collect(),
        }
    }

    /// File names of every expected cell.
    #[must_use]
    pub fn expected_files(&self) -> BTreeSet<String> {
        self.cells.iter().map(|entry| entry.file_name.clone()).collect()
    }

    /// Check that the entries cover every slot of `shape` exactly once and
    /// that the shape agrees with the layout. Returns a description of the
    /// first inconsistency.
    pub(crate) fn check_complete(&self) -> Result<(), String> {
        let [nf, nw, np] = self.shape;
        let layout_shape = [
            self.layout.frequency_values.len(),
            self.layout.w_values.len(),
            self.layout.polarization.total_slots(),
        ];
        if layout_shape != self.shape {
            return Err(format!(
                "manifest shape {:?} disagrees with its layout {layout_shape:?}",
                self.shape
            ));
        }

        let expected = nf.saturating_mul(nw).saturating_mul(np);
        if self.cells.len() != expected {
            return Err(format!(
                "manifest lists {} cells, shape {:?} needs {expected}",
                self.cells.len(),
                self.shape
            ));
        }

        let mut seen = BTreeSet::new();
        for entry in &self.cells {
            if entry.slot.iter().zip(&self.shape).any(|(index, extent)| index >= extent) {
                return Err(format!(
                    "manifest slot {:?} outside shape {:?}",
                    entry.slot, self.shape
                ));
            }
            if !seen.insert(entry.slot) {
                return Err(format!("manifest lists slot {:?} twice", entry.slot));
            }
            if entry.file_name != cell_file_name(entry.slot) {
                return Err(format!(
                    "manifest names '{}' for slot {:?}",
                    entry.file_name, entry.slot
                ));
            }
        }
        Ok(())
    }
}
