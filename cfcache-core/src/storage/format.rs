//! Binary layouts of persisted cells and manifests
//!
//! Cell file (all integers and floats little-endian):
//!
//! ```text
//! magic u32 | version u16 | sample kind u8 | reserved u8
//! frequency_value f64 | frequency_increment f64 | w_value f64
//! mueller_element i32 | sampling_rate f32 | x_support i32 | y_support i32
//! rank u32 | shape i32[rank]
//! descriptor_len u32 | descriptor (bincode)
//! payload_len u64 | header_crc u32
//! payload (row-major samples; complex as re, im) | payload_crc u32
//! ```
//!
//! Manifest file:
//!
//! ```text
//! magic u32 | version u16 | reserved u16 | body_len u64 | body_crc u32 | body (bincode)
//! ```
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! reader never observes a half-written file under its final name.

// Allow unsafe code for read-only memory mapping of cell files
#![allow(unsafe_code)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crc32c::{crc32c, crc32c_append};
use memmap2::Mmap;
use ndarray::{ArrayD, IxDyn};

use super::manifest::Manifest;
use super::{CELL_EXTENSION, FsyncMode};
use crate::error::{CacheError, CacheResult};
use crate::kernel::{
    CellParams, Complex32, CoordinateDescriptor, KernelCell, KernelSamples, SampleKind,
};
use crate::numeric::{
    i32_from_usize, u32_from_usize, u64_from_usize, usize_from_i32, usize_from_u64,
};

const CELL_MAGIC: u32 = 0x3143_4643; // "CFC1"
const MANIFEST_MAGIC: u32 = 0x314D_4643; // "CFM1"
const FORMAT_VERSION: u16 = 1;
const MAX_RANK: usize = 16;
const PAYLOAD_CHUNK: usize = 64 * 1024;

/// Write `cell` to `path_prefix` + `.cfc`. Returns the final path and the
/// number of bytes written.
pub(crate) fn write_cell(
    path_prefix: &Path,
    cell: &KernelCell,
    fsync: FsyncMode,
) -> CacheResult<(PathBuf, u64)> {
    let path = append_extension(path_prefix, CELL_EXTENSION);
    let header = encode_cell_header(cell)?;

    let written = write_atomically(&path, fsync.sync_each_file(), "write kernel cell", |writer| {
        writer.write_all(&header)?;
        let mut payload = ChecksumWriter::new(&mut *writer);
        write_samples(&mut payload, cell.samples())?;
        let (payload_crc, payload_bytes) = payload.finish();
        writer.write_all(&payload_crc.to_le_bytes())?;
        Ok(u64_from_usize(header.len()) + payload_bytes + 4)
    })?;

    Ok((path, written))
}

/// Read and verify one cell file. Returns the cell and the file size.
pub(crate) fn read_cell(path: &Path) -> CacheResult<(KernelCell, u64)> {
    let file = File::open(path).map_err(|e| CacheError::io("open kernel cell", path, e))?;
    let len = file
        .metadata()
        .map_err(|e| CacheError::io("stat kernel cell", path, e))?
        .len();
    let origin = path.display().to_string();
    if len == 0 {
        return Err(CacheError::corrupt(origin, "file is empty"));
    }

    // SAFETY: the mapping is read-only and cache files are only ever replaced
    // by rename, never modified in place.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| CacheError::io("map kernel cell", path, e))?;
    let cell = decode_cell(&map, &origin)?;
    Ok((cell, len))
}

/// Write a buffer manifest.
pub(crate) fn write_manifest(
    path: &Path,
    manifest: &Manifest,
    fsync: FsyncMode,
) -> CacheResult<u64> {
    let body = bincode::serialize(manifest).map_err(|source| CacheError::Encoding {
        context: "buffer manifest",
        source,
    })?;

    let mut header = Vec::with_capacity(20);
    header.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
    header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    header.extend_from_slice(&0u16.to_le_bytes());
    header.extend_from_slice(&u64_from_usize(body.len()).to_le_bytes());
    header.extend_from_slice(&crc32c(&body).to_le_bytes());

    write_atomically(path, fsync.sync_batch(), "write buffer manifest", |writer| {
        writer.write_all(&header)?;
        writer.write_all(&body)?;
        Ok(u64_from_usize(header.len() + body.len()))
    })
}

/// Read and verify a buffer manifest.
pub(crate) fn read_manifest(path: &Path) -> CacheResult<Manifest> {
    let bytes = std::fs::read(path).map_err(|e| CacheError::io("read buffer manifest", path, e))?;
    let origin = path.display().to_string();
    let mut cursor = ByteCursor::new(&bytes, &origin);

    let magic = cursor.u32()?;
    if magic != MANIFEST_MAGIC {
        return Err(cursor.corrupt(format!(
            "invalid manifest magic: expected {MANIFEST_MAGIC:x}, got {magic:x}"
        )));
    }
    let version = cursor.u16()?;
    check_version(&cursor, version)?;
    let _reserved = cursor.u16()?;
    let body_len =
        usize_from_u64(cursor.u64()?).ok_or_else(|| cursor.corrupt("manifest too large"))?;
    let stored_crc = cursor.u32()?;
    let body = cursor.take(body_len)?;
    cursor.expect_end()?;

    let actual_crc = crc32c(body);
    if actual_crc != stored_crc {
        return Err(cursor.corrupt(format!(
            "manifest checksum mismatch: expected {stored_crc:x}, got {actual_crc:x}"
        )));
    }

    bincode::deserialize(body).map_err(|e| cursor.corrupt(format!("manifest body: {e}")))
}

fn check_version(cursor: &ByteCursor<'_>, version: u16) -> CacheResult<()> {
    if version == FORMAT_VERSION {
        Ok(())
    } else {
        Err(cursor.corrupt(format!(
            "unsupported format version {version} (expected {FORMAT_VERSION})"
        )))
    }
}

fn encode_cell_header(cell: &KernelCell) -> CacheResult<Vec<u8>> {
    let descriptor = bincode::serialize(cell.coordinates()).map_err(|source| CacheError::Encoding {
        context: "coordinate descriptor",
        source,
    })?;
    let shape = cell.shape();

    let mut bytes = Vec::with_capacity(64 + shape.len() * 4 + descriptor.len());
    bytes.extend_from_slice(&CELL_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.push(cell.sample_kind() as u8);
    bytes.push(0);
    bytes.extend_from_slice(&cell.frequency_value().to_le_bytes());
    bytes.extend_from_slice(&cell.frequency_increment().to_le_bytes());
    bytes.extend_from_slice(&cell.w_value().to_le_bytes());
    bytes.extend_from_slice(&cell.mueller_element().to_le_bytes());
    bytes.extend_from_slice(&cell.sampling_rate().to_le_bytes());
    bytes.extend_from_slice(&cell.x_support().to_le_bytes());
    bytes.extend_from_slice(&cell.y_support().to_le_bytes());
    bytes.extend_from_slice(&u32_from_usize(shape.len(), "cell rank")?.to_le_bytes());
    for &extent in shape {
        bytes.extend_from_slice(&i32_from_usize(extent, "cell shape")?.to_le_bytes());
    }
    let descriptor_len = u32_from_usize(descriptor.len(), "coordinate descriptor")?;
    bytes.extend_from_slice(&descriptor_len.to_le_bytes());
    bytes.extend_from_slice(&descriptor);
    bytes.extend_from_slice(&u64_from_usize(cell.memory_usage()).to_le_bytes());

    let header_crc = crc32c(&bytes);
    bytes.extend_from_slice(&header_crc.to_le_bytes());
    Ok(bytes)
}

fn decode_cell(bytes: &[u8], origin: &str) -> CacheResult<KernelCell> {
    let mut cursor = ByteCursor::new(bytes, origin);

    let magic = cursor.u32()?;
    if magic != CELL_MAGIC {
        return Err(cursor.corrupt(format!(
            "invalid cell magic: expected {CELL_MAGIC:x}, got {magic:x}"
        )));
    }
    let version = cursor.u16()?;
    check_version(&cursor, version)?;
    let kind_raw = cursor.u8()?;
    let kind = SampleKind::from_u8(kind_raw)
        .ok_or_else(|| cursor.corrupt(format!("unknown sample kind {kind_raw}")))?;
    let _reserved = cursor.u8()?;

    let frequency_value = cursor.f64()?;
    let frequency_increment = cursor.f64()?;
    let w_value = cursor.f64()?;
    let mueller_element = cursor.i32()?;
    let sampling_rate = cursor.f32()?;
    let x_support = cursor.i32()?;
    let y_support = cursor.i32()?;

    let rank = usize::try_from(cursor.u32()?).unwrap_or(usize::MAX);
    if rank > MAX_RANK {
        return Err(cursor.corrupt(format!("rank {rank} exceeds {MAX_RANK}")));
    }
    let mut shape = Vec::with_capacity(rank);
    for _ in 0..rank {
        let extent = cursor.i32()?;
        let extent = usize_from_i32(extent)
            .ok_or_else(|| cursor.corrupt(format!("negative extent {extent}")))?;
        shape.push(extent);
    }

    let descriptor_len = usize::try_from(cursor.u32()?).unwrap_or(usize::MAX);
    let descriptor_bytes = cursor.take(descriptor_len)?;
    let payload_len =
        usize_from_u64(cursor.u64()?).ok_or_else(|| cursor.corrupt("payload too large"))?;

    let header_end = cursor.offset;
    let stored_header_crc = cursor.u32()?;
    let actual_header_crc = crc32c(&bytes[..header_end]);
    if stored_header_crc != actual_header_crc {
        return Err(cursor.corrupt(format!(
            "header checksum mismatch: expected {stored_header_crc:x}, got {actual_header_crc:x}"
        )));
    }

    let expected_len = if kind == SampleKind::Empty {
        (rank == 0).then_some(0)
    } else {
        shape
            .iter()
            .try_fold(1usize, |acc, &extent| acc.checked_mul(extent))
            .and_then(|count| count.checked_mul(kind.sample_bytes()))
    };
    if expected_len != Some(payload_len) {
        return Err(cursor.corrupt(format!(
            "payload length {payload_len} does not match {kind:?} samples of shape {shape:?}"
        )));
    }

    let payload = cursor.take(payload_len)?;
    let stored_payload_crc = cursor.u32()?;
    cursor.expect_end()?;
    let actual_payload_crc = crc32c(payload);
    if stored_payload_crc != actual_payload_crc {
        return Err(cursor.corrupt(format!(
            "payload checksum mismatch: expected {stored_payload_crc:x}, got {actual_payload_crc:x}"
        )));
    }

    let coordinates: CoordinateDescriptor = bincode::deserialize(descriptor_bytes)
        .map_err(|e| cursor.corrupt(format!("coordinate descriptor: {e}")))?;

    let samples = match kind {
        SampleKind::Empty => None,
        SampleKind::Real => {
            let data: Vec<f32> = payload
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            let array = ArrayD::from_shape_vec(IxDyn(&shape), data)
                .map_err(|e| cursor.corrupt(format!("sample shape: {e}")))?;
            Some(KernelSamples::Real(array))
        }
        SampleKind::Complex => {
            let data: Vec<Complex32> = payload
                .chunks_exact(8)
                .map(|b| {
                    Complex32::new(
                        f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                        f32::from_le_bytes([b[4], b[5], b[6], b[7]]),
                    )
                })
                .collect();
            let array = ArrayD::from_shape_vec(IxDyn(&shape), data)
                .map_err(|e| cursor.corrupt(format!("sample shape: {e}")))?;
            Some(KernelSamples::Complex(array))
        }
    };

    let params = CellParams {
        sampling_rate,
        x_support,
        y_support,
        frequency_value,
        frequency_increment,
        w_value,
        mueller_element,
        coordinates,
    };
    Ok(KernelCell::from_parts(params, samples))
}

fn write_samples<W: Write>(out: &mut W, samples: Option<&KernelSamples>) -> std::io::Result<()> {
    let mut chunk = Vec::with_capacity(PAYLOAD_CHUNK);
    match samples {
        None => {}
        Some(KernelSamples::Real(array)) => {
            for value in array {
                chunk.extend_from_slice(&value.to_le_bytes());
                if chunk.len() >= PAYLOAD_CHUNK {
                    out.write_all(&chunk)?;
                    chunk.clear();
                }
            }
        }
        Some(KernelSamples::Complex(array)) => {
            for value in array {
                chunk.extend_from_slice(&value.re.to_le_bytes());
                chunk.extend_from_slice(&value.im.to_le_bytes());
                if chunk.len() >= PAYLOAD_CHUNK {
                    out.write_all(&chunk)?;
                    chunk.clear();
                }
            }
        }
    }
    out.write_all(&chunk)
}

fn append_extension(prefix: &Path, extension: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Write through a temporary sibling and rename into place.
fn write_atomically<F>(
    path: &Path,
    fsync: bool,
    operation: &'static str,
    body: F,
) -> CacheResult<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<u64>,
{
    let tmp = append_extension(path, "tmp");
    let result: std::io::Result<u64> = (|| {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::with_capacity(PAYLOAD_CHUNK, file);
        let written = body(&mut writer)?;
        let file = writer.into_inner().map_err(std::io::IntoInnerError::into_error)?;
        if fsync {
            file.sync_all()?;
        }
        drop(file);
        std::fs::rename(&tmp, path)?;
        Ok(written)
    })();

    result.map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        CacheError::io(operation, path, e)
    })
}

/// Running CRC32C over everything written through it.
struct ChecksumWriter<W> {
    inner: W,
    crc: u32,
    written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    const fn new(inner: W) -> Self {
        Self {
            inner,
            crc: 0,
            written: 0,
        }
    }

    fn finish(self) -> (u32, u64) {
        (self.crc, self.written)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc = crc32c_append(self.crc, &buf[..n]);
        self.written += u64_from_usize(n);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Bounds-checked little-endian reader over a byte slice.
struct ByteCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
    origin: &'a str,
}

impl<'a> ByteCursor<'a> {
    const fn new(bytes: &'a [u8], origin: &'a str) -> Self {
        Self {
            bytes,
            offset: 0,
            origin,
        }
    }

    fn corrupt(&self, detail: impl Into<String>) -> CacheError {
        CacheError::corrupt(self.origin, detail)
    }

    fn take(&mut self, n: usize) -> CacheResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                self.corrupt(format!(
                    "truncated: needed {n} bytes at offset {} of {}",
                    self.offset,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CacheResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn expect_end(&self) -> CacheResult<()> {
        let trailing = self.bytes.len() - self.offset;
        if trailing == 0 {
            Ok(())
        } else {
            Err(self.corrupt(format!("{trailing} trailing bytes")))
        }
    }

    fn u8(&mut self) -> CacheResult<u8> {
        self.array::<1>().map(|[b]| b)
    }

    fn u16(&mut self) -> CacheResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> CacheResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> CacheResult<i32> {
        self.array().map(i32::from_le_bytes)
    }

    fn u64(&mut self) -> CacheResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    fn f32(&mut self) -> CacheResult<f32> {
        self.array().map(f32::from_le_bytes)
    }

    fn f64(&mut self) -> CacheResult<f64> {
        self.array().map(f64::from_le_bytes)
    }
}
