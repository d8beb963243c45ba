//! On-disk 3D array container (`.arr`).
//!
//! Layout: a fixed 32-byte little-endian header followed by the contiguous
//! row-major payload, frame-major. Frames are fixed-size, so any frame can
//! be addressed without scanning. Writers exist only at creation time and
//! mark the file complete on `finish()`; readers memory-map the payload.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const MAGIC: &[u8; 4] = b"CTAR";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    U16,
    U32,
    F32,
    F64,
    Bool,
}

impl DType {
    pub fn tag(self) -> u8 {
        match self {
            DType::U8 => 0,
            DType::U16 => 1,
            DType::U32 => 2,
            DType::F32 => 3,
            DType::F64 => 4,
            DType::Bool => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<DType> {
        match tag {
            0 => Some(DType::U8),
            1 => Some(DType::U16),
            2 => Some(DType::U32),
            3 => Some(DType::F32),
            4 => Some(DType::F64),
            5 => Some(DType::Bool),
            _ => None,
        }
    }

    /// Bytes per element as stored on disk (bool is one byte).
    pub fn byte_len(self) -> usize {
        match self {
            DType::U8 | DType::Bool => 1,
            DType::U16 => 2,
            DType::U32 | DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Bool => "bool",
        }
    }
}

/// `(t, h, w)` frame count and frame dimensions.
pub type Shape = (usize, usize, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub dtype: DType,
    pub shape: Shape,
    pub complete: bool,
}

impl Header {
    fn frame_elems(&self) -> usize {
        self.shape.1 * self.shape.2
    }

    fn frame_bytes(&self) -> usize {
        self.frame_elems() * self.dtype.byte_len()
    }

    fn payload_bytes(&self) -> usize {
        self.shape.0 * self.frame_bytes()
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(MAGIC);
        buf.write_u16::<LittleEndian>(VERSION).unwrap();
        buf.push(self.dtype.tag());
        buf.push(0); // byte-order tag, little endian
        buf.write_u32::<LittleEndian>(self.shape.0 as u32).unwrap();
        buf.write_u32::<LittleEndian>(self.shape.1 as u32).unwrap();
        buf.write_u32::<LittleEndian>(self.shape.2 as u32).unwrap();
        buf.push(u8::from(self.complete));
        buf.resize(HEADER_LEN, 0);
        buf
    }

    fn decode(path: &Path, raw: &[u8]) -> Result<Header> {
        if raw.len() < HEADER_LEN {
            return Err(corrupt(path, "file shorter than header"));
        }
        if &raw[0..4] != MAGIC {
            return Err(corrupt(path, "bad magic"));
        }
        let mut rest = &raw[4..];
        let version = rest.read_u16::<LittleEndian>()?;
        if version != VERSION {
            return Err(incompatible(path, format!("unsupported version {version}")));
        }
        let dtype_tag = rest.read_u8()?;
        let dtype = DType::from_tag(dtype_tag)
            .ok_or_else(|| corrupt(path, format!("unknown dtype tag {dtype_tag}")))?;
        let byte_order = rest.read_u8()?;
        if byte_order != 0 {
            return Err(incompatible(path, format!("unsupported byte order {byte_order}")));
        }
        let t = rest.read_u32::<LittleEndian>()? as usize;
        let h = rest.read_u32::<LittleEndian>()? as usize;
        let w = rest.read_u32::<LittleEndian>()? as usize;
        let complete = rest.read_u8()? != 0;
        Ok(Header {
            dtype,
            shape: (t, h, w),
            complete,
        })
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> PipelineError {
    PipelineError::CorruptArtifact {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn incompatible(path: &Path, reason: impl Into<String>) -> PipelineError {
    PipelineError::IncompatibleArtifact {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Exclusive frame-oriented writer. The mapping is released when the writer
/// drops, on every path including panic; a file that was never `finish()`ed
/// keeps `complete = 0` and is treated as absent by [`open_expecting`].
pub struct ArrWriter {
    path: PathBuf,
    header: Header,
    mmap: MmapMut,
}

impl ArrWriter {
    pub fn create(path: &Path, shape: Shape, dtype: DType) -> Result<ArrWriter> {
        let header = Header {
            dtype,
            shape,
            complete: false,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| PipelineError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        file.write_all(&header.encode())
            .map_err(|source| PipelineError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        file.set_len((HEADER_LEN + header.payload_bytes()) as u64)
            .map_err(|source| PipelineError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(ArrWriter {
            path: path.to_path_buf(),
            header,
            mmap,
        })
    }

    pub fn shape(&self) -> Shape {
        self.header.shape
    }

    fn frame_slice(&mut self, t: usize, elems: usize) -> Result<&mut [u8]> {
        let (nt, h, w) = self.header.shape;
        if t >= nt {
            return Err(PipelineError::Shape(format!(
                "frame {t} out of range (0-{})",
                nt.saturating_sub(1)
            )));
        }
        if elems != h * w {
            return Err(PipelineError::Shape(format!(
                "frame has {elems} elements, expected {}",
                h * w
            )));
        }
        let bytes = self.header.frame_bytes();
        let start = HEADER_LEN + t * bytes;
        Ok(&mut self.mmap[start..start + bytes])
    }

    pub fn write_frame_u16(&mut self, t: usize, data: &[u16]) -> Result<()> {
        self.expect_dtype(DType::U16)?;
        let dst = self.frame_slice(t, data.len())?;
        for (chunk, v) in dst.chunks_exact_mut(2).zip(data) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    pub fn write_frame_f32(&mut self, t: usize, data: &[f32]) -> Result<()> {
        self.expect_dtype(DType::F32)?;
        let dst = self.frame_slice(t, data.len())?;
        for (chunk, v) in dst.chunks_exact_mut(4).zip(data) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    pub fn write_frame_bool(&mut self, t: usize, data: &[bool]) -> Result<()> {
        self.expect_dtype(DType::Bool)?;
        let dst = self.frame_slice(t, data.len())?;
        for (byte, v) in dst.iter_mut().zip(data) {
            *byte = u8::from(*v);
        }
        Ok(())
    }

    fn expect_dtype(&self, dtype: DType) -> Result<()> {
        if self.header.dtype != dtype {
            return Err(PipelineError::DType(format!(
                "writer holds {} data, got {}",
                self.header.dtype.name(),
                dtype.name()
            )));
        }
        Ok(())
    }

    /// Flush the payload and flip the complete flag. Without this the file
    /// reads back as an interrupted write.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.mmap[20] = 1;
        self.mmap.flush()?;
        Ok(self.path)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Shared read-only view. Multiple readers within a process are fine; the
/// mapping lives exactly as long as the reader.
#[derive(Debug)]
pub struct ArrReader {
    path: PathBuf,
    header: Header,
    mmap: Mmap,
}

impl ArrReader {
    pub fn open(path: &Path) -> Result<ArrReader> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => corrupt(path, "missing file"),
            _ => PipelineError::Io(e),
        })?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_LEN {
            return Err(corrupt(path, "file shorter than header"));
        }
        let mmap = unsafe { Mmap::map(&file)? };
        let header = Header::decode(path, &mmap)?;
        let expected = HEADER_LEN + header.payload_bytes();
        if mmap.len() != expected {
            return Err(corrupt(
                path,
                format!("expected {expected} bytes, found {}", mmap.len()),
            ));
        }
        Ok(ArrReader {
            path: path.to_path_buf(),
            header,
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> Shape {
        self.header.shape
    }

    pub fn dtype(&self) -> DType {
        self.header.dtype
    }

    pub fn is_complete(&self) -> bool {
        self.header.complete
    }

    fn frame_bytes_at(&self, t: usize) -> Result<&[u8]> {
        let (nt, _, _) = self.header.shape;
        if t >= nt {
            return Err(PipelineError::Shape(format!(
                "frame {t} out of range (0-{})",
                nt.saturating_sub(1)
            )));
        }
        let bytes = self.header.frame_bytes();
        let start = HEADER_LEN + t * bytes;
        Ok(&self.mmap[start..start + bytes])
    }

    pub fn read_frame_u16(&self, t: usize) -> Result<Vec<u16>> {
        self.expect_dtype(DType::U16)?;
        let raw = self.frame_bytes_at(t)?;
        Ok(raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    pub fn read_frame_f32(&self, t: usize) -> Result<Vec<f32>> {
        self.expect_dtype(DType::F32)?;
        let raw = self.frame_bytes_at(t)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn read_frame_bool(&self, t: usize) -> Result<Vec<bool>> {
        self.expect_dtype(DType::Bool)?;
        let raw = self.frame_bytes_at(t)?;
        Ok(raw.iter().map(|&b| b != 0).collect())
    }

    /// Intensity frame widened to f32 regardless of stored dtype (u16 raw
    /// fluorescence or f32 corrected fluorescence).
    pub fn read_frame_as_f32(&self, t: usize) -> Result<Vec<f32>> {
        match self.header.dtype {
            DType::U16 => Ok(self.read_frame_u16(t)?.iter().map(|&v| v as f32).collect()),
            DType::F32 => self.read_frame_f32(t),
            other => Err(PipelineError::DType(format!(
                "cannot widen {} to f32",
                other.name()
            ))),
        }
    }

    fn expect_dtype(&self, dtype: DType) -> Result<()> {
        if self.header.dtype != dtype {
            return Err(PipelineError::DType(format!(
                "{} holds {} data, asked for {}",
                self.path.display(),
                self.header.dtype.name(),
                dtype.name()
            )));
        }
        Ok(())
    }
}

/// Resume check: `Some(reader)` only for an existing, structurally valid,
/// complete file with the expected shape and dtype. Anything else means the
/// stage recomputes.
pub fn open_expecting(path: &Path, shape: Shape, dtype: DType) -> Option<ArrReader> {
    if !path.is_file() {
        return None;
    }
    let reader = ArrReader::open(path).ok()?;
    if reader.shape() == shape && reader.dtype() == dtype && reader.is_complete() {
        Some(reader)
    } else {
        None
    }
}
