//! Storage of fields
//!
//! The [`Format`] trait is the boundary with file formats: it infers the [`Schema`] of a
//! file, reads one chunk of it at a time and writes whole buffers. Chunks are described by
//! a [`ChunkPlan`], so that loading a field becomes a set of independent reads.
//!
//! The crate ships [`RawFormat`], a minimal self-describing layout, while native lattice
//! formats are meant to be provided by other crates implementing [`Format`].

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use anyhow::{ensure, Context};
use bytemuck::{Pod, Zeroable};
use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::axes::indexes_of;
use crate::buffer::{Buffer, DType};
use crate::errors::IoError;

/// Description of a stored field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub dims: IndexMap<String, usize>,
    pub dofs: IndexMap<String, usize>,
    /// Axes of the field in storage order
    pub axes: Vec<String>,
    #[serde(default)]
    pub dtype: DType,
    #[serde(default)]
    pub field_type: Option<String>,
}

impl Schema {
    pub fn indexes(&self) -> Vec<String> {
        indexes_of(&self.axes)
    }

    pub fn size_of(&self, axis: &str) -> Option<usize> {
        self.dims
            .get(axis)
            .or_else(|| self.dofs.get(axis))
            .copied()
    }

    pub fn shape(&self) -> Result<Vec<usize>, IoError> {
        self.axes
            .iter()
            .map(|axis| {
                self.size_of(axis).ok_or_else(|| {
                    IoError::Incompatible(format!("axis {axis:?} has no size in the schema"))
                })
            })
            .collect()
    }
}

/// A file format fields can be loaded from and saved to
pub trait Format: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Other names, also used as file extensions
    fn aliases(&self) -> &[&str] {
        &[]
    }

    /// Whether the file at `path` looks like this format
    fn is_compatible(&self, path: &Path) -> bool;

    fn get_type(&self, path: &Path) -> Result<Schema, IoError>;

    /// Reads the chunk `chunk` of a field of the given shape, split in chunks of the given sizes
    fn read(
        &self,
        path: &Path,
        shape: &[usize],
        chunks: &[usize],
        chunk: usize,
    ) -> anyhow::Result<Buffer>;

    /// Writes a buffer laid out in the storage order of `schema`
    fn write(&self, path: &Path, schema: &Schema, buffer: &Buffer) -> Result<(), IoError>;
}

/// Known formats, looked up by name, alias or file extension
#[derive(Debug, Clone)]
pub struct FormatRegistry {
    formats: Vec<Arc<dyn Format>>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        let mut registry = FormatRegistry::empty();
        registry.register(Arc::new(RawFormat));
        registry
    }
}

impl FormatRegistry {
    pub fn empty() -> Self {
        FormatRegistry {
            formats: Vec::new(),
        }
    }

    pub fn register(&mut self, format: Arc<dyn Format>) {
        self.formats.push(format);
    }

    pub fn names(&self) -> Vec<&str> {
        self.formats.iter().map(|format| format.name()).collect()
    }

    /// Format called `name`, case insensitive
    pub fn get(&self, name: &str) -> Result<Arc<dyn Format>, IoError> {
        let name = name.to_lowercase();
        self.formats
            .iter()
            .find(|format| {
                format.name().to_lowercase() == name
                    || format.aliases().iter().any(|alias| alias.to_lowercase() == name)
            })
            .cloned()
            .ok_or(IoError::UnknownFormat(name))
    }

    /// Format of `path`, from its extension first and then from its content
    pub fn deduce(&self, path: &Path) -> Result<Arc<dyn Format>, IoError> {
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            if let Ok(format) = self.get(extension) {
                return Ok(format);
            }
        }
        self.formats
            .iter()
            .find(|format| format.is_compatible(path))
            .cloned()
            .ok_or_else(|| IoError::CannotDeduce(path.to_path_buf()))
    }

    pub fn resolve(&self, path: &Path, name: Option<&str>) -> Result<Arc<dyn Format>, IoError> {
        match name {
            Some(name) => self.get(name),
            None => self.deduce(path),
        }
    }
}

/// Split of a shape into chunks, numbered in row-major order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    shape: Vec<usize>,
    chunks: Vec<usize>,
}

impl ChunkPlan {
    pub fn new(shape: Vec<usize>, chunks: Vec<usize>) -> Result<Self, IoError> {
        if shape.len() != chunks.len() {
            return Err(IoError::InvalidChunks(format!(
                "{} chunk sizes given for {} axes",
                chunks.len(),
                shape.len()
            )));
        }
        if let Some((size, chunk)) = shape
            .iter()
            .zip(&chunks)
            .find(|(size, chunk)| **chunk == 0 || chunk > size)
        {
            return Err(IoError::InvalidChunks(format!(
                "chunk size {chunk} not allowed for an axis of size {size}"
            )));
        }
        if shape.iter().zip(&chunks).any(|(size, chunk)| size % chunk != 0) {
            warn!(?shape, ?chunks, "chunks do not divide the shape, the last ones are smaller");
        }
        Ok(ChunkPlan { shape, chunks })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn chunks(&self) -> &[usize] {
        &self.chunks
    }

    /// Number of chunks along every axis
    pub fn grid(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(size, chunk)| (size + chunk - 1) / chunk)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.grid().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of chunk `id` in the grid
    pub fn position(&self, id: usize) -> Vec<usize> {
        let grid = self.grid();
        let mut position = vec![0; grid.len()];
        let mut rest = id;
        for (k, n) in grid.iter().enumerate().rev() {
            position[k] = rest % n;
            rest /= n;
        }
        position
    }

    pub fn ranges(&self, id: usize) -> Vec<Range<usize>> {
        self.position(id)
            .iter()
            .zip(self.shape.iter().zip(&self.chunks))
            .map(|(p, (size, chunk))| p * chunk..((p + 1) * chunk).min(*size))
            .collect()
    }

    pub fn chunk_shape(&self, id: usize) -> Vec<usize> {
        self.ranges(id).iter().map(|r| r.len()).collect()
    }
}

const MAGIC: [u8; 8] = *b"LATFIELD";

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Preamble {
    magic: [u8; 8],
    header_len: u64,
}

/// Self-describing binary layout
///
/// A fixed preamble with the magic string and the header length, the [`Schema`] as JSON, then
/// the elements in C order and native endianness, complex numbers as (re, im) pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFormat;

impl RawFormat {
    fn header(path: &Path) -> Result<(Schema, u64), IoError> {
        let mut file = File::open(path)?;
        let mut preamble = Preamble::zeroed();
        file.read_exact(bytemuck::bytes_of_mut(&mut preamble))?;
        if preamble.magic != MAGIC {
            return Err(IoError::InvalidFile {
                path: path.to_path_buf(),
                reason: "missing raw field preamble".to_string(),
            });
        }
        let available = file
            .metadata()?
            .len()
            .saturating_sub(std::mem::size_of::<Preamble>() as u64);
        if preamble.header_len > available {
            return Err(IoError::InvalidFile {
                path: path.to_path_buf(),
                reason: format!(
                    "header of {} bytes announced, only {available} bytes follow the preamble",
                    preamble.header_len
                ),
            });
        }
        let mut header = vec![0u8; preamble.header_len as usize];
        file.read_exact(&mut header)?;
        let schema: Schema = serde_json::from_slice(&header)?;
        let offset = std::mem::size_of::<Preamble>() as u64 + preamble.header_len;
        Ok((schema, offset))
    }
}

impl Format for RawFormat {
    fn name(&self) -> &str {
        "raw"
    }

    fn aliases(&self) -> &[&str] {
        &["bin", "lat"]
    }

    fn is_compatible(&self, path: &Path) -> bool {
        RawFormat::header(path).is_ok()
    }

    fn get_type(&self, path: &Path) -> Result<Schema, IoError> {
        RawFormat::header(path).map(|(schema, _)| schema)
    }

    fn read(
        &self,
        path: &Path,
        shape: &[usize],
        chunks: &[usize],
        chunk: usize,
    ) -> anyhow::Result<Buffer> {
        let (schema, offset) = RawFormat::header(path)?;
        let stored = schema.shape()?;
        ensure!(
            stored == shape,
            "{path:?} stores a field of shape {stored:?}, not {shape:?}"
        );
        let plan = ChunkPlan::new(shape.to_vec(), chunks.to_vec())?;
        ensure!(chunk < plan.len(), "chunk {chunk} out of {}", plan.len());

        let itemsize = schema.dtype.itemsize() as u64;
        let ranges = plan.ranges(chunk);
        let (outer, run) = match ranges.split_last() {
            Some((last, outer)) => (outer, last.clone()),
            None => (&ranges[..], 0..1),
        };
        let strides: Vec<u64> = (0..outer.len())
            .map(|k| shape[k + 1..].iter().product::<usize>() as u64)
            .collect();
        let outer_shape: Vec<usize> = outer.iter().map(Range::len).collect();

        let mut file = File::open(path).with_context(|| format!("opening {path:?}"))?;
        let mut complex = vec![Complex64::new(0.0, 0.0); run.len()];
        let mut real = vec![0f64; run.len()];
        let mut values = Vec::with_capacity(plan.chunk_shape(chunk).iter().product());
        for index in ndarray::indices(IxDyn(&outer_shape)) {
            let start: u64 = outer
                .iter()
                .zip(&strides)
                .enumerate()
                .map(|(k, (range, stride))| (range.start + index[k]) as u64 * stride)
                .sum::<u64>()
                + run.start as u64;
            file.seek(SeekFrom::Start(offset + start * itemsize))?;
            match schema.dtype {
                DType::Complex128 => {
                    file.read_exact(bytemuck::cast_slice_mut(&mut complex))?;
                    values.extend_from_slice(&complex);
                }
                DType::Float64 => {
                    file.read_exact(bytemuck::cast_slice_mut(&mut real))?;
                    values.extend(real.iter().map(|re| Complex64::new(*re, 0.0)));
                }
            }
        }
        debug!(path = %path.display(), chunk, "read chunk");
        Ok(ArrayD::from_shape_vec(
            IxDyn(&plan.chunk_shape(chunk)),
            values,
        )?)
    }

    fn write(&self, path: &Path, schema: &Schema, buffer: &Buffer) -> Result<(), IoError> {
        let shape = schema.shape()?;
        if buffer.shape() != shape.as_slice() {
            return Err(IoError::Incompatible(format!(
                "buffer of shape {:?} does not match the schema shape {:?}",
                buffer.shape(),
                shape
            )));
        }
        let header = serde_json::to_vec(schema)?;
        let preamble = Preamble {
            magic: MAGIC,
            header_len: header.len() as u64,
        };
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(bytemuck::bytes_of(&preamble))?;
        file.write_all(&header)?;
        let data = buffer.as_standard_layout();
        match schema.dtype {
            DType::Complex128 => {
                let values: Vec<Complex64> = data.iter().copied().collect();
                file.write_all(bytemuck::cast_slice(&values))?;
            }
            DType::Float64 => {
                let values: Vec<f64> = data.iter().map(|value| value.re).collect();
                file.write_all(bytemuck::cast_slice(&values))?;
            }
        }
        file.flush()?;
        debug!(path = %path.display(), bytes = buffer.len() as u64 * schema.dtype.itemsize() as u64, "wrote field");
        Ok(())
    }
}
