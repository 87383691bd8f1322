//! Self-contained binary container.
//!
//! Layout: 4-byte magic `SCFD`, a `u32` format version, then one binary
//! stream holding the global attributes, the dimension table and the
//! variables (name, dimension tuple, attributes, packed array). Files are
//! loaded whole on open; hyperslab reads slice in memory. The container
//! doubles as the serialized dataset dump format.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::array::{ElementType, VariantArray};
use crate::error::{Error, Result};
use crate::io::{DimensionInfo, FormatDriver, FormatFile, FormatFileWriter, VariableInfo};
use crate::metadata::Metadata;
use crate::stream::BinaryStream;

const MAGIC: &[u8; 4] = b"SCFD";
const VERSION: u32 = 1;

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeDriver;

impl FormatDriver for NativeDriver {
    fn thread_safe(&self) -> bool {
        true
    }

    fn open(&self, path: &Path) -> Result<Box<dyn FormatFile>> {
        Ok(Box::new(NativeFile::open(path)?))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn FormatFileWriter>> {
        Ok(Box::new(NativeFileWriter::new(path)))
    }
}

pub struct NativeFile {
    dimensions: Vec<DimensionInfo>,
    variables: Vec<VariableInfo>,
    attributes: Metadata,
    data: HashMap<String, VariantArray>,
}

impl NativeFile {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut stream = BinaryStream::from_bytes(bytes);
        let magic = stream.consume_raw(4)?;
        if magic != MAGIC {
            return Err(Error::stream(format!(
                "{} is not a native container (bad magic)",
                path.display()
            )));
        }
        let version = stream.consume_u32()?;
        if version != VERSION {
            return Err(Error::stream(format!(
                "{}: unsupported container version {version}",
                path.display()
            )));
        }

        let attributes = Metadata::from_stream(&mut stream)?;
        let n_dims = stream.consume_u64()?;
        let mut dimensions = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            dimensions.push(DimensionInfo {
                name: stream.consume_str()?,
                size: stream.consume_u64()?,
                unlimited: stream.consume_u8()? != 0,
            });
        }

        let n_vars = stream.consume_u64()?;
        let mut variables = Vec::with_capacity(n_vars as usize);
        let mut data = HashMap::new();
        for _ in 0..n_vars {
            let name = stream.consume_str()?;
            let n_var_dims = stream.consume_u64()?;
            let mut var_dims = Vec::with_capacity(n_var_dims as usize);
            for _ in 0..n_var_dims {
                var_dims.push(stream.consume_str()?);
            }
            let element_type = ElementType::from_code(stream.consume_u8()?)?;
            let var_attributes = Metadata::from_stream(&mut stream)?;
            let array = VariantArray::from_stream(&mut stream)?;
            variables.push(VariableInfo {
                name: name.clone(),
                dimensions: var_dims,
                element_type,
                attributes: var_attributes,
            });
            data.insert(name, array);
        }

        Ok(Self {
            dimensions,
            variables,
            attributes,
            data,
        })
    }

    fn shape(&self, info: &VariableInfo) -> Result<Vec<u64>> {
        info.dimensions
            .iter()
            .map(|name| {
                self.dimension(name)
                    .map(|d| d.size)
                    .ok_or_else(|| Error::semantic(format!("undefined dimension '{name}'")))
            })
            .collect()
    }
}

impl FormatFile for NativeFile {
    fn dimensions(&self) -> &[DimensionInfo] {
        &self.dimensions
    }

    fn variables(&self) -> &[VariableInfo] {
        &self.variables
    }

    fn attributes(&self) -> &Metadata {
        &self.attributes
    }

    fn read(&self, name: &str) -> Result<VariantArray> {
        self.data
            .get(name)
            .cloned()
            .ok_or_else(|| Error::semantic(format!("no variable '{name}' in container")))
    }

    fn read_hyperslab(&self, name: &str, starts: &[u64], counts: &[u64]) -> Result<VariantArray> {
        let info = self
            .variable(name)
            .ok_or_else(|| Error::semantic(format!("no variable '{name}' in container")))?;
        let shape = self.shape(info)?;
        if starts.len() != shape.len() || counts.len() != shape.len() {
            return Err(Error::semantic(format!(
                "variable '{name}' has {} dimensions, hyperslab gives {}/{}",
                shape.len(),
                starts.len(),
                counts.len()
            )));
        }
        for d in 0..shape.len() {
            if starts[d] + counts[d] > shape[d] {
                return Err(Error::semantic(format!(
                    "hyperslab [{}, {}) exceeds dimension '{}' of {}",
                    starts[d],
                    starts[d] + counts[d],
                    info.dimensions[d],
                    shape[d]
                )));
            }
        }
        let indices = slab_indices(&shape, starts, counts);
        self.data[name].gather(&indices)
    }
}

/// Flat indices of a row-major (slowest dimension first) hyperslab.
fn slab_indices(shape: &[u64], starts: &[u64], counts: &[u64]) -> Vec<usize> {
    let rank = shape.len();
    let mut strides = vec![1u64; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    let total: u64 = counts.iter().product();
    let mut counter = vec![0u64; rank];
    let mut indices = Vec::with_capacity(total as usize);
    for _ in 0..total {
        let flat: u64 = counter
            .iter()
            .zip(starts)
            .zip(&strides)
            .map(|((i, s), stride)| (i + s) * stride)
            .sum();
        indices.push(flat as usize);
        for d in (0..rank).rev() {
            counter[d] += 1;
            if counter[d] < counts[d] {
                break;
            }
            counter[d] = 0;
        }
    }
    indices
}

pub struct NativeFileWriter {
    path: PathBuf,
    dimensions: Vec<DimensionInfo>,
    variables: Vec<VariableInfo>,
    attributes: Metadata,
    data: HashMap<String, VariantArray>,
}

impl NativeFileWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            dimensions: Vec::new(),
            variables: Vec::new(),
            attributes: Metadata::new(),
            data: HashMap::new(),
        }
    }
}

impl FormatFileWriter for NativeFileWriter {
    fn define_dimension(&mut self, name: &str, size: u64, unlimited: bool) -> Result<()> {
        if self.dimensions.iter().any(|d| d.name == name) {
            return Err(Error::config(format!("dimension '{name}' already defined")));
        }
        self.dimensions.push(DimensionInfo {
            name: name.to_string(),
            size,
            unlimited,
        });
        Ok(())
    }

    fn define_variable(&mut self, info: VariableInfo) -> Result<()> {
        if self.variables.iter().any(|v| v.name == info.name) {
            return Err(Error::config(format!(
                "variable '{}' already defined",
                info.name
            )));
        }
        for dim in &info.dimensions {
            if !self.dimensions.iter().any(|d| d.name == *dim) {
                return Err(Error::config(format!(
                    "variable '{}' references undefined dimension '{dim}'",
                    info.name
                )));
            }
        }
        self.variables.push(info);
        Ok(())
    }

    fn set_attributes(&mut self, attributes: Metadata) {
        self.attributes = attributes;
    }

    fn write(&mut self, name: &str, data: &VariantArray) -> Result<()> {
        let info = self
            .variables
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| Error::config(format!("variable '{name}' not defined")))?;
        let expected: u64 = info
            .dimensions
            .iter()
            .map(|dim| {
                self.dimensions
                    .iter()
                    .find(|d| d.name == *dim)
                    .map(|d| d.size)
                    .unwrap_or(0)
            })
            .product();
        if data.len() as u64 != expected {
            return Err(Error::semantic(format!(
                "variable '{name}' expects {expected} values, got {}",
                data.len()
            )));
        }
        self.data.insert(name.to_string(), data.clone());
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut stream = BinaryStream::new();
        stream.append_raw(MAGIC);
        stream.append_u32(VERSION);
        self.attributes.to_stream(&mut stream);
        stream.append_u64(self.dimensions.len() as u64);
        for dim in &self.dimensions {
            stream.append_str(&dim.name);
            stream.append_u64(dim.size);
            stream.append_u8(dim.unlimited as u8);
        }
        stream.append_u64(self.variables.len() as u64);
        for info in &self.variables {
            stream.append_str(&info.name);
            stream.append_u64(info.dimensions.len() as u64);
            for dim in &info.dimensions {
                stream.append_str(dim);
            }
            stream.append_u8(info.element_type.code());
            info.attributes.to_stream(&mut stream);
            match self.data.get(&info.name) {
                Some(array) => array.to_stream(&mut stream),
                None => info.element_type.empty().to_stream(&mut stream),
            }
        }
        std::fs::write(&self.path, stream.as_bytes())?;
        Ok(())
    }
}
