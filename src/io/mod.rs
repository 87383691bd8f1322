//! File-format drivers.
//!
//! The reader and writer stages talk to on-disk containers through the
//! [`FormatDriver`] trait, which models exactly the surface a
//! CF-conventions NetCDF binding exposes: named dimensions (one may be
//! unlimited), typed variables with dimension tuples and attribute maps,
//! whole-variable and hyperslab reads. The bundled implementation is the
//! pure-Rust [`native`] container; a libnetcdf-backed driver implements
//! the same trait.
//!
//! Third-party format libraries are often not thread-safe; when a driver
//! says so, every call from a pool worker must hold the process-wide
//! serial guard.

pub mod native;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::array::{ElementType, VariantArray};
use crate::error::Result;
use crate::metadata::Metadata;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionInfo {
    pub name: String,
    pub size: u64,
    pub unlimited: bool,
}

#[derive(Debug, Clone)]
pub struct VariableInfo {
    pub name: String,
    /// Dimension names, slowest varying first.
    pub dimensions: Vec<String>,
    pub element_type: ElementType,
    pub attributes: Metadata,
}

pub trait FormatFile: Send {
    fn dimensions(&self) -> &[DimensionInfo];

    fn dimension(&self, name: &str) -> Option<&DimensionInfo> {
        self.dimensions().iter().find(|d| d.name == name)
    }

    fn variables(&self) -> &[VariableInfo];

    fn variable(&self, name: &str) -> Option<&VariableInfo> {
        self.variables().iter().find(|v| v.name == name)
    }

    /// Global (file level) attributes.
    fn attributes(&self) -> &Metadata;

    /// Reads a whole variable.
    fn read(&self, name: &str) -> Result<VariantArray>;

    /// Reads the hyperslab `starts[d] .. starts[d]+counts[d]` along each
    /// of the variable's dimensions, slowest varying first.
    fn read_hyperslab(&self, name: &str, starts: &[u64], counts: &[u64]) -> Result<VariantArray>;
}

pub trait FormatFileWriter: Send {
    fn define_dimension(&mut self, name: &str, size: u64, unlimited: bool) -> Result<()>;

    fn define_variable(&mut self, info: VariableInfo) -> Result<()>;

    fn set_attributes(&mut self, attributes: Metadata);

    fn write(&mut self, name: &str, data: &VariantArray) -> Result<()>;

    /// Flushes the container to disk.
    fn close(self: Box<Self>) -> Result<()>;
}

pub trait FormatDriver: Send + Sync {
    /// Whether concurrent driver calls are safe without the serial guard.
    fn thread_safe(&self) -> bool {
        false
    }

    fn open(&self, path: &Path) -> Result<Box<dyn FormatFile>>;

    fn create(&self, path: &Path) -> Result<Box<dyn FormatFileWriter>>;
}

pub type DriverRef = Arc<dyn FormatDriver>;

static SERIAL: Mutex<()> = Mutex::new(());

/// Serializes access to a non-thread-safe driver. Hold the returned guard
/// across every driver call made from a pool worker.
pub fn serial_guard(driver: &dyn FormatDriver) -> Option<MutexGuard<'static, ()>> {
    if driver.thread_safe() {
        None
    } else {
        Some(SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}
