//! The stage contract.
//!
//! A pipeline stage is a node with N input and M output ports and three
//! operations: report the metadata its outputs can provide, translate a
//! downstream request into per-input upstream requests, and execute a
//! request against the upstream datasets. Requests and reported metadata
//! are plain [`Metadata`] maps; the well-known keys live in [`keys`].
//!
//! Map-reduce stages additionally expose a binary reduce operator and an
//! ordering mode; the driver schedules their upstream request sequences
//! with bounded concurrency and folds results through the operator.

use async_trait::async_trait;

use crate::dataset::DatasetRef;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::properties::PropertySpec;

/// A request is metadata addressed to one stage output.
pub type Request = Metadata;

/// Well-known metadata and request keys of the pipeline contract.
pub mod keys {
    /// Names the metadata entry holding the total work index count.
    pub const INDEX_INITIALIZER_KEY: &str = "index_initializer_key";
    /// Names the request entry carrying the requested work index.
    pub const INDEX_REQUEST_KEY: &str = "index_request_key";
    pub const ARRAYS: &str = "arrays";
    pub const BOUNDS: &str = "bounds";
    pub const EXTENT: &str = "extent";
    pub const VARIABLES: &str = "variables";
    pub const ATTRIBUTES: &str = "attributes";
    pub const COORDINATES: &str = "coordinates";
    pub const WHOLE_EXTENT: &str = "whole_extent";
    pub const FILES: &str = "files";
    pub const ROOT: &str = "root";
    pub const STEP_COUNT: &str = "step_count";
    pub const NUMBER_OF_TIME_STEPS: &str = "number_of_time_steps";

    // Entries of the nested `coordinates` metadata.
    pub const X_VARIABLE: &str = "x_variable";
    pub const Y_VARIABLE: &str = "y_variable";
    pub const Z_VARIABLE: &str = "z_variable";
    pub const T_VARIABLE: &str = "t_variable";
    pub const X: &str = "x";
    pub const Y: &str = "y";
    pub const Z: &str = "z";
    pub const T: &str = "t";
    pub const T_UNITS: &str = "t_units";
    pub const CALENDAR: &str = "calendar";
}

/// How the driver may fold a map-reduce stage's partial results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOrder {
    /// The operator is associative and commutative; partials combine in
    /// completion order.
    Unordered,
    /// Partials combine in upstream sequence order.
    Ordered,
}

#[async_trait]
pub trait Algorithm: Send + Sync {
    /// The stage type name, e.g. `"source"` or `"vorticity"`.
    fn name(&self) -> &'static str;

    fn input_ports(&self) -> usize {
        1
    }

    fn output_ports(&self) -> usize {
        1
    }

    /// The enumerated property table; applications build parsers from it.
    fn property_schema(&self) -> &'static [PropertySpec] {
        &[]
    }

    /// Routes a named property value into the stage. The driver invalidates
    /// the stage's cached report on every successful set.
    fn set_property(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        let _ = value;
        Err(Error::config(format!(
            "stage '{}' has no property '{key}'",
            self.name()
        )))
    }

    /// Produces this stage's output metadata from the reported metadata of
    /// each connected input. Must be pure in the stage properties and
    /// `input_md`.
    async fn report_metadata(&self, port: usize, input_md: &[Metadata]) -> Result<Metadata>;

    /// Produces one request sequence per input port for a downstream
    /// request. Ordinary stages return singleton sequences; map-reduce
    /// stages return one entry per upstream index they consume.
    fn translate_request(
        &self,
        port: usize,
        input_md: &[Metadata],
        request: &Request,
    ) -> Result<Vec<Vec<Request>>>;

    /// Produces the requested dataset from the upstream answers, one per
    /// input port (reduced when the port's request sequence fanned out).
    async fn execute(
        &self,
        port: usize,
        inputs: Vec<DatasetRef>,
        request: &Request,
    ) -> Result<DatasetRef>;

    /// `Some` marks a map-reduce stage and selects the fold order.
    fn reduction(&self) -> Option<ReduceOrder> {
        None
    }

    /// Binary reduce operator for map-reduce stages.
    fn reduce(&self, _left: DatasetRef, _right: DatasetRef) -> Result<DatasetRef> {
        Err(Error::config(format!(
            "stage '{}' is not a reducing stage",
            self.name()
        )))
    }

    /// Whether a failed upstream datum may be dropped from a reduction
    /// instead of failing the whole index.
    fn missing_ok(&self) -> bool {
        false
    }

    /// Width of the stage's fan-out scheduling; `-1` means hardware
    /// concurrency.
    fn concurrency(&self) -> isize {
        1
    }
}

/// Copies the index initializer/request contract from an upstream report
/// into a pass-through stage's report.
pub fn forward_index_keys(output: &mut Metadata, input: &Metadata) -> Result<()> {
    let init_key = input.require_string(keys::INDEX_INITIALIZER_KEY)?;
    let request_key = input.require_string(keys::INDEX_REQUEST_KEY)?;
    let count = input.require_u64(&init_key)?;
    output.set_string(keys::INDEX_INITIALIZER_KEY, init_key.clone());
    output.set_string(keys::INDEX_REQUEST_KEY, request_key);
    output.set_u64(init_key, count);
    Ok(())
}

/// The `arrays` set of a request; absent means none.
pub fn requested_arrays(request: &Request) -> Vec<String> {
    request.get_strings(keys::ARRAYS).unwrap_or_default()
}

/// Adds `names` to a request's `arrays` set, keeping it duplicate free.
pub fn request_arrays(request: &mut Request, names: &[&str]) {
    let mut arrays = requested_arrays(request);
    for name in names {
        if !arrays.iter().any(|a| a == name) {
            arrays.push((*name).to_string());
        }
    }
    request.set_strings(keys::ARRAYS, arrays);
}

/// Removes `name` from a request's `arrays` set if present.
pub fn drop_array(request: &mut Request, name: &str) {
    let arrays: Vec<String> = requested_arrays(request)
        .into_iter()
        .filter(|a| a != name)
        .collect();
    request.set_strings(keys::ARRAYS, arrays);
}
