//! Cartesian (rectilinear) meshes.
//!
//! A mesh carries per-axis coordinate arrays, a scalar time, the inclusive
//! index `extent` it covers, the `whole_extent` of the dataset it was
//! sliced from, world-space `bounds`, and point/cell/information array
//! collections. Point arrays are indexed `i + ni*(j + nj*k)` with x
//! fastest.

use std::sync::Arc;

use crate::array::VariantArray;
use crate::dataset::{ArrayCollection, ArrayRef};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::stream::BinaryStream;

#[derive(Debug, Clone, PartialEq)]
pub struct CartesianMesh {
    pub metadata: Metadata,
    pub point_arrays: ArrayCollection,
    pub cell_arrays: ArrayCollection,
    pub info_arrays: ArrayCollection,
    x_variable: String,
    y_variable: String,
    z_variable: String,
    t_variable: String,
    x_coordinates: ArrayRef,
    y_coordinates: ArrayRef,
    z_coordinates: ArrayRef,
    time: f64,
    time_step: u64,
    extent: [u64; 6],
    whole_extent: [u64; 6],
    bounds: [f64; 6],
}

impl Default for CartesianMesh {
    fn default() -> Self {
        let empty = || Arc::new(VariantArray::Float64(Vec::new()));
        Self {
            metadata: Metadata::new(),
            point_arrays: ArrayCollection::new(),
            cell_arrays: ArrayCollection::new(),
            info_arrays: ArrayCollection::new(),
            x_variable: String::new(),
            y_variable: String::new(),
            z_variable: String::new(),
            t_variable: String::new(),
            x_coordinates: empty(),
            y_coordinates: empty(),
            z_coordinates: empty(),
            time: 0.0,
            time_step: 0,
            extent: [0; 6],
            whole_extent: [0; 6],
            bounds: [0.0; 6],
        }
    }
}

impl CartesianMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_x_coordinates(&mut self, variable: impl Into<String>, coords: ArrayRef) {
        self.x_variable = variable.into();
        self.x_coordinates = coords;
    }

    pub fn set_y_coordinates(&mut self, variable: impl Into<String>, coords: ArrayRef) {
        self.y_variable = variable.into();
        self.y_coordinates = coords;
    }

    pub fn set_z_coordinates(&mut self, variable: impl Into<String>, coords: ArrayRef) {
        self.z_variable = variable.into();
        self.z_coordinates = coords;
    }

    pub fn set_t_variable(&mut self, variable: impl Into<String>) {
        self.t_variable = variable.into();
    }

    pub fn x_coordinates(&self) -> &ArrayRef {
        &self.x_coordinates
    }

    pub fn y_coordinates(&self) -> &ArrayRef {
        &self.y_coordinates
    }

    pub fn z_coordinates(&self) -> &ArrayRef {
        &self.z_coordinates
    }

    pub fn x_variable(&self) -> &str {
        &self.x_variable
    }

    pub fn y_variable(&self) -> &str {
        &self.y_variable
    }

    pub fn z_variable(&self) -> &str {
        &self.z_variable
    }

    pub fn t_variable(&self) -> &str {
        &self.t_variable
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    pub fn time_step(&self) -> u64 {
        self.time_step
    }

    pub fn set_time_step(&mut self, step: u64) {
        self.time_step = step;
    }

    pub fn extent(&self) -> [u64; 6] {
        self.extent
    }

    pub fn set_extent(&mut self, extent: [u64; 6]) {
        self.extent = extent;
    }

    pub fn whole_extent(&self) -> [u64; 6] {
        self.whole_extent
    }

    pub fn set_whole_extent(&mut self, extent: [u64; 6]) {
        self.whole_extent = extent;
    }

    pub fn bounds(&self) -> [f64; 6] {
        self.bounds
    }

    pub fn set_bounds(&mut self, bounds: [f64; 6]) {
        self.bounds = bounds;
    }

    /// Per-axis point counts of the local extent.
    pub fn extent_spans(&self) -> (usize, usize, usize) {
        let e = &self.extent;
        (
            (e[1] - e[0] + 1) as usize,
            (e[3] - e[2] + 1) as usize,
            (e[5] - e[4] + 1) as usize,
        )
    }

    pub fn n_points(&self) -> usize {
        let (ni, nj, nk) = self.extent_spans();
        ni * nj * nk
    }

    pub fn n_cells(&self) -> usize {
        let (ni, nj, nk) = self.extent_spans();
        ni.saturating_sub(1).max(1) * nj.saturating_sub(1).max(1) * nk.saturating_sub(1).max(1)
    }

    /// Checks the coordinate and point-array size invariants.
    pub fn validate(&self) -> Result<()> {
        let (ni, nj, nk) = self.extent_spans();
        for (axis, len, n) in [
            ("x", self.x_coordinates.len(), ni),
            ("y", self.y_coordinates.len(), nj),
            ("z", self.z_coordinates.len(), nk),
        ] {
            if len != n {
                return Err(Error::semantic(format!(
                    "{axis} coordinates have {len} values, extent requires {n}"
                )));
            }
        }
        let n_points = self.n_points();
        for (name, array) in self.point_arrays.iter() {
            if array.len() != n_points {
                return Err(Error::semantic(format!(
                    "point array '{name}' has {} values, extent requires {n_points}",
                    array.len()
                )));
            }
        }
        Ok(())
    }

    pub fn to_stream(&self, stream: &mut BinaryStream) {
        self.metadata.to_stream(stream);
        stream.append_str(&self.x_variable);
        stream.append_str(&self.y_variable);
        stream.append_str(&self.z_variable);
        stream.append_str(&self.t_variable);
        self.x_coordinates.to_stream(stream);
        self.y_coordinates.to_stream(stream);
        self.z_coordinates.to_stream(stream);
        stream.append_f64(self.time);
        stream.append_u64(self.time_step);
        self.extent.iter().for_each(|v| stream.append_u64(*v));
        self.whole_extent.iter().for_each(|v| stream.append_u64(*v));
        self.bounds.iter().for_each(|v| stream.append_f64(*v));
        self.point_arrays.to_stream(stream);
        self.cell_arrays.to_stream(stream);
        self.info_arrays.to_stream(stream);
    }

    pub fn from_stream(stream: &mut BinaryStream) -> Result<Self> {
        let metadata = Metadata::from_stream(stream)?;
        let x_variable = stream.consume_str()?;
        let y_variable = stream.consume_str()?;
        let z_variable = stream.consume_str()?;
        let t_variable = stream.consume_str()?;
        let x_coordinates = Arc::new(VariantArray::from_stream(stream)?);
        let y_coordinates = Arc::new(VariantArray::from_stream(stream)?);
        let z_coordinates = Arc::new(VariantArray::from_stream(stream)?);
        let time = stream.consume_f64()?;
        let time_step = stream.consume_u64()?;
        let mut extent = [0u64; 6];
        for v in extent.iter_mut() {
            *v = stream.consume_u64()?;
        }
        let mut whole_extent = [0u64; 6];
        for v in whole_extent.iter_mut() {
            *v = stream.consume_u64()?;
        }
        let mut bounds = [0.0f64; 6];
        for v in bounds.iter_mut() {
            *v = stream.consume_f64()?;
        }
        Ok(Self {
            metadata,
            point_arrays: ArrayCollection::from_stream(stream)?,
            cell_arrays: ArrayCollection::from_stream(stream)?,
            info_arrays: ArrayCollection::from_stream(stream)?,
            x_variable,
            y_variable,
            z_variable,
            t_variable,
            x_coordinates,
            y_coordinates,
            z_coordinates,
            time,
            time_step,
            extent,
            whole_extent,
            bounds,
        })
    }
}
