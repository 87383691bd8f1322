//! Atmospheric river detection.
//!
//! Thresholds the integrated vapor transport magnitude, labels the
//! 4-connected components of the exceedance mask (optionally periodic in
//! x), filters small objects, and emits one table row per detected
//! feature: time, component id, cell count, bounding box and peak value.
//! The stage always requests the full horizontal domain upstream so that
//! components are not cut at subset edges.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use crate::algorithm::{Algorithm, Request, forward_index_keys, keys};
use crate::array::{ElementType, VariantArray};
use crate::dataset::{Dataset, DatasetRef, Table};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::properties::{self, PropertySpec};

const COLUMNS: &[&str] = &[
    "time_step",
    "time",
    "component_id",
    "n_cells",
    "min_lon",
    "max_lon",
    "min_lat",
    "max_lat",
    "peak",
];

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec {
        name: "ivt_variable",
        type_name: "string",
        default: "ivt",
        description: "transport magnitude field to threshold",
    },
    PropertySpec {
        name: "threshold",
        type_name: "float",
        default: "250",
        description: "exceedance threshold in the field's units",
    },
    PropertySpec {
        name: "min_cells",
        type_name: "int",
        default: "8",
        description: "smallest component, in mesh cells, worth reporting",
    },
    PropertySpec {
        name: "periodic_x",
        type_name: "bool",
        default: "true",
        description: "treat the x axis as periodic when labelling",
    },
];

pub struct ArDetect {
    ivt_variable: String,
    threshold: f64,
    min_cells: u64,
    periodic_x: bool,
}

impl ArDetect {
    pub fn new() -> Self {
        Self {
            ivt_variable: "ivt".to_string(),
            threshold: 250.0,
            min_cells: 8,
            periodic_x: true,
        }
    }
}

impl Default for ArDetect {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Algorithm for ArDetect {
    fn name(&self) -> &'static str {
        "ar_detect"
    }

    fn property_schema(&self) -> &'static [PropertySpec] {
        PROPERTIES
    }

    fn set_property(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        match key {
            "ivt_variable" => self.ivt_variable = properties::as_string(key, &value)?,
            "threshold" => self.threshold = properties::as_f64(key, &value)?,
            "min_cells" => self.min_cells = properties::as_u64(key, &value)?,
            "periodic_x" => self.periodic_x = properties::as_bool(key, &value)?,
            _ => {
                return Err(Error::config(format!("ar_detect has no property '{key}'")));
            }
        }
        Ok(())
    }

    async fn report_metadata(&self, _port: usize, input_md: &[Metadata]) -> Result<Metadata> {
        // The time axis passes through so the executive can still resolve
        // date ranges; the advertised variables become table columns.
        let mut report = input_md[0].clone();
        forward_index_keys(&mut report, &input_md[0])?;
        report.set_strings(
            keys::VARIABLES,
            COLUMNS.iter().map(|c| c.to_string()).collect(),
        );
        Ok(report)
    }

    fn translate_request(
        &self,
        _port: usize,
        _input_md: &[Metadata],
        request: &Request,
    ) -> Result<Vec<Vec<Request>>> {
        let mut upstream = request.clone();
        // The table columns are produced here; upstream only supplies the
        // transport field, over the whole domain.
        upstream.set_strings(keys::ARRAYS, vec![self.ivt_variable.clone()]);
        upstream.remove(keys::EXTENT);
        upstream.remove(keys::BOUNDS);
        Ok(vec![vec![upstream]])
    }

    async fn execute(
        &self,
        _port: usize,
        inputs: Vec<DatasetRef>,
        _request: &Request,
    ) -> Result<DatasetRef> {
        let input = inputs
            .into_iter()
            .next()
            .ok_or_else(|| Error::config("ar_detect executed with no input"))?;
        let mesh = input
            .as_mesh()
            .ok_or_else(|| Error::semantic("ar_detect expects a cartesian mesh"))?;
        let (ni, nj, nk) = mesh.extent_spans();
        if nk != 1 {
            return Err(Error::semantic("ar_detect expects a single vertical level"));
        }
        let field = mesh
            .point_arrays
            .get(&self.ivt_variable)
            .and_then(|a| a.to_f64_vec())
            .ok_or_else(|| {
                Error::semantic(format!("no numeric point array '{}'", self.ivt_variable))
            })?;
        let lon = mesh
            .x_coordinates()
            .to_f64_vec()
            .ok_or_else(|| Error::semantic("non-numeric x coordinates"))?;
        let lat = mesh
            .y_coordinates()
            .to_f64_vec()
            .ok_or_else(|| Error::semantic("non-numeric y coordinates"))?;

        let mask: Vec<bool> = field.iter().map(|v| *v >= self.threshold).collect();
        let components = label_components(&mask, ni, nj, self.periodic_x);

        let mut table = Table::new();
        table.declare_column("time_step", ElementType::UInt64);
        table.declare_column("time", ElementType::Float64);
        table.declare_column("component_id", ElementType::UInt64);
        table.declare_column("n_cells", ElementType::UInt64);
        table.declare_column("min_lon", ElementType::Float64);
        table.declare_column("max_lon", ElementType::Float64);
        table.declare_column("min_lat", ElementType::Float64);
        table.declare_column("max_lat", ElementType::Float64);
        table.declare_column("peak", ElementType::Float64);

        let mut component_id = 0u64;
        for cells in components {
            if (cells.len() as u64) < self.min_cells {
                continue;
            }
            let mut min_lon = f64::INFINITY;
            let mut max_lon = f64::NEG_INFINITY;
            let mut min_lat = f64::INFINITY;
            let mut max_lat = f64::NEG_INFINITY;
            let mut peak = f64::NEG_INFINITY;
            for cell in &cells {
                let i = cell % ni;
                let j = cell / ni;
                min_lon = min_lon.min(lon[i]);
                max_lon = max_lon.max(lon[i]);
                min_lat = min_lat.min(lat[j]);
                max_lat = max_lat.max(lat[j]);
                peak = peak.max(field[*cell]);
            }
            push_u64(&mut table, "time_step", mesh.time_step());
            push_f64(&mut table, "time", mesh.time());
            push_u64(&mut table, "component_id", component_id);
            push_u64(&mut table, "n_cells", cells.len() as u64);
            push_f64(&mut table, "min_lon", min_lon);
            push_f64(&mut table, "max_lon", max_lon);
            push_f64(&mut table, "min_lat", min_lat);
            push_f64(&mut table, "max_lat", max_lat);
            push_f64(&mut table, "peak", peak);
            component_id += 1;
        }

        let mut metadata = Metadata::new();
        metadata.set_u64("time_step", mesh.time_step());
        metadata.set_f64("time", mesh.time());
        table.metadata = metadata;
        table.validate()?;
        Ok(Arc::new(Dataset::Table(table)))
    }
}

fn push_u64(table: &mut Table, column: &str, value: u64) {
    if let Some(VariantArray::UInt64(v)) = table.column_mut(column) {
        v.push(value);
    }
}

fn push_f64(table: &mut Table, column: &str, value: f64) {
    if let Some(VariantArray::Float64(v)) = table.column_mut(column) {
        v.push(value);
    }
}

/// 4-connected component labelling by breadth-first flood fill.
fn label_components(mask: &[bool], ni: usize, nj: usize, periodic_x: bool) -> Vec<Vec<usize>> {
    let mut visited = vec![false; mask.len()];
    let mut components = Vec::new();
    for seed in 0..mask.len() {
        if !mask[seed] || visited[seed] {
            continue;
        }
        let mut cells = Vec::new();
        let mut queue = VecDeque::from([seed]);
        visited[seed] = true;
        while let Some(cell) = queue.pop_front() {
            cells.push(cell);
            let i = cell % ni;
            let j = cell / ni;
            let mut neighbors = Vec::with_capacity(4);
            if i > 0 {
                neighbors.push(cell - 1);
            } else if periodic_x {
                neighbors.push(cell + ni - 1);
            }
            if i + 1 < ni {
                neighbors.push(cell + 1);
            } else if periodic_x {
                neighbors.push(cell + 1 - ni);
            }
            if j > 0 {
                neighbors.push(cell - ni);
            }
            if j + 1 < nj {
                neighbors.push(cell + ni);
            }
            for neighbor in neighbors {
                if mask[neighbor] && !visited[neighbor] {
                    visited[neighbor] = true;
                    queue.push_back(neighbor);
                }
            }
        }
        components.push(cells);
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::CartesianMesh;

    #[test]
    fn labelling_finds_separate_blobs() {
        // 4 x 3 mask with two components.
        #[rustfmt::skip]
        let mask = vec![
            true,  true,  false, false,
            false, false, false, true,
            false, false, false, true,
        ];
        let components = label_components(&mask, 4, 3, false);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec![0, 1]);
        assert_eq!(components[1], vec![7, 11]);
    }

    #[test]
    fn periodic_x_joins_edge_blobs() {
        #[rustfmt::skip]
        let mask = vec![
            true, false, false, true,
        ];
        assert_eq!(label_components(&mask, 4, 1, false).len(), 2);
        assert_eq!(label_components(&mask, 4, 1, true).len(), 1);
    }

    #[tokio::test]
    async fn detection_emits_one_row_per_feature() {
        let mut stage = ArDetect::new();
        stage
            .set_property("threshold", serde_json::json!(100.0))
            .unwrap();
        stage.set_property("min_cells", serde_json::json!(2)).unwrap();
        stage
            .set_property("periodic_x", serde_json::json!(false))
            .unwrap();

        let mut mesh = CartesianMesh::new();
        mesh.set_x_coordinates(
            "lon",
            Arc::new(VariantArray::from(vec![0.0f64, 10.0, 20.0, 30.0])),
        );
        mesh.set_y_coordinates(
            "lat",
            Arc::new(VariantArray::from(vec![-10.0f64, 0.0, 10.0])),
        );
        mesh.set_z_coordinates("", Arc::new(VariantArray::from(vec![0.0f64])));
        mesh.set_extent([0, 3, 0, 2, 0, 0]);
        mesh.set_whole_extent([0, 3, 0, 2, 0, 0]);
        mesh.set_time(5.0);
        mesh.set_time_step(5);
        // One 3-cell feature along the top row, one isolated cell.
        #[rustfmt::skip]
        let field = vec![
            0.0,   0.0,   0.0,   0.0,
            0.0,   0.0,   0.0,   150.0,
            120.0, 130.0, 140.0, 0.0,
        ];
        mesh.point_arrays
            .set("ivt", Arc::new(VariantArray::from(field)));

        let out = stage
            .execute(0, vec![Arc::new(Dataset::Mesh(mesh))], &Request::new())
            .await
            .unwrap();
        let table = out.as_table().unwrap();
        assert_eq!(table.n_rows(), 1);
        assert_eq!(table.column("n_cells").unwrap().get_f64(0), Some(3.0));
        assert_eq!(table.column("peak").unwrap().get_f64(0), Some(140.0));
        assert_eq!(table.column("min_lon").unwrap().get_f64(0), Some(0.0));
        assert_eq!(table.column("max_lon").unwrap().get_f64(0), Some(20.0));
        assert_eq!(table.column("min_lat").unwrap().get_f64(0), Some(10.0));
        assert_eq!(table.column("time_step").unwrap().get_f64(0), Some(5.0));
    }

    #[test]
    fn translation_strips_subsetting() {
        let stage = ArDetect::new();
        let mut request = Request::new();
        request.set_f64s(keys::BOUNDS, vec![0.0, 10.0, 0.0, 10.0, 0.0, 0.0]);
        request.set_u64("interval", 3);
        let upstream = stage
            .translate_request(0, &[Metadata::new()], &request)
            .unwrap();
        assert!(!upstream[0][0].has(keys::BOUNDS));
        assert_eq!(
            upstream[0][0].get_strings(keys::ARRAYS).unwrap(),
            vec!["ivt"]
        );
    }
}
