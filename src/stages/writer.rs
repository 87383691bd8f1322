//! The terminal writer stage.
//!
//! A pass-through sink: forwards requests upstream untouched, writes each
//! answered dataset to disk, and hands the dataset downstream unchanged.
//! Meshes go into the native container; tables are written as CSV. The
//! `%t%` token in `file_name` is replaced with the request index, which
//! keeps per-rank outputs distinct under the block partition.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::algorithm::{Algorithm, Request, forward_index_keys, keys};
use crate::dataset::{CartesianMesh, Dataset, DatasetRef};
use crate::error::{Error, Result};
use crate::io::{DriverRef, VariableInfo};
use crate::metadata::Metadata;
use crate::properties::{self, PropertySpec};

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec {
        name: "file_name",
        type_name: "string",
        default: "",
        description: "output path; the %t% token is replaced with the request index",
    },
    PropertySpec {
        name: "output_format",
        type_name: "string",
        default: "auto",
        description: "auto, native, or csv; auto picks by dataset shape and extension",
    },
];

pub struct Writer {
    driver: DriverRef,
    file_name: String,
    output_format: String,
    /// Upstream index request key, captured at report time.
    request_key: Mutex<Option<String>>,
}

impl Writer {
    pub fn new(driver: DriverRef) -> Self {
        Self {
            driver,
            file_name: String::new(),
            output_format: "auto".to_string(),
            request_key: Mutex::new(None),
        }
    }

    fn output_path(&self, index: u64) -> Result<PathBuf> {
        if self.file_name.is_empty() {
            return Err(Error::config("writer needs a 'file_name' property"));
        }
        if !self.file_name.contains("%t%") {
            tracing::warn!(
                file_name = %self.file_name,
                "file_name has no %t% token, successive indices overwrite"
            );
        }
        Ok(PathBuf::from(
            self.file_name.replace("%t%", &index.to_string()),
        ))
    }

    fn write_mesh(&self, mesh: &CartesianMesh, path: &PathBuf) -> Result<()> {
        let mut writer = self.driver.create(path)?;

        let x_name = nonempty(mesh.x_variable(), "lon");
        let y_name = nonempty(mesh.y_variable(), "lat");
        let z_name = nonempty(mesh.z_variable(), "z");
        let t_name = nonempty(mesh.t_variable(), "time");
        let (ni, nj, nk) = mesh.extent_spans();

        writer.define_dimension(&t_name, 1, true)?;
        if nk > 1 || !mesh.z_variable().is_empty() {
            writer.define_dimension(&z_name, nk as u64, false)?;
        }
        writer.define_dimension(&y_name, nj as u64, false)?;
        writer.define_dimension(&x_name, ni as u64, false)?;

        let attributes = mesh.metadata.get_nested(keys::ATTRIBUTES);
        let var_attributes = |name: &str| -> Metadata {
            attributes
                .and_then(|a| a.get_nested(name))
                .cloned()
                .unwrap_or_default()
        };

        // Coordinate variables.
        let mut time_atts = var_attributes(&t_name);
        if let Some(units) = mesh.metadata.get_string(keys::T_UNITS) {
            time_atts.set_string("units", units);
        }
        if let Some(calendar) = mesh.metadata.get_string(keys::CALENDAR) {
            time_atts.set_string("calendar", calendar);
        }
        writer.define_variable(VariableInfo {
            name: t_name.clone(),
            dimensions: vec![t_name.clone()],
            element_type: crate::array::ElementType::Float64,
            attributes: time_atts,
        })?;
        for (name, dims, coords) in [
            (&x_name, vec![x_name.clone()], mesh.x_coordinates()),
            (&y_name, vec![y_name.clone()], mesh.y_coordinates()),
        ] {
            writer.define_variable(VariableInfo {
                name: name.clone(),
                dimensions: dims,
                element_type: coords.element_type(),
                attributes: var_attributes(name),
            })?;
        }
        if nk > 1 || !mesh.z_variable().is_empty() {
            writer.define_variable(VariableInfo {
                name: z_name.clone(),
                dimensions: vec![z_name.clone()],
                element_type: mesh.z_coordinates().element_type(),
                attributes: var_attributes(&z_name),
            })?;
        }

        // Point arrays: [time][z] y x.
        let mut spatial_dims = Vec::new();
        spatial_dims.push(t_name.clone());
        if nk > 1 || !mesh.z_variable().is_empty() {
            spatial_dims.push(z_name.clone());
        }
        spatial_dims.push(y_name.clone());
        spatial_dims.push(x_name.clone());
        for (name, array) in mesh.point_arrays.iter() {
            writer.define_variable(VariableInfo {
                name: name.to_string(),
                dimensions: spatial_dims.clone(),
                element_type: array.element_type(),
                attributes: var_attributes(name),
            })?;
        }

        // Information arrays get their own private dimensions.
        for (name, array) in mesh.info_arrays.iter() {
            let dim = format!("dim_{name}");
            writer.define_dimension(&dim, array.len() as u64, false)?;
            writer.define_variable(VariableInfo {
                name: name.to_string(),
                dimensions: vec![dim],
                element_type: array.element_type(),
                attributes: var_attributes(name),
            })?;
        }

        writer.write(
            &t_name,
            &crate::array::VariantArray::from(vec![mesh.time()]),
        )?;
        writer.write(&x_name, mesh.x_coordinates())?;
        writer.write(&y_name, mesh.y_coordinates())?;
        if nk > 1 || !mesh.z_variable().is_empty() {
            writer.write(&z_name, mesh.z_coordinates())?;
        }
        for (name, array) in mesh.point_arrays.iter() {
            writer.write(name, array)?;
        }
        for (name, array) in mesh.info_arrays.iter() {
            writer.write(name, array)?;
        }
        writer.close()?;
        Ok(())
    }
}

fn nonempty(name: &str, fallback: &str) -> String {
    if name.is_empty() {
        fallback.to_string()
    } else {
        name.to_string()
    }
}

#[async_trait]
impl Algorithm for Writer {
    fn name(&self) -> &'static str {
        "writer"
    }

    fn property_schema(&self) -> &'static [PropertySpec] {
        PROPERTIES
    }

    fn set_property(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        match key {
            "file_name" => self.file_name = properties::as_string(key, &value)?,
            "output_format" => {
                let format = properties::as_string(key, &value)?;
                if !["auto", "native", "csv"].contains(&format.as_str()) {
                    return Err(Error::config(format!(
                        "output_format must be auto, native or csv, got '{format}'"
                    )));
                }
                self.output_format = format;
            }
            _ => {
                return Err(Error::config(format!("writer has no property '{key}'")));
            }
        }
        Ok(())
    }

    async fn report_metadata(&self, _port: usize, input_md: &[Metadata]) -> Result<Metadata> {
        let mut report = input_md[0].clone();
        forward_index_keys(&mut report, &input_md[0])?;
        *self.request_key.lock().unwrap() =
            Some(report.require_string(keys::INDEX_REQUEST_KEY)?);
        Ok(report)
    }

    fn translate_request(
        &self,
        _port: usize,
        _input_md: &[Metadata],
        request: &Request,
    ) -> Result<Vec<Vec<Request>>> {
        Ok(vec![vec![request.clone()]])
    }

    async fn execute(
        &self,
        _port: usize,
        inputs: Vec<DatasetRef>,
        request: &Request,
    ) -> Result<DatasetRef> {
        let dataset = inputs
            .into_iter()
            .next()
            .ok_or_else(|| Error::config("writer executed with no input"))?;
        let index = self
            .request_key
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|key| request.get_u64(key))
            .unwrap_or(0);
        let path = self.output_path(index)?;

        match dataset.as_ref() {
            Dataset::Empty => {
                tracing::warn!(index, "nothing to write for this index");
            }
            Dataset::Mesh(mesh) => {
                if self.output_format == "csv" {
                    return Err(Error::config("csv output requires a table dataset"));
                }
                self.write_mesh(mesh, &path)?;
                tracing::info!(path = %path.display(), index, "wrote mesh");
            }
            Dataset::Table(table) => {
                let csv = self.output_format != "native";
                if csv {
                    std::fs::write(&path, table.to_csv())?;
                } else {
                    let mut stream = crate::stream::BinaryStream::new();
                    dataset.to_stream(&mut stream);
                    std::fs::write(&path, stream.as_bytes())?;
                }
                tracing::info!(path = %path.display(), index, "wrote table");
            }
        }
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::native::NativeDriver;
    use std::sync::Arc;

    #[test]
    fn path_interpolation() {
        let mut writer = Writer::new(Arc::new(NativeDriver));
        writer
            .set_property("file_name", serde_json::json!("out_%t%.cfb"))
            .unwrap();
        assert_eq!(writer.output_path(7).unwrap(), PathBuf::from("out_7.cfb"));
    }

    #[test]
    fn missing_file_name_is_a_config_error() {
        let writer = Writer::new(Arc::new(NativeDriver));
        assert!(writer.output_path(0).is_err());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let mut writer = Writer::new(Arc::new(NativeDriver));
        assert!(
            writer
                .set_property("output_format", serde_json::json!("hdf"))
                .is_err()
        );
    }
}
