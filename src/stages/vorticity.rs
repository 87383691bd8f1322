//! Relative vorticity of a horizontal wind field.
//!
//! Computes `ζ = (1 / (R cosφ)) (∂v/∂λ − ∂(u cosφ)/∂φ)` on a lat/lon
//! mesh with central differences in the interior; the boundary ring is
//! set to zero. Latitude and longitude are taken from the mesh
//! coordinates in degrees.

use std::sync::Arc;

use async_trait::async_trait;

use crate::algorithm::{
    Algorithm, Request, drop_array, forward_index_keys, keys, request_arrays,
};
use crate::array::VariantArray;
use crate::dataset::{Dataset, DatasetRef};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::properties::{self, PropertySpec};

const EARTH_RADIUS: f64 = 6371.0e3;

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec {
        name: "component_0_variable",
        type_name: "string",
        default: "u",
        description: "zonal wind component",
    },
    PropertySpec {
        name: "component_1_variable",
        type_name: "string",
        default: "v",
        description: "meridional wind component",
    },
    PropertySpec {
        name: "vorticity_variable",
        type_name: "string",
        default: "vorticity",
        description: "name of the produced vorticity array",
    },
];

pub struct Vorticity {
    component_0_variable: String,
    component_1_variable: String,
    vorticity_variable: String,
}

impl Vorticity {
    pub fn new() -> Self {
        Self {
            component_0_variable: "u".to_string(),
            component_1_variable: "v".to_string(),
            vorticity_variable: "vorticity".to_string(),
        }
    }
}

impl Default for Vorticity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Algorithm for Vorticity {
    fn name(&self) -> &'static str {
        "vorticity"
    }

    fn property_schema(&self) -> &'static [PropertySpec] {
        PROPERTIES
    }

    fn set_property(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        match key {
            "component_0_variable" => {
                self.component_0_variable = properties::as_string(key, &value)?
            }
            "component_1_variable" => {
                self.component_1_variable = properties::as_string(key, &value)?
            }
            "vorticity_variable" => self.vorticity_variable = properties::as_string(key, &value)?,
            _ => {
                return Err(Error::config(format!("vorticity has no property '{key}'")));
            }
        }
        Ok(())
    }

    async fn report_metadata(&self, _port: usize, input_md: &[Metadata]) -> Result<Metadata> {
        let mut report = input_md[0].clone();
        forward_index_keys(&mut report, &input_md[0])?;

        let mut variables = report.get_strings(keys::VARIABLES).unwrap_or_default();
        variables.push(self.vorticity_variable.clone());
        report.set_strings(keys::VARIABLES, variables);

        let mut attributes = report
            .get_nested(keys::ATTRIBUTES)
            .cloned()
            .unwrap_or_default();
        let mut atts = Metadata::new();
        atts.set_string("units", "1/s");
        atts.set_string("long_name", "relative vorticity");
        attributes.set_nested(self.vorticity_variable.clone(), atts);
        report.set_nested(keys::ATTRIBUTES, attributes);
        Ok(report)
    }

    fn translate_request(
        &self,
        _port: usize,
        _input_md: &[Metadata],
        request: &Request,
    ) -> Result<Vec<Vec<Request>>> {
        let mut upstream = request.clone();
        request_arrays(
            &mut upstream,
            &[&self.component_0_variable, &self.component_1_variable],
        );
        drop_array(&mut upstream, &self.vorticity_variable);
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
            .ok_or_else(|| Error::config("vorticity executed with no input"))?;
        let mesh = input
            .as_mesh()
            .ok_or_else(|| Error::semantic("vorticity expects a cartesian mesh"))?;
        let (ni, nj, nk) = mesh.extent_spans();
        if nk != 1 {
            return Err(Error::semantic(
                "vorticity expects a single vertical level",
            ));
        }

        let fetch = |name: &str| -> Result<Vec<f64>> {
            mesh.point_arrays
                .get(name)
                .and_then(|a| a.to_f64_vec())
                .ok_or_else(|| Error::semantic(format!("no numeric point array '{name}'")))
        };
        let u = fetch(&self.component_0_variable)?;
        let v = fetch(&self.component_1_variable)?;
        let lon = mesh
            .x_coordinates()
            .to_f64_vec()
            .ok_or_else(|| Error::semantic("non-numeric x coordinates"))?;
        let lat = mesh
            .y_coordinates()
            .to_f64_vec()
            .ok_or_else(|| Error::semantic("non-numeric y coordinates"))?;

        let deg = std::f64::consts::PI / 180.0;
        let mut zeta = vec![0.0f64; ni * nj];
        for j in 1..nj.saturating_sub(1) {
            let phi = lat[j] * deg;
            let cos_phi = phi.cos();
            let dphi = (lat[j + 1] - lat[j - 1]) * deg;
            for i in 1..ni.saturating_sub(1) {
                let dlambda = (lon[i + 1] - lon[i - 1]) * deg;
                let dv_dlambda = (v[j * ni + i + 1] - v[j * ni + i - 1]) / dlambda;
                let du_cos_dphi = (u[(j + 1) * ni + i] * (lat[j + 1] * deg).cos()
                    - u[(j - 1) * ni + i] * (lat[j - 1] * deg).cos())
                    / dphi;
                zeta[j * ni + i] = (dv_dlambda - du_cos_dphi) / (EARTH_RADIUS * cos_phi);
            }
        }

        let mut output = mesh.clone();
        output
            .point_arrays
            .set(self.vorticity_variable.clone(), Arc::new(VariantArray::from(zeta)));
        Ok(Arc::new(Dataset::Mesh(output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::CartesianMesh;

    fn mesh_with_uniform_wind() -> CartesianMesh {
        let mut mesh = CartesianMesh::new();
        mesh.set_x_coordinates("lon", Arc::new(VariantArray::from(vec![0.0f64, 10.0, 20.0])));
        mesh.set_y_coordinates("lat", Arc::new(VariantArray::from(vec![10.0f64, 0.0, -10.0])));
        mesh.set_z_coordinates("", Arc::new(VariantArray::from(vec![0.0f64])));
        mesh.set_extent([0, 2, 0, 2, 0, 0]);
        mesh.set_whole_extent([0, 2, 0, 2, 0, 0]);
        mesh.point_arrays
            .set("u", Arc::new(VariantArray::from(vec![1.0f64; 9])));
        mesh.point_arrays
            .set("v", Arc::new(VariantArray::from(vec![1.0f64; 9])));
        mesh
    }

    #[tokio::test]
    async fn uniform_wind_has_zero_interior_vorticity() {
        let stage = Vorticity::new();
        let out = stage
            .execute(
                0,
                vec![Arc::new(Dataset::Mesh(mesh_with_uniform_wind()))],
                &Request::new(),
            )
            .await
            .unwrap();
        let mesh = out.as_mesh().unwrap();
        let zeta = mesh.point_arrays.get("vorticity").unwrap();
        // Interior point is at lat 0 where d(u cos phi)/dphi vanishes.
        assert!(zeta.get_f64(4).unwrap().abs() < 1.0e-12);
    }

    #[test]
    fn request_translation_adds_inputs_and_drops_output() {
        let stage = Vorticity::new();
        let mut request = Request::new();
        request_arrays(&mut request, &["vorticity"]);
        let upstream = stage
            .translate_request(0, &[Metadata::new()], &request)
            .unwrap();
        let arrays = upstream[0][0].get_strings(keys::ARRAYS).unwrap();
        assert!(arrays.contains(&"u".to_string()));
        assert!(arrays.contains(&"v".to_string()));
        assert!(!arrays.contains(&"vorticity".to_string()));
    }
}
