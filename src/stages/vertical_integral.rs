//! Vertical integration on hybrid levels.
//!
//! Integrates a column quantity over pressure:
//! `out = -(1/g) Σ_k q_k (p_{k+1} - p_k)` with interface pressures
//! `p_k = a_k p_top + b_k p_sfc`. The `a`/`b` coefficients are
//! information arrays with one value per level interface (nz + 1); the
//! surface pressure is an optional 2D point array. In `ivt` mode the
//! stage integrates `q·u` and `q·v` in one pass, producing the two
//! components of integrated vapor transport.
//!
//! The stage reduces rank: reported extent, bounds and coordinates
//! collapse the z axis to a single level, and a downstream request is
//! widened back to the full column upstream.

use std::sync::Arc;

use async_trait::async_trait;

use crate::algorithm::{
    Algorithm, Request, drop_array, forward_index_keys, keys, request_arrays,
};
use crate::array::VariantArray;
use crate::dataset::{CartesianMesh, Dataset, DatasetRef};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::properties::{self, PropertySpec};

const GRAVITY: f64 = 9.81;

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec {
        name: "mode",
        type_name: "string",
        default: "integral",
        description: "integral for one scalar, ivt for the two transport components",
    },
    PropertySpec {
        name: "integrand_variable",
        type_name: "string",
        default: "q",
        description: "column quantity to integrate (specific humidity for ivt)",
    },
    PropertySpec {
        name: "wind_u_variable",
        type_name: "string",
        default: "u",
        description: "zonal wind, ivt mode only",
    },
    PropertySpec {
        name: "wind_v_variable",
        type_name: "string",
        default: "v",
        description: "meridional wind, ivt mode only",
    },
    PropertySpec {
        name: "output_variable",
        type_name: "string",
        default: "q_int",
        description: "output name in integral mode; ivt mode appends _u and _v",
    },
    PropertySpec {
        name: "hybrid_a_variable",
        type_name: "string",
        default: "a_bnds",
        description: "hybrid coefficient a at level interfaces",
    },
    PropertySpec {
        name: "hybrid_b_variable",
        type_name: "string",
        default: "b_bnds",
        description: "hybrid coefficient b at level interfaces",
    },
    PropertySpec {
        name: "surface_pressure_variable",
        type_name: "string",
        default: "",
        description: "surface pressure point array; empty when b is zero everywhere",
    },
    PropertySpec {
        name: "p_top",
        type_name: "float",
        default: "100000",
        description: "reference pressure multiplying the a coefficients",
    },
];

pub struct VerticalIntegral {
    mode: String,
    integrand_variable: String,
    wind_u_variable: String,
    wind_v_variable: String,
    output_variable: String,
    hybrid_a_variable: String,
    hybrid_b_variable: String,
    surface_pressure_variable: String,
    p_top: f64,
}

impl VerticalIntegral {
    pub fn new() -> Self {
        Self {
            mode: "integral".to_string(),
            integrand_variable: "q".to_string(),
            wind_u_variable: "u".to_string(),
            wind_v_variable: "v".to_string(),
            output_variable: "q_int".to_string(),
            hybrid_a_variable: "a_bnds".to_string(),
            hybrid_b_variable: "b_bnds".to_string(),
            surface_pressure_variable: String::new(),
            p_top: 100000.0,
        }
    }

    fn is_ivt(&self) -> bool {
        self.mode == "ivt"
    }

    fn output_variables(&self) -> Vec<String> {
        if self.is_ivt() {
            vec![
                format!("{}_u", self.output_variable),
                format!("{}_v", self.output_variable),
            ]
        } else {
            vec![self.output_variable.clone()]
        }
    }

    /// Integrates `weight_k * q_k` over the column at every (j, i).
    fn integrate(
        &self,
        q: &[f64],
        factor: Option<&[f64]>,
        a: &[f64],
        b: &[f64],
        ps: Option<&[f64]>,
        ni: usize,
        nj: usize,
        nk: usize,
    ) -> Vec<f64> {
        let mut out = vec![0.0f64; ni * nj];
        for j in 0..nj {
            for i in 0..ni {
                let surface = ps.map_or(0.0, |ps| ps[j * ni + i]);
                let mut sum = 0.0;
                for k in 0..nk {
                    let p_lo = a[k] * self.p_top + b[k] * surface;
                    let p_hi = a[k + 1] * self.p_top + b[k + 1] * surface;
                    let cell = (k * nj + j) * ni + i;
                    let value = q[cell] * factor.map_or(1.0, |f| f[cell]);
                    sum += value * (p_hi - p_lo);
                }
                out[j * ni + i] = -sum / GRAVITY;
            }
        }
        out
    }
}

impl Default for VerticalIntegral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Algorithm for VerticalIntegral {
    fn name(&self) -> &'static str {
        "vertical_integral"
    }

    fn property_schema(&self) -> &'static [PropertySpec] {
        PROPERTIES
    }

    fn set_property(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        match key {
            "mode" => {
                let mode = properties::as_string(key, &value)?;
                if !["integral", "ivt"].contains(&mode.as_str()) {
                    return Err(Error::config(format!(
                        "mode must be integral or ivt, got '{mode}'"
                    )));
                }
                self.mode = mode;
            }
            "integrand_variable" => self.integrand_variable = properties::as_string(key, &value)?,
            "wind_u_variable" => self.wind_u_variable = properties::as_string(key, &value)?,
            "wind_v_variable" => self.wind_v_variable = properties::as_string(key, &value)?,
            "output_variable" => self.output_variable = properties::as_string(key, &value)?,
            "hybrid_a_variable" => self.hybrid_a_variable = properties::as_string(key, &value)?,
            "hybrid_b_variable" => self.hybrid_b_variable = properties::as_string(key, &value)?,
            "surface_pressure_variable" => {
                self.surface_pressure_variable = properties::as_string(key, &value)?
            }
            "p_top" => self.p_top = properties::as_f64(key, &value)?,
            _ => {
                return Err(Error::config(format!(
                    "vertical_integral has no property '{key}'"
                )));
            }
        }
        Ok(())
    }

    async fn report_metadata(&self, _port: usize, input_md: &[Metadata]) -> Result<Metadata> {
        let mut report = input_md[0].clone();
        forward_index_keys(&mut report, &input_md[0])?;

        // The output mesh is a single level.
        if let Some(mut extent) = report.get_u64s(keys::WHOLE_EXTENT) {
            if extent.len() == 6 {
                extent[4] = 0;
                extent[5] = 0;
                report.set_u64s(keys::WHOLE_EXTENT, extent);
            }
        }
        if let Some(mut bounds) = report.get_f64s(keys::BOUNDS) {
            if bounds.len() == 6 {
                bounds[4] = 0.0;
                bounds[5] = 0.0;
                report.set_f64s(keys::BOUNDS, bounds);
            }
        }
        if let Some(coordinates) = report.get_nested(keys::COORDINATES) {
            let mut coordinates = coordinates.clone();
            coordinates.set_f64s(keys::Z, vec![0.0]);
            coordinates.set_string(keys::Z_VARIABLE, "");
            report.set_nested(keys::COORDINATES, coordinates);
        }

        let mut variables = report.get_strings(keys::VARIABLES).unwrap_or_default();
        let mut attributes = report
            .get_nested(keys::ATTRIBUTES)
            .cloned()
            .unwrap_or_default();
        for output in self.output_variables() {
            let mut atts = Metadata::new();
            atts.set_string(
                "units",
                if self.is_ivt() { "kg m-1 s-1" } else { "kg m-2" },
            );
            atts.set_string("long_name", "vertically integrated");
            attributes.set_nested(output.clone(), atts);
            variables.push(output);
        }
        report.set_strings(keys::VARIABLES, variables);
        report.set_nested(keys::ATTRIBUTES, attributes);
        Ok(report)
    }

    fn translate_request(
        &self,
        _port: usize,
        input_md: &[Metadata],
        request: &Request,
    ) -> Result<Vec<Vec<Request>>> {
        let mut upstream = request.clone();
        let mut needed: Vec<&str> = vec![
            &self.integrand_variable,
            &self.hybrid_a_variable,
            &self.hybrid_b_variable,
        ];
        if self.is_ivt() {
            needed.push(&self.wind_u_variable);
            needed.push(&self.wind_v_variable);
        }
        if !self.surface_pressure_variable.is_empty() {
            needed.push(&self.surface_pressure_variable);
        }
        request_arrays(&mut upstream, &needed);
        for output in self.output_variables() {
            drop_array(&mut upstream, &output);
        }

        // The integral needs the whole column: widen any z restriction
        // back to the upstream whole extent.
        if let Some(mut extent) = upstream.get_u64s(keys::EXTENT) {
            if let Some(whole) = input_md[0].get_u64s(keys::WHOLE_EXTENT) {
                if extent.len() == 6 && whole.len() == 6 {
                    extent[4] = whole[4];
                    extent[5] = whole[5];
                    upstream.set_u64s(keys::EXTENT, extent);
                }
            }
        }
        if let Some(mut bounds) = upstream.get_f64s(keys::BOUNDS) {
            if let Some(whole) = input_md[0].get_f64s(keys::BOUNDS) {
                if bounds.len() == 6 && whole.len() == 6 {
                    bounds[4] = whole[4];
                    bounds[5] = whole[5];
                    upstream.set_f64s(keys::BOUNDS, bounds);
                }
            }
        }
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
            .ok_or_else(|| Error::config("vertical_integral executed with no input"))?;
        let mesh = input
            .as_mesh()
            .ok_or_else(|| Error::semantic("vertical_integral expects a cartesian mesh"))?;
        let (ni, nj, nk) = mesh.extent_spans();

        let point = |name: &str| -> Result<Vec<f64>> {
            mesh.point_arrays
                .get(name)
                .and_then(|a| a.to_f64_vec())
                .ok_or_else(|| Error::semantic(format!("no numeric point array '{name}'")))
        };
        let info = |name: &str| -> Result<Vec<f64>> {
            mesh.info_arrays
                .get(name)
                .and_then(|a| a.to_f64_vec())
                .ok_or_else(|| Error::semantic(format!("no numeric information array '{name}'")))
        };

        let a = info(&self.hybrid_a_variable)?;
        let b = info(&self.hybrid_b_variable)?;
        if a.len() != nk + 1 || b.len() != nk + 1 {
            return Err(Error::semantic(format!(
                "hybrid coefficients need {} interface values, got {}/{}",
                nk + 1,
                a.len(),
                b.len()
            )));
        }
        let ps = if self.surface_pressure_variable.is_empty() {
            if b.iter().any(|v| *v != 0.0) {
                return Err(Error::config(
                    "nonzero hybrid b coefficients need a surface_pressure_variable",
                ));
            }
            None
        } else {
            Some(point(&self.surface_pressure_variable)?)
        };

        let q = point(&self.integrand_variable)?;
        let expected = ni * nj * nk;
        if q.len() != expected {
            return Err(Error::semantic(format!(
                "integrand '{}' has {} values, expected {expected}",
                self.integrand_variable,
                q.len()
            )));
        }

        let mut output = CartesianMesh::new();
        output.metadata = mesh.metadata.clone();
        output.set_x_coordinates(mesh.x_variable(), mesh.x_coordinates().clone());
        output.set_y_coordinates(mesh.y_variable(), mesh.y_coordinates().clone());
        output.set_z_coordinates("", Arc::new(VariantArray::from(vec![0.0f64])));
        output.set_t_variable(mesh.t_variable());
        let mut extent = mesh.extent();
        extent[4] = 0;
        extent[5] = 0;
        output.set_extent(extent);
        let mut whole = mesh.whole_extent();
        whole[4] = 0;
        whole[5] = 0;
        output.set_whole_extent(whole);
        let mut bounds = mesh.bounds();
        bounds[4] = 0.0;
        bounds[5] = 0.0;
        output.set_bounds(bounds);
        output.set_time(mesh.time());
        output.set_time_step(mesh.time_step());

        if self.is_ivt() {
            let u = point(&self.wind_u_variable)?;
            let v = point(&self.wind_v_variable)?;
            let ivt_u = self.integrate(&q, Some(&u), &a, &b, ps.as_deref(), ni, nj, nk);
            let ivt_v = self.integrate(&q, Some(&v), &a, &b, ps.as_deref(), ni, nj, nk);
            let names = self.output_variables();
            output
                .point_arrays
                .set(names[0].clone(), Arc::new(VariantArray::from(ivt_u)));
            output
                .point_arrays
                .set(names[1].clone(), Arc::new(VariantArray::from(ivt_v)));
        } else {
            let integral = self.integrate(&q, None, &a, &b, ps.as_deref(), ni, nj, nk);
            output.point_arrays.set(
                self.output_variable.clone(),
                Arc::new(VariantArray::from(integral)),
            );
        }
        Ok(Arc::new(Dataset::Mesh(output)))
    }
}
