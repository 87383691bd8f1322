//! Euclidean magnitude of 2 or 3 component arrays.

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

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec {
        name: "component_0_variable",
        type_name: "string",
        default: "",
        description: "first component",
    },
    PropertySpec {
        name: "component_1_variable",
        type_name: "string",
        default: "",
        description: "second component",
    },
    PropertySpec {
        name: "component_2_variable",
        type_name: "string",
        default: "",
        description: "optional third component",
    },
    PropertySpec {
        name: "output_variable",
        type_name: "string",
        default: "magnitude",
        description: "name of the produced array",
    },
];

pub struct Magnitude {
    component_0_variable: String,
    component_1_variable: String,
    component_2_variable: String,
    output_variable: String,
}

impl Magnitude {
    pub fn new() -> Self {
        Self {
            component_0_variable: String::new(),
            component_1_variable: String::new(),
            component_2_variable: String::new(),
            output_variable: "magnitude".to_string(),
        }
    }

    fn components(&self) -> Result<Vec<&str>> {
        let mut components = Vec::new();
        for name in [
            &self.component_0_variable,
            &self.component_1_variable,
            &self.component_2_variable,
        ] {
            if !name.is_empty() {
                components.push(name.as_str());
            }
        }
        if components.len() < 2 {
            return Err(Error::config(
                "magnitude needs at least component_0_variable and component_1_variable",
            ));
        }
        Ok(components)
    }
}

impl Default for Magnitude {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Algorithm for Magnitude {
    fn name(&self) -> &'static str {
        "magnitude"
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
            "component_2_variable" => {
                self.component_2_variable = properties::as_string(key, &value)?
            }
            "output_variable" => self.output_variable = properties::as_string(key, &value)?,
            _ => {
                return Err(Error::config(format!("magnitude has no property '{key}'")));
            }
        }
        Ok(())
    }

    async fn report_metadata(&self, _port: usize, input_md: &[Metadata]) -> Result<Metadata> {
        self.components()?;
        let mut report = input_md[0].clone();
        forward_index_keys(&mut report, &input_md[0])?;
        let mut variables = report.get_strings(keys::VARIABLES).unwrap_or_default();
        variables.push(self.output_variable.clone());
        report.set_strings(keys::VARIABLES, variables);
        Ok(report)
    }

    fn translate_request(
        &self,
        _port: usize,
        _input_md: &[Metadata],
        request: &Request,
    ) -> Result<Vec<Vec<Request>>> {
        let mut upstream = request.clone();
        request_arrays(&mut upstream, &self.components()?);
        drop_array(&mut upstream, &self.output_variable);
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
            .ok_or_else(|| Error::config("magnitude executed with no input"))?;
        let mesh = input
            .as_mesh()
            .ok_or_else(|| Error::semantic("magnitude expects a cartesian mesh"))?;

        let mut components = Vec::new();
        for name in self.components()? {
            components.push(
                mesh.point_arrays
                    .get(name)
                    .and_then(|a| a.to_f64_vec())
                    .ok_or_else(|| Error::semantic(format!("no numeric point array '{name}'")))?,
            );
        }
        let n = components[0].len();
        if components.iter().any(|c| c.len() != n) {
            return Err(Error::semantic("component arrays differ in length"));
        }
        let magnitude: Vec<f64> = (0..n)
            .map(|i| components.iter().map(|c| c[i] * c[i]).sum::<f64>().sqrt())
            .collect();

        let mut output = mesh.clone();
        output.point_arrays.set(
            self.output_variable.clone(),
            Arc::new(VariantArray::from(magnitude)),
        );
        Ok(Arc::new(Dataset::Mesh(output)))
    }
}
