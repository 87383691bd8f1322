//! Shared command-line plumbing for the applications.
//!
//! Every application takes the same basic flags (inputs, step and date
//! windows, subsetting) plus advanced `--set stage.prop=value`
//! assignments and an optional TOML file whose tables are keyed by stage
//! instance name. Advanced values route straight into the stage property
//! tables, so anything a stage can do is reachable from the command line.

use clap::Args;

use crate::error::{Error, Result};
use crate::executive::IndexExecutive;
use crate::pipeline::{NodeId, Pipeline};

#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Directory plus file name regex selecting the input files
    #[arg(long)]
    pub input_regex: Option<String>,

    /// Explicit comma separated list of input files
    #[arg(long, value_delimiter = ',')]
    pub files: Vec<String>,

    /// Output path; %t% is replaced with the request index
    #[arg(long)]
    pub output_file: String,

    /// First work index to process
    #[arg(long)]
    pub first_step: Option<u64>,

    /// Last work index to process
    #[arg(long)]
    pub last_step: Option<u64>,

    /// Start date, YYYY-MM-DD, resolved against the time axis
    #[arg(long)]
    pub start_date: Option<String>,

    /// End date, YYYY-MM-DD, resolved against the time axis
    #[arg(long)]
    pub end_date: Option<String>,

    /// Extra arrays to request from the terminal stage
    #[arg(long, value_delimiter = ',')]
    pub arrays: Vec<String>,

    /// Spatial subset: x0,x1,y0,y1,z0,z1 in coordinate units
    #[arg(long, value_delimiter = ',')]
    pub bounds: Vec<f64>,

    /// Worker threads for scanning and reductions, -1 for all cores
    #[arg(long, default_value_t = -1)]
    pub n_threads: i64,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// TOML file with per-stage property tables
    #[arg(long)]
    pub config: Option<String>,

    /// Advanced stage property assignment, repeatable
    #[arg(long = "set", value_name = "STAGE.PROP=VALUE")]
    pub assignments: Vec<String>,

    /// Print every stage's property table and exit
    #[arg(long)]
    pub list_properties: bool,
}

impl CommonArgs {
    /// Routes the input flags into a source stage.
    pub fn configure_source(&self, pipeline: &mut Pipeline, source: NodeId) -> Result<()> {
        match (&self.input_regex, self.files.is_empty()) {
            (Some(_), false) => {
                return Err(Error::config(
                    "--input_regex and --files are mutually exclusive",
                ));
            }
            (None, true) => {
                return Err(Error::config("one of --input_regex or --files is required"));
            }
            (Some(regex), true) => {
                pipeline.set_property(source, "input_regex", regex.clone().into())?;
            }
            (None, false) => {
                pipeline.set_property(source, "files", self.files.clone().into())?;
            }
        }
        pipeline.set_property(source, "n_threads", self.n_threads.into())?;
        Ok(())
    }

    /// Builds the executive from the step, date and subset flags.
    pub fn build_executive(&self, comm: crate::comm::CommRef) -> Result<IndexExecutive> {
        let mut executive = IndexExecutive::new(comm);
        if let Some(step) = self.first_step {
            executive.set_first_step(step);
        }
        if let Some(step) = self.last_step {
            executive.set_last_step(step);
        }
        if let Some(date) = &self.start_date {
            executive.set_start_date(date.clone());
        }
        if let Some(date) = &self.end_date {
            executive.set_end_date(date.clone());
        }
        if !self.bounds.is_empty() {
            let bounds: [f64; 6] = self
                .bounds
                .clone()
                .try_into()
                .map_err(|_| Error::config("--bounds needs exactly 6 values"))?;
            executive.set_bounds(bounds);
        }
        Ok(executive)
    }

    /// Applies the TOML config and `--set` assignments, in that order so
    /// the command line wins.
    pub fn apply_properties(&self, pipeline: &mut Pipeline) -> Result<()> {
        if let Some(path) = &self.config {
            apply_config_file(pipeline, path)?;
        }
        for assignment in &self.assignments {
            apply_assignment(pipeline, assignment)?;
        }
        Ok(())
    }
}

/// Parses `stage.prop=value` and routes it by stage instance name. The
/// value is JSON when it parses as JSON, a plain string otherwise.
pub fn apply_assignment(pipeline: &mut Pipeline, assignment: &str) -> Result<()> {
    let (target, raw_value) = assignment
        .split_once('=')
        .ok_or_else(|| Error::config(format!("'{assignment}' is not STAGE.PROP=VALUE")))?;
    let (stage, property) = target
        .split_once('.')
        .ok_or_else(|| Error::config(format!("'{target}' is not STAGE.PROP")))?;
    let node = pipeline
        .stage_id(stage)
        .ok_or_else(|| Error::config(format!("no stage named '{stage}' in this pipeline")))?;
    let value = serde_json::from_str(raw_value)
        .unwrap_or_else(|_| serde_json::Value::String(raw_value.to_string()));
    pipeline.set_property(node, property, value)
}

/// Applies a TOML file whose top-level tables are stage instance names.
pub fn apply_config_file(pipeline: &mut Pipeline, path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let parsed: toml::Value = toml::from_str(&content)
        .map_err(|e| Error::config(format!("cannot parse '{path}': {e}")))?;
    let tables = parsed
        .as_table()
        .ok_or_else(|| Error::config(format!("'{path}' must contain stage tables")))?;
    for (stage, values) in tables {
        let node = pipeline
            .stage_id(stage)
            .ok_or_else(|| Error::config(format!("no stage named '{stage}' in this pipeline")))?;
        let table = values
            .as_table()
            .ok_or_else(|| Error::config(format!("'{stage}' must be a table of properties")))?;
        for (property, value) in table {
            let value = serde_json::to_value(value)
                .map_err(|e| Error::config(format!("bad value for {stage}.{property}: {e}")))?;
            pipeline.set_property(node, property, value)?;
        }
    }
    Ok(())
}

/// Renders every stage's property table, for `--list_properties`.
pub fn render_property_tables(pipeline: &Pipeline, stages: &[NodeId]) -> String {
    let mut out = String::new();
    for node in stages {
        let algorithm = pipeline.algorithm(*node);
        out.push_str(&format!("{}:\n", pipeline.stage_name(*node)));
        for spec in algorithm.property_schema() {
            out.push_str(&format!(
                "  {:<28} {:<12} [{}] {}\n",
                spec.name, spec.type_name, spec.default, spec.description
            ));
        }
    }
    out
}
