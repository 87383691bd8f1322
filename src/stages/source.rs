//! The CF reader stage.
//!
//! A zero-input source: enumerates input files from a literal list or a
//! regex over a directory listing, scans the first file for variables and
//! spatial coordinates, builds the time axis, and publishes the pipeline
//! index contract. Scanning runs only on the communicator's scan rank and
//! is cached on disk under a content hash; all other ranks receive the
//! serialized report through a broadcast.
//!
//! Time axis strategies, tried in this order:
//! 1. user-supplied `t_values` (one per file),
//! 2. a `filename_time_template` with strftime-style tokens,
//! 3. the file's own time variable, read per file on the task pool with
//!    units converted onto the first file's base,
//! 4. a synthetic integer axis with one step per file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regex::Regex;

use crate::algorithm::{Algorithm, Request, keys};
use crate::array::VariantArray;
use crate::cache::MetadataCache;
use crate::calendar::{self, Calendar, DateTime, TimeUnits};
use crate::comm::CommRef;
use crate::dataset::{CartesianMesh, Dataset, DatasetRef};
use crate::error::{Error, Result};
use crate::io::{DriverRef, FormatFile, serial_guard};
use crate::metadata::Metadata;
use crate::pool::TaskPool;
use crate::properties::{self, PropertySpec};

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec {
        name: "files",
        type_name: "string list",
        default: "",
        description: "explicit list of input files, bypasses input_regex",
    },
    PropertySpec {
        name: "input_regex",
        type_name: "string",
        default: "",
        description: "directory plus file name regex selecting the inputs",
    },
    PropertySpec {
        name: "x_axis_variable",
        type_name: "string",
        default: "lon",
        description: "name of the x coordinate variable",
    },
    PropertySpec {
        name: "y_axis_variable",
        type_name: "string",
        default: "lat",
        description: "name of the y coordinate variable",
    },
    PropertySpec {
        name: "z_axis_variable",
        type_name: "string",
        default: "",
        description: "name of the z coordinate variable, empty for 2D data",
    },
    PropertySpec {
        name: "t_axis_variable",
        type_name: "string",
        default: "time",
        description: "name of the time variable",
    },
    PropertySpec {
        name: "calendar",
        type_name: "string",
        default: "",
        description: "overrides the calendar reported by the inputs",
    },
    PropertySpec {
        name: "t_units",
        type_name: "string",
        default: "",
        description: "overrides the time units reported by the inputs",
    },
    PropertySpec {
        name: "filename_time_template",
        type_name: "string",
        default: "",
        description: "file name pattern with %Y %m %d %H %M %S tokens giving each file's date",
    },
    PropertySpec {
        name: "t_values",
        type_name: "float list",
        default: "",
        description: "user supplied time values, one per input file",
    },
    PropertySpec {
        name: "n_threads",
        type_name: "int",
        default: "-1",
        description: "pool width for parallel per-file scanning, -1 for hardware concurrency",
    },
    PropertySpec {
        name: "metadata_cache_dir",
        type_name: "string",
        default: "",
        description: "extra directory appended to the metadata cache search path",
    },
];

pub struct Source {
    driver: DriverRef,
    comm: CommRef,
    files: Vec<String>,
    input_regex: String,
    x_axis_variable: String,
    y_axis_variable: String,
    z_axis_variable: String,
    t_axis_variable: String,
    calendar: String,
    t_units: String,
    filename_time_template: String,
    t_values: Vec<f64>,
    n_threads: isize,
    metadata_cache_dir: String,
    /// Scan result; also consulted by execute. Cleared on property change.
    scanned: Mutex<Option<Metadata>>,
}

impl Source {
    pub fn new(driver: DriverRef, comm: CommRef) -> Self {
        Self {
            driver,
            comm,
            files: Vec::new(),
            input_regex: String::new(),
            x_axis_variable: "lon".to_string(),
            y_axis_variable: "lat".to_string(),
            z_axis_variable: String::new(),
            t_axis_variable: "time".to_string(),
            calendar: String::new(),
            t_units: String::new(),
            filename_time_template: String::new(),
            t_values: Vec::new(),
            n_threads: -1,
            metadata_cache_dir: String::new(),
            scanned: Mutex::new(None),
        }
    }

    /// Deterministic rendering of every property, part of the cache hash.
    fn property_string(&self) -> String {
        format!(
            "files={:?};input_regex={};x={};y={};z={};t={};calendar={};t_units={};template={};t_values={:?};",
            self.files,
            self.input_regex,
            self.x_axis_variable,
            self.y_axis_variable,
            self.z_axis_variable,
            self.t_axis_variable,
            self.calendar,
            self.t_units,
            self.filename_time_template,
            self.t_values,
        )
    }

    /// Canonical root directory + ordered file list.
    fn enumerate_inputs(&self) -> Result<(PathBuf, Vec<String>)> {
        if !self.files.is_empty() {
            let parent_of = |path: &Path| {
                path.parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."))
                    .to_path_buf()
            };
            let root = parent_of(Path::new(&self.files[0]));
            let mut names = Vec::with_capacity(self.files.len());
            for file in &self.files {
                let path = Path::new(file);
                if parent_of(path) != root {
                    return Err(Error::config(
                        "all entries of 'files' must share one parent directory",
                    ));
                }
                let name = path
                    .file_name()
                    .ok_or_else(|| Error::config(format!("'{file}' has no file name")))?;
                names.push(name.to_string_lossy().into_owned());
            }
            return Ok((root, names));
        }

        if self.input_regex.is_empty() {
            return Err(Error::config(
                "the source needs either 'files' or 'input_regex'",
            ));
        }
        let pattern = Path::new(&self.input_regex);
        let root = pattern
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let name_regex = pattern
            .file_name()
            .ok_or_else(|| Error::config("input_regex has no file name component"))?
            .to_string_lossy()
            .into_owned();
        let regex = Regex::new(&name_regex)
            .map_err(|e| Error::config(format!("invalid input_regex: {e}")))?;

        let mut names: Vec<String> = std::fs::read_dir(&root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| regex.is_match(name))
            .collect();
        names.sort();
        if names.is_empty() {
            return Err(Error::config(format!(
                "input_regex '{}' matched no files under {}",
                name_regex,
                root.display()
            )));
        }
        Ok((root, names))
    }

    fn open(&self, root: &Path, name: &str) -> Result<Box<dyn FormatFile>> {
        let _guard = serial_guard(self.driver.as_ref());
        self.driver.open(&root.join(name))
    }

    /// Full scan of the inputs; runs on the scan rank only.
    async fn scan(&self, root: &Path, names: &[String]) -> Result<Metadata> {
        let first = self.open(root, &names[0])?;

        let (x, y, z) = {
            let read_axis = |variable: &str| -> Result<VariantArray> {
                first.read(variable).map_err(|_| {
                    Error::semantic(format!(
                        "coordinate variable '{variable}' not found in {}",
                        names[0]
                    ))
                })
            };
            let x = read_axis(&self.x_axis_variable)?;
            let y = read_axis(&self.y_axis_variable)?;
            let z = if self.z_axis_variable.is_empty() {
                VariantArray::from(vec![0.0f64])
            } else {
                read_axis(&self.z_axis_variable)?
            };
            (x, y, z)
        };
        if x.is_empty() || y.is_empty() || z.is_empty() {
            return Err(Error::semantic(format!(
                "empty coordinate axis in {}",
                names[0]
            )));
        }

        let mut coordinates = Metadata::new();
        coordinates.set_string(keys::X_VARIABLE, self.x_axis_variable.clone());
        coordinates.set_string(keys::Y_VARIABLE, self.y_axis_variable.clone());
        coordinates.set_string(keys::Z_VARIABLE, self.z_axis_variable.clone());
        coordinates.set_string(keys::T_VARIABLE, self.t_axis_variable.clone());
        coordinates.set_array(keys::X, x.clone());
        coordinates.set_array(keys::Y, y.clone());
        coordinates.set_array(keys::Z, z.clone());

        let has_t_var = !self.t_axis_variable.is_empty()
            && first.variable(&self.t_axis_variable).is_some();
        let (time, step_count, t_units, t_calendar) =
            self.time_axis(root, names, has_t_var).await?;
        coordinates.set_f64s(keys::T, time.clone());
        if let Some(units) = &t_units {
            coordinates.set_string(keys::T_UNITS, units.clone());
        }
        if let Some(cal) = &t_calendar {
            coordinates.set_string(keys::CALENDAR, cal.clone());
        }

        let mut variables = Vec::new();
        let mut attributes = Metadata::new();
        for info in first.variables() {
            variables.push(info.name.clone());
            let mut atts = info.attributes.clone();
            atts.set_strings("dimensions", info.dimensions.clone());
            atts.set_u64("type_code", info.element_type.code() as u64);
            attributes.set_nested(info.name.clone(), atts);
        }

        let whole_extent = [
            0,
            x.len() as u64 - 1,
            0,
            y.len() as u64 - 1,
            0,
            z.len() as u64 - 1,
        ];
        let bounds = axis_bounds(&x, &y, &z)?;

        let mut md = Metadata::new();
        md.set_nested(keys::COORDINATES, coordinates);
        md.set_u64s(keys::WHOLE_EXTENT, whole_extent.to_vec());
        md.set_f64s(keys::BOUNDS, bounds.to_vec());
        md.set_strings(keys::VARIABLES, variables);
        md.set_nested(keys::ATTRIBUTES, attributes);
        md.set_string(keys::ROOT, root.to_string_lossy().into_owned());
        md.set_strings(keys::FILES, names.to_vec());
        md.set_u64s(keys::STEP_COUNT, step_count);
        md.set_u64(keys::NUMBER_OF_TIME_STEPS, time.len() as u64);
        md.set_string(keys::INDEX_INITIALIZER_KEY, keys::NUMBER_OF_TIME_STEPS);
        md.set_string(keys::INDEX_REQUEST_KEY, "time_step");
        Ok(md)
    }

    /// Builds `(time values, per-file step counts, units, calendar)`.
    async fn time_axis(
        &self,
        root: &Path,
        names: &[String],
        has_t_var: bool,
    ) -> Result<(Vec<f64>, Vec<u64>, Option<String>, Option<String>)> {
        let n_files = names.len();

        if !self.t_values.is_empty() {
            if self.t_values.len() != n_files {
                return Err(Error::config(format!(
                    "{} t_values supplied for {n_files} files",
                    self.t_values.len()
                )));
            }
            return Ok((
                self.t_values.clone(),
                vec![1; n_files],
                Some(self.units_or_default()),
                Some(self.calendar_or_default()),
            ));
        }

        if !self.filename_time_template.is_empty() {
            let units = self.units_or_default();
            let calendar_name = self.calendar_or_default();
            let parsed_units = TimeUnits::parse(&units)?;
            let calendar = Calendar::parse(&calendar_name)?;
            let template = TimeTemplate::compile(&self.filename_time_template)?;
            let mut time = Vec::with_capacity(n_files);
            for name in names {
                let date = template.parse(name)?;
                time.push(calendar::date_to_offset(&date, &parsed_units, calendar)?);
            }
            return Ok((time, vec![1; n_files], Some(units), Some(calendar_name)));
        }

        if has_t_var {
            return self.time_axis_from_files(root, names).await;
        }

        // No time dimension at all: synthetic monotonic axis.
        let time = (0..n_files).map(|i| i as f64).collect();
        Ok((time, vec![1; n_files], None, None))
    }

    /// Strategy 1: read every file's time variable on the task pool and
    /// convert onto the first file's base units.
    async fn time_axis_from_files(
        &self,
        root: &Path,
        names: &[String],
    ) -> Result<(Vec<f64>, Vec<u64>, Option<String>, Option<String>)> {
        struct FileAxis {
            values: Vec<f64>,
            units: Option<String>,
            calendar: Option<String>,
        }

        let pool = TaskPool::new(self.n_threads);
        let mut futures = Vec::with_capacity(names.len());
        for name in names {
            let driver = self.driver.clone();
            let path = root.join(name);
            let t_variable = self.t_axis_variable.clone();
            futures.push(
                pool.push(move || {
                    let _guard = serial_guard(driver.as_ref());
                    let file = driver.open(&path)?;
                    let info = file.variable(&t_variable).ok_or_else(|| {
                        Error::semantic(format!(
                            "time variable '{t_variable}' not found in {}",
                            path.display()
                        ))
                    })?;
                    let units = info.attributes.get_string("units");
                    let calendar = info.attributes.get_string("calendar");
                    let values = file.read(&t_variable)?.to_f64_vec().ok_or_else(|| {
                        Error::semantic(format!("time variable in {} is not numeric", path.display()))
                    })?;
                    Ok(FileAxis {
                        values,
                        units,
                        calendar,
                    })
                })
                .await,
            );
        }
        let axes = TaskPool::wait_all(futures).await?;

        let base_units_string = if self.t_units.is_empty() {
            axes[0].units.clone().ok_or_else(|| {
                Error::semantic(format!("time variable in {} has no units", names[0]))
            })?
        } else {
            self.t_units.clone()
        };
        let base_calendar_string = if self.calendar.is_empty() {
            axes[0]
                .calendar
                .clone()
                .unwrap_or_else(|| "standard".to_string())
        } else {
            self.calendar.clone()
        };
        let base_units = TimeUnits::parse(&base_units_string)?;
        let base_calendar = Calendar::parse(&base_calendar_string)?;

        let mut time = Vec::new();
        let mut step_count = Vec::with_capacity(axes.len());
        for (name, axis) in names.iter().zip(&axes) {
            // Every file must agree with the base calendar; a file with no
            // calendar attribute inherits it.
            if let Some(calendar) = &axis.calendar {
                if Calendar::parse(calendar)? != base_calendar {
                    return Err(Error::semantic(format!(
                        "calendar '{calendar}' of {name} disagrees with base '{}'",
                        base_calendar.name()
                    )));
                }
            }
            step_count.push(axis.values.len() as u64);
            let units = match &axis.units {
                Some(u) => TimeUnits::parse(u)?,
                None => base_units,
            };
            if units == base_units {
                time.extend_from_slice(&axis.values);
            } else {
                for value in &axis.values {
                    time.push(calendar::convert_offset(
                        *value,
                        &units,
                        &base_units,
                        base_calendar,
                    )?);
                }
            }
        }
        Ok((
            time,
            step_count,
            Some(base_units_string),
            Some(base_calendar_string),
        ))
    }

    fn units_or_default(&self) -> String {
        if self.t_units.is_empty() {
            "days since 0001-01-01".to_string()
        } else {
            self.t_units.clone()
        }
    }

    fn calendar_or_default(&self) -> String {
        if self.calendar.is_empty() {
            "standard".to_string()
        } else {
            self.calendar.clone()
        }
    }

    /// Scan-or-cache on the scan rank, broadcast to the others.
    async fn report(&self) -> Result<Metadata> {
        if let Some(md) = self.scanned.lock().unwrap().clone() {
            return Ok(md);
        }

        let comm = self.comm.clone();
        let mut bytes = Vec::new();
        let mut local: Option<Metadata> = None;
        if comm.is_scan_rank() {
            let (root, names) = self.enumerate_inputs()?;
            let user_dir = if self.metadata_cache_dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(&self.metadata_cache_dir))
            };
            let cache = MetadataCache::new(&root, user_dir.as_deref());
            let hash = MetadataCache::hash(
                &root.to_string_lossy(),
                names.as_slice(),
                &self.property_string(),
            );
            let md = match cache.load(&hash) {
                Some(md) => md,
                None => {
                    let md = self.scan(&root, &names).await?;
                    cache.store(&hash, &md)?;
                    md
                }
            };
            bytes = md.to_bytes();
            local = Some(md);
        }
        comm.broadcast(comm.scan_rank(), &mut bytes)?;
        let md = match local {
            Some(md) => md,
            None => Metadata::from_bytes(bytes)?,
        };
        *self.scanned.lock().unwrap() = Some(md.clone());
        Ok(md)
    }
}

#[async_trait]
impl Algorithm for Source {
    fn name(&self) -> &'static str {
        "source"
    }

    fn input_ports(&self) -> usize {
        0
    }

    fn property_schema(&self) -> &'static [PropertySpec] {
        PROPERTIES
    }

    fn set_property(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        match key {
            "files" => self.files = properties::as_string_list(key, &value)?,
            "input_regex" => self.input_regex = properties::as_string(key, &value)?,
            "x_axis_variable" => self.x_axis_variable = properties::as_string(key, &value)?,
            "y_axis_variable" => self.y_axis_variable = properties::as_string(key, &value)?,
            "z_axis_variable" => self.z_axis_variable = properties::as_string(key, &value)?,
            "t_axis_variable" => self.t_axis_variable = properties::as_string(key, &value)?,
            "calendar" => self.calendar = properties::as_string(key, &value)?,
            "t_units" => self.t_units = properties::as_string(key, &value)?,
            "filename_time_template" => {
                self.filename_time_template = properties::as_string(key, &value)?
            }
            "t_values" => self.t_values = properties::as_f64_list(key, &value)?,
            "n_threads" => self.n_threads = properties::as_i64(key, &value)? as isize,
            "metadata_cache_dir" => self.metadata_cache_dir = properties::as_string(key, &value)?,
            _ => {
                return Err(Error::config(format!(
                    "source has no property '{key}'"
                )));
            }
        }
        *self.scanned.lock().unwrap() = None;
        Ok(())
    }

    async fn report_metadata(&self, _port: usize, _input_md: &[Metadata]) -> Result<Metadata> {
        self.report().await
    }

    fn translate_request(
        &self,
        _port: usize,
        _input_md: &[Metadata],
        _request: &Request,
    ) -> Result<Vec<Vec<Request>>> {
        Ok(Vec::new())
    }

    async fn execute(
        &self,
        _port: usize,
        _inputs: Vec<DatasetRef>,
        request: &Request,
    ) -> Result<DatasetRef> {
        let md = self
            .scanned
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::config("source executed before reporting"))?;

        let index = request.require_u64("time_step")?;
        let step_count = md
            .get_u64s(keys::STEP_COUNT)
            .ok_or_else(|| Error::semantic("no step_count in scan metadata"))?;
        let (file_index, local_step) = locate_step(&step_count, index)?;

        let names = md.get_strings(keys::FILES).unwrap_or_default();
        let root = PathBuf::from(md.get_string(keys::ROOT).unwrap_or_default());
        let coordinates = md
            .get_nested(keys::COORDINATES)
            .ok_or_else(|| Error::semantic("no coordinates in scan metadata"))?;
        let x = coordinates
            .get_array(keys::X)
            .ok_or_else(|| Error::semantic("no x coordinates in scan metadata"))?;
        let y = coordinates
            .get_array(keys::Y)
            .ok_or_else(|| Error::semantic("no y coordinates in scan metadata"))?;
        let z = coordinates
            .get_array(keys::Z)
            .ok_or_else(|| Error::semantic("no z coordinates in scan metadata"))?;
        let whole_extent: [u64; 6] = md
            .get_u64s(keys::WHOLE_EXTENT)
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| Error::semantic("no whole_extent in scan metadata"))?;

        // Resolve the requested region: extent beats bounds beats whole.
        let extent: [u64; 6] = if let Some(extent) = request.get_u64s(keys::EXTENT) {
            extent
                .try_into()
                .map_err(|_| Error::semantic("request extent must have 6 entries"))?
        } else if let Some(bounds) = request.get_f64s(keys::BOUNDS) {
            let bounds: [f64; 6] = bounds
                .try_into()
                .map_err(|_| Error::semantic("request bounds must have 6 entries"))?;
            bounds_to_extent(&bounds, x, y, z)?
        } else {
            whole_extent
        };

        let file = self.open(&root, &names[file_index])?;
        let t_dimension = file
            .variable(&self.t_axis_variable)
            .and_then(|v| v.dimensions.first().cloned());
        let spatial = spatial_dimensions(file.as_ref(), coordinates)?;

        let mut mesh = CartesianMesh::new();
        mesh.set_x_coordinates(
            coordinates.require_string(keys::X_VARIABLE)?,
            Arc::new(x.new_copy(extent[0] as usize, extent[1] as usize)?),
        );
        mesh.set_y_coordinates(
            coordinates.require_string(keys::Y_VARIABLE)?,
            Arc::new(y.new_copy(extent[2] as usize, extent[3] as usize)?),
        );
        mesh.set_z_coordinates(
            coordinates.get_string(keys::Z_VARIABLE).unwrap_or_default(),
            Arc::new(z.new_copy(extent[4] as usize, extent[5] as usize)?),
        );
        mesh.set_t_variable(self.t_axis_variable.clone());
        mesh.set_extent(extent);
        mesh.set_whole_extent(whole_extent);
        let time = coordinates
            .get_f64s(keys::T)
            .and_then(|t| t.get(index as usize).copied())
            .unwrap_or(index as f64);
        mesh.set_time(time);
        mesh.set_time_step(index);
        mesh.set_bounds(axis_bounds(
            mesh.x_coordinates(),
            mesh.y_coordinates(),
            mesh.z_coordinates(),
        )?);

        for name in crate::algorithm::requested_arrays(request) {
            let info = file.variable(&name).ok_or_else(|| {
                Error::semantic(format!("requested variable '{name}' absent from {}", names[file_index]))
            })?;
            let layout = classify(&info.dimensions, t_dimension.as_deref(), &spatial);
            match layout {
                Layout::Mesh { has_time, has_z } => {
                    let mut starts = Vec::new();
                    let mut counts = Vec::new();
                    if has_time {
                        starts.push(local_step);
                        counts.push(1);
                    }
                    if has_z {
                        starts.push(extent[4]);
                        counts.push(extent[5] - extent[4] + 1);
                    }
                    starts.push(extent[2]);
                    counts.push(extent[3] - extent[2] + 1);
                    starts.push(extent[0]);
                    counts.push(extent[1] - extent[0] + 1);
                    let data = file.read_hyperslab(&name, &starts, &counts)?;
                    mesh.point_arrays.set(name, Arc::new(data));
                }
                Layout::Information { time_axis } => {
                    let data = match time_axis {
                        Some(axis) => {
                            let shape: Vec<u64> = info
                                .dimensions
                                .iter()
                                .map(|d| file.dimension(d).map(|d| d.size).unwrap_or(0))
                                .collect();
                            let mut starts = vec![0; shape.len()];
                            let mut counts = shape;
                            starts[axis] = local_step;
                            counts[axis] = 1;
                            file.read_hyperslab(&name, &starts, &counts)?
                        }
                        None => file.read(&name)?,
                    };
                    mesh.info_arrays.set(name, Arc::new(data));
                }
            }
        }

        let mut dataset_md = Metadata::new();
        if let Some(atts) = md.get_nested(keys::ATTRIBUTES) {
            dataset_md.set_nested(keys::ATTRIBUTES, atts.clone());
        }
        if let Some(units) = coordinates.get_string(keys::T_UNITS) {
            dataset_md.set_string(keys::T_UNITS, units);
        }
        if let Some(cal) = coordinates.get_string(keys::CALENDAR) {
            dataset_md.set_string(keys::CALENDAR, cal);
        }
        dataset_md.set_u64("time_step", index);
        mesh.metadata = dataset_md;

        mesh.validate()?;
        Ok(Arc::new(Dataset::Mesh(mesh)))
    }
}

/// How a variable's dimension tuple relates to the mesh.
enum Layout {
    Mesh { has_time: bool, has_z: bool },
    Information { time_axis: Option<usize> },
}

/// The dimension names of the spatial axes `(x, y, z)`, taken from the
/// coordinate variables' own dimension tuples.
fn spatial_dimensions(
    file: &dyn FormatFile,
    coordinates: &Metadata,
) -> Result<(String, String, Option<String>)> {
    let dim_of = |variable: &str| -> Option<String> {
        file.variable(variable)
            .and_then(|info| info.dimensions.first().cloned())
    };
    let x_variable = coordinates.require_string(keys::X_VARIABLE)?;
    let y_variable = coordinates.require_string(keys::Y_VARIABLE)?;
    let z_variable = coordinates.get_string(keys::Z_VARIABLE).unwrap_or_default();
    let x = dim_of(&x_variable)
        .ok_or_else(|| Error::semantic(format!("no dimension for coordinate '{x_variable}'")))?;
    let y = dim_of(&y_variable)
        .ok_or_else(|| Error::semantic(format!("no dimension for coordinate '{y_variable}'")))?;
    let z = if z_variable.is_empty() {
        None
    } else {
        dim_of(&z_variable)
    };
    Ok((x, y, z))
}

/// A variable is a mesh variable when its dimension tuple is the mesh's
/// spatial dimensions in `[t][z] y x` order; anything else is an
/// information variable (time sliced if it carries the time dimension).
fn classify(
    dimensions: &[String],
    t_dimension: Option<&str>,
    spatial: &(String, String, Option<String>),
) -> Layout {
    let (x, y, z) = spatial;
    let mut dims = dimensions.to_vec();
    let has_time = t_dimension.is_some_and(|t| dims.first().is_some_and(|d| d == t));
    if has_time {
        dims.remove(0);
    }
    let has_z = z.as_ref().is_some_and(|z| dims.first().is_some_and(|d| d == z));
    if has_z {
        dims.remove(0);
    }
    if dims.len() == 2 && dims[0] == *y && dims[1] == *x {
        Layout::Mesh { has_time, has_z }
    } else {
        Layout::Information {
            time_axis: t_dimension.and_then(|t| dimensions.iter().position(|d| d == t)),
        }
    }
}

/// Maps a global step index through the per-file step counts.
fn locate_step(step_count: &[u64], index: u64) -> Result<(usize, u64)> {
    let mut remaining = index;
    for (file_index, count) in step_count.iter().enumerate() {
        if remaining < *count {
            return Ok((file_index, remaining));
        }
        remaining -= count;
    }
    Err(Error::semantic(format!(
        "time step {index} is past the end of the dataset"
    )))
}

/// World-space bounds of the coordinate axes.
fn axis_bounds(x: &VariantArray, y: &VariantArray, z: &VariantArray) -> Result<[f64; 6]> {
    let ends = |a: &VariantArray| -> Result<(f64, f64)> {
        let first = a
            .get_f64(0)
            .ok_or_else(|| Error::semantic("empty or non-numeric coordinate axis"))?;
        let last = a
            .get_f64(a.len() - 1)
            .ok_or_else(|| Error::semantic("empty or non-numeric coordinate axis"))?;
        Ok((first, last))
    };
    let (x0, x1) = ends(x)?;
    let (y0, y1) = ends(y)?;
    let (z0, z1) = ends(z)?;
    Ok([x0, x1, y0, y1, z0, z1])
}

/// Inclusive index extent covering `bounds`, found by binary search on
/// each (ascending or descending) coordinate axis.
pub fn bounds_to_extent(
    bounds: &[f64; 6],
    x: &VariantArray,
    y: &VariantArray,
    z: &VariantArray,
) -> Result<[u64; 6]> {
    let (x0, x1) = axis_extent(x, bounds[0], bounds[1])?;
    let (y0, y1) = axis_extent(y, bounds[2], bounds[3])?;
    let (z0, z1) = axis_extent(z, bounds[4], bounds[5])?;
    Ok([x0, x1, y0, y1, z0, z1])
}

fn axis_extent(axis: &VariantArray, lo: f64, hi: f64) -> Result<(u64, u64)> {
    const EPS: f64 = 1.0e-9;
    let values = axis
        .to_f64_vec()
        .ok_or_else(|| Error::semantic("non-numeric coordinate axis"))?;
    if values.is_empty() {
        return Err(Error::semantic("empty coordinate axis"));
    }
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    let ascending = values.first() <= values.last();
    let (first, last) = if ascending {
        let first = values.partition_point(|v| *v < lo - EPS);
        let last = values.partition_point(|v| *v <= hi + EPS);
        (first, last)
    } else {
        let first = values.partition_point(|v| *v > hi + EPS);
        let last = values.partition_point(|v| *v >= lo - EPS);
        (first, last)
    };
    if first >= last {
        return Err(Error::semantic(format!(
            "bounds [{lo}, {hi}] select no coordinate values"
        )));
    }
    Ok((first as u64, last as u64 - 1))
}


/// Compiled `filename_time_template`: literal text with `%Y %m %d %H %M
/// %S` tokens.
struct TimeTemplate {
    regex: Regex,
    /// Field order of the capture groups.
    fields: Vec<char>,
}

impl TimeTemplate {
    fn compile(template: &str) -> Result<Self> {
        let mut pattern = String::from("^");
        let mut fields = Vec::new();
        let mut chars = template.chars();
        while let Some(c) = chars.next() {
            if c == '%' {
                match chars.next() {
                    Some('Y') => {
                        pattern.push_str(r"(\d{1,4})");
                        fields.push('Y');
                    }
                    Some(f @ ('m' | 'd' | 'H' | 'M' | 'S')) => {
                        pattern.push_str(r"(\d{1,2})");
                        fields.push(f);
                    }
                    Some(other) => {
                        return Err(Error::config(format!(
                            "unknown token %{other} in filename_time_template"
                        )));
                    }
                    None => {
                        return Err(Error::config(
                            "dangling % in filename_time_template",
                        ));
                    }
                }
            } else {
                pattern.push_str(&regex::escape(&c.to_string()));
            }
        }
        pattern.push('$');
        let regex = Regex::new(&pattern)
            .map_err(|e| Error::config(format!("invalid filename_time_template: {e}")))?;
        Ok(Self { regex, fields })
    }

    fn parse(&self, name: &str) -> Result<DateTime> {
        let caps = self.regex.captures(name).ok_or_else(|| {
            Error::semantic(format!(
                "file name '{name}' does not match the time template"
            ))
        })?;
        let mut date = DateTime::new(1, 1, 1);
        for (field, cap) in self.fields.iter().zip(caps.iter().skip(1)) {
            let value: u32 = cap
                .map(|m| m.as_str().parse().unwrap_or(0))
                .unwrap_or(0);
            match *field {
                'Y' => date.year = value as i64,
                'm' => date.month = value,
                'd' => date.day = value,
                'H' => date.hour = value,
                'M' => date.minute = value,
                'S' => date.second = value as f64,
                _ => {}
            }
        }
        Ok(date)
    }
}
