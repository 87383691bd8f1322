//! Temporal reduction: the map-reduce stage.
//!
//! One downstream interval (day, month, season, year, or the whole axis)
//! is produced from many upstream time steps. The report rewrites the
//! index contract — `number_of_intervals` replaces the upstream step
//! count and the time axis shrinks to one value per interval — and the
//! translate pass emits the member-step request sequence, which the
//! driver schedules with bounded width and folds through [`reduce`].
//!
//! The reduce operator accumulates per-point sums (or running min/max)
//! plus valid-sample counts so that `_FillValue` data is skipped; it is
//! associative and commutative, so the driver may combine partials in
//! completion order. `execute` finalizes the accumulator: the mean
//! divides by the counts, and points that never saw a valid sample are
//! restored to the fill value.
//!
//! [`reduce`]: Algorithm::reduce

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::algorithm::{Algorithm, ReduceOrder, Request, keys};
use crate::calendar::{self, Calendar, TimeUnits};
use crate::dataset::{CartesianMesh, Dataset, DatasetRef};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::properties::{self, PropertySpec};

const PARTIAL_FLAG: &str = "reduction_partial";
const COUNT_SUFFIX: &str = "__valid_count";

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec {
        name: "interval",
        type_name: "string",
        default: "monthly",
        description: "daily, monthly, seasonal, yearly or all",
    },
    PropertySpec {
        name: "operator",
        type_name: "string",
        default: "mean",
        description: "mean, min, max or sum",
    },
    PropertySpec {
        name: "missing_policy",
        type_name: "string",
        default: "error",
        description: "error fails an interval on any missing step, fill drops the step",
    },
    PropertySpec {
        name: "n_threads",
        type_name: "int",
        default: "-1",
        description: "fan-out width for upstream requests, -1 for hardware concurrency",
    },
];

#[derive(Debug, Clone, Copy, PartialEq)]
struct Interval {
    first_step: u64,
    last_step: u64,
    time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Mean,
    Min,
    Max,
    Sum,
}

impl Operator {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "mean" => Operator::Mean,
            "min" => Operator::Min,
            "max" => Operator::Max,
            "sum" => Operator::Sum,
            other => {
                return Err(Error::config(format!(
                    "operator must be mean, min, max or sum, got '{other}'"
                )));
            }
        })
    }
}

pub struct TemporalReduction {
    interval: String,
    operator: String,
    missing_policy: String,
    n_threads: isize,
    /// Interval table computed at report time, used by execute.
    intervals: Mutex<Option<Vec<Interval>>>,
}

impl TemporalReduction {
    pub fn new() -> Self {
        Self {
            interval: "monthly".to_string(),
            operator: "mean".to_string(),
            missing_policy: "error".to_string(),
            n_threads: -1,
            intervals: Mutex::new(None),
        }
    }

    fn compute_intervals(&self, input_md: &Metadata) -> Result<Vec<Interval>> {
        let coordinates = input_md
            .get_nested(keys::COORDINATES)
            .ok_or_else(|| Error::semantic("temporal reduction needs upstream coordinates"))?;
        let time = coordinates
            .get_f64s(keys::T)
            .ok_or_else(|| Error::semantic("temporal reduction needs an upstream time axis"))?;
        if time.is_empty() {
            return Ok(Vec::new());
        }
        if self.interval == "all" {
            return Ok(vec![Interval {
                first_step: 0,
                last_step: time.len() as u64 - 1,
                time: time[0],
            }]);
        }

        let units = TimeUnits::parse(&coordinates.require_string(keys::T_UNITS)?)?;
        let calendar = Calendar::parse(
            &coordinates
                .get_string(keys::CALENDAR)
                .unwrap_or_else(|| "standard".to_string()),
        )?;

        let mut intervals: Vec<Interval> = Vec::new();
        let mut current_key: Option<(i64, u32)> = None;
        for (step, value) in time.iter().enumerate() {
            let date = calendar::offset_to_date(*value, &units, calendar)?;
            let key = match self.interval.as_str() {
                "daily" => (date.year * 366 + date.month as i64 * 31, date.day),
                "monthly" => (date.year, date.month),
                // December belongs to the following year's DJF.
                "seasonal" => {
                    let season_year = if date.month == 12 {
                        date.year + 1
                    } else {
                        date.year
                    };
                    (season_year, (date.month % 12) / 3)
                }
                "yearly" => (date.year, 0),
                other => {
                    return Err(Error::config(format!(
                        "interval must be daily, monthly, seasonal, yearly or all, got '{other}'"
                    )));
                }
            };
            if current_key == Some(key) {
                intervals.last_mut().expect("open interval").last_step = step as u64;
            } else {
                current_key = Some(key);
                intervals.push(Interval {
                    first_step: step as u64,
                    last_step: step as u64,
                    time: *value,
                });
            }
        }
        Ok(intervals)
    }

    fn fill_value(metadata: &Metadata, variable: &str) -> Option<f64> {
        metadata
            .get_nested(keys::ATTRIBUTES)?
            .get_nested(variable)?
            .get_f64("_FillValue")
    }

    /// Turns a raw upstream mesh into an accumulator: per-variable value
    /// and valid-count arrays, fill values zeroed out of the sums.
    fn normalize(&self, mesh: &CartesianMesh, operator: Operator) -> CartesianMesh {
        let mut accumulator = mesh.clone();
        let names: Vec<String> = mesh.point_arrays.names().map(str::to_string).collect();
        for name in names {
            let fill = Self::fill_value(&mesh.metadata, &name);
            let values = match mesh.point_arrays.get(&name).and_then(|a| a.to_f64_vec()) {
                Some(values) => values,
                None => continue,
            };
            let counts: Vec<f64> = values
                .iter()
                .map(|v| match fill {
                    Some(fill) if *v == fill => 0.0,
                    _ if v.is_nan() => 0.0,
                    _ => 1.0,
                })
                .collect();
            if matches!(operator, Operator::Mean | Operator::Sum) {
                let zeroed: Vec<f64> = values
                    .iter()
                    .zip(&counts)
                    .map(|(v, c)| if *c > 0.0 { *v } else { 0.0 })
                    .collect();
                accumulator
                    .point_arrays
                    .set(name.clone(), Arc::new(zeroed.into()));
            }
            accumulator
                .info_arrays
                .set(format!("{name}{COUNT_SUFFIX}"), Arc::new(counts.into()));
        }
        accumulator.metadata.set_u64(PARTIAL_FLAG, 1);
        accumulator
    }

    fn as_accumulator(&self, dataset: &Dataset, operator: Operator) -> Result<CartesianMesh> {
        let mesh = dataset
            .as_mesh()
            .ok_or_else(|| Error::semantic("temporal reduction expects cartesian meshes"))?;
        if mesh.metadata.get_u64(PARTIAL_FLAG) == Some(1) {
            Ok(mesh.clone())
        } else {
            Ok(self.normalize(mesh, operator))
        }
    }

    fn combine(
        &self,
        mut left: CartesianMesh,
        right: CartesianMesh,
        operator: Operator,
    ) -> Result<CartesianMesh> {
        let names: Vec<String> = left.point_arrays.names().map(str::to_string).collect();
        for name in names {
            let count_name = format!("{name}{COUNT_SUFFIX}");
            if !left.info_arrays.has(&count_name) {
                continue;
            }
            let (a, a_counts, b, b_counts) = match (
                left.point_arrays.get(&name).and_then(|v| v.to_f64_vec()),
                left.info_arrays.get(&count_name).and_then(|v| v.to_f64_vec()),
                right.point_arrays.get(&name).and_then(|v| v.to_f64_vec()),
                right.info_arrays.get(&count_name).and_then(|v| v.to_f64_vec()),
            ) {
                (Some(a), Some(ac), Some(b), Some(bc)) => (a, ac, b, bc),
                _ => {
                    return Err(Error::semantic(format!(
                        "array '{name}' is missing from one side of the reduction"
                    )));
                }
            };
            if a.len() != b.len() {
                return Err(Error::semantic(format!(
                    "array '{name}' length changed mid-reduction: {} vs {}",
                    a.len(),
                    b.len()
                )));
            }
            let mut values = Vec::with_capacity(a.len());
            let mut counts = Vec::with_capacity(a.len());
            for i in 0..a.len() {
                let valid_a = a_counts[i] > 0.0;
                let valid_b = b_counts[i] > 0.0;
                let value = match operator {
                    Operator::Mean | Operator::Sum => a[i] + b[i],
                    Operator::Min => match (valid_a, valid_b) {
                        (true, true) => a[i].min(b[i]),
                        (true, false) => a[i],
                        _ => b[i],
                    },
                    Operator::Max => match (valid_a, valid_b) {
                        (true, true) => a[i].max(b[i]),
                        (true, false) => a[i],
                        _ => b[i],
                    },
                };
                values.push(value);
                counts.push(a_counts[i] + b_counts[i]);
            }
            left.point_arrays.set(name.clone(), Arc::new(values.into()));
            left.info_arrays.set(count_name, Arc::new(counts.into()));
        }
        Ok(left)
    }

    fn finalize(
        &self,
        mut accumulator: CartesianMesh,
        operator: Operator,
        interval: Interval,
        index: u64,
    ) -> Result<CartesianMesh> {
        let names: Vec<String> = accumulator.point_arrays.names().map(str::to_string).collect();
        for name in names {
            let count_name = format!("{name}{COUNT_SUFFIX}");
            let counts = match accumulator
                .info_arrays
                .remove(&count_name)
                .and_then(|v| v.to_f64_vec())
            {
                Some(counts) => counts,
                None => continue,
            };
            let fill = Self::fill_value(&accumulator.metadata, &name).unwrap_or(f64::NAN);
            let values = accumulator
                .point_arrays
                .get(&name)
                .and_then(|v| v.to_f64_vec())
                .ok_or_else(|| Error::semantic(format!("lost array '{name}' in reduction")))?;
            let finalized: Vec<f64> = values
                .iter()
                .zip(&counts)
                .map(|(v, c)| {
                    if *c <= 0.0 {
                        fill
                    } else if operator == Operator::Mean {
                        *v / *c
                    } else {
                        *v
                    }
                })
                .collect();
            accumulator
                .point_arrays
                .set(name, Arc::new(finalized.into()));
        }
        accumulator.metadata.remove(PARTIAL_FLAG);
        accumulator.metadata.set_u64("interval", index);
        accumulator.set_time(interval.time);
        accumulator.set_time_step(index);
        Ok(accumulator)
    }
}

impl Default for TemporalReduction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Algorithm for TemporalReduction {
    fn name(&self) -> &'static str {
        "temporal_reduction"
    }

    fn property_schema(&self) -> &'static [PropertySpec] {
        PROPERTIES
    }

    fn set_property(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        match key {
            "interval" => self.interval = properties::as_string(key, &value)?,
            "operator" => {
                let operator = properties::as_string(key, &value)?;
                Operator::parse(&operator)?;
                self.operator = operator;
            }
            "missing_policy" => {
                let policy = properties::as_string(key, &value)?;
                if !["error", "fill"].contains(&policy.as_str()) {
                    return Err(Error::config(format!(
                        "missing_policy must be error or fill, got '{policy}'"
                    )));
                }
                self.missing_policy = policy;
            }
            "n_threads" => self.n_threads = properties::as_i64(key, &value)? as isize,
            _ => {
                return Err(Error::config(format!(
                    "temporal_reduction has no property '{key}'"
                )));
            }
        }
        *self.intervals.lock().unwrap() = None;
        Ok(())
    }

    async fn report_metadata(&self, _port: usize, input_md: &[Metadata]) -> Result<Metadata> {
        let intervals = self.compute_intervals(&input_md[0])?;

        let mut report = input_md[0].clone();
        // Substitute the index contract for the reduced axis.
        let upstream_initializer = input_md[0].require_string(keys::INDEX_INITIALIZER_KEY)?;
        report.remove(&upstream_initializer);
        report.set_string(keys::INDEX_INITIALIZER_KEY, "number_of_intervals");
        report.set_string(keys::INDEX_REQUEST_KEY, "interval");
        report.set_u64("number_of_intervals", intervals.len() as u64);
        if let Some(coordinates) = report.get_nested(keys::COORDINATES) {
            let mut coordinates = coordinates.clone();
            coordinates.set_f64s(keys::T, intervals.iter().map(|i| i.time).collect());
            report.set_nested(keys::COORDINATES, coordinates);
        }

        // Record how the data was reduced, the CF way.
        if let Some(attributes) = report.get_nested(keys::ATTRIBUTES) {
            let mut attributes = attributes.clone();
            let names: Vec<String> = attributes.keys().map(str::to_string).collect();
            for name in names {
                if let Some(atts) = attributes.get_nested(&name) {
                    let mut atts = atts.clone();
                    atts.set_string("cell_methods", format!("time: {}", self.operator));
                    attributes.set_nested(name, atts);
                }
            }
            report.set_nested(keys::ATTRIBUTES, attributes);
        }

        *self.intervals.lock().unwrap() = Some(intervals);
        Ok(report)
    }

    fn translate_request(
        &self,
        _port: usize,
        input_md: &[Metadata],
        request: &Request,
    ) -> Result<Vec<Vec<Request>>> {
        let index = request.require_u64("interval")?;
        let intervals = self.compute_intervals(&input_md[0])?;
        let interval = intervals.get(index as usize).ok_or_else(|| {
            Error::semantic(format!(
                "interval {index} out of range, {} available",
                intervals.len()
            ))
        })?;
        let upstream_key = input_md[0].require_string(keys::INDEX_REQUEST_KEY)?;

        let mut upstream = Vec::with_capacity((interval.last_step - interval.first_step + 1) as usize);
        for (sequence, step) in (interval.first_step..=interval.last_step).enumerate() {
            let mut member = request.clone();
            member.remove("interval");
            member.set_u64(upstream_key.clone(), step);
            member.set_u64("sequence_id", sequence as u64);
            upstream.push(member);
        }
        Ok(vec![upstream])
    }

    async fn execute(
        &self,
        _port: usize,
        inputs: Vec<DatasetRef>,
        request: &Request,
    ) -> Result<DatasetRef> {
        let input = inputs
            .into_iter()
            .next()
            .ok_or_else(|| Error::config("temporal_reduction executed with no input"))?;
        if input.is_empty() {
            // Every member step was dropped under the fill policy.
            return Ok(input);
        }
        let operator = Operator::parse(&self.operator)?;
        let index = request.require_u64("interval")?;
        let interval = {
            let intervals = self.intervals.lock().unwrap();
            let intervals = intervals
                .as_ref()
                .ok_or_else(|| Error::config("temporal_reduction executed before reporting"))?;
            *intervals.get(index as usize).ok_or_else(|| {
                Error::semantic(format!("interval {index} out of range"))
            })?
        };
        let accumulator = self.as_accumulator(&input, operator)?;
        let reduced = self.finalize(accumulator, operator, interval, index)?;
        Ok(Arc::new(Dataset::Mesh(reduced)))
    }

    fn reduction(&self) -> Option<ReduceOrder> {
        Some(ReduceOrder::Unordered)
    }

    fn reduce(&self, left: DatasetRef, right: DatasetRef) -> Result<DatasetRef> {
        // Empty partials drop out of the fold.
        if left.is_empty() {
            return Ok(right);
        }
        if right.is_empty() {
            return Ok(left);
        }
        let operator = Operator::parse(&self.operator)?;
        let a = self.as_accumulator(&left, operator)?;
        let b = self.as_accumulator(&right, operator)?;
        Ok(Arc::new(Dataset::Mesh(self.combine(a, b, operator)?)))
    }

    fn missing_ok(&self) -> bool {
        self.missing_policy == "fill"
    }

    fn concurrency(&self) -> isize {
        self.n_threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::VariantArray;

    fn upstream_report(n: u64, calendar: &str) -> Metadata {
        let mut md = Metadata::new();
        md.set_string(keys::INDEX_INITIALIZER_KEY, keys::NUMBER_OF_TIME_STEPS);
        md.set_string(keys::INDEX_REQUEST_KEY, "time_step");
        md.set_u64(keys::NUMBER_OF_TIME_STEPS, n);
        let mut coordinates = Metadata::new();
        coordinates.set_f64s(keys::T, (0..n).map(|i| i as f64).collect());
        coordinates.set_string(keys::T_UNITS, "days since 2000-01-01");
        coordinates.set_string(keys::CALENDAR, calendar);
        md.set_nested(keys::COORDINATES, coordinates);
        md
    }

    fn scalar_mesh(value: f64) -> CartesianMesh {
        let mut mesh = CartesianMesh::new();
        mesh.set_x_coordinates("lon", Arc::new(VariantArray::from(vec![0.0f64])));
        mesh.set_y_coordinates("lat", Arc::new(VariantArray::from(vec![0.0f64])));
        mesh.set_z_coordinates("", Arc::new(VariantArray::from(vec![0.0f64])));
        mesh.point_arrays
            .set("T", Arc::new(VariantArray::from(vec![value])));
        mesh
    }

    #[test]
    fn monthly_intervals_on_a_360_day_axis() {
        let stage = TemporalReduction::new();
        let intervals = stage
            .compute_intervals(&upstream_report(60, "360_day"))
            .unwrap();
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].first_step, 0);
        assert_eq!(intervals[0].last_step, 29);
        assert_eq!(intervals[1].first_step, 30);
        assert_eq!(intervals[1].last_step, 59);
    }

    #[tokio::test]
    async fn monthly_mean_of_step_indices() {
        let stage = TemporalReduction::new();
        let report = stage
            .report_metadata(0, &[upstream_report(60, "360_day")])
            .await
            .unwrap();
        assert_eq!(report.get_u64("number_of_intervals"), Some(2));
        assert_eq!(
            report.get_string(keys::INDEX_REQUEST_KEY).as_deref(),
            Some("interval")
        );

        // Fold the member steps of each month the way the driver would.
        for (interval, expected) in [(0u64, 14.5f64), (1, 44.5)] {
            let mut request = Request::new();
            request.set_u64("interval", interval);
            let members = stage
                .translate_request(0, &[upstream_report(60, "360_day")], &request)
                .unwrap();
            assert_eq!(members[0].len(), 30);

            let mut partial: Option<DatasetRef> = None;
            for member in &members[0] {
                let step = member.get_u64("time_step").unwrap();
                let mesh: DatasetRef = Arc::new(Dataset::Mesh(scalar_mesh(step as f64)));
                partial = Some(match partial.take() {
                    None => mesh,
                    Some(p) => stage.reduce(p, mesh).unwrap(),
                });
            }
            let out = stage
                .execute(0, vec![partial.unwrap()], &request)
                .await
                .unwrap();
            let mesh = out.as_mesh().unwrap();
            let value = mesh.point_arrays.get("T").unwrap().get_f64(0).unwrap();
            assert!((value - expected).abs() < 1.0e-12, "month {interval}");
            assert_eq!(mesh.time_step(), interval);
        }
    }

    #[test]
    fn reduce_is_associative() {
        let stage = TemporalReduction::new();
        let a: DatasetRef = Arc::new(Dataset::Mesh(scalar_mesh(1.0)));
        let b: DatasetRef = Arc::new(Dataset::Mesh(scalar_mesh(2.0)));
        let c: DatasetRef = Arc::new(Dataset::Mesh(scalar_mesh(4.0)));

        let left = stage
            .reduce(stage.reduce(a.clone(), b.clone()).unwrap(), c.clone())
            .unwrap();
        let right = stage.reduce(a, stage.reduce(b, c).unwrap()).unwrap();

        for side in [&left, &right] {
            let mesh = side.as_mesh().unwrap();
            assert_eq!(mesh.point_arrays.get("T").unwrap().get_f64(0), Some(7.0));
        }
    }

    #[test]
    fn fill_values_are_skipped() {
        let stage = TemporalReduction::new();
        let mut with_fill = scalar_mesh(1.0e20);
        let mut atts = Metadata::new();
        let mut t_atts = Metadata::new();
        t_atts.set_f64("_FillValue", 1.0e20);
        atts.set_nested("T", t_atts);
        with_fill.metadata.set_nested(keys::ATTRIBUTES, atts.clone());
        let mut valid = scalar_mesh(3.0);
        valid.metadata.set_nested(keys::ATTRIBUTES, atts);

        let reduced = stage
            .reduce(
                Arc::new(Dataset::Mesh(with_fill)),
                Arc::new(Dataset::Mesh(valid)),
            )
            .unwrap();
        let mesh = reduced.as_mesh().unwrap();
        // One valid sample of 3.0; the fill contributed nothing.
        assert_eq!(mesh.point_arrays.get("T").unwrap().get_f64(0), Some(3.0));
        assert_eq!(
            mesh.info_arrays
                .get("T__valid_count")
                .unwrap()
                .get_f64(0),
            Some(1.0)
        );
    }

    #[test]
    fn seasonal_intervals_roll_december_forward() {
        let mut stage = TemporalReduction::new();
        stage
            .set_property("interval", serde_json::json!("seasonal"))
            .unwrap();
        // Daily steps from 2000-11-01 for 120 days on a noleap calendar.
        let mut md = upstream_report(120, "noleap");
        let mut coordinates = md.get_nested(keys::COORDINATES).unwrap().clone();
        let start = 304.0; // day of year of Nov 1 on noleap
        coordinates.set_f64s(keys::T, (0..120).map(|i| start + i as f64).collect());
        md.set_nested(keys::COORDINATES, coordinates);

        let intervals = stage.compute_intervals(&md).unwrap();
        // SON (Nov), DJF (Dec 2000 + Jan/Feb 2001).
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].last_step, 29);
        assert_eq!(intervals[1].first_step, 30);
        assert_eq!(intervals[1].last_step, 119);
    }
}
