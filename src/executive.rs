//! Work-index enumeration and partitioning.
//!
//! Given the terminal stage's reported metadata, the executive reads the
//! index initializer key, applies step and date-range restrictions,
//! block-partitions the surviving indices across the communicator's
//! ranks, and emits one base request per local index. A shared cancel
//! flag is polled between requests; in-flight work runs to completion.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::algorithm::{Request, keys};
use crate::calendar::{self, Calendar, DateTime, TimeUnits};
use crate::comm::{CommRef, block_partition};
use crate::error::{Error, Result};
use crate::metadata::Metadata;

pub struct IndexExecutive {
    comm: CommRef,
    first_step: u64,
    last_step: Option<u64>,
    start_date: Option<String>,
    end_date: Option<String>,
    arrays: Vec<String>,
    bounds: Option<[f64; 6]>,
    cancel: Arc<AtomicBool>,
    requests: VecDeque<Request>,
}

impl IndexExecutive {
    pub fn new(comm: CommRef) -> Self {
        Self {
            comm,
            first_step: 0,
            last_step: None,
            start_date: None,
            end_date: None,
            arrays: Vec::new(),
            bounds: None,
            cancel: Arc::new(AtomicBool::new(false)),
            requests: VecDeque::new(),
        }
    }

    pub fn set_first_step(&mut self, step: u64) {
        self.first_step = step;
    }

    pub fn set_last_step(&mut self, step: u64) {
        self.last_step = Some(step);
    }

    pub fn set_start_date(&mut self, date: impl Into<String>) {
        self.start_date = Some(date.into());
    }

    pub fn set_end_date(&mut self, date: impl Into<String>) {
        self.end_date = Some(date.into());
    }

    pub fn set_arrays(&mut self, arrays: Vec<String>) {
        self.arrays = arrays;
    }

    pub fn set_bounds(&mut self, bounds: [f64; 6]) {
        self.bounds = Some(bounds);
    }

    /// Shared flag; setting it stops request emission at the next poll.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn n_local_requests(&self) -> usize {
        self.requests.len()
    }

    /// Builds this rank's request queue from the terminal stage's report.
    pub fn initialize(&mut self, metadata: &Metadata) -> Result<()> {
        self.requests.clear();

        let initializer_key = metadata.require_string(keys::INDEX_INITIALIZER_KEY)?;
        let request_key = metadata.require_string(keys::INDEX_REQUEST_KEY)?;
        let n_indices = metadata.require_u64(&initializer_key)?;
        if n_indices == 0 {
            tracing::warn!("upstream reports zero work indices");
            return Ok(());
        }

        let mut first = self.first_step;
        let mut last = self.last_step.unwrap_or(n_indices - 1).min(n_indices - 1);

        if self.start_date.is_some() || self.end_date.is_some() {
            let (time, units, calendar) = time_axis(metadata)?;
            if let Some(date) = &self.start_date {
                first = first.max(first_step_at_or_after(&time, date, &units, calendar)?);
            }
            if let Some(date) = &self.end_date {
                last = last.min(last_step_at_or_before(&time, date, &units, calendar)?);
            }
        }

        if first > last {
            tracing::warn!(first, last, "index range is empty, no requests generated");
            return Ok(());
        }

        let count = last - first + 1;
        let local = block_partition(count, self.comm.size(), self.comm.rank());
        tracing::info!(
            rank = self.comm.rank(),
            ranks = self.comm.size(),
            local = local.end - local.start,
            total = count,
            "partitioned work indices"
        );

        for index in local {
            let mut request = Request::new();
            request.set_u64(request_key.clone(), first + index);
            if !self.arrays.is_empty() {
                request.set_strings(keys::ARRAYS, self.arrays.clone());
            }
            if let Some(bounds) = self.bounds {
                request.set_f64s(keys::BOUNDS, bounds.to_vec());
            }
            self.requests.push_back(request);
        }
        Ok(())
    }

    /// The next base request, or `None` when exhausted or cancelled.
    pub fn next_request(&mut self) -> Option<Request> {
        if self.cancel.load(Ordering::Relaxed) {
            if !self.requests.is_empty() {
                tracing::warn!(
                    pending = self.requests.len(),
                    "cancellation requested, dropping pending requests"
                );
                self.requests.clear();
            }
            return None;
        }
        self.requests.pop_front()
    }
}

/// Pulls the time axis out of the reported `coordinates` metadata.
fn time_axis(metadata: &Metadata) -> Result<(Vec<f64>, TimeUnits, Calendar)> {
    let coordinates = metadata
        .get_nested(keys::COORDINATES)
        .ok_or_else(|| Error::semantic("date range requested but no coordinates reported"))?;
    let time = coordinates
        .get_f64s(keys::T)
        .ok_or_else(|| Error::semantic("date range requested but no time axis reported"))?;
    let units = TimeUnits::parse(&coordinates.require_string(keys::T_UNITS)?)?;
    let calendar = Calendar::parse(
        &coordinates
            .get_string(keys::CALENDAR)
            .unwrap_or_else(|| "standard".to_string()),
    )?;
    Ok((time, units, calendar))
}

fn first_step_at_or_after(
    time: &[f64],
    date: &str,
    units: &TimeUnits,
    calendar: Calendar,
) -> Result<u64> {
    let offset = calendar::date_to_offset(&DateTime::parse(date)?, units, calendar)?;
    time.iter()
        .position(|t| *t >= offset - 1.0e-9)
        .map(|i| i as u64)
        .ok_or_else(|| Error::semantic(format!("start date {date} is past the end of the time axis")))
}

fn last_step_at_or_before(
    time: &[f64],
    date: &str,
    units: &TimeUnits,
    calendar: Calendar,
) -> Result<u64> {
    let offset = calendar::date_to_offset(&DateTime::parse(date)?, units, calendar)?;
    time.iter()
        .rposition(|t| *t <= offset + 1.0e-9)
        .map(|i| i as u64)
        .ok_or_else(|| Error::semantic(format!("end date {date} precedes the time axis")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfCommunicator;

    fn report(n: u64) -> Metadata {
        let mut md = Metadata::new();
        md.set_string(keys::INDEX_INITIALIZER_KEY, "number_of_time_steps");
        md.set_string(keys::INDEX_REQUEST_KEY, "time_step");
        md.set_u64("number_of_time_steps", n);
        md
    }

    fn report_with_time_axis(n: u64, calendar: &str) -> Metadata {
        let mut md = report(n);
        let mut coords = Metadata::new();
        coords.set_f64s(keys::T, (0..n).map(|i| i as f64).collect());
        coords.set_string(keys::T_UNITS, "days since 2000-01-01");
        coords.set_string(keys::CALENDAR, calendar);
        md.set_nested(keys::COORDINATES, coords);
        md
    }

    fn executive() -> IndexExecutive {
        IndexExecutive::new(Arc::new(SelfCommunicator))
    }

    #[test]
    fn emits_one_request_per_index() {
        let mut exec = executive();
        exec.set_arrays(vec!["T".to_string()]);
        exec.initialize(&report(3)).unwrap();
        let mut seen = Vec::new();
        while let Some(req) = exec.next_request() {
            assert_eq!(req.get_strings(keys::ARRAYS).unwrap(), vec!["T"]);
            seen.push(req.get_u64("time_step").unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn step_restrictions_clamp_the_range() {
        let mut exec = executive();
        exec.set_first_step(2);
        exec.set_last_step(100);
        exec.initialize(&report(5)).unwrap();
        assert_eq!(exec.n_local_requests(), 3);
    }

    #[test]
    fn start_date_resolves_against_noleap_axis() {
        let mut exec = executive();
        exec.set_start_date("2000-02-01");
        exec.initialize(&report_with_time_axis(60, "noleap")).unwrap();
        let first = exec.next_request().unwrap();
        assert_eq!(first.get_u64("time_step"), Some(31));
    }

    #[test]
    fn invalid_end_date_is_an_error() {
        let mut exec = executive();
        exec.set_end_date("2000-02-29");
        let err = exec
            .initialize(&report_with_time_axis(60, "noleap"))
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn start_past_axis_end_is_an_error() {
        let mut exec = executive();
        exec.set_start_date("2001-01-01");
        assert!(exec.initialize(&report_with_time_axis(10, "noleap")).is_err());
    }

    #[test]
    fn cancellation_drops_pending_requests() {
        let mut exec = executive();
        exec.initialize(&report(10)).unwrap();
        assert!(exec.next_request().is_some());
        exec.cancel_flag().store(true, Ordering::Relaxed);
        assert!(exec.next_request().is_none());
        assert_eq!(exec.n_local_requests(), 0);
    }
}
