//! Setter value sources.
//!
//! A setter is swept either through an evenly spaced linear range or through an
//! explicit list of values. Both end up as a plain `Vec<f64>` of destinations
//! that feeds the composition algebra.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Largest number of values a single sweep may produce.
pub const MAX_SWEEP_POINTS: usize = 1_000_000;

/// Evenly spaced sweep from `start` to `end` (inclusive) over `points` values.
///
/// `step`, `mid` and `span` are derived. The editing helpers keep the same
/// relationships between the six quantities that an operator sees in a sweep
/// form: changing the step recomputes the point count, changing mid or span
/// recenters the range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearSweep {
    /// First value.
    pub start: f64,
    /// Last value.
    pub end: f64,
    /// Number of values (>= 1).
    pub points: usize,
}

impl Default for LinearSweep {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 10.0,
            points: 11,
        }
    }
}

impl LinearSweep {
    /// Create a sweep.
    pub fn new(start: f64, end: f64, points: usize) -> Self {
        Self { start, end, points }
    }

    /// `end - start`.
    pub fn span(&self) -> f64 {
        self.end - self.start
    }

    /// Midpoint of the range.
    pub fn mid(&self) -> f64 {
        (self.start + self.end) / 2.0
    }

    /// Spacing between consecutive values; 0 for a single point.
    pub fn step(&self) -> f64 {
        if self.points > 1 {
            self.span() / (self.points - 1) as f64
        } else {
            0.0
        }
    }

    /// Keep the range, pick the point count closest to the requested step.
    pub fn with_step(mut self, step: f64) -> AppResult<Self> {
        if !step.is_finite() || step == 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid sweep step {step}"
            )));
        }
        let points = (self.span() / step + 1.0).round();
        if !points.is_finite() || points < 1.0 {
            return Err(DaqError::Configuration(format!(
                "Step {step} does not fit range {} -> {}",
                self.start, self.end
            )));
        }
        if points > MAX_SWEEP_POINTS as f64 {
            return Err(DaqError::Configuration(format!(
                "Step {step} gives {points} points, at most {MAX_SWEEP_POINTS} are supported"
            )));
        }
        self.points = points as usize;
        Ok(self)
    }

    /// Move the range so it is centered on `mid`, keeping the span.
    pub fn with_mid(mut self, mid: f64) -> Self {
        let half = self.span() / 2.0;
        self.start = mid - half;
        self.end = mid + half;
        self
    }

    /// Resize the range around its current midpoint.
    pub fn with_span(mut self, span: f64) -> Self {
        let mid = self.mid();
        self.start = mid - span / 2.0;
        self.end = mid + span / 2.0;
        self
    }

    /// The sweep values. The last value is exactly `end`.
    pub fn destinations(&self) -> AppResult<Vec<f64>> {
        match self.points {
            0 => Err(DaqError::Configuration(
                "Linear sweep needs at least one point".to_string(),
            )),
            n if n > MAX_SWEEP_POINTS => Err(DaqError::Configuration(format!(
                "Linear sweep of {n} points, at most {MAX_SWEEP_POINTS} are supported"
            ))),
            1 => Ok(vec![self.start]),
            n => {
                let step = self.step();
                let mut values: Vec<f64> =
                    (0..n).map(|i| self.start + step * i as f64).collect();
                values[n - 1] = self.end;
                Ok(values)
            }
        }
    }
}

/// Where a setter's destinations come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetterValues {
    /// Evenly spaced range.
    Linear(LinearSweep),
    /// Values taken verbatim.
    Explicit(Vec<f64>),
}

impl SetterValues {
    /// Materialize the destinations.
    pub fn destinations(&self) -> AppResult<Vec<f64>> {
        match self {
            SetterValues::Linear(sweep) => sweep.destinations(),
            SetterValues::Explicit(values) => Ok(values.clone()),
        }
    }
}
