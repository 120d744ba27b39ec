//! Per-scan state: levels, result tensors, indices, progress.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ndarray::{ArrayD, IxDyn};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::events::DataSnapshot;
use super::progress::Progress;
use crate::error::{AppResult, DaqError};
use crate::level::Level;

/// Lifecycle of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    /// Nothing initialized.
    Idle,
    /// Initialized, ready to run.
    Armed,
    /// A worker is walking the levels.
    Running,
    /// Every step ran.
    Finished,
    /// Stopped on request before the last step.
    Cancelled,
    /// A collaborator error aborted the run.
    Faulted,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanPhase::Idle => "Idle",
            ScanPhase::Armed => "Armed",
            ScanPhase::Running => "Running",
            ScanPhase::Finished => "Finished",
            ScanPhase::Cancelled => "Cancelled",
            ScanPhase::Faulted => "Faulted",
        };
        write!(f, "{}", s)
    }
}

/// Everything the engine owns for one scan.
///
/// Built by [`initialize`]; mutated only by [`crate::scan::run`]. Level 0 is
/// the innermost loop and `max_level` the outermost.
#[derive(Debug, Clone)]
pub struct ScanState {
    scan_id: Uuid,
    pub(crate) levels: Vec<Level>,
    pub(crate) tensors: Vec<Arc<ArrayD<f64>>>,
    pub(crate) indices: Vec<usize>,
    pub(crate) progress: Progress,
    pub(crate) phase: ScanPhase,
    pub(crate) started_at: Option<DateTime<Utc>>,
}

/// Validate `levels` and build a fresh, armed scan state.
///
/// For level `l` the result tensor has shape
/// `[getters(l), steps(max_level), ..., steps(l + 1), steps(l)]` and is NaN
/// filled. Fails with [`DaqError::Configuration`] before any hardware is
/// touched.
pub fn initialize(levels: Vec<Level>) -> AppResult<ScanState> {
    if levels.is_empty() {
        return Err(DaqError::Configuration(
            "A scan needs at least one level".to_string(),
        ));
    }
    for (ordinal, level) in levels.iter().enumerate() {
        level.validate(ordinal)?;
    }

    let max_level = levels.len() - 1;
    let total_points = levels.iter().map(|l| l.steps() as u64).product();

    let tensors = (0..=max_level)
        .map(|l| {
            let mut shape = Vec::with_capacity(max_level - l + 2);
            shape.push(levels[l].getters.len());
            shape.extend((l..=max_level).rev().map(|k| levels[k].steps()));
            Arc::new(ArrayD::from_elem(IxDyn(&shape), f64::NAN))
        })
        .collect();

    let scan_id = Uuid::new_v4();
    info!(
        %scan_id,
        levels = levels.len(),
        total_points,
        "Scan initialized"
    );

    Ok(ScanState {
        scan_id,
        indices: vec![0; levels.len()],
        levels,
        tensors,
        progress: Progress::new(total_points),
        phase: ScanPhase::Armed,
        started_at: None,
    })
}

impl ScanState {
    /// Id assigned at initialization.
    pub fn scan_id(&self) -> Uuid {
        self.scan_id
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    /// Levels, innermost first.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Ordinal of the outermost level.
    pub fn max_level(&self) -> usize {
        self.levels.len() - 1
    }

    /// Current step index of `level`.
    pub fn current_index(&self, level: usize) -> usize {
        self.indices.get(level).copied().unwrap_or(0)
    }

    /// Result tensor of `level`.
    pub fn tensor(&self, level: usize) -> Option<&ArrayD<f64>> {
        self.tensors.get(level).map(Arc::as_ref)
    }

    /// Point counts and timing.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Elementary points the full scan visits.
    pub fn total_points(&self) -> u64 {
        self.progress.total_points()
    }

    /// Elementary points done so far.
    pub fn completed_points(&self) -> u64 {
        self.progress.completed_points()
    }

    /// Wall-clock time the last run started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub(crate) fn snapshot(&self, level: usize) -> DataSnapshot {
        DataSnapshot {
            tensors: self.tensors.clone(),
            indices: self.indices.clone(),
            level,
        }
    }

    /// Store one reading per getter of `level` at the current indices.
    ///
    /// `None` entries leave the cell NaN.
    pub(crate) fn store(&mut self, level: usize, readings: &[Option<f64>]) {
        let max_level = self.max_level();
        let mut index = Vec::with_capacity(max_level - level + 2);
        index.push(0);
        index.extend((level..=max_level).rev().map(|l| self.indices[l]));

        let tensor = Arc::make_mut(&mut self.tensors[level]);
        for (getter, reading) in readings.iter().enumerate() {
            let Some(value) = reading else { continue };
            index[0] = getter;
            if let Some(cell) = tensor.get_mut(index.as_slice()) {
                *cell = *value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::SettingMatrix;

    fn level(steps: usize, getters: &[&str]) -> Level {
        Level::new(
            vec![],
            SettingMatrix::repeat(steps),
            getters.iter().map(|g| g.to_string()).collect(),
        )
    }

    #[test]
    fn test_initialize_shapes_and_totals() {
        let state = initialize(vec![level(3, &["a", "b"]), level(2, &[]), level(4, &["c"])])
            .unwrap();
        assert_eq!(state.phase(), ScanPhase::Armed);
        assert_eq!(state.total_points(), 24);
        assert_eq!(state.max_level(), 2);
        assert_eq!(state.tensor(0).unwrap().shape(), &[2, 4, 2, 3]);
        assert_eq!(state.tensor(1).unwrap().shape(), &[1, 4, 2]);
        assert_eq!(state.tensor(2).unwrap().shape(), &[1, 4]);
        assert!(state.tensor(0).unwrap().iter().all(|v| v.is_nan()));
        assert_eq!(state.current_index(1), 0);
    }

    #[test]
    fn test_initialize_rejects_zero_levels() {
        let err = initialize(vec![]).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_initialize_rejects_setter_row_mismatch() {
        let bad = Level::new(vec!["x".into()], SettingMatrix::repeat(2), vec![]);
        assert!(initialize(vec![bad]).is_err());
    }

    #[test]
    fn test_store_does_not_touch_snapshots() {
        let mut state = initialize(vec![level(2, &["g"])]).unwrap();
        let before = state.snapshot(0);
        state.indices[0] = 1;
        state.store(0, &[Some(7.0)]);

        assert!(before.tensor(0).unwrap().iter().all(|v| v.is_nan()));
        assert_eq!(state.tensor(0).unwrap()[[0, 1]], 7.0);
        assert_eq!(before.indices, vec![0]);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ScanPhase::Cancelled.to_string(), "Cancelled");
    }
}
