//! Point counting and time estimates.

use std::time::Duration;

use tokio::time::Instant;

use super::events::{RemainingPoints, RemainingTime};

/// Progress of one scan.
///
/// Only elementary points (steps of level 0) count as completed, so
/// `completed_points` reaches `total_points` exactly when the scan finishes.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    total_points: u64,
    completed_points: u64,
    started_at: Option<Instant>,
    elapsed: Duration,
}

impl Progress {
    /// Nothing done yet out of `total_points`.
    pub fn new(total_points: u64) -> Self {
        Self {
            total_points,
            ..Self::default()
        }
    }

    /// Elementary points in the scan.
    pub fn total_points(&self) -> u64 {
        self.total_points
    }

    /// Elementary points done.
    pub fn completed_points(&self) -> u64 {
        self.completed_points
    }

    /// Time since the first step, as of the last update.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Record the start instant; later calls keep the first one.
    pub(crate) fn start(&mut self) {
        self.started_at.get_or_insert_with(Instant::now);
    }

    pub(crate) fn update_elapsed(&mut self) {
        if let Some(start) = self.started_at {
            self.elapsed = start.elapsed();
        }
    }

    pub(crate) fn record_point(&mut self) {
        self.completed_points += 1;
    }

    /// Linear extrapolation from the average time per completed point.
    ///
    /// `None` until the first point completes.
    pub fn estimate(&self) -> Option<(RemainingTime, RemainingPoints)> {
        if self.completed_points == 0 || self.total_points == 0 {
            return None;
        }
        let per_point = self.elapsed.as_secs_f64() / self.completed_points as f64;
        let left = self.total_points.saturating_sub(self.completed_points);
        let time = RemainingTime {
            elapsed: self.elapsed,
            remaining: Duration::from_secs_f64(per_point * left as f64),
            total_estimate: Duration::from_secs_f64(per_point * self.total_points as f64),
        };
        let percent =
            (self.completed_points as f64 / self.total_points as f64 * 100.0).round() as u32;
        let points = RemainingPoints {
            completed: self.completed_points,
            total: self.total_points,
            percent,
        };
        Some((time, points))
    }
}
