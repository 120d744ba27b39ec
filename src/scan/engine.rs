//! Recursive multi-level scan loop.
//!
//! The outermost level is visited first. Each of its steps writes the level's
//! setpoints, reads its getters, publishes a snapshot and then runs the whole
//! next-inner level, so the innermost level changes fastest:
//!
//! ```text
//! visit(max)
//!   before effects
//!   for step:
//!     stop? -> return
//!     write setters -> read getters -> NewDataPoint
//!     visit(level - 1)
//!     index += 1 -> RemainingTime / RemainingPoints
//!   after effects
//!   index = 0
//! ```

use futures::future::BoxFuture;
use tracing::{debug, debug_span, info, info_span, warn, Instrument};

use super::cancel::CancelToken;
use super::events::{EventSink, ScanEvent};
use super::state::{ScanPhase, ScanState};
use crate::channel::ScanIo;
use crate::error::{AppResult, DaqError};
use crate::level::{SideEffect, NO_GETTER};

/// How a run ended when no error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every step of every level ran.
    Finished,
    /// A stop request ended the scan early.
    Cancelled,
}

/// Execute an armed scan to completion, cancellation or error.
///
/// Runs on the calling task; spawn it to keep the caller responsive. Teardown
/// (flag reset, [`crate::channel::EquipmentHooks::start_after_scanning`],
/// [`ScanEvent::ScanFinished`]) happens on every exit path, and a collaborator
/// error is returned only after it.
pub async fn run(
    state: &mut ScanState,
    io: &ScanIo,
    cancel: &CancelToken,
    events: &EventSink,
) -> AppResult<Outcome> {
    if state.phase != ScanPhase::Armed {
        return Err(DaqError::InvalidState {
            expected: ScanPhase::Armed.to_string(),
            actual: state.phase.to_string(),
        });
    }

    let scan_id = state.scan_id();
    let span = info_span!("scan", %scan_id);
    state.phase = ScanPhase::Running;
    state.started_at = Some(chrono::Utc::now());
    info!(parent: &span, total_points = state.total_points(), "Scan started");

    let mut walker = Walker {
        state: &mut *state,
        io,
        cancel,
        events,
        stopped: false,
    };
    let result = async {
        io.hooks()
            .stop_for_scanning()
            .await
            .map_err(|e| DaqError::instrument("equipment", e))?;
        let max_level = walker.state.max_level();
        walker.visit(max_level).await
    }
    .instrument(span.clone())
    .await;
    let stopped = walker.stopped;

    // Teardown
    cancel.reset();
    if let Err(e) = io.hooks().start_after_scanning().await {
        warn!(parent: &span, error = %e, "Failed to restart equipment after scan");
    }
    events.emit(ScanEvent::ScanFinished {
        scan_id,
        completed_points: state.completed_points(),
    });

    match result {
        Ok(()) => {
            let outcome = if stopped {
                Outcome::Cancelled
            } else {
                Outcome::Finished
            };
            state.phase = match outcome {
                Outcome::Finished => ScanPhase::Finished,
                Outcome::Cancelled => ScanPhase::Cancelled,
            };
            info!(
                parent: &span,
                ?outcome,
                completed = state.completed_points(),
                "Scan ended"
            );
            Ok(outcome)
        }
        Err(e) => {
            state.phase = ScanPhase::Faulted;
            warn!(parent: &span, error = %e, "Scan aborted");
            Err(e)
        }
    }
}

struct Walker<'a> {
    state: &'a mut ScanState,
    io: &'a ScanIo,
    cancel: &'a CancelToken,
    events: &'a EventSink,
    stopped: bool,
}

impl Walker<'_> {
    /// Observe the stop flag, delivering an unclaimed force stop to the
    /// equipment first.
    async fn stop_requested(&mut self) -> bool {
        if !self.cancel.is_stop_requested() {
            return false;
        }
        if self.cancel.take_pending_force() {
            warn!("Force stop observed, aborting equipment");
            if let Err(e) = self.io.hooks().force_stop().await {
                warn!(error = %e, "Equipment force stop failed");
            }
        }
        self.stopped = true;
        true
    }

    fn visit(&mut self, level: usize) -> BoxFuture<'_, AppResult<()>> {
        let span = debug_span!("level", level);
        Box::pin(
            async move {
                if level == self.state.max_level() {
                    self.state.progress.start();
                }

                let before = self.state.levels[level].before.clone();
                for effect in &before {
                    if self.stop_requested().await {
                        return Ok(());
                    }
                    self.apply(effect).await?;
                }

                let steps = self.state.levels[level].steps();
                for step in 0..steps {
                    if self.stop_requested().await {
                        debug!(step, forced = self.cancel.is_force_requested(), "Stop observed");
                        return Ok(());
                    }

                    self.write(level, step).await?;

                    // Zero getter names: only the first step runs.
                    if self.state.levels[level].getters.is_empty() {
                        break;
                    }
                    let readings = self.read(level).await?;
                    self.state.store(level, &readings);
                    self.events
                        .emit(ScanEvent::NewDataPoint(self.state.snapshot(level)));

                    if level > 0 {
                        self.visit(level - 1).await?;
                    }

                    self.state.indices[level] += 1;
                    self.state.progress.update_elapsed();
                    if level == 0 {
                        self.state.progress.record_point();
                    }
                    if let Some((time, points)) = self.state.progress.estimate() {
                        self.events.emit(ScanEvent::RemainingTime(time));
                        self.events.emit(ScanEvent::RemainingPoints(points));
                    }
                }

                let after = self.state.levels[level].after.clone();
                for effect in &after {
                    self.apply(effect).await?;
                }

                self.state.indices[level] = 0;
                Ok(())
            }
            .instrument(span),
        )
    }

    async fn apply(&self, effect: &SideEffect) -> AppResult<()> {
        debug!(channel = %effect.channel, value = effect.value, "side effect");
        self.io.apply(effect.value, &effect.channel).await
    }

    async fn write(&self, level: usize, step: usize) -> AppResult<()> {
        let level_def = &self.state.levels[level];
        for (row, channel) in level_def.setters.iter().enumerate() {
            if let Some(value) = level_def.settings.get(row, step) {
                self.io.apply(value, channel).await?;
            }
        }
        Ok(())
    }

    async fn read(&self, level: usize) -> AppResult<Vec<Option<f64>>> {
        let getters = &self.state.levels[level].getters;
        let mut readings = Vec::with_capacity(getters.len());
        for getter in getters {
            if getter == NO_GETTER {
                readings.push(None);
            } else {
                readings.push(Some(self.io.read(getter).await?));
            }
        }
        Ok(readings)
    }
}
