//! Events published while a scan runs.
//!
//! Events go out on a `tokio::sync::broadcast` channel in execution order.
//! Data snapshots share tensor storage through `Arc`; the engine copies a
//! tensor before mutating it whenever a snapshot still holds it, so a
//! subscriber never observes later writes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ndarray::ArrayD;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Immutable view of all result tensors and indices at one step.
#[derive(Debug, Clone)]
pub struct DataSnapshot {
    /// One tensor per level, level 0 first.
    pub tensors: Vec<Arc<ArrayD<f64>>>,
    /// Current step index of every level, level 0 first.
    pub indices: Vec<usize>,
    /// Level whose step produced this snapshot.
    pub level: usize,
}

impl DataSnapshot {
    /// Tensor of `level`.
    pub fn tensor(&self, level: usize) -> Option<&ArrayD<f64>> {
        self.tensors.get(level).map(Arc::as_ref)
    }
}

/// Time estimate after a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RemainingTime {
    /// Time since the scan started.
    pub elapsed: Duration,
    /// Linear estimate of the time left.
    pub remaining: Duration,
    /// `elapsed + remaining`.
    pub total_estimate: Duration,
}

impl fmt::Display for RemainingTime {
    /// `"0:01:05 / 0:10:00"` (remaining / total).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {}",
            hms(self.remaining),
            hms(self.total_estimate)
        )
    }
}

/// Point count after a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemainingPoints {
    /// Elementary points done.
    pub completed: u64,
    /// Elementary points in the scan.
    pub total: u64,
    /// Rounded percentage, 0..=100.
    pub percent: u32,
}

impl fmt::Display for RemainingPoints {
    /// `"3 / 6 (50%)"`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} ({}%)", self.completed, self.total, self.percent)
    }
}

/// Formats whole seconds as `H:MM:SS`.
pub(crate) fn hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Everything a subscriber can hear from a running scan.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A step finished writing and reading.
    NewDataPoint(DataSnapshot),
    /// Updated time estimate.
    RemainingTime(RemainingTime),
    /// Updated point count.
    RemainingPoints(RemainingPoints),
    /// Emitted exactly once per run, on every exit path.
    ScanFinished {
        /// The scan that ended.
        scan_id: Uuid,
        /// Elementary points done when it ended.
        completed_points: u64,
    },
}

/// Sending half of the event channel.
///
/// Emitting never fails: with no subscribers the event is dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ScanEvent>,
}

impl EventSink {
    /// Create a sink buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver seeing every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: ScanEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_text() {
        let time = RemainingTime {
            elapsed: Duration::from_secs(10),
            remaining: Duration::from_secs(65),
            total_estimate: Duration::from_secs(3 * 3600 + 75),
        };
        assert_eq!(time.to_string(), "0:01:05 / 3:01:15");

        let points = RemainingPoints {
            completed: 3,
            total: 6,
            percent: 50,
        };
        assert_eq!(points.to_string(), "3 / 6 (50%)");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let sink = EventSink::new(4);
        sink.emit(ScanEvent::ScanFinished {
            scan_id: Uuid::new_v4(),
            completed_points: 0,
        });

        let mut rx = sink.subscribe();
        sink.emit(ScanEvent::ScanFinished {
            scan_id: Uuid::nil(),
            completed_points: 1,
        });
        match rx.recv().await.unwrap() {
            ScanEvent::ScanFinished {
                completed_points, ..
            } => assert_eq!(completed_points, 1),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
