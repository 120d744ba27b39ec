//! Scan execution engine.
//!
//! [`initialize`] validates a stack of [`crate::level::Level`]s and allocates
//! the result tensors; [`run`] walks the levels depth-first, driving channels
//! through a [`crate::channel::ScanIo`] and publishing [`ScanEvent`]s.
//! Cancellation is cooperative through a shared [`CancelToken`].

pub mod cancel;
pub mod engine;
pub mod events;
pub mod progress;
pub mod state;

pub use cancel::CancelToken;
pub use engine::{run, Outcome};
pub use events::{DataSnapshot, EventSink, RemainingPoints, RemainingTime, ScanEvent};
pub use progress::Progress;
pub use state::{initialize, ScanPhase, ScanState};
