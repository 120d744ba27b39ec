//! Scan controller actor.
//!
//! The controller owns the scan state between runs and the worker task during
//! a run. Consumers talk to it only through [`ScanCommand`]s (usually via a
//! [`ScanHandle`]) and observe data through the event broadcast:
//!
//! ```text
//!  ScanHandle ──mpsc──▶ ScanController ──spawn──▶ worker: scan::run(..)
//!      ▲                     │  ▲                        │
//!      └──────oneshot────────┘  └──── JoinHandle ◀───────┘
//!                                     events ──broadcast──▶ subscribers
//! ```
//!
//! Stop requests flip the shared [`CancelToken`]; the worker honours them at
//! the next step boundary. A force stop additionally calls
//! [`crate::channel::EquipmentHooks::force_stop`] right away.
//!
//! Between scans the controller also applies manual `channel -> value`
//! settings, and [`ScanHandle::wait_idle`] lets a caller such as
//! [`crate::queue::ScanQueue`] sequence scans one after another.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::ScanIo;
use crate::config::EngineConfig;
use crate::error::{AppResult, DaqError};
use crate::level::{Level, SideEffect};
use crate::scan::{self, CancelToken, EventSink, Outcome, ScanEvent, ScanPhase, ScanState};

/// Command queue depth.
const COMMAND_CAPACITY: usize = 32;

// =============================================================================
// Commands
// =============================================================================

/// Commands accepted by the [`ScanController`].
#[derive(Debug)]
pub enum ScanCommand {
    /// Validate levels and arm a new scan
    Initialize {
        /// Levels, innermost first
        levels: Vec<Level>,
        /// Status of the armed scan
        response: oneshot::Sender<AppResult<ScanStatus>>,
    },

    /// Run the armed scan on a worker task
    Start {
        /// Id of the started scan
        response: oneshot::Sender<AppResult<Uuid>>,
    },

    /// Stop at the next step boundary
    RequestStop {
        /// Acknowledged once the flag is set
        response: oneshot::Sender<()>,
    },

    /// Stop and abort equipment immediately
    RequestForceStop {
        /// Acknowledged once equipment was told
        response: oneshot::Sender<()>,
    },

    /// Apply `channel -> value` settings in order while no scan runs
    ManualSet {
        /// Settings to apply
        effects: Vec<SideEffect>,
        /// First failure, if any
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Reply once no scan is running
    AwaitIdle {
        /// Status after the running scan (if any) ended
        response: oneshot::Sender<ScanStatus>,
    },

    /// Current status
    GetStatus {
        /// Current status
        response: oneshot::Sender<ScanStatus>,
    },

    /// Stop any running scan, wait for it, exit the actor; replies with the
    /// final status
    Shutdown {
        /// Final status
        response: oneshot::Sender<ScanStatus>,
    },
}

impl ScanCommand {
    /// Helper to create an Initialize command
    pub fn initialize(levels: Vec<Level>) -> (Self, oneshot::Receiver<AppResult<ScanStatus>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Initialize {
                levels,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Start command
    pub fn start() -> (Self, oneshot::Receiver<AppResult<Uuid>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Start { response: tx }, rx)
    }

    /// Helper to create a RequestStop command
    pub fn request_stop() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::RequestStop { response: tx }, rx)
    }

    /// Helper to create a RequestForceStop command
    pub fn request_force_stop() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::RequestForceStop { response: tx }, rx)
    }

    /// Helper to create a ManualSet command
    pub fn manual_set(effects: Vec<SideEffect>) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::ManualSet {
                effects,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create an AwaitIdle command
    pub fn await_idle() -> (Self, oneshot::Receiver<ScanStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::AwaitIdle { response: tx }, rx)
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<ScanStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<ScanStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanStatus {
    /// Lifecycle phase of the current (or last) scan.
    pub phase: ScanPhase,
    /// Id of the current (or last) scan.
    pub scan_id: Option<Uuid>,
    /// Elementary points of the current scan.
    pub total_points: u64,
    /// Elementary points done so far.
    pub completed_points: u64,
    /// Outcome of the last run that ended without error.
    pub last_outcome: Option<Outcome>,
    /// Error of the last run that failed.
    pub last_error: Option<String>,
}

// =============================================================================
// Actor
// =============================================================================

type WorkerOutput = (ScanState, AppResult<Outcome>);

enum Wake {
    Command(Option<ScanCommand>),
    Worker(Result<WorkerOutput, JoinError>),
    Event(Result<ScanEvent, broadcast::error::RecvError>),
}

/// Actor serializing all scan lifecycle operations.
pub struct ScanController {
    io: ScanIo,
    events: EventSink,
    cancel: CancelToken,
    state: Option<ScanState>,
    worker: Option<JoinHandle<WorkerOutput>>,
    phase: ScanPhase,
    scan_id: Option<Uuid>,
    total_points: u64,
    completed_points: u64,
    last_outcome: Option<Outcome>,
    last_error: Option<String>,
    idle_waiters: Vec<oneshot::Sender<ScanStatus>>,
}

impl ScanController {
    /// Create a controller driving `io`.
    pub fn new(io: ScanIo, config: &EngineConfig) -> Self {
        Self {
            io,
            events: EventSink::new(config.event_capacity),
            cancel: CancelToken::new(),
            state: None,
            worker: None,
            phase: ScanPhase::Idle,
            scan_id: None,
            total_points: 0,
            completed_points: 0,
            last_outcome: None,
            last_error: None,
            idle_waiters: Vec::new(),
        }
    }

    /// Spawn the actor on the current runtime.
    pub fn spawn(io: ScanIo, config: &EngineConfig) -> (ScanHandle, JoinHandle<()>) {
        let controller = Self::new(io, config);
        let events = controller.events.clone();
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = tokio::spawn(controller.run(rx));
        (ScanHandle { tx, events }, task)
    }

    /// Runs the actor event loop, processing commands until shutdown
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<ScanCommand>) {
        info!("ScanController started");
        let mut progress_rx = self.events.subscribe();

        loop {
            let wake = match self.worker.as_mut() {
                Some(worker) => tokio::select! {
                    joined = worker => Wake::Worker(joined),
                    command = command_rx.recv() => Wake::Command(command),
                    event = progress_rx.recv() => Wake::Event(event),
                },
                None => tokio::select! {
                    command = command_rx.recv() => Wake::Command(command),
                    event = progress_rx.recv() => Wake::Event(event),
                },
            };

            match wake {
                Wake::Worker(joined) => {
                    self.worker = None;
                    self.finish_worker(joined);
                }
                Wake::Event(Ok(ScanEvent::RemainingPoints(points))) if self.worker.is_some() => {
                    self.completed_points = points.completed;
                }
                Wake::Event(Ok(_)) => {}
                Wake::Event(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(skipped, "Controller progress receiver lagged");
                }
                Wake::Event(Err(broadcast::error::RecvError::Closed)) => break,
                Wake::Command(None) => break,
                Wake::Command(Some(command)) => {
                    if !self.handle(command).await {
                        break;
                    }
                }
            }
        }

        self.stop_worker().await;
        info!("ScanController shutting down");
    }

    /// Returns false when the actor should exit.
    async fn handle(&mut self, command: ScanCommand) -> bool {
        match command {
            ScanCommand::Initialize { levels, response } => {
                let result = self.initialize(levels);
                let _ = response.send(result);
            }

            ScanCommand::Start { response } => {
                let result = self.start();
                let _ = response.send(result);
            }

            ScanCommand::RequestStop { response } => {
                if self.worker.is_some() {
                    info!("Stop requested");
                    self.cancel.request_stop();
                } else {
                    debug!("Stop requested while no scan is running");
                }
                let _ = response.send(());
            }

            ScanCommand::RequestForceStop { response } => {
                warn!("Force stop requested");
                // The worker may claim the force stop first at a step boundary.
                let deliver = match self.worker {
                    Some(_) => {
                        self.cancel.request_force_stop();
                        self.cancel.take_pending_force()
                    }
                    None => true,
                };
                if deliver {
                    if let Err(e) = self.io.hooks().force_stop().await {
                        warn!(error = %e, "Equipment force stop failed");
                    }
                }
                let _ = response.send(());
            }

            ScanCommand::ManualSet { effects, response } => {
                let result = self.manual_set(&effects).await;
                let _ = response.send(result);
            }

            ScanCommand::AwaitIdle { response } => {
                if self.worker.is_some() {
                    self.idle_waiters.push(response);
                } else {
                    let _ = response.send(self.status());
                }
            }

            ScanCommand::GetStatus { response } => {
                let _ = response.send(self.status());
            }

            ScanCommand::Shutdown { response } => {
                info!("Shutdown command received");
                self.stop_worker().await;
                let _ = response.send(self.status());
                return false;
            }
        }
        true
    }

    fn initialize(&mut self, levels: Vec<Level>) -> AppResult<ScanStatus> {
        self.ensure_idle()?;
        let state = scan::initialize(levels)?;
        self.phase = state.phase();
        self.scan_id = Some(state.scan_id());
        self.total_points = state.total_points();
        self.completed_points = 0;
        self.last_outcome = None;
        self.last_error = None;
        self.state = Some(state);
        Ok(self.status())
    }

    fn start(&mut self) -> AppResult<Uuid> {
        self.ensure_idle()?;
        let mut state = match self.state.take() {
            Some(state) if state.phase() == ScanPhase::Armed => state,
            other => {
                self.state = other;
                return Err(DaqError::InvalidState {
                    expected: ScanPhase::Armed.to_string(),
                    actual: self.phase.to_string(),
                });
            }
        };

        let scan_id = state.scan_id();
        self.cancel.reset();
        self.phase = ScanPhase::Running;

        let io = self.io.clone();
        let cancel = self.cancel.clone();
        let events = self.events.clone();
        self.worker = Some(tokio::spawn(async move {
            let result = scan::run(&mut state, &io, &cancel, &events).await;
            (state, result)
        }));
        info!(%scan_id, "Scan worker spawned");
        Ok(scan_id)
    }

    async fn manual_set(&self, effects: &[SideEffect]) -> AppResult<()> {
        self.ensure_idle()?;
        for effect in effects {
            info!(channel = %effect.channel, value = effect.value, "Manual set");
            self.io.apply(effect.value, &effect.channel).await?;
        }
        Ok(())
    }

    fn ensure_idle(&self) -> AppResult<()> {
        if self.worker.is_some() {
            return Err(DaqError::InvalidState {
                expected: "no running scan".to_string(),
                actual: ScanPhase::Running.to_string(),
            });
        }
        Ok(())
    }

    fn finish_worker(&mut self, joined: Result<WorkerOutput, JoinError>) {
        match joined {
            Ok((state, result)) => {
                self.phase = state.phase();
                self.completed_points = state.completed_points();
                match result {
                    Ok(outcome) => self.last_outcome = Some(outcome),
                    Err(e) => self.last_error = Some(e.to_string()),
                }
                self.state = Some(state);
            }
            Err(e) => {
                warn!(error = %e, "Scan worker panicked or was cancelled");
                self.phase = ScanPhase::Faulted;
                self.last_error = Some(e.to_string());
            }
        }
        let status = self.status();
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(status.clone());
        }
    }

    async fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.cancel.request_stop();
            let joined = worker.await;
            self.finish_worker(joined);
        }
    }

    fn status(&self) -> ScanStatus {
        ScanStatus {
            phase: self.phase,
            scan_id: self.scan_id,
            total_points: self.total_points,
            completed_points: self.completed_points,
            last_outcome: self.last_outcome,
            last_error: self.last_error.clone(),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable client of a [`ScanController`].
#[derive(Debug, Clone)]
pub struct ScanHandle {
    tx: mpsc::Sender<ScanCommand>,
    events: EventSink,
}

impl ScanHandle {
    async fn call<T>(&self, (command, rx): (ScanCommand, oneshot::Receiver<T>)) -> AppResult<T> {
        let gone = || DaqError::InvalidState {
            expected: "controller running".to_string(),
            actual: "controller stopped".to_string(),
        };
        self.tx.send(command).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())
    }

    /// Arm a scan over `levels`.
    pub async fn initialize(&self, levels: Vec<Level>) -> AppResult<ScanStatus> {
        self.call(ScanCommand::initialize(levels)).await?
    }

    /// Start the armed scan; returns its id.
    pub async fn start(&self) -> AppResult<Uuid> {
        self.call(ScanCommand::start()).await?
    }

    /// Ask the running scan to stop at the next step boundary.
    pub async fn request_stop(&self) -> AppResult<()> {
        self.call(ScanCommand::request_stop()).await
    }

    /// Stop the running scan and abort equipment.
    pub async fn request_force_stop(&self) -> AppResult<()> {
        self.call(ScanCommand::request_force_stop()).await
    }

    /// Apply manual settings; fails while a scan is running.
    pub async fn manual_set(&self, effects: Vec<SideEffect>) -> AppResult<()> {
        self.call(ScanCommand::manual_set(effects)).await?
    }

    /// Wait until no scan is running and return the status at that point.
    pub async fn wait_idle(&self) -> AppResult<ScanStatus> {
        self.call(ScanCommand::await_idle()).await
    }

    /// Current status.
    pub async fn status(&self) -> AppResult<ScanStatus> {
        self.call(ScanCommand::get_status()).await
    }

    /// Stop the controller, waiting for any running scan to wind down.
    pub async fn shutdown(&self) -> AppResult<ScanStatus> {
        self.call(ScanCommand::shutdown()).await
    }

    /// Subscribe to scan events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }
}
