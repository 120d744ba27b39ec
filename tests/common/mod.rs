//! Common test utilities for daq_scan integration tests

#![allow(dead_code)] // Not every test binary uses every helper

use std::sync::Arc;

use daq_scan::channel::ScanIo;
use daq_scan::level::{Level, SettingMatrix};
use daq_scan::mock::MockChannels;
use daq_scan::scan::ScanEvent;
use tokio::sync::broadcast;

/// Level with a single setter sweeping `values`.
pub fn sweep_level(channel: &str, values: &[f64], getters: &[&str]) -> Level {
    let row = values.iter().map(|v| Some(*v)).collect();
    Level::new(
        vec![channel.to_string()],
        SettingMatrix::from_rows(vec![row]).expect("single row is rectangular"),
        getters.iter().map(|g| g.to_string()).collect(),
    )
}

/// Outer level (2 steps, no getters) around an inner level (3 steps, getter
/// `G`), innermost first.
pub fn two_level_scan() -> Vec<Level> {
    vec![
        sweep_level("inner_0_v", &[0.0, 1.0, 2.0], &["G"]),
        sweep_level("outer_0_v", &[0.0, 1.0], &[]),
    ]
}

/// Reading `100 * outer + inner` from the current setpoints.
pub fn grid_reading(_channel: &str, setpoints: &std::collections::HashMap<String, f64>) -> f64 {
    let outer = setpoints.get("outer_0_v").copied().unwrap_or(f64::NAN);
    let inner = setpoints.get("inner_0_v").copied().unwrap_or(f64::NAN);
    100.0 * outer + inner
}

/// Wire one mock as writer, reader, control executor and hooks.
pub fn mock_io(mock: &Arc<MockChannels>) -> ScanIo {
    ScanIo::from_shared(mock.clone())
        .with_control_executor(mock.clone())
        .with_hooks(mock.clone())
}

/// Everything currently buffered in `rx`.
pub fn drain(rx: &mut broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Receive until `ScanFinished`, returning everything seen (inclusive).
pub async fn until_finished(rx: &mut broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let done = matches!(event, ScanEvent::ScanFinished { .. });
                events.push(event);
                if done {
                    return events;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return events,
        }
    }
}

/// NaN-aware slice equality.
pub fn same(actual: &[f64], expected: &[f64]) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected)
            .all(|(a, e)| (a.is_nan() && e.is_nan()) || a == e)
}
