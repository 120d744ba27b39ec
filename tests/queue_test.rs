//! Scans and manual settings run in order through the controller.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{grid_reading, mock_io, sweep_level, two_level_scan};
use daq_scan::config::EngineConfig;
use daq_scan::controller::ScanController;
use daq_scan::level::SideEffect;
use daq_scan::mock::MockChannels;
use daq_scan::queue::{QueueItem, QueueRecord, ScanQueue};
use daq_scan::scan::ScanPhase;
use daq_scan::DaqError;

#[tokio::test]
async fn test_items_run_in_order() {
    let mock = Arc::new(MockChannels::new().with_reading(grid_reading));
    let (handle, _task) = ScanController::spawn(mock_io(&mock), &EngineConfig::default());

    let mut queue = ScanQueue::new();
    queue.push(QueueItem::manual_set("gate_0_v->0.5").unwrap());
    queue.push(QueueItem::scan("map", two_level_scan()));
    queue.push(QueueItem::manual_set("gate_0_v->0, bias_0_v->0").unwrap());
    queue.push(QueueItem::scan("line", vec![sweep_level("gate_0_v", &[1.0, 2.0], &["G"])]));

    let records = queue.run(&handle).await;
    assert!(queue.is_empty());
    assert_eq!(records.len(), 4);

    let statuses: Vec<(&str, ScanPhase, u64)> = records
        .iter()
        .filter_map(|r| match r {
            QueueRecord::Scan { name, status } => {
                Some((name.as_str(), status.phase, status.completed_points))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![("map", ScanPhase::Finished, 6), ("line", ScanPhase::Finished, 2)]
    );
    assert_eq!(
        records[2],
        QueueRecord::ManualSet {
            settings: "gate_0_v->0, bias_0_v->0".to_string()
        }
    );

    let writes = mock.writes().await;
    assert_eq!(writes.first(), Some(&("gate_0_v".to_string(), 0.5)));
    let reset = writes
        .iter()
        .position(|w| *w == ("bias_0_v".to_string(), 0.0))
        .unwrap();
    // The manual reset lands after the whole map and before the line scan.
    assert_eq!(writes[reset - 1], ("gate_0_v".to_string(), 0.0));
    assert_eq!(writes[reset - 2], ("inner_0_v".to_string(), 2.0));
    assert_eq!(
        &writes[reset + 1..],
        &[("gate_0_v".to_string(), 1.0), ("gate_0_v".to_string(), 2.0)]
    );
}

#[tokio::test]
async fn test_faulted_scan_halts_queue() {
    let mock = Arc::new(MockChannels::new().with_reading(grid_reading));
    mock.fail_on("G").await;
    let (handle, _task) = ScanController::spawn(mock_io(&mock), &EngineConfig::default());

    let mut queue = ScanQueue::new();
    queue.push(QueueItem::scan("broken", two_level_scan()));
    queue.push(QueueItem::manual_set("gate_0_v->1").unwrap());

    let records = queue.run(&handle).await;
    assert_eq!(records.len(), 1);
    match &records[0] {
        QueueRecord::Scan { status, .. } => {
            assert_eq!(status.phase, ScanPhase::Faulted);
            assert!(status.last_error.as_deref().unwrap_or("").contains("G"));
        }
        other => panic!("expected scan record, got {other:?}"),
    }
    assert_eq!(queue.len(), 1);
    assert!(!mock.writes().await.contains(&("gate_0_v".to_string(), 1.0)));
}

#[tokio::test]
async fn test_failing_manual_set_halts_queue() {
    let mock = Arc::new(MockChannels::new());
    mock.fail_on("gate_0_v").await;
    let (handle, _task) = ScanController::spawn(mock_io(&mock), &EngineConfig::default());

    let mut queue = ScanQueue::new();
    queue.push(QueueItem::manual_set("gate_0_v->1").unwrap());
    queue.push(QueueItem::scan("never", two_level_scan()));

    let records = queue.run(&handle).await;
    match records.as_slice() {
        [QueueRecord::Failed { item, error }] => {
            assert_eq!(item, "gate_0_v->1");
            assert!(error.contains("gate_0_v"), "{error}");
        }
        other => panic!("expected one failure, got {other:?}"),
    }
    assert_eq!(queue.len(), 1);
    assert_eq!(handle.status().await.unwrap().phase, ScanPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_manual_set_rejected_while_scanning() {
    let mock = Arc::new(
        MockChannels::new()
            .with_reading(grid_reading)
            .with_latency(Duration::from_millis(10)),
    );
    let (handle, _task) = ScanController::spawn(mock_io(&mock), &EngineConfig::default());

    handle.initialize(two_level_scan()).await.unwrap();
    handle.start().await.unwrap();
    let err = handle
        .manual_set(vec![SideEffect::new("gate_0_v", 1.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::InvalidState { .. }));

    let status = handle.wait_idle().await.unwrap();
    assert_eq!(status.phase, ScanPhase::Finished);
    assert!(!mock.writes().await.contains(&("gate_0_v".to_string(), 1.0)));
}
