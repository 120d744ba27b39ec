//! Ordered queue of scans and manual settings.
//!
//! A queue runs its items strictly one after another through a
//! [`ScanHandle`]:
//!
//! - a scan item is initialized, started and awaited before the next item
//!   begins;
//! - a manual-set item applies its `channel->value` settings in order while no
//!   scan runs, e.g. to ramp a source back to zero between two maps.
//!
//! The queue halts after a scan that did not finish (stopped or faulted) and
//! after a failing item. Items not yet run stay queued.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{info, warn};

use crate::controller::{ScanHandle, ScanStatus};
use crate::error::{AppResult, DaqError};
use crate::level::{format_side_effects, parse_side_effects, Level, SideEffect};
use crate::scan::ScanPhase;

/// One entry of a [`ScanQueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    /// A scan to run to completion.
    Scan {
        /// Label used in logs and records.
        name: String,
        /// Levels, innermost first.
        levels: Vec<Level>,
    },
    /// Settings applied between scans.
    ManualSet(Vec<SideEffect>),
}

impl QueueItem {
    /// A scan item.
    pub fn scan(name: impl Into<String>, levels: Vec<Level>) -> Self {
        Self::Scan {
            name: name.into(),
            levels,
        }
    }

    /// Parse a manual-set item from `"channel->value, ..."` text.
    pub fn manual_set(text: &str) -> AppResult<Self> {
        let effects = parse_side_effects(text)?;
        if effects.is_empty() {
            return Err(DaqError::Configuration(
                "Manual set item has no settings".to_string(),
            ));
        }
        Ok(Self::ManualSet(effects))
    }

    fn label(&self) -> String {
        match self {
            Self::Scan { name, .. } => name.clone(),
            Self::ManualSet(effects) => format_side_effects(effects),
        }
    }
}

/// What happened to one queue item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueRecord {
    /// A scan ran; `status` is the controller status when it ended.
    Scan {
        /// Scan label.
        name: String,
        /// Final status.
        status: ScanStatus,
    },
    /// Manual settings were applied.
    ManualSet {
        /// The settings, in `channel->value` form.
        settings: String,
    },
    /// The item could not be run; the queue halted here.
    Failed {
        /// Scan label or settings text.
        item: String,
        /// Why it failed.
        error: String,
    },
}

/// FIFO of [`QueueItem`]s.
#[derive(Debug, Clone, Default)]
pub struct ScanQueue {
    items: VecDeque<QueueItem>,
}

impl ScanQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item.
    pub fn push(&mut self, item: QueueItem) {
        self.items.push_back(item);
    }

    /// Items not yet run.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is left to run.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run items in order until the queue is empty or halts.
    pub async fn run(&mut self, handle: &ScanHandle) -> Vec<QueueRecord> {
        let mut records = Vec::new();
        while let Some(item) = self.items.pop_front() {
            let label = item.label();
            let record = match Self::run_item(item, handle).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(item = %label, error = %e, remaining = self.items.len(), "Queue halted");
                    records.push(QueueRecord::Failed {
                        item: label,
                        error: e.to_string(),
                    });
                    break;
                }
            };

            let halt = match &record {
                QueueRecord::Scan { status, .. } => status.phase != ScanPhase::Finished,
                _ => false,
            };
            records.push(record);
            if halt {
                warn!(item = %label, remaining = self.items.len(), "Scan did not finish, queue halted");
                break;
            }
        }
        records
    }

    async fn run_item(item: QueueItem, handle: &ScanHandle) -> AppResult<QueueRecord> {
        match item {
            QueueItem::ManualSet(effects) => {
                let settings = format_side_effects(&effects);
                handle.manual_set(effects).await?;
                Ok(QueueRecord::ManualSet { settings })
            }
            QueueItem::Scan { name, levels } => {
                handle.initialize(levels).await?;
                let scan_id = handle.start().await?;
                info!(%scan_id, scan = %name, "Queued scan started");
                let status = handle.wait_idle().await?;
                Ok(QueueRecord::Scan { name, status })
            }
        }
    }
}
