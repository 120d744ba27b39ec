//! Simulated channels.
//!
//! [`MockChannels`] stands in for a whole rack of instruments. It implements
//! every collaborator trait of [`crate::channel`], records each call in order
//! and answers reads with a programmable function of the channel name and the
//! setpoints written so far. [`MockEquipment`] exposes one labelled slice of
//! the rack to a [`crate::channel::ChannelRegistry`]. Used by the CLI `run`
//! command and the tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

use crate::channel::{ChannelReader, ChannelWriter, ControlExecutor, Equipment, EquipmentHooks};

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    /// Setpoint written to a channel.
    Write {
        /// Channel name.
        channel: String,
        /// Setpoint.
        value: f64,
    },
    /// Channel sampled.
    Read {
        /// Channel name.
        channel: String,
    },
    /// Control executed.
    Control {
        /// Control name.
        control: String,
        /// Argument.
        value: f64,
    },
    /// [`EquipmentHooks::stop_for_scanning`].
    StopForScanning,
    /// [`EquipmentHooks::start_after_scanning`].
    StartAfterScanning,
    /// [`EquipmentHooks::force_stop`].
    ForceStop,
}

/// Reading function: channel name and last written setpoint per channel.
pub type ReadFn = Arc<dyn Fn(&str, &HashMap<String, f64>) -> f64 + Send + Sync>;

/// Recording, programmable channel simulator.
///
/// By default a read returns the sum of all current setpoints, which is
/// enough to see every setter move in the output.
pub struct MockChannels {
    calls: Mutex<Vec<MockCall>>,
    setpoints: RwLock<HashMap<String, f64>>,
    reading: ReadFn,
    failing: RwLock<HashSet<String>>,
    latency: Duration,
}

impl fmt::Debug for MockChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChannels")
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl Default for MockChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannels {
    /// Create a simulator with no latency.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            setpoints: RwLock::new(HashMap::new()),
            reading: Arc::new(|_, setpoints| setpoints.values().sum()),
            failing: RwLock::new(HashSet::new()),
            latency: Duration::ZERO,
        }
    }

    /// Replace the reading function.
    pub fn with_reading<F>(mut self, reading: F) -> Self
    where
        F: Fn(&str, &HashMap<String, f64>) -> f64 + Send + Sync + 'static,
    {
        self.reading = Arc::new(reading);
        self
    }

    /// Delay every write and read by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every call addressed to `channel` fail.
    pub async fn fail_on(&self, channel: impl Into<String>) {
        self.failing.write().await.insert(channel.into());
    }

    /// All calls so far, in order.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    /// `(channel, value)` of every write so far, in order.
    pub async fn writes(&self) -> Vec<(String, f64)> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                MockCall::Write { channel, value } => Some((channel.clone(), *value)),
                _ => None,
            })
            .collect()
    }

    /// Last value written to `channel`.
    pub async fn setpoint(&self, channel: &str) -> Option<f64> {
        self.setpoints.read().await.get(channel).copied()
    }

    /// The instrument labelled `label`, addressed by variable name.
    pub fn equipment(self: &Arc<Self>, label: impl Into<String>) -> Arc<MockEquipment> {
        Arc::new(MockEquipment {
            label: label.into(),
            rack: self.clone(),
        })
    }

    async fn record(&self, call: MockCall) {
        self.calls.lock().await.push(call);
    }

    async fn check(&self, channel: &str) -> Result<()> {
        if self.failing.read().await.contains(channel) {
            bail!("simulated fault on {channel}");
        }
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelWriter for MockChannels {
    async fn write(&self, value: f64, channel: &str) -> Result<()> {
        self.record(MockCall::Write {
            channel: channel.to_string(),
            value,
        })
        .await;
        self.check(channel).await?;
        self.setpoints
            .write()
            .await
            .insert(channel.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl ChannelReader for MockChannels {
    async fn read(&self, channel: &str) -> Result<f64> {
        self.record(MockCall::Read {
            channel: channel.to_string(),
        })
        .await;
        self.check(channel).await?;
        let setpoints = self.setpoints.read().await;
        Ok((self.reading)(channel, &setpoints))
    }
}

#[async_trait]
impl ControlExecutor for MockChannels {
    async fn execute(&self, value: f64, control: &str) -> Result<()> {
        self.record(MockCall::Control {
            control: control.to_string(),
            value,
        })
        .await;
        if self.failing.read().await.contains(control) {
            bail!("simulated fault on {control}");
        }
        if control.ends_with("wait") && value.is_finite() && value > 0.0 {
            sleep(Duration::from_secs_f64(value)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl EquipmentHooks for MockChannels {
    async fn stop_for_scanning(&self) -> Result<()> {
        self.record(MockCall::StopForScanning).await;
        Ok(())
    }

    async fn start_after_scanning(&self) -> Result<()> {
        self.record(MockCall::StartAfterScanning).await;
        Ok(())
    }

    async fn force_stop(&self) -> Result<()> {
        self.record(MockCall::ForceStop).await;
        Ok(())
    }
}

/// One instrument of a [`MockChannels`] rack.
///
/// Variables are recorded on the rack under their full channel name
/// `"<label>_<variable>"`.
#[derive(Debug)]
pub struct MockEquipment {
    label: String,
    rack: Arc<MockChannels>,
}

#[async_trait]
impl Equipment for MockEquipment {
    async fn write(&self, variable: &str, value: f64) -> Result<()> {
        let channel = format!("{}_{variable}", self.label);
        ChannelWriter::write(self.rack.as_ref(), value, &channel).await
    }

    async fn read(&self, variable: &str) -> Result<f64> {
        let channel = format!("{}_{variable}", self.label);
        ChannelReader::read(self.rack.as_ref(), &channel).await
    }
}
