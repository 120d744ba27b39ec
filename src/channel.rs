//! Channel I/O seams between the scan engine and instruments.
//!
//! The engine never talks to hardware directly. It routes every setpoint,
//! reading and control through the traits in this module:
//!
//! - [`ChannelWriter`] / [`ChannelReader`]: real instrument channels.
//! - [`ControlExecutor`]: pseudo-channels such as a timed wait.
//! - [`VirtualChannel`]: channels derived from other channels by an external
//!   equation solver, selected by exact name membership.
//! - [`EquipmentHooks`]: lifecycle notifications around a scan.
//!
//! [`ScanIo`] bundles one of each and decides, per channel name, which path a
//! call takes. [`ChannelRegistry`] is the explicit name -> equipment map that
//! implements the writer and reader for a set of instruments.
//!
//! # Channel Names
//!
//! Instrument channels are named `"<equipment label>_<variable>"`, e.g.
//! `"lockin_0_frequency"` for variable `frequency` of equipment `lockin_0`.
//! Labels may themselves contain underscores, so the split is ambiguous. The
//! [`NamingRule`] a registry uses is therefore always chosen explicitly.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::error::{AppResult, DaqError};

// =============================================================================
// Collaborator Traits
// =============================================================================

/// Writes setpoints to named channels.
///
/// The engine only calls `write` for real setpoints; empty cells of a setting
/// matrix never reach the writer.
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    /// Drive `channel` to `value`.
    async fn write(&self, value: f64, channel: &str) -> Result<()>;
}

/// Reads a scalar from a named channel.
#[async_trait]
pub trait ChannelReader: Send + Sync {
    /// Sample `channel` once.
    async fn read(&self, channel: &str) -> Result<f64>;
}

/// Executes control pseudo-channels (waits, triggers, ...).
#[async_trait]
pub trait ControlExecutor: Send + Sync {
    /// Run `control` with argument `value`.
    async fn execute(&self, value: f64, control: &str) -> Result<()>;
}

/// A channel computed from, or decomposed into, other channels.
#[async_trait]
pub trait VirtualChannel: Send + Sync {
    /// Set the virtual channel; implementations write the underlying channels.
    async fn write(&self, value: f64) -> Result<()>;

    /// Evaluate the virtual channel from the underlying channels.
    async fn read(&self) -> Result<f64>;
}

/// Lifecycle notifications for the equipment taking part in a scan.
///
/// All methods default to no-ops.
#[async_trait]
pub trait EquipmentHooks: Send + Sync {
    /// Pause free-running acquisition before a scan takes control.
    async fn stop_for_scanning(&self) -> Result<()> {
        Ok(())
    }

    /// Resume free-running acquisition after a scan, on every exit path.
    async fn start_after_scanning(&self) -> Result<()> {
        Ok(())
    }

    /// Abort whatever the equipment is doing right now.
    async fn force_stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl EquipmentHooks for NoHooks {}

// =============================================================================
// Naming Rule
// =============================================================================

/// How a channel name is split into equipment label and variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingRule {
    /// Label is everything up to the second underscore:
    /// `"lockin_0_x_phase"` -> (`"lockin_0"`, `"x_phase"`).
    SecondUnderscore,
    /// Label is the longest registered label followed by `_`:
    /// with label `"my_dev_2"`, `"my_dev_2_power"` -> (`"my_dev_2"`, `"power"`).
    KnownLabels(Vec<String>),
}

impl Default for NamingRule {
    fn default() -> Self {
        Self::SecondUnderscore
    }
}

/// A channel name split into equipment label and variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelName<'a> {
    /// Equipment label.
    pub label: &'a str,
    /// Variable on that equipment.
    pub variable: &'a str,
}

impl<'a> ChannelName<'a> {
    /// Split `name` with `rule`. Returns `None` if the rule does not apply.
    pub fn parse(name: &'a str, rule: &NamingRule) -> Option<Self> {
        match rule {
            NamingRule::SecondUnderscore => {
                let (idx, _) = name.match_indices('_').nth(1)?;
                Some(Self {
                    label: &name[..idx],
                    variable: &name[idx + 1..],
                })
            }
            NamingRule::KnownLabels(labels) => labels
                .iter()
                .filter(|label| {
                    name.len() > label.len() + 1
                        && name.starts_with(label.as_str())
                        && name.as_bytes()[label.len()] == b'_'
                })
                .max_by_key(|label| label.len())
                .map(|label| Self {
                    label: &name[..label.len()],
                    variable: &name[label.len() + 1..],
                }),
        }
    }
}

impl fmt::Display for ChannelName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.label, self.variable)
    }
}

// =============================================================================
// Channel Registry
// =============================================================================

/// An instrument exposing named variables.
#[async_trait]
pub trait Equipment: Send + Sync {
    /// Write `value` to `variable`.
    async fn write(&self, variable: &str, value: f64) -> Result<()>;

    /// Read `variable`.
    async fn read(&self, variable: &str) -> Result<f64>;
}

/// Explicit map of equipment label -> equipment, built once at wiring time.
///
/// Implements [`ChannelWriter`] and [`ChannelReader`] by splitting each
/// channel name with the configured [`NamingRule`] and dispatching to the
/// equipment registered under the label.
pub struct ChannelRegistry {
    rule: NamingRule,
    equipment: HashMap<String, Arc<dyn Equipment>>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut labels: Vec<&String> = self.equipment.keys().collect();
        labels.sort();
        f.debug_struct("ChannelRegistry")
            .field("rule", &self.rule)
            .field("equipment", &labels)
            .finish()
    }
}

impl ChannelRegistry {
    /// Create an empty registry using `rule`.
    pub fn new(rule: NamingRule) -> Self {
        Self {
            rule,
            equipment: HashMap::new(),
        }
    }

    /// Create an empty registry with the naming rule selected in `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.naming_rule())
    }

    /// Equipment label `channel` belongs to under this registry's rule.
    ///
    /// The label need not be registered yet.
    pub fn label_for<'n>(&self, channel: &'n str) -> Option<&'n str> {
        ChannelName::parse(channel, &self.rule).map(|name| name.label)
    }

    /// Register `equipment` under `label`.
    ///
    /// With [`NamingRule::KnownLabels`] the label is also added to the rule.
    pub fn register(&mut self, label: impl Into<String>, equipment: Arc<dyn Equipment>) {
        let label = label.into();
        if let NamingRule::KnownLabels(labels) = &mut self.rule {
            if !labels.contains(&label) {
                labels.push(label.clone());
            }
        }
        self.equipment.insert(label, equipment);
    }

    /// Registered labels.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.equipment.keys().map(String::as_str)
    }

    fn resolve<'n>(&self, channel: &'n str) -> AppResult<(&Arc<dyn Equipment>, ChannelName<'n>)> {
        let name = ChannelName::parse(channel, &self.rule)
            .ok_or_else(|| DaqError::UnknownChannel(channel.to_string()))?;
        let equipment = self
            .equipment
            .get(name.label)
            .ok_or_else(|| DaqError::UnknownChannel(channel.to_string()))?;
        Ok((equipment, name))
    }
}

#[async_trait]
impl ChannelWriter for ChannelRegistry {
    async fn write(&self, value: f64, channel: &str) -> Result<()> {
        let (equipment, name) = self.resolve(channel)?;
        trace!(label = name.label, variable = name.variable, value, "registry write");
        equipment.write(name.variable, value).await
    }
}

#[async_trait]
impl ChannelReader for ChannelRegistry {
    async fn read(&self, channel: &str) -> Result<f64> {
        let (equipment, name) = self.resolve(channel)?;
        trace!(label = name.label, variable = name.variable, "registry read");
        equipment.read(name.variable).await
    }
}

// =============================================================================
// Wait Control
// =============================================================================

/// Control executor that sleeps `value` seconds for any `*_wait` control.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitControl;

#[async_trait]
impl ControlExecutor for WaitControl {
    async fn execute(&self, value: f64, control: &str) -> Result<()> {
        if !control.ends_with("wait") {
            bail!("Unsupported control '{control}'");
        }
        if !value.is_finite() || value < 0.0 {
            bail!("Wait duration must be a non-negative number of seconds, got {value}");
        }
        debug!(control, seconds = value, "waiting");
        tokio::time::sleep(Duration::from_secs_f64(value)).await;
        Ok(())
    }
}

// =============================================================================
// ScanIo - routing
// =============================================================================

/// Where a channel name is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Registered virtual channel.
    Virtual,
    /// Registered control pseudo-channel.
    Control,
    /// Anything else goes to the writer / reader.
    Hardware,
}

/// The collaborators of one scan.
#[derive(Clone)]
pub struct ScanIo {
    writer: Arc<dyn ChannelWriter>,
    reader: Arc<dyn ChannelReader>,
    control: Arc<dyn ControlExecutor>,
    controls: HashSet<String>,
    virtual_channels: HashMap<String, Arc<dyn VirtualChannel>>,
    hooks: Arc<dyn EquipmentHooks>,
}

impl fmt::Debug for ScanIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanIo")
            .field("controls", &self.controls)
            .field(
                "virtual_channels",
                &self.virtual_channels.keys().collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl ScanIo {
    /// Wire a writer and a reader; controls default to [`WaitControl`] with no
    /// registered control names.
    pub fn new(writer: Arc<dyn ChannelWriter>, reader: Arc<dyn ChannelReader>) -> Self {
        Self {
            writer,
            reader,
            control: Arc::new(WaitControl),
            controls: HashSet::new(),
            virtual_channels: HashMap::new(),
            hooks: Arc::new(NoHooks),
        }
    }

    /// Convenience for a single object implementing both directions.
    pub fn from_shared<T>(channels: Arc<T>) -> Self
    where
        T: ChannelWriter + ChannelReader + 'static,
    {
        Self::new(channels.clone(), channels)
    }

    /// Replace the control executor.
    pub fn with_control_executor(mut self, control: Arc<dyn ControlExecutor>) -> Self {
        self.control = control;
        self
    }

    /// Route `name` to the control executor.
    pub fn with_control(mut self, name: impl Into<String>) -> Self {
        self.controls.insert(name.into());
        self
    }

    /// Route `name` to a virtual channel.
    pub fn with_virtual_channel(
        mut self,
        name: impl Into<String>,
        channel: Arc<dyn VirtualChannel>,
    ) -> Self {
        self.virtual_channels.insert(name.into(), channel);
        self
    }

    /// Attach equipment lifecycle hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn EquipmentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Lifecycle hooks.
    pub fn hooks(&self) -> &Arc<dyn EquipmentHooks> {
        &self.hooks
    }

    /// Decide where `name` goes. Virtual channels win over controls.
    pub fn route(&self, name: &str) -> Route {
        if self.virtual_channels.contains_key(name) {
            Route::Virtual
        } else if self.controls.contains(name) {
            Route::Control
        } else {
            Route::Hardware
        }
    }

    /// Apply `value` to `channel` through whichever path it routes to.
    pub async fn apply(&self, value: f64, channel: &str) -> AppResult<()> {
        let result = match self.route(channel) {
            Route::Virtual => match self.virtual_channels.get(channel) {
                Some(v) => v.write(value).await,
                None => Err(anyhow!("virtual channel '{channel}' vanished")),
            },
            Route::Control => self.control.execute(value, channel).await,
            Route::Hardware => self.writer.write(value, channel).await,
        };
        result.map_err(|e| DaqError::instrument(channel, e))
    }

    /// Read `channel` through the virtual resolver or the reader.
    pub async fn read(&self, channel: &str) -> AppResult<f64> {
        let result = match self.virtual_channels.get(channel) {
            Some(v) => v.read().await,
            None => self.reader.read(channel).await,
        };
        result.map_err(|e| DaqError::instrument(channel, e))
    }
}
