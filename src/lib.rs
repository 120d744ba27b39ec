//! Core library for multi-level parameter scans.
//!
//! This library turns an operator's description of a scan into a stack of
//! nested loops and runs them against instrument channels:
//!
//! - [`composition`]: the `+` / `,` algebra that lays named value sequences out
//!   as a `[channels, steps]` matrix.
//! - [`setpoint`], [`level`], [`plan`]: building per-level setting matrices,
//!   getters and side effects, directly or from a TOML scan plan.
//! - [`channel`]: the collaborator traits the engine drives, plus an explicit
//!   channel registry and the wait control.
//! - [`scan`]: `initialize` / `run`, the recursive engine with cooperative
//!   cancellation, progress estimates and copy-on-write data snapshots.
//! - [`controller`]: an actor that owns the worker task and accepts
//!   initialize / start / stop commands.
//! - [`queue`]: scans and manual settings run one after another.
//!
//! Ambient pieces live in [`config`], [`logging`], [`error`] and [`mock`].

pub mod channel;
pub mod composition;
pub mod config;
pub mod controller;
pub mod error;
pub mod level;
pub mod logging;
pub mod mock;
pub mod plan;
pub mod queue;
pub mod scan;
pub mod setpoint;

pub use error::{AppResult, DaqError};
