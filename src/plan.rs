//! Serializable scan plans.
//!
//! A plan describes every level of a scan the way an operator fills in a scan
//! form: per level, a list of setters (each with a linear sweep or explicit
//! values), a composition command, getters and the before/after side effects
//! in `channel->value` text form. `levels[0]` is the innermost level.
//!
//! ```toml
//! name = "gate map"
//!
//! [[levels]]
//! getters = ["lockin_0_x", "lockin_0_y"]
//! setting_method = "A+B"
//! after = "control_wait->0.5"
//!
//! [[levels.setters]]
//! channel = "dc_0_gate"
//! linear = { start = -1.0, end = 1.0, points = 21 }
//!
//! [[levels.setters]]
//! channel = "dc_0_bias"
//! explicit = [0.0, 0.1]
//! ```
//!
//! Within a level the setters are lettered `A`, `B`, `C`, ... in order; the
//! `setting_method` command refers to those letters. An empty or missing
//! command lays the setters out one after another.

use std::path::Path;

use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::composition::{compose, DestinationTable};
use crate::config::EngineConfig;
use crate::error::{AppResult, DaqError};
use crate::level::{parse_side_effects, Level, SettingMatrix};
use crate::setpoint::SetterValues;

/// Maximum setters per level (one per letter).
pub const MAX_SETTERS: usize = 26;

/// A whole scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    /// Free-form label.
    #[serde(default = "default_plan_name")]
    pub name: String,
    /// Levels, innermost first.
    pub levels: Vec<LevelPlan>,
}

/// One level of a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelPlan {
    /// Setters, lettered `A`, `B`, ... in order.
    #[serde(default)]
    pub setters: Vec<SetterPlan>,
    /// Composition command over setter letters; empty means sequential.
    #[serde(default)]
    pub setting_method: Option<String>,
    /// Channels read on every step; empty reads nothing.
    #[serde(default)]
    pub getters: Vec<String>,
    /// `channel->value, ...` applied before the loop.
    #[serde(default)]
    pub before: String,
    /// `channel->value, ...` applied after the loop.
    #[serde(default)]
    pub after: String,
}

/// One setter channel and where its values come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetterPlan {
    /// Channel the setter drives.
    pub channel: String,
    /// `linear = {..}` or `explicit = [..]`.
    #[serde(flatten)]
    pub values: SetterValues,
}

fn default_plan_name() -> String {
    "scan".to_string()
}

/// Letter used for the setter at `index` (`0 -> "A"`).
pub fn setter_letter(index: usize) -> Option<String> {
    u8::try_from(index)
        .ok()
        .filter(|i| usize::from(*i) < MAX_SETTERS)
        .map(|i| char::from(b'A' + i).to_string())
}

impl ScanPlan {
    /// Parse a plan from TOML text.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        toml::from_str(text)
            .map_err(|e| DaqError::Configuration(format!("Invalid scan plan: {e}")))
    }

    /// Load a plan file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let plan = Figment::new().merge(Toml::file(path.as_ref())).extract()?;
        Ok(plan)
    }

    /// Compose every level.
    pub fn into_levels(&self, engine: &EngineConfig) -> AppResult<Vec<Level>> {
        self.levels
            .iter()
            .enumerate()
            .map(|(ordinal, level)| level.to_level(ordinal, engine))
            .collect()
    }
}

impl LevelPlan {
    /// Build the destination table, compose it and attach getters and effects.
    pub fn to_level(&self, ordinal: usize, engine: &EngineConfig) -> AppResult<Level> {
        if self.setters.len() > MAX_SETTERS {
            return Err(DaqError::Configuration(format!(
                "Level {ordinal}: {} setters, at most {MAX_SETTERS} are supported",
                self.setters.len()
            )));
        }

        let mut table = DestinationTable::new();
        for (i, setter) in self.setters.iter().enumerate() {
            let letter = setter_letter(i).ok_or_else(|| {
                DaqError::Configuration(format!("Level {ordinal}: no letter for setter {i}"))
            })?;
            table.insert(letter, setter.values.destinations()?);
        }

        let method = self.setting_method.as_deref().map(str::trim).unwrap_or("");
        let composition = compose(Some(method), &table, method.is_empty());
        if engine.reject_unknown_channels && !composition.unknown_tokens.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Level {ordinal}: setting method '{method}' names unknown setters {:?}",
                composition.unknown_tokens
            )));
        }
        debug!(
            level = ordinal,
            steps = composition.steps(),
            "Level composed"
        );

        let level = Level::new(
            self.setters.iter().map(|s| s.channel.clone()).collect(),
            SettingMatrix::from_nan_matrix(&composition.matrix),
            self.getters.clone(),
        )
        .with_before(parse_side_effects(&self.before)?)
        .with_after(parse_side_effects(&self.after)?);
        level.validate(ordinal)?;
        Ok(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::{SideEffect, NO_GETTER};

    const PLAN: &str = r#"
name = "two level"

[[levels]]
getters = ["lockin_0_x"]
setting_method = "a+b"
before = "control_wait->0.25"

[[levels.setters]]
channel = "dc_0_gate"
linear = { start = 0.0, end = 1.0, points = 3 }

[[levels.setters]]
channel = "dc_0_bias"
explicit = [5.0]

[[levels]]
after = "dc_0_gate->0.0"

[[levels.setters]]
channel = "magnet_0_field"
explicit = [0.5, 1.0]
"#;

    #[test]
    fn test_setter_letters() {
        assert_eq!(setter_letter(0).as_deref(), Some("A"));
        assert_eq!(setter_letter(25).as_deref(), Some("Z"));
        assert_eq!(setter_letter(26), None);
    }

    #[test]
    fn test_plan_into_levels() {
        let plan = ScanPlan::from_toml_str(PLAN).unwrap();
        assert_eq!(plan.name, "two level");
        let levels = plan.into_levels(&EngineConfig::default()).unwrap();
        assert_eq!(levels.len(), 2);

        let inner = &levels[0];
        assert_eq!(inner.setters, vec!["dc_0_gate", "dc_0_bias"]);
        assert_eq!(inner.steps(), 3);
        assert_eq!(inner.settings.get(0, 2), Some(1.0));
        assert_eq!(inner.settings.get(1, 0), Some(5.0));
        assert_eq!(inner.settings.get(1, 1), None);
        assert_eq!(inner.before, vec![SideEffect::new("control_wait", 0.25)]);

        let outer = &levels[1];
        assert_eq!(outer.getters, vec![NO_GETTER]);
        assert_eq!(outer.steps(), 2);
        assert_eq!(outer.after, vec![SideEffect::new("dc_0_gate", 0.0)]);
    }

    #[test]
    fn test_empty_method_auto_generates() {
        let level = LevelPlan {
            setters: vec![
                SetterPlan {
                    channel: "a_0_x".into(),
                    values: SetterValues::Explicit(vec![1.0, 2.0]),
                },
                SetterPlan {
                    channel: "b_0_x".into(),
                    values: SetterValues::Explicit(vec![3.0]),
                },
            ],
            setting_method: Some("  ".into()),
            ..LevelPlan::default()
        };
        let level = level.to_level(0, &EngineConfig::default()).unwrap();
        assert_eq!(level.steps(), 3);
        assert_eq!(level.settings.get(0, 2), None);
        assert_eq!(level.settings.get(1, 2), Some(3.0));
    }

    #[test]
    fn test_unknown_tokens_can_be_rejected() {
        let level = LevelPlan {
            setters: vec![SetterPlan {
                channel: "a_0_x".into(),
                values: SetterValues::Explicit(vec![1.0]),
            }],
            setting_method: Some("A+Q".into()),
            ..LevelPlan::default()
        };
        assert_eq!(level.to_level(0, &EngineConfig::default()).unwrap().steps(), 1);

        let strict = EngineConfig {
            reject_unknown_channels: true,
            ..EngineConfig::default()
        };
        let err = level.to_level(0, &strict).unwrap_err();
        assert!(err.to_string().contains("unknown setters"));
    }

    #[test]
    fn test_too_many_setters() {
        let setter = SetterPlan {
            channel: "a_0_x".into(),
            values: SetterValues::Explicit(vec![1.0]),
        };
        let level = LevelPlan {
            setters: vec![setter; MAX_SETTERS + 1],
            ..LevelPlan::default()
        };
        assert!(level.to_level(4, &EngineConfig::default()).is_err());
    }
}
