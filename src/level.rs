//! Scan level specification.
//!
//! A level is one nesting depth of a scan. Level 0 is the innermost (fastest
//! changing) loop, the highest ordinal is the outermost. Each level carries:
//!
//! - the ordered setter channel names and a setting matrix
//!   (`[setters, steps]`) of optional setpoints,
//! - the ordered getter channel names read once per step,
//! - one-shot `before` / `after` side effects applied when the level's loop
//!   starts and ends.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Getter name meaning "read nothing on this level".
///
/// A level built without getters is given this single sentinel so it still
/// sweeps every step; its result tensor row simply stays NaN.
pub const NO_GETTER: &str = "none";

// =============================================================================
// Setting Matrix
// =============================================================================

/// `[setters, steps]` matrix of setpoints; `None` means "do not write".
#[derive(Debug, Clone, PartialEq)]
pub struct SettingMatrix {
    cells: Array2<Option<f64>>,
}

impl SettingMatrix {
    /// Convert a composition matrix, mapping NaN cells to `None`.
    pub fn from_nan_matrix(matrix: &Array2<f64>) -> Self {
        Self {
            cells: matrix.mapv(|v| if v.is_nan() { None } else { Some(v) }),
        }
    }

    /// Build from per-setter rows of equal length.
    pub fn from_rows(rows: Vec<Vec<Option<f64>>>) -> AppResult<Self> {
        let steps = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().position(|r| r.len() != steps) {
            return Err(DaqError::Configuration(format!(
                "Setting matrix row {bad} has {} steps, expected {steps}",
                rows[bad].len()
            )));
        }
        let n_rows = rows.len();
        let flat: Vec<Option<f64>> = rows.into_iter().flatten().collect();
        let cells = Array2::from_shape_vec((n_rows, steps), flat)
            .map_err(|e| DaqError::Configuration(format!("Setting matrix shape: {e}")))?;
        Ok(Self { cells })
    }

    /// A matrix with no setters that still has `steps` columns.
    ///
    /// Used for levels that only repeat a measurement.
    pub fn repeat(steps: usize) -> Self {
        Self {
            cells: Array2::from_elem((0, steps), None),
        }
    }

    /// Number of rows.
    pub fn setters(&self) -> usize {
        self.cells.nrows()
    }

    /// Number of steps.
    pub fn steps(&self) -> usize {
        self.cells.ncols()
    }

    /// Setpoint of `row` at `step`.
    pub fn get(&self, row: usize, step: usize) -> Option<f64> {
        self.cells.get((row, step)).copied().flatten()
    }
}

// =============================================================================
// Side Effects
// =============================================================================

/// A single `channel -> value` applied once when a level starts or ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    /// Channel or control name.
    pub channel: String,
    /// Value to write (seconds for a wait control).
    pub value: f64,
}

impl SideEffect {
    /// Create a side effect.
    pub fn new(channel: impl Into<String>, value: f64) -> Self {
        Self {
            channel: channel.into(),
            value,
        }
    }
}

/// Parse `"lockin_0_f->10, control_wait->0.5"`.
///
/// Empty (or whitespace-only) text yields no side effects.
pub fn parse_side_effects(text: &str) -> AppResult<Vec<SideEffect>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|mapping| {
            let (key, value) = mapping.split_once("->").ok_or_else(|| {
                DaqError::Configuration(format!(
                    "Side effect '{}' is not of the form channel->value",
                    mapping.trim()
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Side effect '{}' has no channel",
                    mapping.trim()
                )));
            }
            let value: f64 = value.trim().parse().map_err(|_| {
                DaqError::Configuration(format!(
                    "Side effect '{}' has a non-numeric value",
                    mapping.trim()
                ))
            })?;
            Ok(SideEffect::new(key, value))
        })
        .collect()
}

/// Inverse of [`parse_side_effects`].
pub fn format_side_effects(effects: &[SideEffect]) -> String {
    effects
        .iter()
        .map(|e| format!("{}->{}", e.channel, e.value))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Level
// =============================================================================

/// One nesting depth of a scan.
///
/// Fields are public so callers can assemble unusual levels directly; note
/// that a level whose `getters` list is literally empty (as opposed to holding
/// [`NO_GETTER`]) only executes its first step. [`Level::new`] never produces
/// such a level.
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    /// Setter channel names, one per matrix row.
    pub setters: Vec<String>,
    /// Setpoints for every setter and step.
    pub settings: SettingMatrix,
    /// Getter channel names read on every step.
    pub getters: Vec<String>,
    /// Applied once before the level's loop.
    pub before: Vec<SideEffect>,
    /// Applied once after the level's loop completes.
    pub after: Vec<SideEffect>,
}

impl Level {
    /// Create a level; an empty getter list becomes `[NO_GETTER]`.
    pub fn new(setters: Vec<String>, settings: SettingMatrix, mut getters: Vec<String>) -> Self {
        if getters.is_empty() {
            getters.push(NO_GETTER.to_string());
        }
        Self {
            setters,
            settings,
            getters,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Set the side effects applied before the loop.
    pub fn with_before(mut self, effects: Vec<SideEffect>) -> Self {
        self.before = effects;
        self
    }

    /// Set the side effects applied after the loop.
    pub fn with_after(mut self, effects: Vec<SideEffect>) -> Self {
        self.after = effects;
        self
    }

    /// Number of steps on this level.
    pub fn steps(&self) -> usize {
        self.settings.steps()
    }

    /// Check that setter names and matrix rows agree.
    pub fn validate(&self, ordinal: usize) -> AppResult<()> {
        if self.setters.len() != self.settings.setters() {
            return Err(DaqError::Configuration(format!(
                "Level {ordinal}: {} setter names but setting matrix has {} rows",
                self.setters.len(),
                self.settings.setters()
            )));
        }
        if let Some(blank) = self.setters.iter().position(|s| s.trim().is_empty()) {
            return Err(DaqError::Configuration(format!(
                "Level {ordinal}: setter {blank} has an empty channel name"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_nan_cells_become_none() {
        let m = SettingMatrix::from_nan_matrix(&array![[1.0, f64::NAN], [f64::NAN, 4.0]]);
        assert_eq!(m.get(0, 0), Some(1.0));
        assert_eq!(m.get(0, 1), None);
        assert_eq!(m.get(1, 0), None);
        assert_eq!(m.get(1, 1), Some(4.0));
        assert_eq!(m.get(5, 5), None);
    }

    #[test]
    fn test_from_rows_rejects_ragged_rows() {
        let err = SettingMatrix::from_rows(vec![vec![Some(1.0)], vec![None, None]]).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn test_repeat_keeps_step_count() {
        let m = SettingMatrix::repeat(4);
        assert_eq!((m.setters(), m.steps()), (0, 4));
    }

    #[test]
    fn test_side_effect_text_round_trip() {
        let effects = parse_side_effects(" a->1, control_wait -> 0.5").unwrap();
        assert_eq!(
            effects,
            vec![SideEffect::new("a", 1.0), SideEffect::new("control_wait", 0.5)]
        );
        assert_eq!(format_side_effects(&effects), "a->1, control_wait->0.5");
    }

    #[test]
    fn test_side_effect_parse_errors() {
        assert!(parse_side_effects("").unwrap().is_empty());
        assert!(parse_side_effects("a=1").is_err());
        assert!(parse_side_effects("->1").is_err());
        assert!(parse_side_effects("a->fast").is_err());
    }

    #[test]
    fn test_new_level_inserts_getter_sentinel() {
        let level = Level::new(vec![], SettingMatrix::repeat(2), vec![]);
        assert_eq!(level.getters, vec![NO_GETTER]);
        assert_eq!(level.steps(), 2);
    }

    #[test]
    fn test_validate_row_mismatch() {
        let level = Level::new(
            vec!["a".into(), "b".into()],
            SettingMatrix::from_rows(vec![vec![Some(1.0)]]).unwrap(),
            vec!["g".into()],
        );
        let err = level.validate(3).unwrap_err();
        assert!(err.to_string().contains("Level 3"));
    }
}
