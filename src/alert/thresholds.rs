//! Distance-bracketed heavy-traffic thresholds.
//!
//! Short routes tolerate a large relative slowdown before anyone notices,
//! long routes do not, so each distance bracket carries its own factors and
//! absolute delay floors. The table is persisted in the store's config
//! record and edited through the management commands.

use crate::model::{ThresholdBracket, ThresholdError};
use serde::{Deserialize, Serialize};

/// Built-in brackets, covering 0–50 km.
///
/// | km      | route × | segment × | route floor | segment floor |
/// |---------|---------|-----------|-------------|---------------|
/// | 0–2     | 3.0     | 1.0       | 5 min       | 1 min         |
/// | 2–5     | 2.5     | 2.0       | 10 min      | 2 min         |
/// | 5–20    | 2.0     | 3.0       | 15 min      | 5 min         |
/// | 20–50   | 1.5     | 4.0       | 30 min      | 10 min        |
pub fn default_brackets() -> Vec<ThresholdBracket> {
    vec![
        bracket(0.0, 2.0, 3.0, 1.0, 300.0, 60.0),
        bracket(2.0, 5.0, 2.5, 2.0, 600.0, 120.0),
        bracket(5.0, 20.0, 2.0, 3.0, 900.0, 300.0),
        bracket(20.0, 50.0, 1.5, 4.0, 1800.0, 600.0),
    ]
}

fn bracket(
    min_km: f64,
    max_km: f64,
    route_factor: f64,
    segment_factor: f64,
    route_delay_threshold_sec: f64,
    segment_delay_threshold_sec: f64,
) -> ThresholdBracket {
    ThresholdBracket {
        min_km,
        max_km,
        route_factor,
        segment_factor,
        route_delay_threshold_sec,
        segment_delay_threshold_sec,
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// A validated, ascending, non-overlapping list of brackets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ThresholdBracket>", into = "Vec<ThresholdBracket>")]
pub struct ThresholdTable {
    brackets: Vec<ThresholdBracket>,
}

impl TryFrom<Vec<ThresholdBracket>> for ThresholdTable {
    type Error = ThresholdError;

    fn try_from(brackets: Vec<ThresholdBracket>) -> Result<Self, Self::Error> {
        ThresholdTable::new(brackets)
    }
}

impl From<ThresholdTable> for Vec<ThresholdBracket> {
    fn from(table: ThresholdTable) -> Self {
        table.brackets
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        ThresholdTable {
            brackets: default_brackets(),
        }
    }
}

/// Partial edit of one bracket. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BracketUpdate {
    pub route_factor: Option<f64>,
    pub segment_factor: Option<f64>,
    pub route_delay_threshold_sec: Option<f64>,
    pub segment_delay_threshold_sec: Option<f64>,
}

impl BracketUpdate {
    pub fn is_empty(&self) -> bool {
        self == &BracketUpdate::default()
    }
}

impl ThresholdTable {
    pub fn new(brackets: Vec<ThresholdBracket>) -> Result<Self, ThresholdError> {
        validate(&brackets)?;
        Ok(ThresholdTable { brackets })
    }

    pub fn brackets(&self) -> &[ThresholdBracket] {
        &self.brackets
    }

    /// Returns the bracket whose `[min_km, max_km)` contains `distance_km`.
    ///
    /// Distances outside every bracket (negative, beyond the last bracket,
    /// or in a gap between brackets) use the nearest bracket. A non-finite
    /// distance uses the first bracket.
    pub fn bracket_for(&self, distance_km: f64) -> &ThresholdBracket {
        let first = &self.brackets[0];
        if !distance_km.is_finite() {
            return first;
        }
        if let Some(found) = self.brackets.iter().find(|b| b.contains(distance_km)) {
            return found;
        }

        let gap = |b: &ThresholdBracket| {
            if distance_km < b.min_km {
                b.min_km - distance_km
            } else {
                distance_km - b.max_km
            }
        };
        // Ties go to the earlier bracket.
        self.brackets.iter().fold(first, |best, b| if gap(b) < gap(best) { b } else { best })
    }

    /// Applies `update` to the bracket at `index` and revalidates.
    pub fn with_update(&self, index: usize, update: &BracketUpdate) -> Result<Self, ThresholdError> {
        let mut brackets = self.brackets.clone();
        let target = brackets
            .get_mut(index)
            .ok_or(ThresholdError::UnknownBracket(index))?;

        if let Some(v) = update.route_factor {
            target.route_factor = v;
        }
        if let Some(v) = update.segment_factor {
            target.segment_factor = v;
        }
        if let Some(v) = update.route_delay_threshold_sec {
            target.route_delay_threshold_sec = v;
        }
        if let Some(v) = update.segment_delay_threshold_sec {
            target.segment_delay_threshold_sec = v;
        }

        ThresholdTable::new(brackets)
    }
}

fn validate(brackets: &[ThresholdBracket]) -> Result<(), ThresholdError> {
    if brackets.is_empty() {
        return Err(ThresholdError::Empty);
    }

    for (index, b) in brackets.iter().enumerate() {
        if !(b.min_km.is_finite() && b.max_km.is_finite()) || b.min_km < 0.0 || b.min_km >= b.max_km {
            return Err(ThresholdError::InvalidRange {
                index,
                min_km: b.min_km,
                max_km: b.max_km,
            });
        }

        let params = [
            ("route_factor", b.route_factor),
            ("segment_factor", b.segment_factor),
            ("route_delay_threshold_sec", b.route_delay_threshold_sec),
            ("segment_delay_threshold_sec", b.segment_delay_threshold_sec),
        ];
        if let Some((field, _)) = params.iter().find(|(_, v)| !v.is_finite() || *v < 0.0) {
            return Err(ThresholdError::NegativeParameter { index, field: *field });
        }

        if index > 0 && b.min_km < brackets[index - 1].max_km {
            return Err(ThresholdError::Overlap { index });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ThresholdTable::new(default_brackets()).is_ok());
        assert_eq!(ThresholdTable::default().brackets().len(), 4);
    }

    // --- Lookup -------------------------------------------------------------

    #[test]
    fn test_lookup_uses_half_open_ranges() {
        let table = ThresholdTable::default();
        assert_eq!(table.bracket_for(0.0).max_km, 2.0);
        assert_eq!(table.bracket_for(1.999).max_km, 2.0);
        assert_eq!(table.bracket_for(2.0).min_km, 2.0, "2 km belongs to the 2–5 bracket");
        assert_eq!(table.bracket_for(19.9).min_km, 5.0);
        assert_eq!(table.bracket_for(49.9).min_km, 20.0);
    }

    #[test]
    fn test_lookup_clamps_beyond_last_bracket() {
        let table = ThresholdTable::default();
        assert_eq!(table.bracket_for(50.0).min_km, 20.0);
        assert_eq!(table.bracket_for(320.0).min_km, 20.0);
    }

    #[test]
    fn test_lookup_clamps_negative_and_non_finite() {
        let table = ThresholdTable::default();
        assert_eq!(table.bracket_for(-3.0).min_km, 0.0);
        assert_eq!(table.bracket_for(f64::NAN).min_km, 0.0);
    }

    #[test]
    fn test_lookup_in_gap_uses_nearest_bracket() {
        let table = ThresholdTable::new(vec![
            bracket(0.0, 2.0, 3.0, 1.0, 300.0, 60.0),
            bracket(10.0, 20.0, 2.0, 3.0, 900.0, 300.0),
        ])
        .expect("gapped table is valid");
        assert_eq!(table.bracket_for(3.0).min_km, 0.0);
        assert_eq!(table.bracket_for(9.0).min_km, 10.0);
    }

    // --- Validation ---------------------------------------------------------

    #[test]
    fn test_overlapping_brackets_rejected() {
        let result = ThresholdTable::new(vec![
            bracket(0.0, 5.0, 3.0, 1.0, 300.0, 60.0),
            bracket(4.0, 20.0, 2.0, 3.0, 900.0, 300.0),
        ]);
        assert_eq!(result.unwrap_err(), ThresholdError::Overlap { index: 1 });
    }

    #[test]
    fn test_inverted_range_rejected() {
        let result = ThresholdTable::new(vec![bracket(5.0, 2.0, 3.0, 1.0, 300.0, 60.0)]);
        assert!(matches!(result, Err(ThresholdError::InvalidRange { index: 0, .. })));
    }

    #[test]
    fn test_empty_table_rejected() {
        assert_eq!(ThresholdTable::new(vec![]).unwrap_err(), ThresholdError::Empty);
    }

    // --- Updates ------------------------------------------------------------

    #[test]
    fn test_update_changes_only_named_fields() {
        let table = ThresholdTable::default();
        let update = BracketUpdate {
            route_factor: Some(1.8),
            ..Default::default()
        };
        let updated = table.with_update(2, &update).expect("valid update");
        assert_eq!(updated.brackets()[2].route_factor, 1.8);
        assert_eq!(updated.brackets()[2].route_delay_threshold_sec, 900.0);
        assert_eq!(updated.brackets()[1], table.brackets()[1]);
    }

    #[test]
    fn test_update_rejects_negative_delay_and_unknown_index() {
        let table = ThresholdTable::default();
        let negative = BracketUpdate {
            segment_delay_threshold_sec: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(
            table.with_update(0, &negative),
            Err(ThresholdError::NegativeParameter { index: 0, field: "segment_delay_threshold_sec" })
        ));
        assert_eq!(
            table.with_update(9, &BracketUpdate::default()).unwrap_err(),
            ThresholdError::UnknownBracket(9)
        );
    }

    #[test]
    fn test_table_json_rejects_invalid_brackets() {
        let json = r#"[{"min_km":5,"max_km":1,"route_factor":2,"segment_factor":3,
                        "route_delay_threshold_sec":900,"segment_delay_threshold_sec":300}]"#;
        assert!(serde_json::from_str::<ThresholdTable>(json).is_err());
    }
}
