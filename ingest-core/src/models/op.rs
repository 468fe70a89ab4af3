//! The history-row operation kind (`op` column, §3.1).

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// The kind of change a history row records.
///
/// Stored as a single character (`I`/`U`/`D`) in `E_history.op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum ChangeOp {
    #[strum(serialize = "I")]
    Insert,
    #[strum(serialize = "U")]
    Update,
    #[strum(serialize = "D")]
    Delete,
}

impl ChangeOp {
    /// The single-character code stored in the `op` column.
    pub fn as_sql_char(&self) -> char {
        match self {
            ChangeOp::Insert => 'I',
            ChangeOp::Update => 'U',
            ChangeOp::Delete => 'D',
        }
    }

    /// Whether this op leaves the entity present in `current` (invariant
    /// §3.2.1: only `I`/`U` rows can be the open row for a key in `current`).
    pub fn is_live(&self) -> bool {
        matches!(self, ChangeOp::Insert | ChangeOp::Update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_sql_char() {
        for op in [ChangeOp::Insert, ChangeOp::Update, ChangeOp::Delete] {
            assert_eq!(op.to_string(), op.as_sql_char().to_string());
        }
    }

    #[test]
    fn only_insert_and_update_are_live() {
        assert!(ChangeOp::Insert.is_live());
        assert!(ChangeOp::Update.is_live());
        assert!(!ChangeOp::Delete.is_live());
    }
}
