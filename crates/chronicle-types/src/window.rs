//! Processing windows.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::table::Table;

/// Identity of a window. Two windows are the same unit of work exactly when
/// their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub tenant_id: String,
    pub source: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} [{}, {}]",
            self.tenant_id,
            self.source,
            self.start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.end.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        )
    }
}

/// A bounded slice of the event stream selected for one unit of processing.
///
/// For message-count windows `start` and `end` are the first and last event
/// timestamps. For hour and day windows `end` is the exclusive period
/// boundary and `start` is the period start, pulled back to the first
/// carried-over event when overlap re-includes earlier events.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub key: WindowKey,
    /// Ordinal within its planning pass.
    pub index: usize,
    /// Leading rows re-included from the previous window.
    pub carried: usize,
    pub rows: Table,
}

impl Window {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows not seen by any earlier window of the same pass.
    pub fn fresh_rows(&self) -> usize {
        self.rows.len().saturating_sub(self.carried)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_display_is_readable() {
        let key = WindowKey {
            tenant_id: "acme".into(),
            source: "chat".into(),
            start: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
        };
        assert_eq!(
            key.to_string(),
            "acme/chat [2024-03-01T00:00:00Z, 2024-03-02T00:00:00Z]"
        );
    }
}
