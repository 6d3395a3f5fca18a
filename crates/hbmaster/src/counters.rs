// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! Restart-safe daily traffic counters.
//!
//! Written atomically (temp file + rename) at shutdown only; loaded at
//! startup and zeroed when the stored date is not today.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Counters for the current local day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCounters {
    /// Streams received from peers today (assumed copies excluded).
    pub calls_today: u64,
    /// Total duration of received streams, seconds.
    pub duration_today: f64,
    /// Stream retransmissions to targets (one per target per stream).
    pub retransmitted_calls: u64,
    /// Local date the counters belong to.
    pub last_reset_date: NaiveDate,
}

impl DailyCounters {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            calls_today: 0,
            duration_today: 0.0,
            retransmitted_calls: 0,
            last_reset_date: today,
        }
    }

    /// Load persisted counters, starting fresh when the file is absent,
    /// unreadable, or from a previous day.
    pub fn load(path: &Path, today: NaiveDate) -> Self {
        let stored = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str::<Self>(&content).ok());
        match stored {
            Some(counters) if counters.last_reset_date == today => {
                info!(
                    calls = counters.calls_today,
                    retransmitted = counters.retransmitted_calls,
                    "loaded today's counters"
                );
                counters
            }
            Some(counters) => {
                info!(
                    stale_date = %counters.last_reset_date,
                    "stored counters are from a previous day, starting fresh"
                );
                Self::new(today)
            }
            None => Self::new(today),
        }
    }

    /// Write the counters atomically: temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)
    }

    /// Zero everything if the local date moved past `last_reset_date`.
    pub fn roll_if_needed(&mut self, today: NaiveDate) {
        if self.last_reset_date != today {
            warn!(
                from = %self.last_reset_date,
                to = %today,
                "date changed, resetting daily counters"
            );
            *self = Self::new(today);
        }
    }

    pub fn record_call(&mut self) {
        self.calls_today += 1;
    }

    pub fn record_retransmissions(&mut self, targets: usize) {
        self.retransmitted_calls += targets as u64;
    }

    pub fn record_duration(&mut self, seconds: f64) {
        self.duration_today += seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_roll_on_date_change() {
        let mut counters = DailyCounters::new(date("2026-07-31"));
        counters.record_call();
        counters.record_retransmissions(3);
        counters.record_duration(12.5);

        // Same day: nothing happens.
        counters.roll_if_needed(date("2026-07-31"));
        assert_eq!(counters.calls_today, 1);

        counters.roll_if_needed(date("2026-08-01"));
        assert_eq!(counters.calls_today, 0);
        assert_eq!(counters.retransmitted_calls, 0);
        assert_eq!(counters.duration_today, 0.0);
        assert_eq!(counters.last_reset_date, date("2026-08-01"));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.json");

        let mut counters = DailyCounters::new(date("2026-08-01"));
        counters.record_call();
        counters.record_call();
        counters.record_retransmissions(5);
        counters.record_duration(42.0);
        counters.save(&path).unwrap();

        let loaded = DailyCounters::load(&path, date("2026-08-01"));
        assert_eq!(loaded, counters);
        // The temp file must not linger after the rename.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_purges_previous_day() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.json");

        let mut counters = DailyCounters::new(date("2026-07-31"));
        counters.record_call();
        counters.save(&path).unwrap();

        let loaded = DailyCounters::load(&path, date("2026-08-01"));
        assert_eq!(loaded.calls_today, 0);
        assert_eq!(loaded.last_reset_date, date("2026-08-01"));
    }

    #[test]
    fn test_load_missing_or_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let loaded = DailyCounters::load(&missing, date("2026-08-01"));
        assert_eq!(loaded.calls_today, 0);

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{not json").unwrap();
        let loaded = DailyCounters::load(&corrupt, date("2026-08-01"));
        assert_eq!(loaded.calls_today, 0);
    }

    #[test]
    fn test_date_serialized_as_iso() {
        let counters = DailyCounters::new(date("2026-08-01"));
        let json = serde_json::to_string(&counters).unwrap();
        assert!(json.contains("\"2026-08-01\""));
    }
}
