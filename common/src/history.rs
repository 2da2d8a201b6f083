//! Bounded log of past feedings.
//!
//! The ring and its write cursor are one serializable record so a store can
//! persist them in a single write. A slot with timestamp 0 is empty.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::{engine::FeedAction, schedule::Session};

pub const HISTORY_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FeedSource {
    Scheduled {
        session: Session,
        ordinal: u8,
    },
    #[default]
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// Local wall-clock epoch seconds.
    #[serde(rename = "ts")]
    pub timestamp: i64,
    #[serde(rename = "d")]
    pub duration_seconds: u16,
    #[serde(default)]
    pub source: FeedSource,
}

impl FeedEvent {
    pub fn scheduled(action: &FeedAction, local_epoch: i64) -> Self {
        Self {
            timestamp: local_epoch,
            duration_seconds: action.duration_seconds,
            source: FeedSource::Scheduled {
                session: action.session,
                ordinal: action.ordinal,
            },
        }
    }

    pub fn manual(local_epoch: i64, duration_seconds: u16) -> Self {
        Self {
            timestamp: local_epoch,
            duration_seconds,
            source: FeedSource::Manual,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRow {
    pub date: String,
    pub time: String,
    pub duration: String,
}

impl From<&FeedEvent> for HistoryRow {
    fn from(event: &FeedEvent) -> Self {
        // Local epoch seconds are formatted as if they were UTC.
        let local = DateTime::from_timestamp(event.timestamp, 0)
            .unwrap_or_default()
            .naive_utc();
        Self {
            date: local.format("%Y-%m-%d").to_string(),
            time: local.format("%H:%M:%S").to_string(),
            duration: format!("{}s", event.duration_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLog {
    cursor: usize,
    slots: [FeedEvent; HISTORY_CAPACITY],
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self {
            cursor: 0,
            slots: [FeedEvent::default(); HISTORY_CAPACITY],
        }
    }
}

impl HistoryLog {
    /// Repairs a cursor loaded from storage.
    pub fn normalize(&mut self) {
        self.cursor %= HISTORY_CAPACITY;
    }

    pub fn append(&mut self, event: FeedEvent) {
        self.normalize();
        self.slots[self.cursor] = event;
        self.cursor = (self.cursor + 1) % HISTORY_CAPACITY;
    }

    /// Recorded events, most recent first.
    pub fn list(&self) -> Vec<FeedEvent> {
        (1..=HISTORY_CAPACITY)
            .map(|back| self.slots[(self.cursor + HISTORY_CAPACITY - back) % HISTORY_CAPACITY])
            .filter(|event| !event.is_empty())
            .collect()
    }

    pub fn rows(&self) -> Vec<HistoryRow> {
        self.list().iter().map(HistoryRow::from).collect()
    }

    pub fn latest(&self) -> Option<FeedEvent> {
        self.list().into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|event| !event.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use super::*;

    fn manual(timestamp: i64, duration_seconds: u16) -> FeedEvent {
        FeedEvent::manual(timestamp, duration_seconds)
    }

    #[test]
    fn lists_most_recent_first() {
        let mut log = HistoryLog::default();
        assert!(log.is_empty());

        log.append(manual(100, 1));
        log.append(manual(200, 2));
        log.append(manual(300, 3));

        let timestamps: Vec<i64> = log.list().iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![300, 200, 100]);
        assert_eq!(log.len(), 3);
        assert_eq!(log.latest(), Some(manual(300, 3)));
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut log = HistoryLog::default();
        let total = HISTORY_CAPACITY as i64 + 3;
        for n in 1..=total {
            log.append(manual(n * 60, n as u16));
        }

        let timestamps: Vec<i64> = log.list().iter().map(|e| e.timestamp).collect();
        let expected: Vec<i64> = (4..=total).rev().map(|n| n * 60).collect();
        assert_eq!(log.len(), HISTORY_CAPACITY);
        assert_eq!(timestamps, expected);
    }

    #[test]
    fn rows_format_local_timestamp() {
        let mut log = HistoryLog::default();
        let local = Utc.with_ymd_and_hms(2025, 3, 9, 6, 57, 4).unwrap();
        let action = FeedAction {
            session: Session::Morning,
            ordinal: 4,
            duration_seconds: 15,
        };
        log.append(FeedEvent::scheduled(&action, local.timestamp()));

        assert_eq!(
            log.rows(),
            vec![HistoryRow {
                date: "2025-03-09".to_string(),
                time: "06:57:04".to_string(),
                duration: "15s".to_string(),
            }]
        );
    }

    #[test]
    fn survives_a_storage_round_trip() {
        let mut log = HistoryLog::default();
        for n in 1..=25 {
            log.append(manual(n * 1_000, 3));
        }

        let json = serde_json::to_string(&log).unwrap();
        let mut restored: HistoryLog = serde_json::from_str(&json).unwrap();
        restored.normalize();

        assert_eq!(restored.list(), log.list());
        restored.append(manual(99_000, 4));
        assert_eq!(restored.latest().map(|e| e.timestamp), Some(99_000));
        assert_eq!(restored.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn rejects_record_with_wrong_slot_count() {
        let json = r#"{"cursor":0,"slots":[{"ts":5,"d":1}]}"#;
        assert!(serde_json::from_str::<HistoryLog>(json).is_err());
    }

    #[test]
    fn repairs_out_of_range_cursor() {
        let mut log = HistoryLog::default();
        log.cursor = HISTORY_CAPACITY + 2;
        log.append(manual(10, 1));
        assert_eq!(log.slots[2], manual(10, 1));
        assert_eq!(log.list(), vec![manual(10, 1)]);
    }
}
