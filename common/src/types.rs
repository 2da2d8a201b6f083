use serde::Serialize;

use crate::{
    civil_time::LocalTime,
    config::{ClockTime, SessionParameters},
    engine::FiringEngine,
    history::{HistoryLog, HistoryRow},
    schedule::{session_targets, Session},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeView {
    pub time: String,
    #[serde(rename = "amPm")]
    pub am_pm: &'static str,
}

impl TimeView {
    pub fn from_local(local: &LocalTime) -> Self {
        let (time, am_pm) = local.twelve_hour();
        Self { time, am_pm }
    }

    /// Placeholder shown before the first time sync.
    pub fn unsynced() -> Self {
        Self {
            time: "--:--".to_string(),
            am_pm: "",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PulseStatus {
    pub ordinal: u8,
    pub time: ClockTime,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: u16,
    #[serde(rename = "firedToday")]
    pub fired_today: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: Session,
    #[serde(rename = "endTime")]
    pub end_time: ClockTime,
    pub pulses: Vec<PulseStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeederStatus {
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "utcEpoch")]
    pub utc_epoch: Option<i64>,
    #[serde(rename = "localTime")]
    pub local_time: Option<String>,
    pub dst: bool,
    pub settings: SessionParameters,
    pub sessions: Vec<SessionStatus>,
    #[serde(rename = "historyCount")]
    pub history_count: usize,
    #[serde(rename = "lastFeed")]
    pub last_feed: Option<HistoryRow>,
}

impl FeederStatus {
    pub fn build(
        params: &SessionParameters,
        engine: &FiringEngine,
        history: &HistoryLog,
        now: Option<&LocalTime>,
    ) -> Self {
        let sessions = Session::ALL
            .into_iter()
            .map(|session| SessionStatus {
                session,
                end_time: session.end_time(params),
                pulses: session_targets(session, params)
                    .into_iter()
                    .map(|target| PulseStatus {
                        ordinal: target.ordinal,
                        time: target.clock_time(),
                        duration_seconds: target.duration_seconds,
                        fired_today: engine.has_fired(session, target.ordinal),
                    })
                    .collect(),
            })
            .collect();

        Self {
            time_synced: now.is_some(),
            utc_epoch: now.map(|local| local.utc_epoch),
            local_time: now.map(|local| local.local.format("%Y-%m-%d %H:%M:%S").to_string()),
            dst: now.map(|local| local.dst).unwrap_or(false),
            settings: params.clone(),
            sessions,
            history_count: history.len(),
            last_feed: history.latest().as_ref().map(HistoryRow::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{civil_time::CivilTimeResolver, history::FeedEvent};

    #[test]
    fn time_view_serializes_like_the_page_expects() {
        let utc = Utc.with_ymd_and_hms(2025, 1, 10, 21, 4, 0).unwrap();
        let local = CivilTimeResolver::default().resolve(utc.timestamp());

        let json = serde_json::to_string(&TimeView::from_local(&local)).unwrap();

        assert_eq!(json, r#"{"time":"1:04","amPm":"PM"}"#);
    }

    #[test]
    fn status_reports_fired_pulses() {
        let params = SessionParameters {
            am_end: "07:00".parse().unwrap(),
            total_seconds: 30,
            pulse_count: 4,
            short_pulse_seconds: 5,
            gap_minutes: 1,
            ..SessionParameters::default()
        };
        let utc = Utc.with_ymd_and_hms(2025, 1, 10, 14, 57, 0).unwrap();
        let local = CivilTimeResolver::default().resolve(utc.timestamp());
        let mut engine = FiringEngine::new();
        let actions = engine.tick(&params, &local);
        let mut history = HistoryLog::default();
        history.append(FeedEvent::scheduled(&actions[0], local.local_epoch));

        let status = FeederStatus::build(&params, &engine, &history, Some(&local));

        assert!(status.time_synced);
        assert_eq!(status.local_time.as_deref(), Some("2025-01-10 06:57:00"));
        let fired: Vec<bool> = status.sessions[0]
            .pulses
            .iter()
            .map(|pulse| pulse.fired_today)
            .collect();
        assert_eq!(fired, vec![true, false, false, false]);
        assert_eq!(status.history_count, 1);
        assert_eq!(
            status.last_feed.map(|row| row.time),
            Some("06:57:00".to_string())
        );
    }

    #[test]
    fn status_without_time_sync() {
        let status = FeederStatus::build(
            &SessionParameters::default(),
            &FiringEngine::new(),
            &HistoryLog::default(),
            None,
        );
        assert!(!status.time_synced);
        assert_eq!(status.utc_epoch, None);
        assert_eq!(status.sessions.len(), 2);
        assert_eq!(status.sessions[1].pulses.len(), 10);
    }
}
