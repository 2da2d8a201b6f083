// Until the first sync succeeds, retry far more often than the hourly refresh.
const RETRY_UNSYNCED_MS: u64 = 5_000;

/// Epochs before this (2020-09-13) come from a clock that was never set.
pub const MIN_VALID_UTC_EPOCH: i64 = 1_600_000_000;

pub fn is_plausible_epoch(utc_epoch: i64) -> bool {
    utc_epoch >= MIN_VALID_UTC_EPOCH
}

/// Last-known UTC time anchored to a monotonic reading.
///
/// Between refreshes the clock free-runs on the monotonic source. A failed
/// refresh leaves the previous anchor in place, so callers keep working on
/// stale time instead of stopping.
#[derive(Debug, Clone, Default)]
pub struct SyncedClock {
    anchor: Option<Anchor>,
    last_attempt_ms: Option<u64>,
    failed_attempts: u32,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    utc_epoch: i64,
    monotonic_ms: u64,
}

impl SyncedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_synced(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Whether a refresh is due: never attempted, never synced, or the last
    /// attempt is older than `interval_ms`.
    pub fn refresh_due(&self, now_ms: u64, interval_ms: u64) -> bool {
        match (self.anchor, self.last_attempt_ms) {
            (_, None) => true,
            (None, Some(last)) => now_ms.saturating_sub(last) >= RETRY_UNSYNCED_MS,
            (Some(_), Some(last)) => now_ms.saturating_sub(last) >= interval_ms,
        }
    }

    pub fn record_sync(&mut self, utc_epoch: i64, now_ms: u64) {
        self.anchor = Some(Anchor {
            utc_epoch,
            monotonic_ms: now_ms,
        });
        self.last_attempt_ms = Some(now_ms);
        self.failed_attempts = 0;
    }

    pub fn record_failure(&mut self, now_ms: u64) {
        self.last_attempt_ms = Some(now_ms);
        self.failed_attempts = self.failed_attempts.saturating_add(1);
    }

    pub fn now_utc(&self, now_ms: u64) -> Option<i64> {
        let anchor = self.anchor?;
        let elapsed_secs = now_ms.saturating_sub(anchor.monotonic_ms) / 1_000;
        Some(anchor.utc_epoch + elapsed_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const HOUR_MS: u64 = 3_600_000;

    #[test]
    fn unknown_until_first_sync() {
        let clock = SyncedClock::new();
        assert!(!clock.is_synced());
        assert_eq!(clock.now_utc(10_000), None);
        assert!(clock.refresh_due(0, HOUR_MS));
    }

    #[test]
    fn advances_on_monotonic_time() {
        let mut clock = SyncedClock::new();
        clock.record_sync(1_700_000_000, 2_000);

        assert_eq!(clock.now_utc(2_000), Some(1_700_000_000));
        assert_eq!(clock.now_utc(62_999), Some(1_700_000_060));
        assert!(!clock.refresh_due(HOUR_MS, HOUR_MS));
        assert!(clock.refresh_due(HOUR_MS + 2_000, HOUR_MS));
    }

    #[test]
    fn failed_refresh_keeps_stale_time() {
        let mut clock = SyncedClock::new();
        clock.record_sync(1_700_000_000, 0);
        clock.record_failure(HOUR_MS);

        assert_eq!(clock.failed_attempts(), 1);
        assert!(clock.is_synced());
        assert_eq!(clock.now_utc(HOUR_MS), Some(1_700_003_600));
        assert!(!clock.refresh_due(HOUR_MS + 1_000, HOUR_MS));

        clock.record_sync(1_700_003_700, HOUR_MS + 5_000);
        assert_eq!(clock.failed_attempts(), 0);
        assert_eq!(clock.now_utc(HOUR_MS + 5_000), Some(1_700_003_700));
    }

    #[test]
    fn rejects_unset_clock_epochs() {
        assert!(!is_plausible_epoch(0));
        assert!(!is_plausible_epoch(86_400 * 30));
        assert!(is_plausible_epoch(1_736_542_800));
    }

    #[test]
    fn retries_quickly_before_first_sync() {
        let mut clock = SyncedClock::new();
        clock.record_failure(0);

        assert!(!clock.refresh_due(4_999, HOUR_MS));
        assert!(clock.refresh_due(5_000, HOUR_MS));
    }
}
