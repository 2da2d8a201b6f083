use chrono::NaiveDate;

use crate::{
    civil_time::LocalTime,
    config::{SessionParameters, MAX_PULSE_COUNT},
    schedule::{session_targets, Session},
};

/// One pulse the caller must run now: drive the motor for `duration_seconds`
/// (blocking), then record it in the history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedAction {
    pub session: Session,
    pub ordinal: u8,
    pub duration_seconds: u16,
}

/// Per-day firing flags for both sessions, indexed by pulse ordinal - 1.
#[derive(Debug, Clone)]
pub struct FiringEngine {
    fired: [[bool; MAX_PULSE_COUNT]; 2],
    // Local date the flags belong to.
    day: Option<NaiveDate>,
}

impl Default for FiringEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FiringEngine {
    pub fn new() -> Self {
        Self {
            fired: [[false; MAX_PULSE_COUNT]; 2],
            day: None,
        }
    }

    pub fn reset(&mut self) {
        self.fired = [[false; MAX_PULSE_COUNT]; 2];
    }

    pub fn has_fired(&self, session: Session, ordinal: u8) -> bool {
        slot(ordinal)
            .map(|index| self.fired[session.index()][index])
            .unwrap_or(false)
    }

    pub fn fired_count(&self, session: Session) -> usize {
        self.fired[session.index()]
            .iter()
            .filter(|fired| **fired)
            .count()
    }

    /// Evaluates one scheduling tick against the schedule regenerated from
    /// `params`.
    ///
    /// Flags are cleared once per local day, on the first tick that observes
    /// the new date. That is the first tick of 00:00 in normal operation, and
    /// the first tick after midnight when minute 00:00 itself was skipped. A
    /// pulse targeting 00:00 therefore fires once, not once per tick.
    ///
    /// A target whose minute is never observed by a tick does not fire that day.
    pub fn tick(&mut self, params: &SessionParameters, now: &LocalTime) -> Vec<FeedAction> {
        let today = now.local.date_naive();
        if self.day != Some(today) {
            self.reset();
            self.day = Some(today);
        }

        let now_minute = now.minute_of_day();
        let mut actions = Vec::new();

        for session in Session::ALL {
            for target in session_targets(session, params) {
                if target.minute_of_day != now_minute {
                    continue;
                }
                let Some(index) = slot(target.ordinal) else {
                    continue;
                };

                let flag = &mut self.fired[session.index()][index];
                if *flag {
                    continue;
                }
                *flag = true;

                actions.push(FeedAction {
                    session,
                    ordinal: target.ordinal,
                    duration_seconds: target.duration_seconds,
                });
            }
        }

        actions
    }
}

fn slot(ordinal: u8) -> Option<usize> {
    let index = (ordinal as usize).checked_sub(1)?;
    (index < MAX_PULSE_COUNT).then_some(index)
}
