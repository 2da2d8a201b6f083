use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::config::{ClockTime, SessionParameters, MINUTES_PER_DAY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Session {
    Morning,
    Evening,
}

impl Session {
    pub const ALL: [Session; 2] = [Session::Morning, Session::Evening];

    pub fn index(self) -> usize {
        match self {
            Self::Morning => 0,
            Self::Evening => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Morning => "AM",
            Self::Evening => "PM",
        }
    }

    pub fn end_time(self, params: &SessionParameters) -> ClockTime {
        match self {
            Self::Morning => params.am_end,
            Self::Evening => params.pm_end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PulseTarget {
    pub ordinal: u8,
    #[serde(rename = "minuteOfDay")]
    pub minute_of_day: u16,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: u16,
}

impl PulseTarget {
    pub fn clock_time(&self) -> ClockTime {
        ClockTime::from_minutes(self.minute_of_day)
    }
}

/// Pulse targets for one session, spaced `gap_minutes` apart and ending at
/// `session_end`. The last ordinal carries the long pulse.
///
/// Targets that wrap past midnight can land on the same minute as another
/// ordinal; they are kept as separate entries.
pub fn generate(session_end: ClockTime, params: &SessionParameters) -> Vec<PulseTarget> {
    let final_minute = session_end.minutes_since_midnight() as i32;
    let count = params.pulse_count;
    let long_pulse = params.long_pulse_seconds();

    (1..=count)
        .map(|ordinal| {
            let steps_back = (count - ordinal) as i32 * params.gap_minutes as i32;
            let minute = (final_minute - steps_back).rem_euclid(MINUTES_PER_DAY as i32);
            let duration_seconds = if ordinal == count {
                long_pulse
            } else {
                params.short_pulse_seconds as u16
            };

            PulseTarget {
                ordinal,
                minute_of_day: minute as u16,
                duration_seconds,
            }
        })
        .collect()
}

pub fn session_targets(session: Session, params: &SessionParameters) -> Vec<PulseTarget> {
    generate(session.end_time(params), params)
}

pub fn render_schedule_text(params: &SessionParameters) -> String {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "Session ends at AM={}  PM={}",
        params.am_end, params.pm_end
    );
    let _ = writeln!(
        text,
        "Total Z={}s, Y={}, gap={} min",
        params.total_seconds, params.pulse_count, params.gap_minutes
    );

    for session in Session::ALL {
        for target in session_targets(session, params) {
            let _ = writeln!(
                text,
                "  {} #{}  {}  ({} s)",
                session.label(),
                target.ordinal,
                target.clock_time(),
                target.duration_seconds
            );
        }
    }

    text
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn params(total: u16, count: u8, short: u8, gap: u8) -> SessionParameters {
        SessionParameters {
            total_seconds: total,
            pulse_count: count,
            short_pulse_seconds: short,
            gap_minutes: gap,
            ..SessionParameters::default()
        }
    }

    #[test]
    fn morning_pulses_converge_on_session_end() {
        let mut params = params(30, 4, 5, 1);
        params.am_end = "07:00".parse().unwrap();

        let targets = session_targets(Session::Morning, &params);

        let minutes: Vec<u16> = targets.iter().map(|t| t.minute_of_day).collect();
        let durations: Vec<u16> = targets.iter().map(|t| t.duration_seconds).collect();
        let ordinals: Vec<u8> = targets.iter().map(|t| t.ordinal).collect();
        assert_eq!(minutes, vec![417, 418, 419, 420]);
        assert_eq!(durations, vec![5, 5, 5, 15]);
        assert_eq!(ordinals, vec![1, 2, 3, 4]);
    }

    #[test]
    fn last_pulse_absorbs_remaining_total() {
        for count in 2..=50_u8 {
            for short in [1_u8, 2, 7, 30] {
                for total in [1_u16, 50, 300, 600] {
                    let params = params(total, count, short, 3).sanitized();
                    let targets = generate(params.am_end, &params);

                    assert_eq!(targets.len(), params.pulse_count as usize);
                    let last = targets.last().unwrap();
                    let shorts =
                        (params.pulse_count as u16 - 1) * params.short_pulse_seconds as u16;
                    assert_eq!(last.duration_seconds, params.total_seconds - shorts);
                    assert!(last.duration_seconds >= 1);

                    let sum: u16 = targets.iter().map(|t| t.duration_seconds).sum();
                    assert_eq!(sum, params.total_seconds);
                }
            }
        }
    }

    #[test]
    fn targets_wrap_into_the_previous_day() {
        let mut params = params(100, 3, 2, 30);
        params.am_end = "00:30".parse().unwrap();

        let targets = generate(params.am_end, &params);

        let minutes: Vec<u16> = targets.iter().map(|t| t.minute_of_day).collect();
        assert_eq!(minutes, vec![1410, 0, 30]);
        assert_eq!(targets[0].clock_time().to_string(), "23:30");
    }

    #[test]
    fn targets_stay_in_range_for_any_distance() {
        for end in [0_u16, 1, 59, 720, 1439] {
            let params = params(600, 50, 1, 60);
            let targets = generate(ClockTime::from_minutes(end), &params);
            assert!(targets.iter().all(|t| t.minute_of_day < MINUTES_PER_DAY));
            assert_eq!(targets.last().unwrap().minute_of_day, end);
        }
    }

    #[test]
    fn colliding_minutes_are_not_deduplicated() {
        // 49 gaps of 60 minutes span more than two days.
        let params = params(600, 50, 1, 60);
        let targets = generate(ClockTime::from_minutes(0), &params);

        let at_midnight = targets.iter().filter(|t| t.minute_of_day == 0).count();
        assert_eq!(targets.len(), 50);
        assert_eq!(at_midnight, 3);
    }

    #[test]
    fn renders_both_sessions() {
        let mut params = params(30, 2, 5, 2);
        params.am_end = "07:00".parse().unwrap();
        params.pm_end = "18:15".parse().unwrap();

        let text = render_schedule_text(&params);

        assert_eq!(
            text,
            "Session ends at AM=07:00  PM=18:15\n\
             Total Z=30s, Y=2, gap=2 min\n\
             \x20 AM #1  06:58  (5 s)\n\
             \x20 AM #2  07:00  (25 s)\n\
             \x20 PM #1  18:13  (5 s)\n\
             \x20 PM #2  18:15  (25 s)\n"
        );
    }
}
