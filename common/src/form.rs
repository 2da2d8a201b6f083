//! `application/x-www-form-urlencoded` bodies posted by the settings page.

use serde::Deserialize;

use crate::config::{ClockTime, FeederConfig, SessionParameters};

/// Raw settings submission. Every field is optional text so a malformed
/// value never rejects the whole form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsForm {
    #[serde(rename = "A")]
    pub am_end: Option<String>,
    #[serde(rename = "P")]
    pub pm_end: Option<String>,
    #[serde(rename = "Z")]
    pub total_seconds: Option<String>,
    #[serde(rename = "Y")]
    pub pulse_count: Option<String>,
    #[serde(rename = "X")]
    pub short_pulse_seconds: Option<String>,
    #[serde(rename = "gap")]
    pub gap_minutes: Option<String>,
}

impl SettingsForm {
    pub fn from_urlencoded(body: &str) -> Self {
        Self {
            am_end: form_value(body, "A"),
            pm_end: form_value(body, "P"),
            total_seconds: form_value(body, "Z"),
            pulse_count: form_value(body, "Y"),
            short_pulse_seconds: form_value(body, "X"),
            gap_minutes: form_value(body, "gap"),
        }
    }

    /// Applies the submission on top of `current` and returns the clamped
    /// result. Unparseable numbers count as 0 before clamping; unparseable
    /// times keep the current value.
    pub fn apply(&self, current: &SessionParameters) -> SessionParameters {
        let mut next = current.clone();

        next.am_end = parse_time(self.am_end.as_deref()).unwrap_or(current.am_end);
        next.pm_end = parse_time(self.pm_end.as_deref()).unwrap_or(current.pm_end);
        next.total_seconds = parse_number(self.total_seconds.as_deref(), u16::MAX);
        next.pulse_count = parse_number(self.pulse_count.as_deref(), u8::MAX);
        next.short_pulse_seconds = parse_number(self.short_pulse_seconds.as_deref(), u8::MAX);
        next.gap_minutes = parse_number(self.gap_minutes.as_deref(), u8::MAX);

        next.sanitize();
        next
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualFeedForm {
    pub dur: Option<String>,
}

impl ManualFeedForm {
    pub fn from_urlencoded(body: &str) -> Self {
        Self {
            dur: form_value(body, "dur"),
        }
    }

    pub fn duration_seconds(&self, config: &FeederConfig) -> u16 {
        let requested = parse_number(self.dur.as_deref(), u16::MAX);
        config.clamp_manual_seconds(requested)
    }
}

fn parse_time(raw: Option<&str>) -> Option<ClockTime> {
    raw?.parse().ok()
}

fn parse_number<T>(raw: Option<&str>, max: T) -> T
where
    T: TryFrom<i64> + Default,
{
    let Some(raw) = raw else {
        return T::default();
    };
    let Ok(value) = raw.trim().parse::<i64>() else {
        return T::default();
    };
    if value <= 0 {
        return T::default();
    }
    T::try_from(value).unwrap_or(max)
}

/// Looks up and decodes one field of a urlencoded body.
pub fn form_value(body: &str, key: &str) -> Option<String> {
    body.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (percent_decode(name) == key).then(|| percent_decode(value))
    })
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => decoded.push(b' '),
            b'%' => {
                let escaped = bytes
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                if let Some(byte) = escaped {
                    decoded.push(byte);
                    i += 3;
                    continue;
                }
                decoded.push(b'%');
            }
            byte => decoded.push(byte),
        }
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_urlencoded_values() {
        let body = "A=07%3A30&P=18%3a05&note=feed+the+ducks&dur=";
        assert_eq!(form_value(body, "A").as_deref(), Some("07:30"));
        assert_eq!(form_value(body, "P").as_deref(), Some("18:05"));
        assert_eq!(form_value(body, "note").as_deref(), Some("feed the ducks"));
        assert_eq!(form_value(body, "dur").as_deref(), Some(""));
        assert_eq!(form_value(body, "Z"), None);
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn settings_submission_is_clamped() {
        let current = SessionParameters::default();
        let form = SettingsForm::from_urlencoded("A=06%3A45&P=19%3A00&Z=10&Y=4&X=5&gap=90");

        let next = form.apply(&current);

        assert_eq!(next.am_end.to_string(), "06:45");
        assert_eq!(next.pm_end.to_string(), "19:00");
        assert_eq!(next.pulse_count, 4);
        assert_eq!(next.short_pulse_seconds, 5);
        assert_eq!(next.gap_minutes, 60);
        assert_eq!(next.total_seconds, 16);
    }

    #[test]
    fn malformed_fields_fall_back() {
        let mut current = SessionParameters::default();
        current.am_end = "05:15".parse().unwrap();
        let form = SettingsForm::from_urlencoded("A=soon&Z=lots&Y=-3&X=99999&gap=");

        let next = form.apply(&current);

        assert_eq!(next.am_end, current.am_end);
        assert_eq!(next.pm_end, current.pm_end);
        assert_eq!(next.pulse_count, 2);
        assert_eq!(next.short_pulse_seconds, 30);
        assert_eq!(next.gap_minutes, 1);
        assert_eq!(next.total_seconds, 31);
    }

    #[test]
    fn applying_twice_matches_applying_once() {
        let form = SettingsForm::from_urlencoded("A=07%3A00&P=18%3A00&Z=700&Y=50&X=30&gap=0");
        let once = form.apply(&SessionParameters::default());
        let twice = form.apply(&once);
        assert_eq!(once, twice);
        assert_eq!(once.clone().sanitized(), once);
    }

    #[test]
    fn manual_duration_is_clamped() {
        let config = FeederConfig::default();
        let cases = [("dur=3", 3), ("dur=0", 1), ("dur=45", 10), ("dur=abc", 1), ("", 1)];
        for (body, expected) in cases {
            let form = ManualFeedForm::from_urlencoded(body);
            assert_eq!(form.duration_seconds(&config), expected, "body `{body}`");
        }
    }
}
