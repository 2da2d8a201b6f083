use std::{fmt, net::Ipv4Addr, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const MIN_PULSE_COUNT: u8 = 2;
pub const MAX_PULSE_COUNT: usize = 50;
pub const MAX_TOTAL_SECONDS: u16 = 600;
pub const MIN_GAP_MINUTES: u8 = 1;
pub const MAX_GAP_MINUTES: u8 = 60;
pub const MIN_SHORT_PULSE_SECONDS: u8 = 1;
pub const MAX_SHORT_PULSE_SECONDS: u8 = 30;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockTimeError {
    #[error("expected HH:MM, got `{0}`")]
    Format(String),
    #[error("time of day out of range: {hour:02}:{minute:02}")]
    OutOfRange { hour: u8, minute: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkConfigError {
    #[error("{0} is required when use_static_ip is set")]
    MissingStaticField(&'static str),
    #[error("invalid subnet mask: {0}")]
    InvalidSubnetMask(Ipv4Addr),
}

/// Local wall-clock time of day at minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime {
    hour: u8,
    minute: u8,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self, ClockTimeError> {
        if hour > 23 || minute > 59 {
            return Err(ClockTimeError::OutOfRange { hour, minute });
        }
        Ok(Self { hour, minute })
    }

    pub fn from_minutes(minutes: u16) -> Self {
        let minutes = minutes % MINUTES_PER_DAY;
        Self {
            hour: (minutes / 60) as u8,
            minute: (minutes % 60) as u8,
        }
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    pub fn minutes_since_midnight(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for ClockTime {
    type Err = ClockTimeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let format_err = || ClockTimeError::Format(trimmed.to_string());

        let (hour, minute) = trimmed.split_once(':').ok_or_else(format_err)?;
        // Browsers may submit seconds ("07:00:00"); only HH:MM is kept.
        let minute = minute.split(':').next().unwrap_or(minute);
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(format_err());
        }

        let hour = hour.parse::<u8>().map_err(|_| format_err())?;
        let minute = minute.parse::<u8>().map_err(|_| format_err())?;
        Self::new(hour, minute)
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parameters shared by the morning and evening sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParameters {
    #[serde(rename = "A")]
    pub am_end: ClockTime,
    #[serde(rename = "P")]
    pub pm_end: ClockTime,
    #[serde(rename = "Z")]
    pub total_seconds: u16,
    #[serde(rename = "Y")]
    pub pulse_count: u8,
    #[serde(rename = "X")]
    pub short_pulse_seconds: u8,
    #[serde(rename = "gap")]
    pub gap_minutes: u8,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            am_end: ClockTime { hour: 7, minute: 0 },
            pm_end: ClockTime {
                hour: 18,
                minute: 0,
            },
            total_seconds: 100,
            pulse_count: 10,
            short_pulse_seconds: 2,
            gap_minutes: 1,
        }
    }
}

impl SessionParameters {
    /// Clamps every field into range so the final pulse is at least one second.
    pub fn sanitize(&mut self) {
        self.gap_minutes = self.gap_minutes.clamp(MIN_GAP_MINUTES, MAX_GAP_MINUTES);
        self.pulse_count = self
            .pulse_count
            .clamp(MIN_PULSE_COUNT, MAX_PULSE_COUNT as u8);
        self.short_pulse_seconds = self
            .short_pulse_seconds
            .clamp(MIN_SHORT_PULSE_SECONDS, MAX_SHORT_PULSE_SECONDS);

        // 49 short pulses of 30 s cannot fit under the 600 s ceiling.
        let short_count = self.pulse_count as u16 - 1;
        let max_short = ((MAX_TOTAL_SECONDS - 1) / short_count).min(MAX_SHORT_PULSE_SECONDS as u16);
        if self.short_pulse_seconds as u16 > max_short {
            self.short_pulse_seconds = max_short as u8;
        }

        let min_total = self.short_total_seconds() + 1;
        self.total_seconds = self.total_seconds.clamp(min_total, MAX_TOTAL_SECONDS);
    }

    pub fn sanitized(mut self) -> Self {
        self.sanitize();
        self
    }

    /// Seconds spent in every pulse except the last.
    pub fn short_total_seconds(&self) -> u16 {
        (self.pulse_count as u16).saturating_sub(1) * self.short_pulse_seconds as u16
    }

    pub fn long_pulse_seconds(&self) -> u16 {
        self.total_seconds
            .saturating_sub(self.short_total_seconds())
            .max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeederConfig {
    pub tick_interval_ms: u64,
    pub time_refresh_interval_ms: u64,
    pub manual_min_seconds: u16,
    pub manual_max_seconds: u16,
    pub manual_default_seconds: u16,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            time_refresh_interval_ms: 3_600_000,
            manual_min_seconds: 1,
            manual_max_seconds: 10,
            manual_default_seconds: 3,
        }
    }
}

impl FeederConfig {
    pub fn clamp_manual_seconds(&self, seconds: u16) -> u16 {
        seconds.clamp(self.manual_min_seconds, self.manual_max_seconds)
    }

    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(100, 30_000);
        self.time_refresh_interval_ms = self.time_refresh_interval_ms.max(60_000);
        self.manual_min_seconds = self.manual_min_seconds.max(1);
        self.manual_max_seconds = self.manual_max_seconds.max(self.manual_min_seconds);
        self.manual_default_seconds = self.clamp_manual_seconds(self.manual_default_seconds);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClockConfig {
    pub standard_offset_hours: i8,
    pub observe_dst: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            standard_offset_hours: -8,
            observe_dst: true,
        }
    }
}

impl ClockConfig {
    pub fn sanitize(&mut self) {
        self.standard_offset_hours = self.standard_offset_hours.clamp(-12, 14);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MotorHardwareConfig {
    pub pin_a: i32,
    pub pin_b: i32,
}

impl Default for MotorHardwareConfig {
    fn default() -> Self {
        Self {
            pin_a: 12,
            pin_b: 14,
        }
    }
}

impl MotorHardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.pin_a < 0 {
            self.pin_a = defaults.pin_a;
        }
        if self.pin_b < 0 || self.pin_b == self.pin_a {
            self.pin_b = defaults.pin_b;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub hostname: String,
    pub ntp_server: String,
    pub use_static_ip: bool,
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            hostname: "duckfeeder".to_string(),
            ntp_server: "pool.ntp.org".to_string(),
            use_static_ip: false,
            static_ip: None,
            gateway: None,
            subnet: None,
            dns: None,
        }
    }
}

/// Validated fixed address for the station interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIpv4 {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
    pub dns: Option<Ipv4Addr>,
}

impl NetworkConfig {
    /// `Ok(None)` means DHCP.
    pub fn static_ipv4(&self) -> Result<Option<StaticIpv4>, NetworkConfigError> {
        if !self.use_static_ip {
            return Ok(None);
        }

        let ip = self
            .static_ip
            .ok_or(NetworkConfigError::MissingStaticField("static_ip"))?;
        let gateway = self
            .gateway
            .ok_or(NetworkConfigError::MissingStaticField("gateway"))?;
        let subnet = Ipv4Addr::from(
            self.subnet
                .ok_or(NetworkConfigError::MissingStaticField("subnet"))?,
        );

        let bits = u32::from(subnet);
        if bits.leading_ones() + bits.trailing_zeros() != 32 {
            return Err(NetworkConfigError::InvalidSubnetMask(subnet));
        }

        Ok(Some(StaticIpv4 {
            ip: Ipv4Addr::from(ip),
            gateway: Ipv4Addr::from(gateway),
            prefix_len: bits.leading_ones() as u8,
            dns: self.dns.map(Ipv4Addr::from),
        }))
    }

    /// Bare lowercase host label advertised over mDNS.
    pub fn mdns_hostname(&self) -> String {
        let name = self.hostname.trim().trim_end_matches('.');
        let name = name.strip_suffix(".local").unwrap_or(name).to_ascii_lowercase();
        if name.is_empty() {
            Self::default().hostname
        } else {
            name
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub feeder: FeederConfig,
    pub clock: ClockConfig,
    pub motor: MotorHardwareConfig,
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.feeder.sanitize();
        self.clock.sanitize();
        self.motor.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn raw(total: u16, count: u8, short: u8, gap: u8) -> SessionParameters {
        SessionParameters {
            total_seconds: total,
            pulse_count: count,
            short_pulse_seconds: short,
            gap_minutes: gap,
            ..SessionParameters::default()
        }
    }

    #[test]
    fn parses_and_formats_clock_time() {
        let time: ClockTime = "07:05".parse().unwrap();
        assert_eq!(time, ClockTime::new(7, 5).unwrap());
        assert_eq!(time.to_string(), "07:05");
        assert_eq!(time.minutes_since_midnight(), 425);

        assert_eq!("7:05".parse::<ClockTime>().unwrap().to_string(), "07:05");
        assert_eq!("18:30:00".parse::<ClockTime>().unwrap().to_string(), "18:30");
    }

    #[test]
    fn rejects_malformed_clock_time() {
        assert!("".parse::<ClockTime>().is_err());
        assert!("0700".parse::<ClockTime>().is_err());
        assert!("ab:cd".parse::<ClockTime>().is_err());
        assert_eq!(
            "24:00".parse::<ClockTime>(),
            Err(ClockTimeError::OutOfRange { hour: 24, minute: 0 })
        );
        assert!("12:60".parse::<ClockTime>().is_err());
    }

    #[test]
    fn sanitize_clamps_each_field() {
        let params = raw(0, 0, 0, 0).sanitized();
        assert_eq!(params.gap_minutes, 1);
        assert_eq!(params.pulse_count, 2);
        assert_eq!(params.short_pulse_seconds, 1);
        assert_eq!(params.total_seconds, 2);

        let params = raw(u16::MAX, u8::MAX, 5, u8::MAX).sanitized();
        assert_eq!(params.gap_minutes, 60);
        assert_eq!(params.pulse_count, 50);
        assert_eq!(params.short_pulse_seconds, 5);
        assert_eq!(params.total_seconds, 600);
    }

    #[test]
    fn sanitize_raises_total_to_fit_long_pulse() {
        let params = raw(10, 4, 5, 1).sanitized();
        assert_eq!(params.total_seconds, 16);
        assert_eq!(params.long_pulse_seconds(), 1);
    }

    #[test]
    fn sanitize_shrinks_short_pulse_when_total_ceiling_is_unreachable() {
        let params = raw(600, 50, 30, 1).sanitized();
        assert_eq!(params.short_pulse_seconds, 12);
        assert_eq!(params.total_seconds, 600);
        assert!(params.short_total_seconds() < params.total_seconds);
    }

    #[test]
    fn sanitize_is_idempotent() {
        for count in [0_u8, 2, 4, 21, 50, 200] {
            for short in [0_u8, 1, 5, 30, 99] {
                for total in [0_u16, 1, 30, 599, 600, 5000] {
                    for gap in [0_u8, 1, 45, 61] {
                        let once = raw(total, count, short, gap).sanitized();
                        let twice = once.clone().sanitized();
                        assert_eq!(once, twice);
                        assert!(once.long_pulse_seconds() >= 1);
                        assert!(once.short_total_seconds() < once.total_seconds);
                    }
                }
            }
        }
    }

    #[test]
    fn session_parameters_use_short_field_names() {
        let json = serde_json::to_string(&SessionParameters::default()).unwrap();
        assert_eq!(
            json,
            r#"{"A":"07:00","P":"18:00","Z":100,"Y":10,"X":2,"gap":1}"#
        );

        let partial: SessionParameters = serde_json::from_str(r#"{"Z":40}"#).unwrap();
        assert_eq!(partial.total_seconds, 40);
        assert_eq!(partial.pulse_count, 10);
        assert_eq!(partial.am_end.to_string(), "07:00");
    }

    fn original_network() -> NetworkConfig {
        NetworkConfig {
            use_static_ip: true,
            static_ip: Some([192, 168, 68, 210]),
            gateway: Some([192, 168, 68, 1]),
            subnet: Some([255, 255, 255, 0]),
            dns: Some([192, 168, 68, 1]),
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn stored_runtime_config_enables_static_ip() {
        let json = r#"{
            "network": {
                "wifi_ssid": "pond",
                "use_static_ip": true,
                "static_ip": [192, 168, 68, 210],
                "gateway": [192, 168, 68, 1],
                "subnet": [255, 255, 255, 0],
                "dns": [192, 168, 68, 1]
            },
            "motor": { "pin_a": 25 }
        }"#;
        let mut runtime: RuntimeConfig = serde_json::from_str(json).unwrap();
        runtime.sanitize();

        assert_eq!(runtime.motor.pin_a, 25);
        assert_eq!(runtime.motor.pin_b, 14);
        assert_eq!(
            runtime.network.static_ipv4(),
            Ok(Some(StaticIpv4 {
                ip: Ipv4Addr::new(192, 168, 68, 210),
                gateway: Ipv4Addr::new(192, 168, 68, 1),
                prefix_len: 24,
                dns: Some(Ipv4Addr::new(192, 168, 68, 1)),
            }))
        );
    }

    #[test]
    fn dhcp_unless_static_ip_is_enabled() {
        assert_eq!(NetworkConfig::default().static_ipv4(), Ok(None));

        let network = NetworkConfig {
            use_static_ip: false,
            ..original_network()
        };
        assert_eq!(network.static_ipv4(), Ok(None));
    }

    #[test]
    fn static_ip_requires_complete_settings() {
        let network = NetworkConfig {
            gateway: None,
            ..original_network()
        };
        assert_eq!(
            network.static_ipv4(),
            Err(NetworkConfigError::MissingStaticField("gateway"))
        );

        let network = NetworkConfig {
            subnet: Some([255, 0, 255, 0]),
            ..original_network()
        };
        assert_eq!(
            network.static_ipv4(),
            Err(NetworkConfigError::InvalidSubnetMask(Ipv4Addr::new(255, 0, 255, 0)))
        );
    }

    #[test]
    fn mdns_hostname_is_a_bare_label() {
        let named = |hostname: &str| NetworkConfig {
            hostname: hostname.to_string(),
            ..NetworkConfig::default()
        };
        assert_eq!(NetworkConfig::default().mdns_hostname(), "duckfeeder");
        assert_eq!(named("DuckFeeder.local.").mdns_hostname(), "duckfeeder");
        assert_eq!(named("  pond ").mdns_hostname(), "pond");
        assert_eq!(named("").mdns_hostname(), "duckfeeder");
    }

    #[test]
    fn manual_seconds_are_clamped() {
        let config = FeederConfig::default();
        assert_eq!(config.clamp_manual_seconds(0), 1);
        assert_eq!(config.clamp_manual_seconds(4), 4);
        assert_eq!(config.clamp_manual_seconds(60), 10);
    }
}
