pub mod civil_time;
pub mod clock;
pub mod config;
pub mod engine;
pub mod form;
pub mod history;
pub mod page;
pub mod schedule;
pub mod types;

pub use civil_time::{is_dst, CivilTimeResolver, LocalTime};
pub use clock::{is_plausible_epoch, SyncedClock};
pub use config::{
    ClockConfig, ClockTime, FeederConfig, MotorHardwareConfig, NetworkConfig,
    NetworkConfigError, RuntimeConfig, SessionParameters, StaticIpv4,
};
pub use engine::{FeedAction, FiringEngine};
pub use form::{ManualFeedForm, SettingsForm};
pub use history::{FeedEvent, FeedSource, HistoryLog, HistoryRow, HISTORY_CAPACITY};
pub use schedule::{generate, render_schedule_text, session_targets, PulseTarget, Session};
pub use types::{FeederStatus, TimeView};
