use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{Duration, FixedOffset, Local};

use crate::error::{ReminderError, Result};
use crate::util::{
    VAR_CACHE_PATH, VAR_COOLDOWN_MIN, VAR_EMBEDDED, VAR_REMOTE_API_KEY, VAR_REMOTE_URL,
    VAR_SNOOZE_OPTIONS_MIN, VAR_TICK_INTERVAL_S, VAR_TOLERANCE_MIN, VAR_UTC_OFFSET_MIN,
    VAR_VAPID_KEY_PATH, VAR_VAPID_SUBJECT,
};

pub const DEFAULT_TICK_INTERVAL_S: u64 = 60;
pub const DEFAULT_TOLERANCE_MIN: i64 = 5;
pub const DEFAULT_COOLDOWN_MIN: i64 = 60;
pub const DEFAULT_SNOOZE_OPTIONS_MIN: [u32; 5] = [5, 10, 15, 30, 60];
pub const DEFAULT_CACHE_PATH: &str = "reminders.sqlite3";
pub const DEFAULT_VAPID_SUBJECT: &str = "mailto:reminders@localhost";

/// Scheduling knobs shared by detection, the alert machine and the monitor loop.
#[derive(Debug, Clone)]
pub struct ReminderConfig {
    pub tick_interval: StdDuration,
    /// Half-width of the window around a reminder time.
    pub tolerance: Duration,
    /// Minimum gap between two notifications for the same schedule.
    pub cooldown: Duration,
    pub snooze_options: Vec<u32>,
    /// Offset of the wall clock that reminder times are written in.
    pub utc_offset: FixedOffset,
    /// Start as if running inside an embedding frame.
    pub embedded: bool,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            tick_interval: StdDuration::from_secs(DEFAULT_TICK_INTERVAL_S),
            tolerance: Duration::minutes(DEFAULT_TOLERANCE_MIN),
            cooldown: Duration::minutes(DEFAULT_COOLDOWN_MIN),
            snooze_options: DEFAULT_SNOOZE_OPTIONS_MIN.to_vec(),
            utc_offset: *Local::now().offset(),
            embedded: false,
        }
    }
}

impl ReminderConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>(VAR_TICK_INTERVAL_S)? {
            if secs == 0 {
                return Err(ReminderError::Config(format!("{VAR_TICK_INTERVAL_S} must be positive")));
            }
            config.tick_interval = StdDuration::from_secs(secs);
        }
        if let Some(minutes) = parse_var::<i64>(VAR_TOLERANCE_MIN)? {
            config.tolerance = non_negative_minutes(VAR_TOLERANCE_MIN, minutes)?;
        }
        if let Some(minutes) = parse_var::<i64>(VAR_COOLDOWN_MIN)? {
            config.cooldown = non_negative_minutes(VAR_COOLDOWN_MIN, minutes)?;
        }
        if let Ok(raw) = env::var(VAR_SNOOZE_OPTIONS_MIN) {
            config.snooze_options = parse_snooze_options(&raw)?;
        }
        if let Some(minutes) = parse_var::<i32>(VAR_UTC_OFFSET_MIN)? {
            config.utc_offset = FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
                ReminderError::Config(format!("{VAR_UTC_OFFSET_MIN} out of range: {minutes}"))
            })?;
        }
        if let Some(embedded) = parse_var::<bool>(VAR_EMBEDDED)? {
            config.embedded = embedded;
        }

        Ok(config)
    }

    pub fn is_snooze_option(&self, minutes: u32) -> bool {
        self.snooze_options.contains(&minutes)
    }
}

/// Where the service keeps its state and how it reaches the remote store.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub remote_url: String,
    pub remote_api_key: String,
    pub cache_path: PathBuf,
    pub vapid_key_path: Option<PathBuf>,
    pub vapid_subject: String,
}

impl ServiceSettings {
    pub fn from_env() -> Result<Self> {
        let remote_url = env::var(VAR_REMOTE_URL)
            .map_err(|_| ReminderError::Config(format!("{VAR_REMOTE_URL} is not set")))?;
        let remote_api_key = env::var(VAR_REMOTE_API_KEY)
            .map_err(|_| ReminderError::Config(format!("{VAR_REMOTE_API_KEY} is not set")))?;

        Ok(Self {
            remote_url,
            remote_api_key,
            cache_path: env::var(VAR_CACHE_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CACHE_PATH)),
            vapid_key_path: env::var(VAR_VAPID_KEY_PATH).ok().map(PathBuf::from),
            vapid_subject: env::var(VAR_VAPID_SUBJECT)
                .unwrap_or_else(|_| DEFAULT_VAPID_SUBJECT.to_string()),
        })
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ReminderError::Config(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn non_negative_minutes(name: &str, minutes: i64) -> Result<Duration> {
    if minutes < 0 {
        return Err(ReminderError::Config(format!("{name} must not be negative")));
    }
    Duration::try_minutes(minutes)
        .ok_or_else(|| ReminderError::Config(format!("{name}={minutes} is out of range")))
}

pub fn parse_snooze_options(raw: &str) -> Result<Vec<u32>> {
    let mut options = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .map_err(|e| ReminderError::Config(format!("snooze option '{part}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    if options.is_empty() || options.contains(&0) {
        return Err(ReminderError::Config(
            "snooze options must be a non-empty list of positive minutes".to_string(),
        ));
    }
    options.sort_unstable();
    options.dedup();
    Ok(options)
}
