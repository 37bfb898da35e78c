use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ReminderError;

/// Non-empty set of weekdays, stored as a bitmask keyed from Monday.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const ALL: WeekdaySet = WeekdaySet(0b111_1111);

    pub fn from_days<I: IntoIterator<Item = Weekday>>(days: I) -> Self {
        let mut set = WeekdaySet::default();
        for day in days {
            set.insert(day);
        }
        set
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter(move |day| self.contains(*day))
    }
}

impl fmt::Debug for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A time of day plus the weekdays it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawReminderTime", into = "RawReminderTime")]
pub struct ReminderTime {
    time: NaiveTime,
    days: WeekdaySet,
}

impl ReminderTime {
    pub fn new(time: NaiveTime, days: WeekdaySet) -> Result<Self, ReminderError> {
        if days.is_empty() {
            return Err(ReminderError::InvalidReminderTime(format!(
                "{} has no active weekdays",
                time.format("%H:%M")
            )));
        }
        Ok(Self { time, days })
    }

    /// Parses `HH:MM` (or `HH:MM:SS`) active on every day of the week.
    pub fn daily(time: &str) -> Result<Self, ReminderError> {
        Self::new(parse_clock_time(time)?, WeekdaySet::ALL)
    }

    pub fn time(&self) -> NaiveTime {
        self.time
    }

    pub fn days(&self) -> WeekdaySet {
        self.days
    }
}

fn parse_clock_time(raw: &str) -> Result<NaiveTime, ReminderError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| ReminderError::InvalidReminderTime(format!("'{raw}' is not a 24h clock time")))
}

/// Weekday as stored remotely: an index with Sunday = 0, or a name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawDay {
    Index(u8),
    Name(String),
}

impl TryFrom<RawDay> for Weekday {
    type Error = ReminderError;

    fn try_from(raw: RawDay) -> Result<Self, Self::Error> {
        match raw {
            RawDay::Index(0) => Ok(Weekday::Sun),
            RawDay::Index(1) => Ok(Weekday::Mon),
            RawDay::Index(2) => Ok(Weekday::Tue),
            RawDay::Index(3) => Ok(Weekday::Wed),
            RawDay::Index(4) => Ok(Weekday::Thu),
            RawDay::Index(5) => Ok(Weekday::Fri),
            RawDay::Index(6) => Ok(Weekday::Sat),
            RawDay::Index(other) => Err(ReminderError::InvalidReminderTime(format!(
                "weekday index {other} out of range"
            ))),
            RawDay::Name(name) => Weekday::from_str(&name).map_err(|_| {
                ReminderError::InvalidReminderTime(format!("unknown weekday '{name}'"))
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawReminderTime {
    time: String,
    days: Vec<RawDay>,
}

impl TryFrom<RawReminderTime> for ReminderTime {
    type Error = ReminderError;

    fn try_from(raw: RawReminderTime) -> Result<Self, Self::Error> {
        let time = parse_clock_time(&raw.time)?;
        let days = raw
            .days
            .into_iter()
            .map(Weekday::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        ReminderTime::new(time, WeekdaySet::from_days(days))
    }
}

impl From<ReminderTime> for RawReminderTime {
    fn from(value: ReminderTime) -> Self {
        RawReminderTime {
            time: value.time.format("%H:%M").to_string(),
            days: value
                .days
                .iter()
                .map(|day| RawDay::Name(day.to_string()))
                .collect(),
        }
    }
}

fn default_active() -> bool {
    true
}

fn non_empty_times<'de, D>(deserializer: D) -> Result<Vec<ReminderTime>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let times = Vec::<ReminderTime>::deserialize(deserializer)?;
    if times.is_empty() {
        return Err(serde::de::Error::custom("a schedule needs at least one reminder time"));
    }
    Ok(times)
}

/// A medication's recurring reminder definition. Read-only to the engine
/// apart from the two notification markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationSchedule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub dosage: String,
    #[serde(deserialize_with = "non_empty_times")]
    pub reminder_times: Vec<ReminderTime>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub last_notified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snoozed_until: Option<DateTime<Utc>>,
}

impl MedicationSchedule {
    pub fn new(id: &str, name: &str, dosage: &str, reminder_times: Vec<ReminderTime>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            dosage: dosage.to_string(),
            reminder_times,
            active: true,
            last_notified_at: None,
            snoozed_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DueReason {
    /// A reminder time matched the current wall clock.
    Scheduled,
    /// A snooze marker elapsed.
    SnoozeElapsed,
}

/// A dose that is triggerable right now. Lives for one polling pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DueReminder {
    pub schedule_id: String,
    pub medication_name: String,
    pub dosage: String,
    pub scheduled_time: NaiveTime,
    pub reason: DueReason,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Taken,
    Snoozed,
    Skipped,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Taken => "taken",
            ActionType::Snoozed => "snoozed",
            ActionType::Skipped => "skipped",
        }
    }
}

impl FromStr for ActionType {
    type Err = ReminderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "taken" => Ok(ActionType::Taken),
            "snoozed" => Ok(ActionType::Snoozed),
            "skipped" => Ok(ActionType::Skipped),
            other => Err(ReminderError::NotFound(format!("action type '{other}'"))),
        }
    }
}

/// A user response as sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewActionLog {
    pub medication_id: String,
    pub action: ActionType,
    pub logged_at: DateTime<Utc>,
    #[serde(rename = "notes")]
    pub note: String,
}

/// A locally stored user response. Append-only; only `synced` ever changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionLogEntry {
    pub id: i64,
    pub medication_id: String,
    pub action: ActionType,
    pub logged_at: DateTime<Utc>,
    pub note: String,
    pub synced: bool,
}

impl ActionLogEntry {
    pub fn to_remote(&self) -> NewActionLog {
        NewActionLog {
            medication_id: self.medication_id.clone(),
            action: self.action,
            logged_at: self.logged_at,
            note: self.note.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Endpoint and keys handed out by the client's push capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushKeys,
}

/// Everything needed to render a reminder without any service state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub tag: String,
    pub medication_id: String,
    pub scheduled_time: String,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct ResponseRequest {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SnoozeRequest {
    pub minutes: u32,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct EventsQuery {
    #[serde(default)]
    pub after: Option<u64>,
}
