//! Per-dose alert lifecycle and the board that keeps at most one alert
//! triggered at a time.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ReminderError, Result};
use crate::models::{ActionType, DueReminder, NewActionLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum AlertState {
    Idle,
    Triggered,
    Taken,
    Snoozed { until: DateTime<Utc> },
    Skipped,
}

impl AlertState {
    pub fn name(&self) -> &'static str {
        match self {
            AlertState::Idle => "idle",
            AlertState::Triggered => "triggered",
            AlertState::Taken => "taken",
            AlertState::Snoozed { .. } => "snoozed",
            AlertState::Skipped => "skipped",
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            AlertState::Taken | AlertState::Snoozed { .. } | AlertState::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertResponse {
    Taken,
    Snoozed { minutes: u32 },
    Skipped,
}

impl AlertResponse {
    fn event_name(&self) -> &'static str {
        match self {
            AlertResponse::Taken => "take",
            AlertResponse::Snoozed { .. } => "snooze",
            AlertResponse::Skipped => "skip",
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            AlertResponse::Taken => ActionType::Taken,
            AlertResponse::Snoozed { .. } => ActionType::Snoozed,
            AlertResponse::Skipped => ActionType::Skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub medication_id: String,
    pub medication_name: String,
    pub dosage: String,
    #[serde(serialize_with = "serialize_clock_time")]
    pub scheduled_time: NaiveTime,
    pub state: AlertState,
    pub triggered_at: Option<DateTime<Utc>>,
}

fn serialize_clock_time<S: serde::Serializer>(
    time: &NaiveTime,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&time.format("%H:%M").to_string())
}

/// What a response produced: the log entry to dual-write and, for snoozes,
/// when the schedule becomes eligible again.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub alert: Alert,
    pub entry: NewActionLog,
    pub snoozed_until: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn from_due(due: &DueReminder) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            medication_id: due.schedule_id.clone(),
            medication_name: due.medication_name.clone(),
            dosage: due.dosage.clone(),
            scheduled_time: due.scheduled_time,
            state: AlertState::Idle,
            triggered_at: None,
        }
    }

    pub fn title(&self) -> String {
        format!("Time to take {}", self.medication_name)
    }

    pub fn body(&self) -> String {
        if self.dosage.is_empty() {
            format!("Scheduled for {}", self.scheduled_time.format("%H:%M"))
        } else {
            format!(
                "{} scheduled for {}",
                self.dosage,
                self.scheduled_time.format("%H:%M")
            )
        }
    }

    pub fn trigger(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != AlertState::Idle {
            return Err(ReminderError::InvalidTransition {
                from: self.state.name(),
                event: "trigger",
            });
        }
        self.state = AlertState::Triggered;
        self.triggered_at = Some(now);
        Ok(())
    }

    pub fn resolve(
        &mut self,
        response: AlertResponse,
        now: DateTime<Utc>,
        note: Option<String>,
    ) -> Result<Resolution> {
        if self.state != AlertState::Triggered {
            return Err(ReminderError::InvalidTransition {
                from: self.state.name(),
                event: response.event_name(),
            });
        }

        let scheduled = self.scheduled_time.format("%H:%M");
        let (state, snoozed_until, summary) = match response {
            AlertResponse::Taken => (AlertState::Taken, None, format!("Scheduled time: {scheduled}")),
            AlertResponse::Snoozed { minutes } => {
                let until = now + Duration::minutes(i64::from(minutes));
                (
                    AlertState::Snoozed { until },
                    Some(until),
                    format!("Snoozed for {minutes} minutes (scheduled time: {scheduled})"),
                )
            }
            AlertResponse::Skipped => (
                AlertState::Skipped,
                None,
                format!("Skipped (scheduled time: {scheduled})"),
            ),
        };
        self.state = state;

        let note = match note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            Some(user_note) => format!("{summary}. {user_note}"),
            None => summary,
        };

        Ok(Resolution {
            alert: self.clone(),
            entry: NewActionLog {
                medication_id: self.medication_id.clone(),
                action: response.action_type(),
                logged_at: now,
                note,
            },
            snoozed_until,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Offer {
    /// The slot was free; the alert now occupies it and must be delivered.
    Activate(Alert),
    /// Another alert is showing; this one waits its turn.
    Queued,
    /// This dose already has an alert on the board.
    Duplicate,
}

/// Holds the single active alert plus the FIFO of alerts waiting behind it.
#[derive(Debug, Default)]
pub struct AlertBoard {
    active: Option<Alert>,
    pending: VecDeque<Alert>,
}

impl AlertBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, due: &DueReminder, now: DateTime<Utc>) -> Result<Offer> {
        let already_listed = self
            .active
            .iter()
            .chain(self.pending.iter())
            .any(|alert| {
                alert.medication_id == due.schedule_id && alert.scheduled_time == due.scheduled_time
            });
        if already_listed {
            return Ok(Offer::Duplicate);
        }

        let alert = Alert::from_due(due);
        if self.active.is_some() {
            self.pending.push_back(alert);
            return Ok(Offer::Queued);
        }
        self.activate(alert, now).map(Offer::Activate)
    }

    fn activate(&mut self, mut alert: Alert, now: DateTime<Utc>) -> Result<Alert> {
        alert.trigger(now)?;
        self.active = Some(alert.clone());
        Ok(alert)
    }

    /// Promotes the oldest waiting alert when nothing is showing.
    pub fn promote_next(&mut self, now: DateTime<Utc>) -> Result<Option<Alert>> {
        if self.active.is_some() {
            return Ok(None);
        }
        match self.pending.pop_front() {
            Some(alert) => self.activate(alert, now).map(Some),
            None => Ok(None),
        }
    }

    /// Returns an alert that no channel could show to the front of the queue.
    pub fn requeue_active(&mut self, alert_id: &str) {
        if self.active.as_ref().is_some_and(|a| a.id == alert_id) {
            if let Some(mut alert) = self.active.take() {
                alert.state = AlertState::Idle;
                alert.triggered_at = None;
                self.pending.push_front(alert);
            }
        }
    }

    /// Works out what answering the active alert records. The alert stays
    /// active until [`AlertBoard::commit_response`].
    pub fn prepare_response(
        &self,
        alert_id: &str,
        response: AlertResponse,
        now: DateTime<Utc>,
        note: Option<String>,
    ) -> Result<Resolution> {
        let alert = match self.active.as_ref() {
            Some(alert) if alert.id == alert_id => alert,
            _ => {
                if let Some(waiting) = self.pending.iter().find(|a| a.id == alert_id) {
                    return Err(ReminderError::InvalidTransition {
                        from: waiting.state.name(),
                        event: response.event_name(),
                    });
                }
                return Err(ReminderError::NotFound(format!("alert {alert_id}")));
            }
        };

        alert.clone().resolve(response, now, note)
    }

    /// Frees the slot once the response has been recorded.
    pub fn commit_response(&mut self, resolution: &Resolution) -> bool {
        if self.active.as_ref().is_some_and(|a| a.id == resolution.alert.id) {
            self.active = None;
            return true;
        }
        false
    }

    pub fn active(&self) -> Option<&Alert> {
        self.active.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn triggered_count(&self) -> usize {
        self.active
            .iter()
            .chain(self.pending.iter())
            .filter(|alert| alert.state == AlertState::Triggered)
            .count()
    }
}
