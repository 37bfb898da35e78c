//! Due-reminder detection.
//!
//! Matches the wall clock against each schedule's reminder times inside the
//! tolerance window, skipping schedules notified within the cooldown. Snoozed
//! schedules become due again once their snooze marker has passed, regardless
//! of cooldown.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Utc};

use crate::config::ReminderConfig;
use crate::models::{DueReason, DueReminder, MedicationSchedule, ReminderTime};

/// At most one record per schedule per call.
pub fn detect_due(
    now: DateTime<Utc>,
    schedules: &[MedicationSchedule],
    config: &ReminderConfig,
) -> Vec<DueReminder> {
    let local_now = now.with_timezone(&config.utc_offset).naive_local();

    schedules
        .iter()
        .filter(|schedule| schedule.active)
        .filter_map(|schedule| match schedule.snoozed_until {
            Some(until) if until > now => None,
            Some(until) if snooze_pending_retrigger(schedule, until) => {
                Some(due_record(schedule, local_now.time(), DueReason::SnoozeElapsed, now))
            }
            _ => {
                if !cooldown_elapsed(schedule, now, config.cooldown) {
                    return None;
                }
                schedule
                    .reminder_times
                    .iter()
                    .find(|slot| matches_window(slot, local_now, config.tolerance))
                    .map(|slot| due_record(schedule, slot.time(), DueReason::Scheduled, now))
            }
        })
        .collect()
}

fn snooze_pending_retrigger(schedule: &MedicationSchedule, until: DateTime<Utc>) -> bool {
    schedule
        .last_notified_at
        .map_or(true, |notified| notified < until)
}

fn cooldown_elapsed(schedule: &MedicationSchedule, now: DateTime<Utc>, cooldown: Duration) -> bool {
    schedule
        .last_notified_at
        .map_or(true, |notified| now - notified >= cooldown)
}

/// Checks yesterday, today and tomorrow so windows that straddle midnight
/// match the weekday the dose belongs to.
fn matches_window(slot: &ReminderTime, local_now: NaiveDateTime, tolerance: Duration) -> bool {
    let today = local_now.date();
    [today.pred_opt(), Some(today), today.succ_opt()]
        .into_iter()
        .flatten()
        .filter(|day| slot.days().contains(day.weekday()))
        .any(|day| {
            let occurrence = day.and_time(slot.time());
            (local_now - occurrence).abs() <= tolerance
        })
}

fn due_record(
    schedule: &MedicationSchedule,
    scheduled_time: chrono::NaiveTime,
    reason: DueReason,
    now: DateTime<Utc>,
) -> DueReminder {
    DueReminder {
        schedule_id: schedule.id.clone(),
        medication_name: schedule.name.clone(),
        dosage: schedule.dosage.clone(),
        scheduled_time,
        reason,
        detected_at: now,
    }
}

/// Combines a fresh remote snapshot with markers recorded locally.
///
/// A marker written while offline may not have reached the remote store yet,
/// so the later of the two timestamps wins.
pub fn merge_local_markers(
    remote: Vec<MedicationSchedule>,
    cached: &[MedicationSchedule],
) -> Vec<MedicationSchedule> {
    remote
        .into_iter()
        .map(|mut schedule| {
            if let Some(local) = cached.iter().find(|c| c.id == schedule.id) {
                schedule.last_notified_at = later(schedule.last_notified_at, local.last_notified_at);
                schedule.snoozed_until = later(schedule.snoozed_until, local.snoozed_until);
            }
            schedule
        })
        .collect()
}

fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
