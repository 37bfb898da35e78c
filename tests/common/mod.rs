#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};

use medication_reminder::alarm::{AudioOutput, ToneSequence};
use medication_reminder::cache::LocalCache;
use medication_reminder::clock::ManualClock;
use medication_reminder::config::ReminderConfig;
use medication_reminder::gateway::RemoteGateway;
use medication_reminder::models::{MedicationSchedule, NewActionLog, PushSubscription, ReminderTime};
use medication_reminder::platform::{NotificationContent, PermissionState, Platform};
use medication_reminder::{ReminderError, ReminderService, Result};

pub const SUBJECT: &str = "user-7f3a9c";

/// 2026-10-15 at `hour:minute` UTC.
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 15, hour, minute, 0).unwrap()
}

pub fn config() -> ReminderConfig {
    ReminderConfig {
        tick_interval: StdDuration::from_secs(3600),
        utc_offset: FixedOffset::east_opt(0).unwrap(),
        ..ReminderConfig::default()
    }
}

pub fn iron_tablets() -> MedicationSchedule {
    MedicationSchedule::new("iron", "Iron Tablets", "65mg", vec![ReminderTime::daily("08:00").unwrap()])
}

/// Two doses a day, 70 minutes apart.
pub fn antibiotic() -> MedicationSchedule {
    MedicationSchedule::new(
        "abx",
        "Antibiotic",
        "250mg",
        vec![ReminderTime::daily("08:00").unwrap(), ReminderTime::daily("09:10").unwrap()],
    )
}

pub fn vitamin_d() -> MedicationSchedule {
    MedicationSchedule::new("vit-d", "Vitamin D", "1000 IU", vec![ReminderTime::daily("08:00").unwrap()])
}

/// In-memory remote store that applies marker writes to its own schedules.
#[derive(Default)]
pub struct FakeGateway {
    pub schedules: Mutex<Vec<MedicationSchedule>>,
    pub logs: Mutex<Vec<NewActionLog>>,
    pub notified: Mutex<Vec<(String, DateTime<Utc>)>>,
    pub snoozes: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
    pub subscriptions: Mutex<HashMap<String, PushSubscription>>,
    pub fail_fetch: AtomicBool,
    pub fail_writes: AtomicBool,
    pub fetch_delay: Mutex<Option<StdDuration>>,
    pub notify_delay: Mutex<Option<StdDuration>>,
    /// Action log inserts for these medications are rejected.
    pub rejected_logs: Mutex<HashSet<String>>,
    pub fetches: AtomicUsize,
}

impl FakeGateway {
    pub fn with(schedules: Vec<MedicationSchedule>) -> Arc<Self> {
        let gateway = Self::default();
        *gateway.schedules.lock().unwrap() = schedules;
        Arc::new(gateway)
    }

    pub fn set_failing_writes(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    pub fn reject_logs_for(&self, medication_id: &str) {
        self.rejected_logs.lock().unwrap().insert(medication_id.to_string());
    }

    fn check_write(&self, what: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ReminderError::RemoteWrite(format!("{what}: connection refused")));
        }
        Ok(())
    }

    fn update_schedule<F: FnOnce(&mut MedicationSchedule)>(&self, id: &str, f: F) {
        if let Some(schedule) = self.schedules.lock().unwrap().iter_mut().find(|s| s.id == id) {
            f(schedule);
        }
    }
}

#[async_trait]
impl RemoteGateway for FakeGateway {
    async fn fetch_due_reminders(&self, _subject_id: &str) -> Result<Vec<MedicationSchedule>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ReminderError::Gateway("offline".into()));
        }
        Ok(self.schedules.lock().unwrap().clone())
    }

    async fn update_last_notified(&self, schedule_id: &str, at: DateTime<Utc>) -> Result<()> {
        let delay = *self.notify_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_write("update_last_notified")?;
        self.notified.lock().unwrap().push((schedule_id.to_string(), at));
        self.update_schedule(schedule_id, |s| s.last_notified_at = Some(at));
        Ok(())
    }

    async fn insert_action_log(&self, entry: &NewActionLog) -> Result<()> {
        self.check_write("insert_action_log")?;
        if self.rejected_logs.lock().unwrap().contains(&entry.medication_id) {
            return Err(ReminderError::RemoteWrite(format!("{}: rejected", entry.medication_id)));
        }
        self.logs.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn upsert_snooze_marker(&self, schedule_id: &str, until: Option<DateTime<Utc>>) -> Result<()> {
        self.check_write("upsert_snooze_marker")?;
        self.snoozes.lock().unwrap().push((schedule_id.to_string(), until));
        self.update_schedule(schedule_id, |s| s.snoozed_until = until);
        Ok(())
    }

    async fn upsert_push_subscription(&self, subject_id: &str, subscription: &PushSubscription) -> Result<()> {
        self.check_write("upsert_push_subscription")?;
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subject_id.to_string(), subscription.clone());
        Ok(())
    }

    async fn delete_push_subscription(&self, subject_id: &str) -> Result<()> {
        self.check_write("delete_push_subscription")?;
        self.subscriptions.lock().unwrap().remove(subject_id);
        Ok(())
    }

    async fn fetch_push_subscription(&self, subject_id: &str) -> Result<Option<PushSubscription>> {
        Ok(self.subscriptions.lock().unwrap().get(subject_id).cloned())
    }
}

pub struct FakePlatform {
    pub embedded: AtomicBool,
    pub permission: Mutex<PermissionState>,
    pub prompt_answer: PermissionState,
    pub prompts: AtomicUsize,
    pub shown: Mutex<Vec<NotificationContent>>,
    pub broken: AtomicBool,
}

impl FakePlatform {
    pub fn new(embedded: bool, permission: PermissionState) -> Arc<Self> {
        Arc::new(Self {
            embedded: AtomicBool::new(embedded),
            permission: Mutex::new(permission),
            prompt_answer: PermissionState::Granted,
            prompts: AtomicUsize::new(0),
            shown: Mutex::new(Vec::new()),
            broken: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn is_embedded(&self) -> bool {
        self.embedded.load(Ordering::SeqCst)
    }

    fn permission_state(&self) -> PermissionState {
        *self.permission.lock().unwrap()
    }

    fn platform_name(&self) -> String {
        "Chrome".to_string()
    }

    async fn prompt_permission(&self) -> PermissionState {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        *self.permission.lock().unwrap() = self.prompt_answer;
        self.prompt_answer
    }

    fn show_notification(&self, content: &NotificationContent) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ReminderError::DeliveryConstruction("Illegal constructor".into()));
        }
        self.shown.lock().unwrap().push(content.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingOutput {
    pub plays: AtomicUsize,
}

impl AudioOutput for CountingOutput {
    fn play(&self, _sequence: &ToneSequence) -> Result<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub service: Arc<ReminderService>,
    pub gateway: Arc<FakeGateway>,
    pub platform: Arc<FakePlatform>,
    pub clock: Arc<ManualClock>,
    pub audio: Arc<CountingOutput>,
}

impl Harness {
    pub fn new(gateway: Arc<FakeGateway>, platform: Arc<FakePlatform>, start: DateTime<Utc>) -> Self {
        let clock = Arc::new(ManualClock::new(start));
        let audio = Arc::new(CountingOutput::default());
        let service = ReminderService::new(
            config(),
            gateway.clone(),
            LocalCache::in_memory().unwrap(),
            platform.clone(),
            audio.clone(),
        )
        .with_clock(clock.clone());
        Self {
            service: Arc::new(service),
            gateway,
            platform,
            clock,
            audio,
        }
    }

    pub fn granted(schedules: Vec<MedicationSchedule>, start: DateTime<Utc>) -> Self {
        Self::new(
            FakeGateway::with(schedules),
            FakePlatform::new(false, PermissionState::Granted),
            start,
        )
    }

    pub fn advance(&self, minutes: i64) {
        self.clock.advance(Duration::minutes(minutes));
    }

    pub async fn tick(&self) -> medication_reminder::service::CycleReport {
        self.service
            .run_cycle(SUBJECT, self.service.current_generation())
            .await
            .unwrap()
    }
}
