//! The foreground reminder engine.
//!
//! Owns the alert board and the monitor lifecycle, and ties detection,
//! delivery, the local cache and the remote gateway together.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex as StdMutex,
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast::error::RecvError, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::agent::{AgentHandle, AgentMessage, ForegroundMessage};
use crate::alarm::{AlarmEmitter, AudioOutput};
use crate::alert::{Alert, AlertBoard, AlertResponse, Offer};
use crate::cache::LocalCache;
use crate::clock::{Clock, SystemClock};
use crate::config::ReminderConfig;
use crate::delivery::{self, DeliveryOutcome, DeliverySelector, EnvironmentInfo, PermissionOutcome};
use crate::detection::{detect_due, merge_local_markers};
use crate::error::{ReminderError, Result};
use crate::events::{EngineEvent, EventBus, SequencedEvent, STORED_LOCALLY_MESSAGE};
use crate::models::{DueReason, MedicationSchedule, PushPayload, PushSubscription};
use crate::monitor::{start_monitoring_loop, CycleGuard};
use crate::platform::{EnvironmentReport, NotificationContent, Platform};
use crate::push::PushSender;
use crate::types::{MonitorHandle, SharedGateway};
use crate::util::get_short_token;

/// What one polling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub due: usize,
    pub delivered: usize,
    pub queued: usize,
    pub synced: usize,
    /// The pass noticed it was superseded and discarded its results.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceipt {
    pub alert: Alert,
    pub local_id: i64,
    /// False when only the local copy was written.
    pub synced: bool,
    pub snoozed_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionReport {
    pub outcome: PermissionOutcome,
    pub hint: Option<&'static str>,
}

pub struct ReminderService {
    config: ReminderConfig,
    gateway: SharedGateway,
    cache: LocalCache,
    platform: Arc<dyn Platform>,
    alarm: Arc<AlarmEmitter>,
    selector: DeliverySelector,
    clock: Arc<dyn Clock>,
    push: Option<Arc<PushSender>>,
    events: EventBus,
    board: Mutex<AlertBoard>,
    monitor: Mutex<Option<MonitorHandle>>,
    subject: StdMutex<Option<String>>,
    generation: AtomicU64,
    active_cycles: Arc<AtomicUsize>,
    sync_lock: Mutex<()>,
    agent: StdMutex<Option<AgentHandle>>,
}

impl ReminderService {
    pub fn new(
        config: ReminderConfig,
        gateway: SharedGateway,
        cache: LocalCache,
        platform: Arc<dyn Platform>,
        audio: Arc<dyn AudioOutput>,
    ) -> Self {
        let alarm = Arc::new(AlarmEmitter::new(audio));
        Self {
            selector: DeliverySelector::new(Arc::clone(&platform), Arc::clone(&alarm)),
            config,
            gateway,
            cache,
            platform,
            alarm,
            clock: Arc::new(SystemClock),
            push: None,
            events: EventBus::default(),
            board: Mutex::new(AlertBoard::new()),
            monitor: Mutex::new(None),
            subject: StdMutex::new(None),
            generation: AtomicU64::new(0),
            active_cycles: Arc::new(AtomicUsize::new(0)),
            sync_lock: Mutex::new(()),
            agent: StdMutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_push(mut self, push: PushSender) -> Self {
        self.push = Some(Arc::new(push));
        self
    }

    pub fn config(&self) -> &ReminderConfig {
        &self.config
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn publish(&self, event: EngineEvent) -> u64 {
        self.events.publish(event, self.now())
    }

    fn current_subject(&self) -> Option<String> {
        match self.subject.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_subject(&self, subject_id: Option<String>) {
        match self.subject.lock() {
            Ok(mut guard) => *guard = subject_id,
            Err(poisoned) => *poisoned.into_inner() = subject_id,
        }
    }

    /// Starts polling for `subject_id`, replacing any running loop.
    pub async fn start_monitoring(self: &Arc<Self>, subject_id: &str) -> u64 {
        let mut monitor = self.monitor.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_subject(Some(subject_id.to_string()));

        if let Some(existing) = monitor.take() {
            existing.cancel.try_send(true).ok();
            info!(
                "Replacing monitor for ...{} (generation {})",
                get_short_token(&existing.subject_id),
                existing.generation
            );
        }

        let (cancel, cancel_rx) = mpsc::channel(1);
        tokio::spawn(start_monitoring_loop(
            Arc::clone(self),
            subject_id.to_string(),
            generation,
            cancel_rx,
        ));
        *monitor = Some(MonitorHandle {
            subject_id: subject_id.to_string(),
            generation,
            cancel,
        });
        info!("Monitoring ...{} (generation {generation})", get_short_token(subject_id));
        generation
    }

    /// Cancels the running loop. Returns whether one was running.
    pub async fn stop_monitoring(&self) -> bool {
        let mut monitor = self.monitor.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        match monitor.take() {
            Some(existing) => {
                existing.cancel.try_send(true).ok();
                info!("Stopped monitoring ...{}", get_short_token(&existing.subject_id));
                true
            }
            None => false,
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Monitor loops that have not exited yet.
    pub fn active_cycles(&self) -> usize {
        self.active_cycles.load(Ordering::SeqCst)
    }

    pub(crate) fn enter_cycle(&self) -> CycleGuard {
        CycleGuard::enter(&self.active_cycles)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == generation
    }

    /// One polling pass: fetch, detect, stamp markers, deliver, flush.
    ///
    /// A pass superseded before stamping discards its results. One superseded
    /// later still offers what it stamped but skips the flush.
    pub async fn run_cycle(&self, subject_id: &str, generation: u64) -> Result<CycleReport> {
        let schedules = self.load_schedules(subject_id).await?;
        if !self.is_current(generation) {
            return Ok(CycleReport {
                cancelled: true,
                ..CycleReport::default()
            });
        }

        let now = self.now();
        let due = detect_due(now, &schedules, &self.config);
        let mut report = CycleReport {
            due: due.len(),
            ..CycleReport::default()
        };

        for record in &due {
            let consumed_snooze = record.reason == DueReason::SnoozeElapsed;
            self.cache
                .record_notified(&record.schedule_id, now, consumed_snooze)
                .await?;
            if let Err(e) = self.gateway.update_last_notified(&record.schedule_id, now).await {
                warn!("Cooldown marker for {} kept locally only: {e}", record.schedule_id);
            }
            if consumed_snooze {
                if let Err(e) = self.gateway.upsert_snooze_marker(&record.schedule_id, None).await {
                    warn!("Failed to clear snooze marker for {}: {e}", record.schedule_id);
                }
            }
        }

        // Stamped records are in cooldown now and must reach the board even if
        // this pass was superseded meanwhile.
        {
            let mut board = self.board.lock().await;
            for record in &due {
                match board.offer(record, now)? {
                    Offer::Activate(alert) => {
                        if self.present(&mut board, alert) {
                            report.delivered += 1;
                        }
                    }
                    Offer::Queued => report.queued += 1,
                    Offer::Duplicate => debug!("{} already on the board", record.schedule_id),
                }
            }
            if let Some(alert) = board.promote_next(now)? {
                if self.present(&mut board, alert) {
                    report.delivered += 1;
                }
            }
        }

        if !self.is_current(generation) {
            report.cancelled = true;
            return Ok(report);
        }
        report.synced = self.flush_unsynced().await?.synced;
        Ok(report)
    }

    /// Remote schedules merged with local markers, or the cached snapshot when
    /// the remote store is unreachable.
    async fn load_schedules(&self, subject_id: &str) -> Result<Vec<MedicationSchedule>> {
        let cached = self.cache.cached_schedules().await?;
        match self.gateway.fetch_due_reminders(subject_id).await {
            Ok(remote) => {
                let merged = merge_local_markers(remote, &cached);
                self.cache.cache_schedules(merged.clone()).await?;
                Ok(merged)
            }
            Err(e) => {
                warn!("Using {} cached schedules: {e}", cached.len());
                Ok(cached)
            }
        }
    }

    /// Hands a freshly triggered alert to the delivery chain. Alerts no channel
    /// could show go back to the front of the queue.
    fn present(&self, board: &mut AlertBoard, alert: Alert) -> bool {
        let content = notification_for(&alert);
        match self.selector.deliver(&content) {
            DeliveryOutcome::Delivered(channel) => {
                info!("Alert for {} delivered via {channel:?}", alert.medication_id);
                self.spawn_push(&alert);
                self.publish(EngineEvent::AlertTriggered { alert, channel });
                true
            }
            DeliveryOutcome::Unavailable => {
                error!("No channel could show the alert for {}", alert.medication_id);
                board.requeue_active(&alert.id);
                false
            }
        }
    }

    /// Reaches backgrounded clients too. Never blocks local delivery.
    fn spawn_push(&self, alert: &Alert) {
        let (Some(push), Some(subject_id)) = (self.push.clone(), self.current_subject()) else {
            return;
        };
        let gateway = Arc::clone(&self.gateway);
        let payload = PushPayload::from(alert);
        let now_secs = self.now().timestamp();

        tokio::spawn(async move {
            let subscription = match gateway.fetch_push_subscription(&subject_id).await {
                Ok(Some(subscription)) => subscription,
                Ok(None) => return,
                Err(e) => {
                    warn!("Push skipped, subscription lookup failed: {e}");
                    return;
                }
            };
            match push.send(&subscription, &payload, now_secs).await {
                Ok(()) => {}
                Err(ReminderError::SubscriptionGone) => {
                    if let Err(e) = gateway.delete_push_subscription(&subject_id).await {
                        warn!("Failed to drop expired push subscription: {e}");
                    }
                }
                Err(e) => warn!("Push for {} failed: {e}", payload.medication_id),
            }
        });
    }

    async fn promote_next(&self) -> Result<()> {
        let mut board = self.board.lock().await;
        if let Some(alert) = board.promote_next(self.now())? {
            self.present(&mut board, alert);
        }
        Ok(())
    }

    /// Resolves the active alert and dual-writes the resulting log entry.
    pub async fn respond(
        &self,
        alert_id: &str,
        response: AlertResponse,
        note: Option<String>,
    ) -> Result<ResponseReceipt> {
        if let AlertResponse::Snoozed { minutes } = response {
            if !self.config.is_snooze_option(minutes) {
                return Err(ReminderError::InvalidSnooze(minutes));
            }
        }

        let sync_guard = self.sync_lock.lock().await;
        let (resolution, local_id) = {
            let mut board = self.board.lock().await;
            let resolution = board.prepare_response(alert_id, response, self.now(), note)?;
            let local_id = self.cache.log_action(resolution.entry.clone()).await?;
            board.commit_response(&resolution);
            (resolution, local_id)
        };
        let medication_id = resolution.alert.medication_id.clone();

        if let Some(until) = resolution.snoozed_until {
            self.cache.record_snooze(&medication_id, until).await?;
            if let Err(e) = self.gateway.upsert_snooze_marker(&medication_id, Some(until)).await {
                warn!("Snooze marker for {medication_id} kept locally only: {e}");
            }
        }

        let synced = match self.gateway.insert_action_log(&resolution.entry).await {
            Ok(()) => {
                self.cache.mark_synced(local_id).await?;
                true
            }
            Err(e) => {
                warn!("Action {local_id} queued for retry: {e}");
                self.publish(EngineEvent::ActionStoredLocally {
                    message: STORED_LOCALLY_MESSAGE.to_string(),
                });
                false
            }
        };
        drop(sync_guard);

        self.publish(EngineEvent::AlertResolved {
            alert_id: resolution.alert.id.clone(),
            medication_id,
            action: resolution.entry.action,
        });
        self.promote_next().await?;

        Ok(ResponseReceipt {
            alert: resolution.alert,
            local_id,
            synced,
            snoozed_until: resolution.snoozed_until,
        })
    }

    /// Pushes every unsynced entry, each independently of the others.
    pub async fn flush_unsynced(&self) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        let pending = self.cache.get_unsynced_actions().await?;
        let mut report = SyncReport {
            attempted: pending.len(),
            ..SyncReport::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        for entry in pending {
            let result = match self.gateway.insert_action_log(&entry.to_remote()).await {
                Ok(()) => self.cache.mark_synced(entry.id).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    debug!("Action {} still unsynced: {e}", entry.id);
                    report.failed += 1;
                }
            }
        }

        if report.synced > 0 {
            self.publish(EngineEvent::SyncCompleted { count: report.synced });
        }
        if report.failed > 0 {
            warn!(
                "{}",
                ReminderError::SyncPartial {
                    attempted: report.attempted,
                    failed: report.failed,
                }
            );
        }
        Ok(report)
    }

    pub async fn request_notification_permission(&self) -> PermissionReport {
        let outcome = delivery::request_permission(self.platform.as_ref()).await;
        let hint = match outcome {
            PermissionOutcome::Denied => Some(delivery::remediation_hint(&self.platform.platform_name())),
            _ => None,
        };
        PermissionReport { outcome, hint }
    }

    pub fn environment_info(&self) -> EnvironmentInfo {
        self.selector.environment()
    }

    pub fn report_environment(&self, report: &EnvironmentReport) -> EnvironmentInfo {
        self.platform.apply_report(report);
        self.environment_info()
    }

    pub fn unlock_audio(&self) {
        self.alarm.unlock();
    }

    /// Plays the alarm once. Returns false while audio is still locked.
    pub fn test_alarm_sound(&self) -> bool {
        match self.alarm.play_alarm() {
            Ok(()) => true,
            Err(e) => {
                debug!("Test alarm not played: {e}");
                false
            }
        }
    }

    pub fn test_notification(&self) -> DeliveryOutcome {
        let content = NotificationContent {
            title: "Test notification".to_string(),
            body: "Medication reminders are working".to_string(),
            tag: "medication-test".to_string(),
            medication_id: None,
            require_interaction: false,
        };
        let outcome = self.selector.deliver(&content);
        if let DeliveryOutcome::Delivered(channel) = outcome {
            self.publish(EngineEvent::TestNotification { channel });
        }
        outcome
    }

    pub async fn subscribe_push(&self, subject_id: &str, subscription: &PushSubscription) -> Result<()> {
        self.gateway.upsert_push_subscription(subject_id, subscription).await?;
        info!("Push subscription stored for ...{}", get_short_token(subject_id));
        Ok(())
    }

    pub async fn unsubscribe_push(&self, subject_id: &str) -> Result<()> {
        self.gateway.delete_push_subscription(subject_id).await?;
        info!("Push subscription removed for ...{}", get_short_token(subject_id));
        Ok(())
    }

    pub fn push_public_key(&self) -> Option<String> {
        self.push.as_ref().map(|push| push.public_key().to_string())
    }

    pub async fn active_alert(&self) -> Option<Alert> {
        self.board.lock().await.active().cloned()
    }

    pub async fn pending_alerts(&self) -> usize {
        self.board.lock().await.pending_len()
    }

    pub fn snooze_options(&self) -> &[u32] {
        &self.config.snooze_options
    }

    pub fn events_since(&self, after: u64) -> Vec<SequencedEvent> {
        self.events.since(after)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Refreshes the local snapshot for the monitored subject.
    pub async fn refresh_medications(&self) -> Result<usize> {
        let Some(subject_id) = self.current_subject() else {
            return Ok(0);
        };
        let remote = self.gateway.fetch_due_reminders(&subject_id).await?;
        let cached = self.cache.cached_schedules().await?;
        let merged = merge_local_markers(remote, &cached);
        let count = merged.len();
        self.cache.cache_schedules(merged).await?;
        self.publish(EngineEvent::MedicationsUpdated);
        Ok(count)
    }

    /// Listens for agent relays and keeps the handle for inbound messages.
    pub fn attach_agent(self: &Arc<Self>, agent: AgentHandle) -> JoinHandle<()> {
        let mut relay = agent.subscribe();
        match self.agent.lock() {
            Ok(mut guard) => *guard = Some(agent),
            Err(poisoned) => *poisoned.into_inner() = Some(agent),
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match relay.recv().await {
                    Ok(ForegroundMessage::MedicationsUpdated) => match service.refresh_medications().await {
                        Ok(count) => debug!("Refreshed {count} medications"),
                        Err(e) => warn!("Medication refresh failed: {e}"),
                    },
                    Ok(ForegroundMessage::SyncRequested) => {
                        if let Err(e) = service.flush_unsynced().await {
                            warn!("Requested sync failed: {e}");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => warn!("Missed {missed} agent messages"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn post_agent_message(&self, message: AgentMessage) -> Result<()> {
        let agent = match self.agent.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match agent {
            Some(agent) => agent.post(message).await,
            None => Err(ReminderError::AgentUnavailable("agent not started".into())),
        }
    }
}

fn notification_for(alert: &Alert) -> NotificationContent {
    NotificationContent {
        title: alert.title(),
        body: alert.body(),
        tag: format!("medication-{}", alert.medication_id),
        medication_id: Some(alert.medication_id.clone()),
        require_interaction: true,
    }
}
