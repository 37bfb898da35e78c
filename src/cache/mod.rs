//! Local durable cache: the medication snapshot used when the remote store is
//! unreachable and the queue of action log entries not yet acknowledged
//! remotely.
//!
//! A single worker thread owns the SQLite connection, so every operation is
//! atomic at the record level and callers never block the async runtime.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;

mod migrations;

use migrations::run_migrations;

use crate::error::{ReminderError, Result};
use crate::models::{ActionLogEntry, ActionType, MedicationSchedule, NewActionLog};

type CacheTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum CacheCommand {
    Execute(CacheTask),
    Shutdown,
}

struct CacheInner {
    sender: mpsc::Sender<CacheCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(CacheCommand::Shutdown) {
                error!("Failed to send shutdown to cache thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join cache thread: {join_err:?}");
            }
        }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| ReminderError::CacheFailure(format!("invalid datetime '{value}': {err}")))
}

fn parse_optional_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_datetime).transpose()
}

#[derive(Clone)]
pub struct LocalCache {
    inner: Arc<CacheInner>,
    location: Arc<Option<PathBuf>>,
}

impl LocalCache {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ReminderError::CacheFailure(format!(
                    "failed to create cache directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let path_for_thread = path.clone();
        let cache = Self::spawn(move || Connection::open(&path_for_thread), Some(path))?;
        if let Some(path) = cache.path() {
            info!("Local cache initialized at {}", path.display());
        }
        Ok(cache)
    }

    /// Non-persistent cache, for tests and diagnostics.
    pub fn in_memory() -> Result<Self> {
        Self::spawn(Connection::open_in_memory, None)
    }

    fn spawn<F>(open: F, location: Option<PathBuf>) -> Result<Self>
    where
        F: FnOnce() -> rusqlite::Result<Connection> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<CacheCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let worker = thread::Builder::new()
            .name("reminder-cache".into())
            .spawn(move || {
                let mut conn = match open() {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(ReminderError::Cache(err)));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                if ready_tx.send(run_migrations(&mut conn)).is_err() {
                    error!("Cache initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        CacheCommand::Execute(task) => task(&mut conn),
                        CacheCommand::Shutdown => break,
                    }
                }

                debug!("Cache thread shutting down");
            })
            .map_err(|e| ReminderError::CacheFailure(format!("failed to spawn cache thread: {e}")))?;

        ready_rx.recv().map_err(|_| {
            ReminderError::CacheFailure("cache worker exited before signaling readiness".into())
        })??;

        Ok(Self {
            inner: Arc::new(CacheInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            location: Arc::new(location),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = CacheCommand::Execute(Box::new(move |conn| {
            if reply_tx.send(task(conn)).is_err() {
                debug!("Cache caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|err| ReminderError::CacheFailure(format!("failed to reach cache thread: {err}")))?;

        reply_rx
            .await
            .map_err(|_| ReminderError::CacheFailure("cache thread terminated unexpectedly".into()))?
    }

    /// Replaces the medication snapshot wholesale.
    pub async fn cache_schedules(&self, schedules: Vec<MedicationSchedule>) -> Result<()> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM medications", [])?;
            let cached_at = Utc::now().to_rfc3339();
            for (position, schedule) in schedules.iter().enumerate() {
                tx.execute(
                    "INSERT INTO medications (id, payload, last_notified_at, snoozed_until, position, cached_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        schedule.id,
                        serde_json::to_string(schedule)?,
                        schedule.last_notified_at.map(|dt| dt.to_rfc3339()),
                        schedule.snoozed_until.map(|dt| dt.to_rfc3339()),
                        position as i64,
                        cached_at,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn cached_schedules(&self) -> Result<Vec<MedicationSchedule>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload, last_notified_at, snoozed_until FROM medications ORDER BY position",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(payload, last_notified_at, snoozed_until)| {
                    let mut schedule: MedicationSchedule = serde_json::from_str(&payload)?;
                    schedule.last_notified_at = parse_optional_datetime(last_notified_at)?;
                    schedule.snoozed_until = parse_optional_datetime(snoozed_until)?;
                    Ok(schedule)
                })
                .collect()
        })
        .await
    }

    /// Stamps the cooldown marker, optionally consuming an elapsed snooze.
    pub async fn record_notified(
        &self,
        schedule_id: &str,
        at: DateTime<Utc>,
        clear_snooze: bool,
    ) -> Result<()> {
        let schedule_id = schedule_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE medications
                 SET last_notified_at = ?2,
                     snoozed_until = CASE WHEN ?3 THEN NULL ELSE snoozed_until END
                 WHERE id = ?1",
                params![schedule_id, at.to_rfc3339(), clear_snooze],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn record_snooze(&self, schedule_id: &str, until: DateTime<Utc>) -> Result<()> {
        let schedule_id = schedule_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE medications SET snoozed_until = ?2 WHERE id = ?1",
                params![schedule_id, until.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Appends an unsynced entry and returns its local id.
    pub async fn log_action(&self, entry: NewActionLog) -> Result<i64> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO action_log (medication_id, action, logged_at, note, synced)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![
                    entry.medication_id,
                    entry.action.as_str(),
                    entry.logged_at.to_rfc3339(),
                    entry.note,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Unsynced entries in insertion order.
    pub async fn get_unsynced_actions(&self) -> Result<Vec<ActionLogEntry>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, medication_id, action, logged_at, note, synced
                 FROM action_log WHERE synced = 0 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], read_action_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RawAction::into_entry).collect()
        })
        .await
    }

    pub async fn get_action(&self, id: i64) -> Result<Option<ActionLogEntry>> {
        self.execute(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT id, medication_id, action, logged_at, note, synced
                     FROM action_log WHERE id = ?1",
                    params![id],
                    read_action_row,
                )
                .optional()?;
            raw.map(RawAction::into_entry).transpose()
        })
        .await
    }

    pub async fn mark_synced(&self, id: i64) -> Result<()> {
        self.execute(move |conn| {
            let updated = conn.execute("UPDATE action_log SET synced = 1 WHERE id = ?1", params![id])?;
            if updated == 0 {
                return Err(ReminderError::NotFound(format!("action log entry {id}")));
            }
            Ok(())
        })
        .await
    }
}

struct RawAction {
    id: i64,
    medication_id: String,
    action: String,
    logged_at: String,
    note: String,
    synced: bool,
}

fn read_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAction> {
    Ok(RawAction {
        id: row.get(0)?,
        medication_id: row.get(1)?,
        action: row.get(2)?,
        logged_at: row.get(3)?,
        note: row.get(4)?,
        synced: row.get(5)?,
    })
}

impl RawAction {
    fn into_entry(self) -> Result<ActionLogEntry> {
        Ok(ActionLogEntry {
            id: self.id,
            medication_id: self.medication_id,
            action: self.action.parse::<ActionType>()?,
            logged_at: parse_datetime(&self.logged_at)?,
            note: self.note,
            synced: self.synced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReminderTime;
    use chrono::TimeZone;

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 15, hour, min, 0).unwrap()
    }

    fn entry(medication_id: &str, action: ActionType) -> NewActionLog {
        NewActionLog {
            medication_id: medication_id.to_string(),
            action,
            logged_at: at(8, 2),
            note: String::new(),
        }
    }

    #[tokio::test]
    async fn unsynced_queue_keeps_insertion_order() {
        let cache = LocalCache::in_memory().unwrap();
        let first = cache.log_action(entry("iron", ActionType::Taken)).await.unwrap();
        let second = cache.log_action(entry("vit-d", ActionType::Skipped)).await.unwrap();
        let third = cache.log_action(entry("iron", ActionType::Snoozed)).await.unwrap();

        cache.mark_synced(second).await.unwrap();

        let pending = cache.get_unsynced_actions().await.unwrap();
        let ids: Vec<i64> = pending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first, third]);
        assert!(pending.iter().all(|e| !e.synced));
        assert_eq!(pending[1].action, ActionType::Snoozed);

        let synced = cache.get_action(second).await.unwrap().unwrap();
        assert!(synced.synced);
        assert_eq!(synced.medication_id, "vit-d");
    }

    #[tokio::test]
    async fn marking_an_unknown_entry_fails() {
        let cache = LocalCache::in_memory().unwrap();
        assert!(matches!(cache.mark_synced(42).await, Err(ReminderError::NotFound(_))));
    }

    #[tokio::test]
    async fn snapshot_is_replaced_and_markers_survive() {
        let cache = LocalCache::in_memory().unwrap();
        let iron = MedicationSchedule::new("iron", "Iron Tablets", "65mg", vec![ReminderTime::daily("08:00").unwrap()]);
        let vit_d = MedicationSchedule::new("vit-d", "Vitamin D", "1000IU", vec![ReminderTime::daily("09:00").unwrap()]);

        cache.cache_schedules(vec![iron.clone(), vit_d]).await.unwrap();
        cache.record_notified("iron", at(8, 2), false).await.unwrap();
        cache.record_snooze("iron", at(8, 12)).await.unwrap();

        let cached = cache.cached_schedules().await.unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0].last_notified_at, Some(at(8, 2)));
        assert_eq!(cached[0].snoozed_until, Some(at(8, 12)));

        cache.record_notified("iron", at(8, 13), true).await.unwrap();
        let cached = cache.cached_schedules().await.unwrap();
        assert_eq!(cached[0].snoozed_until, None);

        cache.cache_schedules(vec![iron]).await.unwrap();
        let cached = cache.cached_schedules().await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].last_notified_at, None);
    }

    #[tokio::test]
    async fn queue_survives_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("reminders.sqlite3");

        {
            let cache = LocalCache::open(path.clone()).unwrap();
            cache.log_action(entry("iron", ActionType::Taken)).await.unwrap();
        }

        let reopened = LocalCache::open(path).unwrap();
        let pending = reopened.get_unsynced_actions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].medication_id, "iron");
    }
}
