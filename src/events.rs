//! Engine events for the surrounding application.
//!
//! Events go out on a broadcast channel for in-process listeners and are also
//! kept in a short sequenced ring so HTTP clients can poll with `?after=N`.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::alert::Alert;
use crate::delivery::Channel;
use crate::models::ActionType;

pub const EVENT_RING_CAPACITY: usize = 256;

pub const STORED_LOCALLY_MESSAGE: &str =
    "Failed to log action, but your response was recorded locally";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// Also what the visual alert channel renders.
    #[serde(rename_all = "camelCase")]
    AlertTriggered { alert: Alert, channel: Channel },
    #[serde(rename_all = "camelCase")]
    AlertResolved {
        alert_id: String,
        medication_id: String,
        action: ActionType,
    },
    SyncCompleted { count: usize },
    /// The remote leg of a dual-write failed.
    ActionStoredLocally { message: String },
    MedicationsUpdated,
    TestNotification { channel: Channel },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

struct Ring {
    next_seq: u64,
    events: VecDeque<SequencedEvent>,
}

pub struct EventBus {
    sender: broadcast::Sender<SequencedEvent>,
    ring: Mutex<Ring>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            ring: Mutex::new(Ring {
                next_seq: 1,
                events: VecDeque::with_capacity(capacity),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn publish(&self, event: EngineEvent, at: DateTime<Utc>) -> u64 {
        let mut ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sequenced = SequencedEvent {
            seq: ring.next_seq,
            at,
            event,
        };
        ring.next_seq += 1;
        if ring.events.len() == self.capacity {
            ring.events.pop_front();
        }
        ring.events.push_back(sequenced.clone());
        drop(ring);

        let seq = sequenced.seq;
        // No receivers is normal for a headless service.
        if self.sender.send(sequenced).is_err() {
            debug!("Event {seq} published with no live subscribers");
        }
        seq
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencedEvent> {
        self.sender.subscribe()
    }

    /// Events with a sequence number greater than `after`, oldest first.
    pub fn since(&self, after: u64) -> Vec<SequencedEvent> {
        let ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.events.iter().filter(|e| e.seq > after).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_RING_CAPACITY)
    }
}
