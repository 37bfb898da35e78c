//! Background agent that outlives any single foreground client.
//!
//! It owns no service state. Push payloads are rendered from their own data,
//! and everything else is relayed to foreground listeners over a broadcast
//! channel.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::{ReminderError, Result};
use crate::models::PushPayload;
use crate::platform::{NotificationContent, Platform};

const INBOX_CAPACITY: usize = 32;
const RELAY_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMessage {
    Push { payload: PushPayload },
    UpdateMedications,
    SyncActions,
}

/// What the agent tells foreground instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForegroundMessage {
    MedicationsUpdated,
    SyncRequested,
}

#[derive(Clone)]
pub struct AgentHandle {
    inbox: mpsc::Sender<AgentMessage>,
    relay: broadcast::Sender<ForegroundMessage>,
}

impl AgentHandle {
    pub async fn post(&self, message: AgentMessage) -> Result<()> {
        self.inbox
            .send(message)
            .await
            .map_err(|_| ReminderError::AgentUnavailable("agent inbox closed".into()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ForegroundMessage> {
        self.relay.subscribe()
    }
}

impl From<&PushPayload> for NotificationContent {
    fn from(payload: &PushPayload) -> Self {
        NotificationContent {
            title: payload.title.clone(),
            body: payload.body.clone(),
            tag: payload.tag.clone(),
            medication_id: Some(payload.medication_id.clone()),
            require_interaction: true,
        }
    }
}

/// Starts the agent on the current tokio runtime.
pub fn spawn_agent(platform: Arc<dyn Platform>) -> Result<(AgentHandle, JoinHandle<()>)> {
    let runtime = Handle::try_current().map_err(|e| ReminderError::AgentUnavailable(e.to_string()))?;

    let (inbox, rx) = mpsc::channel(INBOX_CAPACITY);
    let (relay, _) = broadcast::channel(RELAY_CAPACITY);
    let handle = AgentHandle {
        inbox,
        relay: relay.clone(),
    };

    let task = runtime.spawn(run_agent(platform, rx, relay));
    info!("Background agent started");
    Ok((handle, task))
}

async fn run_agent(
    platform: Arc<dyn Platform>,
    mut inbox: mpsc::Receiver<AgentMessage>,
    relay: broadcast::Sender<ForegroundMessage>,
) {
    while let Some(message) = inbox.recv().await {
        match message {
            AgentMessage::Push { payload } => {
                debug!("agent:: rendering push '{}'", payload.tag);
                if let Err(e) = platform.show_notification(&NotificationContent::from(&payload)) {
                    error!("agent:: failed to render push '{}': {e}", payload.tag);
                }
            }
            AgentMessage::UpdateMedications => relay_to(&relay, ForegroundMessage::MedicationsUpdated),
            AgentMessage::SyncActions => relay_to(&relay, ForegroundMessage::SyncRequested),
        }
    }
    warn!("agent:: inbox closed, stopping");
}

fn relay_to(relay: &broadcast::Sender<ForegroundMessage>, message: ForegroundMessage) {
    match relay.send(message) {
        Ok(count) => debug!("agent:: relayed {message:?} to {count} foreground instance(s)"),
        Err(_) => debug!("agent:: no foreground instance for {message:?}"),
    }
}
