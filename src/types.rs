use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};

use crate::gateway::RemoteGateway;
use crate::service::ReminderService;

/// Stops a monitor loop when anything is sent or the sender is dropped.
pub type CancelSender = Sender<bool>;
pub type CancelReceiver = Receiver<bool>;

pub type SharedService = Arc<ReminderService>;
pub type SharedGateway = Arc<dyn RemoteGateway>;

/// The running monitor loop, if any.
pub struct MonitorHandle {
    pub subject_id: String,
    pub generation: u64,
    pub cancel: CancelSender,
}
