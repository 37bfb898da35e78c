//! Error taxonomy for the reminder engine.
//!
//! Only two kinds ever reach the user: a denied notification permission and the
//! "recorded locally" notice after a failed remote write. Everything else is
//! recovered by falling back a delivery level or by retrying on the next tick.

/// Errors raised by the reminder engine.
#[derive(Debug, thiserror::Error)]
pub enum ReminderError {
    /// The platform lacks notifications or the context forbids asking for them.
    #[error("notification permission unavailable: {0}")]
    PermissionUnavailable(String),

    /// A platform notification could not be built or shown.
    #[error("failed to construct notification: {0}")]
    DeliveryConstruction(String),

    /// The remote store rejected or never received a write.
    #[error("remote write failed: {0}")]
    RemoteWrite(String),

    /// Some queued actions synced and some did not.
    #[error("{failed} of {attempted} queued actions failed to sync")]
    SyncPartial {
        /// Entries attempted in the pass.
        attempted: usize,
        /// Entries still unsynced afterwards.
        failed: usize,
    },

    /// Playback attempted before the first user gesture.
    #[error("audio playback blocked until a user gesture is observed")]
    AudioPolicy,

    /// The remote store could not be read.
    #[error("remote fetch failed: {0}")]
    Gateway(String),

    #[error("local cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("local cache failure: {0}")]
    CacheFailure(String),

    #[error("push delivery failed: {0}")]
    Push(String),

    /// The push service reports the subscription no longer exists.
    #[error("push subscription expired")]
    SubscriptionGone,

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid reminder time: {0}")]
    InvalidReminderTime(String),

    #[error("snooze of {0} minutes is not offered")]
    InvalidSnooze(u32),

    #[error("cannot apply {event} to an alert in state {from}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },

    #[error("{0} not found")]
    NotFound(String),

    /// The background agent is not running.
    #[error("background agent unavailable: {0}")]
    AgentUnavailable(String),
}

pub type Result<T> = std::result::Result<T, ReminderError>;
