// Medication reminder engine: polls a remote store for due doses, alerts the
// user through the best channel the host allows, and keeps every response in a
// local queue until the remote store has acknowledged it.
pub mod agent;
pub mod alarm;
pub mod alert;
pub mod cache;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod detection;
pub mod error;
pub mod events;
pub mod gateway;
pub mod models;
pub mod monitor;
pub mod platform;
pub mod push;
pub mod routes;
pub mod service;
pub mod types;
pub mod util;
pub mod vapid;

pub use error::{ReminderError, Result};
pub use service::ReminderService;
