//! Capability probe for the host the reminders are shown on.
//!
//! The service never caches what it learns here: embedding and permission
//! are read again on every delivery attempt.

use std::sync::RwLock;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{ReminderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionState {
    /// Never requested.
    Default,
    Granted,
    Denied,
    Unsupported,
}

/// A notification as handed to the platform surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    /// Notifications sharing a tag replace each other.
    pub tag: String,
    pub medication_id: Option<String>,
    pub require_interaction: bool,
}

/// What a client tells the service about where it runs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentReport {
    pub embedded: Option<bool>,
    pub permission: Option<PermissionState>,
    pub platform_name: Option<String>,
}

#[async_trait]
pub trait Platform: Send + Sync {
    fn is_embedded(&self) -> bool;

    fn permission_state(&self) -> PermissionState;

    fn platform_name(&self) -> String;

    /// Asks the host for notification permission. Callers must not invoke
    /// this from an embedded context.
    async fn prompt_permission(&self) -> PermissionState;

    fn show_notification(&self, content: &NotificationContent) -> Result<()>;

    fn apply_report(&self, _report: &EnvironmentReport) {}
}

#[derive(Debug, Clone)]
struct HostEnvironment {
    embedded: bool,
    permission: PermissionState,
    platform_name: String,
}

/// Platform backed by whatever notification surface is attached to the
/// service (a native shell or a top-level tab long-polling for notifications).
pub struct HostPlatform {
    environment: RwLock<HostEnvironment>,
    surface: broadcast::Sender<NotificationContent>,
}

impl HostPlatform {
    pub fn new(embedded: bool) -> Self {
        let (surface, _) = broadcast::channel(16);
        Self {
            environment: RwLock::new(HostEnvironment {
                embedded,
                permission: PermissionState::Default,
                platform_name: std::env::consts::OS.to_string(),
            }),
            surface,
        }
    }

    /// Attaches a surface; notifications are only constructible while at
    /// least one receiver is alive.
    pub fn attach_surface(&self) -> broadcast::Receiver<NotificationContent> {
        self.surface.subscribe()
    }

    fn read(&self) -> HostEnvironment {
        match self.environment.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update<F: FnOnce(&mut HostEnvironment)>(&self, f: F) {
        match self.environment.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl Platform for HostPlatform {
    fn is_embedded(&self) -> bool {
        self.read().embedded
    }

    fn permission_state(&self) -> PermissionState {
        self.read().permission
    }

    fn platform_name(&self) -> String {
        self.read().platform_name
    }

    async fn prompt_permission(&self) -> PermissionState {
        let current = self.permission_state();
        if current != PermissionState::Default {
            return current;
        }
        if self.surface.receiver_count() == 0 {
            debug!("No notification surface attached, permission left undecided");
            return PermissionState::Unsupported;
        }
        self.update(|env| env.permission = PermissionState::Granted);
        info!("Notification permission granted by the attached surface");
        PermissionState::Granted
    }

    fn show_notification(&self, content: &NotificationContent) -> Result<()> {
        self.surface
            .send(content.clone())
            .map(|receivers| debug!("Notification '{}' handed to {receivers} surface(s)", content.tag))
            .map_err(|_| ReminderError::DeliveryConstruction("no notification surface attached".into()))
    }

    fn apply_report(&self, report: &EnvironmentReport) {
        self.update(|env| {
            if let Some(embedded) = report.embedded {
                env.embedded = embedded;
            }
            if let Some(permission) = report.permission {
                env.permission = permission;
            }
            if let Some(name) = report.platform_name.as_ref().filter(|n| !n.trim().is_empty()) {
                env.platform_name = name.trim().to_string();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> NotificationContent {
        NotificationContent {
            title: "Time to take Iron Tablets".into(),
            body: "65mg scheduled for 08:00".into(),
            tag: "medication-iron".into(),
            medication_id: Some("iron".into()),
            require_interaction: true,
        }
    }

    #[test]
    fn notifications_need_an_attached_surface() {
        let platform = HostPlatform::new(false);
        assert!(matches!(
            platform.show_notification(&content()),
            Err(ReminderError::DeliveryConstruction(_))
        ));

        let mut surface = platform.attach_surface();
        platform.show_notification(&content()).unwrap();
        assert_eq!(surface.try_recv().unwrap().tag, "medication-iron");
    }

    #[tokio::test]
    async fn prompt_grants_only_with_a_surface() {
        let platform = HostPlatform::new(false);
        assert_eq!(platform.prompt_permission().await, PermissionState::Unsupported);
        assert_eq!(platform.permission_state(), PermissionState::Default);

        // A surface attaching later can still be asked.
        let _surface = platform.attach_surface();
        assert_eq!(platform.prompt_permission().await, PermissionState::Granted);
        assert_eq!(platform.permission_state(), PermissionState::Granted);
    }

    #[test]
    fn reports_update_the_probe() {
        let platform = HostPlatform::new(false);
        platform.apply_report(&EnvironmentReport {
            embedded: Some(true),
            permission: Some(PermissionState::Denied),
            platform_name: Some(" Safari ".into()),
        });
        assert!(platform.is_embedded());
        assert_eq!(platform.permission_state(), PermissionState::Denied);
        assert_eq!(platform.platform_name(), "Safari");
    }
}
