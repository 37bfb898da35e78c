//! Picks how a due reminder reaches the user.
//!
//! The environment is probed fresh on each attempt and the fallback chain is an
//! ordered list of capability checks, so every decision can be exercised with a
//! fake [`Platform`].

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::alarm::AlarmEmitter;
use crate::error::ReminderError;
use crate::platform::{NotificationContent, PermissionState, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    /// Web Push to a backgrounded client.
    Push,
    PlatformNotification,
    /// In-process alert; always available.
    VisualAlert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(Channel),
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    pub embedded: bool,
    pub permission_state: PermissionState,
    pub platform_name: String,
}

pub fn probe(platform: &dyn Platform) -> EnvironmentInfo {
    EnvironmentInfo {
        embedded: platform.is_embedded(),
        permission_state: platform.permission_state(),
        platform_name: platform.platform_name(),
    }
}

/// Local channels to try, best first. Always ends with the visual alert.
pub fn plan(env: &EnvironmentInfo) -> Vec<Channel> {
    if env.embedded || env.permission_state != PermissionState::Granted {
        return vec![Channel::VisualAlert];
    }
    vec![Channel::PlatformNotification, Channel::VisualAlert]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionOutcome {
    Granted,
    Denied,
    Unsupported,
    /// Embedded contexts cannot ask; no prompt was shown.
    BlockedEmbedded,
}

/// Asks for notification permission unless the context forbids it.
pub async fn request_permission(platform: &dyn Platform) -> PermissionOutcome {
    if platform.is_embedded() {
        info!("Permission request blocked: running embedded");
        return PermissionOutcome::BlockedEmbedded;
    }
    let state = match platform.permission_state() {
        PermissionState::Default => platform.prompt_permission().await,
        settled => settled,
    };
    match state {
        PermissionState::Granted => PermissionOutcome::Granted,
        PermissionState::Denied => PermissionOutcome::Denied,
        PermissionState::Default | PermissionState::Unsupported => PermissionOutcome::Unsupported,
    }
}

/// How to re-enable notifications after a denial, per platform.
pub fn remediation_hint(platform_name: &str) -> &'static str {
    let name = platform_name.to_ascii_lowercase();
    if name.contains("ios") || name.contains("iphone") || name.contains("ipad") {
        "Open Settings > Notifications, find this app and turn on Allow Notifications. On iOS, web apps must be added to the Home Screen first."
    } else if name.contains("android") {
        "Open Settings > Apps > your browser > Notifications and allow notifications for this site."
    } else if name.contains("edg") {
        "Click the lock icon in the address bar, open Site permissions and set Notifications to Allow."
    } else if name.contains("chrome") || name.contains("chromium") {
        "Click the lock icon in the address bar, open Site settings and set Notifications to Allow."
    } else if name.contains("firefox") {
        "Click the lock icon in the address bar, clear the Blocked notification permission and reload the page."
    } else if name.contains("safari") || name.contains("macos") {
        "Open Safari > Settings > Websites > Notifications and set this site to Allow."
    } else {
        "Allow notifications for this site in your browser or system settings, then reload the page."
    }
}

/// Runs the fallback chain for one alert and sounds the alarm on success.
pub struct DeliverySelector {
    platform: Arc<dyn Platform>,
    alarm: Arc<AlarmEmitter>,
}

impl DeliverySelector {
    pub fn new(platform: Arc<dyn Platform>, alarm: Arc<AlarmEmitter>) -> Self {
        Self { platform, alarm }
    }

    pub fn environment(&self) -> EnvironmentInfo {
        probe(self.platform.as_ref())
    }

    pub fn deliver(&self, content: &NotificationContent) -> DeliveryOutcome {
        let env = self.environment();
        let mut outcome = DeliveryOutcome::Unavailable;

        for channel in plan(&env) {
            match self.attempt(channel, content) {
                Ok(()) => {
                    outcome = DeliveryOutcome::Delivered(channel);
                    break;
                }
                Err(e) => warn!("Delivery via {channel:?} failed, falling back: {e}"),
            }
        }

        if let DeliveryOutcome::Delivered(channel) = outcome {
            debug!("Reminder '{}' delivered via {channel:?}", content.tag);
            if let Err(e) = self.alarm.play_alarm() {
                debug!("Alarm not played: {e}");
            }
        }
        outcome
    }

    fn attempt(&self, channel: Channel, content: &NotificationContent) -> Result<(), ReminderError> {
        match channel {
            Channel::PlatformNotification => self.platform.show_notification(content),
            // The visual alert is the `alert-triggered` event the caller publishes.
            Channel::VisualAlert => Ok(()),
            Channel::Push => Err(ReminderError::DeliveryConstruction(
                "push is sent by the service, not the local selector".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AudioOutput, ToneSequence};
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakePlatform {
        embedded: bool,
        permission: Mutex<PermissionState>,
        prompt_answer: PermissionState,
        prompts: AtomicUsize,
        shown: AtomicUsize,
        broken: bool,
    }

    impl FakePlatform {
        fn new(embedded: bool, permission: PermissionState) -> Self {
            Self {
                embedded,
                permission: Mutex::new(permission),
                prompt_answer: PermissionState::Granted,
                prompts: AtomicUsize::new(0),
                shown: AtomicUsize::new(0),
                broken: false,
            }
        }
    }

    #[async_trait]
    impl Platform for FakePlatform {
        fn is_embedded(&self) -> bool {
            self.embedded
        }

        fn permission_state(&self) -> PermissionState {
            *self.permission.lock().unwrap()
        }

        fn platform_name(&self) -> String {
            "Firefox".into()
        }

        async fn prompt_permission(&self) -> PermissionState {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            *self.permission.lock().unwrap() = self.prompt_answer;
            self.prompt_answer
        }

        fn show_notification(&self, _content: &NotificationContent) -> Result<()> {
            if self.broken {
                return Err(ReminderError::DeliveryConstruction("constructor threw".into()));
            }
            self.shown.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingOutput(AtomicUsize);

    impl AudioOutput for CountingOutput {
        fn play(&self, _sequence: &ToneSequence) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn content() -> NotificationContent {
        NotificationContent {
            title: "Time to take Iron Tablets".into(),
            body: "65mg scheduled for 08:00".into(),
            tag: "medication-iron".into(),
            medication_id: Some("iron".into()),
            require_interaction: true,
        }
    }

    fn selector(platform: Arc<FakePlatform>) -> (DeliverySelector, Arc<CountingOutput>) {
        let output = Arc::new(CountingOutput::default());
        let alarm = Arc::new(AlarmEmitter::new(output.clone()));
        alarm.unlock();
        (DeliverySelector::new(platform, alarm), output)
    }

    #[test]
    fn plan_orders_capability_checks() {
        let env = |embedded, permission_state| EnvironmentInfo {
            embedded,
            permission_state,
            platform_name: "Chrome".into(),
        };
        assert_eq!(plan(&env(true, PermissionState::Granted)), vec![Channel::VisualAlert]);
        assert_eq!(plan(&env(false, PermissionState::Default)), vec![Channel::VisualAlert]);
        assert_eq!(plan(&env(false, PermissionState::Denied)), vec![Channel::VisualAlert]);
        assert_eq!(
            plan(&env(false, PermissionState::Granted)),
            vec![Channel::PlatformNotification, Channel::VisualAlert]
        );
    }

    #[test]
    fn granted_platform_gets_a_notification_and_the_alarm() {
        let platform = Arc::new(FakePlatform::new(false, PermissionState::Granted));
        let (selector, output) = selector(platform.clone());

        assert_eq!(
            selector.deliver(&content()),
            DeliveryOutcome::Delivered(Channel::PlatformNotification)
        );
        assert_eq!(platform.shown.load(Ordering::SeqCst), 1);
        assert_eq!(output.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn construction_failure_falls_back_to_visual() {
        let mut fake = FakePlatform::new(false, PermissionState::Granted);
        fake.broken = true;
        let (selector, output) = selector(Arc::new(fake));

        assert_eq!(selector.deliver(&content()), DeliveryOutcome::Delivered(Channel::VisualAlert));
        assert_eq!(output.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn embedded_always_uses_visual_alert() {
        let platform = Arc::new(FakePlatform::new(true, PermissionState::Granted));
        let (selector, _) = selector(platform.clone());

        assert_eq!(selector.deliver(&content()), DeliveryOutcome::Delivered(Channel::VisualAlert));
        assert_eq!(platform.shown.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn locked_audio_does_not_block_delivery() {
        let platform = Arc::new(FakePlatform::new(false, PermissionState::Default));
        let output = Arc::new(CountingOutput::default());
        let selector = DeliverySelector::new(platform, Arc::new(AlarmEmitter::new(output.clone())));

        assert_eq!(selector.deliver(&content()), DeliveryOutcome::Delivered(Channel::VisualAlert));
        assert_eq!(output.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn embedded_permission_request_never_prompts() {
        let platform = FakePlatform::new(true, PermissionState::Default);
        assert_eq!(request_permission(&platform).await, PermissionOutcome::BlockedEmbedded);
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn permission_is_prompted_once() {
        let platform = FakePlatform::new(false, PermissionState::Default);
        assert_eq!(request_permission(&platform).await, PermissionOutcome::Granted);
        assert_eq!(request_permission(&platform).await, PermissionOutcome::Granted);
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 1);

        let denied = FakePlatform::new(false, PermissionState::Denied);
        assert_eq!(request_permission(&denied).await, PermissionOutcome::Denied);
        assert_eq!(denied.prompts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hints_are_platform_specific() {
        assert!(remediation_hint("Firefox").contains("lock icon"));
        assert!(remediation_hint("iOS Safari").contains("Home Screen"));
        assert!(remediation_hint("Safari").contains("Safari > Settings"));
        assert!(remediation_hint("Android").contains("Apps"));
        assert!(remediation_hint("Edge").contains("Site permissions"));
        assert!(remediation_hint("plan9").contains("browser or system settings"));
    }
}
