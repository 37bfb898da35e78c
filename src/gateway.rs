//! Narrow interface to the remote store, plus its PostgREST-style client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ReminderError, Result};
use crate::models::{MedicationSchedule, NewActionLog, PushKeys, PushSubscription};
use crate::util::get_short_token;

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Active schedules for the subject; the store may pre-filter by time.
    async fn fetch_due_reminders(&self, subject_id: &str) -> Result<Vec<MedicationSchedule>>;

    async fn update_last_notified(&self, schedule_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn insert_action_log(&self, entry: &NewActionLog) -> Result<()>;

    /// `None` clears the marker.
    async fn upsert_snooze_marker(&self, schedule_id: &str, until: Option<DateTime<Utc>>) -> Result<()>;

    async fn upsert_push_subscription(&self, subject_id: &str, subscription: &PushSubscription) -> Result<()>;

    async fn delete_push_subscription(&self, subject_id: &str) -> Result<()>;

    async fn fetch_push_subscription(&self, subject_id: &str) -> Result<Option<PushSubscription>>;
}

/// Talks to a PostgREST endpoint (`/rest/v1/...`) with an API key.
pub struct RestGateway {
    client: Client,
    base_url: String,
}

#[derive(Serialize, Deserialize)]
struct PushSubscriptionRow {
    endpoint: String,
    p256dh: String,
    auth: String,
}

impl RestGateway {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| ReminderError::Config("remote API key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ReminderError::Config("remote API key is not a valid header value".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| ReminderError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    async fn write(&self, what: &str, request: RequestBuilder) -> Result<()> {
        let response = request
            .send()
            .await
            .map_err(|e| ReminderError::RemoteWrite(format!("{what}: {e}")))?;
        check_status(response, what).await.map_err(ReminderError::RemoteWrite)?;
        Ok(())
    }
}

async fn check_status(response: Response, what: &str) -> std::result::Result<Response, String> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("{what}: {status} {body}"))
}

#[async_trait]
impl RemoteGateway for RestGateway {
    async fn fetch_due_reminders(&self, subject_id: &str) -> Result<Vec<MedicationSchedule>> {
        let response = self
            .client
            .post(self.url("rpc/get_due_reminders"))
            .json(&json!({ "p_user_id": subject_id }))
            .send()
            .await
            .map_err(|e| ReminderError::Gateway(e.to_string()))?;
        let response = check_status(response, "get_due_reminders")
            .await
            .map_err(ReminderError::Gateway)?;

        let schedules: Vec<MedicationSchedule> = response
            .json()
            .await
            .map_err(|e| ReminderError::Gateway(format!("malformed schedules: {e}")))?;
        debug!("Fetched {} schedules for ...{}", schedules.len(), get_short_token(subject_id));
        Ok(schedules)
    }

    async fn update_last_notified(&self, schedule_id: &str, at: DateTime<Utc>) -> Result<()> {
        let request = self
            .client
            .patch(self.url("medications"))
            .query(&[("id", format!("eq.{schedule_id}"))])
            .header("Prefer", "return=minimal")
            .json(&json!({ "last_notified_at": at }));
        self.write("update_last_notified", request).await
    }

    async fn insert_action_log(&self, entry: &NewActionLog) -> Result<()> {
        let request = self
            .client
            .post(self.url("medication_logs"))
            .header("Prefer", "return=minimal")
            .json(entry);
        self.write("insert_action_log", request).await
    }

    async fn upsert_snooze_marker(&self, schedule_id: &str, until: Option<DateTime<Utc>>) -> Result<()> {
        let request = self
            .client
            .post(self.url("medication_snoozes"))
            .query(&[("on_conflict", "medication_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&json!({ "medication_id": schedule_id, "snoozed_until": until }));
        self.write("upsert_snooze_marker", request).await
    }

    async fn upsert_push_subscription(&self, subject_id: &str, subscription: &PushSubscription) -> Result<()> {
        let request = self
            .client
            .post(self.url("push_subscriptions"))
            .query(&[("on_conflict", "user_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&json!({
                "user_id": subject_id,
                "endpoint": subscription.endpoint,
                "p256dh": subscription.keys.p256dh,
                "auth": subscription.keys.auth,
            }));
        self.write("upsert_push_subscription", request).await
    }

    async fn delete_push_subscription(&self, subject_id: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.url("push_subscriptions"))
            .query(&[("user_id", format!("eq.{subject_id}"))]);
        self.write("delete_push_subscription", request).await
    }

    async fn fetch_push_subscription(&self, subject_id: &str) -> Result<Option<PushSubscription>> {
        let response = self
            .client
            .get(self.url("push_subscriptions"))
            .query(&[
                ("user_id", format!("eq.{subject_id}")),
                ("select", "endpoint,p256dh,auth".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await
            .map_err(|e| ReminderError::Gateway(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, "fetch_push_subscription")
            .await
            .map_err(ReminderError::Gateway)?;

        let rows: Vec<PushSubscriptionRow> = response
            .json()
            .await
            .map_err(|e| ReminderError::Gateway(format!("malformed subscription: {e}")))?;
        Ok(rows.into_iter().next().map(|row| PushSubscription {
            endpoint: row.endpoint,
            keys: PushKeys {
                p256dh: row.p256dh,
                auth: row.auth,
            },
        }))
    }
}
