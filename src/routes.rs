use actix_web::{
    delete, get,
    http::StatusCode,
    post,
    web::{self, Data},
    HttpResponse, Responder, ResponseError,
};
use log::{debug, info};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

use crate::agent::AgentMessage;
use crate::alert::AlertResponse;
use crate::delivery::DeliveryOutcome;
use crate::error::ReminderError;
use crate::models::{EventsQuery, PushSubscription, ResponseRequest, SnoozeRequest};
use crate::platform::{EnvironmentReport, HostPlatform};
use crate::types::SharedService;
use crate::util::get_short_token;

impl ResponseError for ReminderError {
    fn status_code(&self) -> StatusCode {
        match self {
            ReminderError::NotFound(_) => StatusCode::NOT_FOUND,
            ReminderError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ReminderError::InvalidSnooze(_)
            | ReminderError::InvalidReminderTime(_)
            | ReminderError::Config(_) => StatusCode::BAD_REQUEST,
            ReminderError::Gateway(_)
            | ReminderError::RemoteWrite(_)
            | ReminderError::Push(_)
            | ReminderError::SubscriptionGone
            | ReminderError::Http(_) => StatusCode::BAD_GATEWAY,
            ReminderError::AgentUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

/// How long a surface waits on `/notifications/next` before getting a 204.
const SURFACE_POLL_TIMEOUT: Duration = Duration::from_secs(25);

#[get("/health")]
pub async fn health() -> impl Responder {
    info!("Health check");
    HttpResponse::Ok()
}

#[post("/monitor/stop")]
async fn stop_monitoring(service: Data<SharedService>) -> impl Responder {
    let was_running = service.stop_monitoring().await;
    HttpResponse::Ok().json(json!({ "stopped": was_running }))
}

#[post("/monitor/{subject_id}")]
async fn start_monitoring(subject_id: web::Path<String>, service: Data<SharedService>) -> impl Responder {
    debug!("monitor:: start requested for ...{}", get_short_token(&subject_id));
    let generation = service.start_monitoring(&subject_id).await;
    HttpResponse::Ok().json(json!({ "generation": generation }))
}

#[get("/alerts/active")]
async fn active_alert(service: Data<SharedService>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "alert": service.active_alert().await,
        "pending": service.pending_alerts().await,
    }))
}

#[post("/alerts/{alert_id}/taken")]
async fn mark_taken(
    alert_id: web::Path<String>,
    payload: Option<web::Json<ResponseRequest>>,
    service: Data<SharedService>,
) -> Result<HttpResponse, ReminderError> {
    let note = payload.and_then(|p| p.into_inner().note);
    let receipt = service.respond(&alert_id, AlertResponse::Taken, note).await?;
    Ok(HttpResponse::Ok().json(receipt))
}

#[post("/alerts/{alert_id}/snooze")]
async fn snooze(
    alert_id: web::Path<String>,
    payload: web::Json<SnoozeRequest>,
    service: Data<SharedService>,
) -> Result<HttpResponse, ReminderError> {
    let SnoozeRequest { minutes, note } = payload.into_inner();
    let receipt = service
        .respond(&alert_id, AlertResponse::Snoozed { minutes }, note)
        .await?;
    Ok(HttpResponse::Ok().json(receipt))
}

#[post("/alerts/{alert_id}/skip")]
async fn skip(
    alert_id: web::Path<String>,
    payload: Option<web::Json<ResponseRequest>>,
    service: Data<SharedService>,
) -> Result<HttpResponse, ReminderError> {
    let note = payload.and_then(|p| p.into_inner().note);
    let receipt = service.respond(&alert_id, AlertResponse::Skipped, note).await?;
    Ok(HttpResponse::Ok().json(receipt))
}

#[get("/snooze-options")]
async fn snooze_options(service: Data<SharedService>) -> impl Responder {
    HttpResponse::Ok().json(service.snooze_options())
}

#[post("/permission")]
async fn request_permission(service: Data<SharedService>) -> impl Responder {
    HttpResponse::Ok().json(service.request_notification_permission().await)
}

#[get("/environment")]
async fn environment(service: Data<SharedService>) -> impl Responder {
    HttpResponse::Ok().json(service.environment_info())
}

#[post("/environment")]
async fn report_environment(payload: web::Json<EnvironmentReport>, service: Data<SharedService>) -> impl Responder {
    HttpResponse::Ok().json(service.report_environment(&payload))
}

#[post("/gesture")]
async fn gesture(service: Data<SharedService>) -> impl Responder {
    service.unlock_audio();
    HttpResponse::Ok()
}

#[post("/diagnostics/alarm")]
async fn test_alarm(service: Data<SharedService>) -> impl Responder {
    HttpResponse::Ok().json(json!({ "played": service.test_alarm_sound() }))
}

#[post("/diagnostics/notification")]
async fn test_notification(service: Data<SharedService>) -> impl Responder {
    let body = match service.test_notification() {
        DeliveryOutcome::Delivered(channel) => json!({ "delivered": true, "channel": channel }),
        DeliveryOutcome::Unavailable => json!({ "delivered": false }),
    };
    HttpResponse::Ok().json(body)
}

#[get("/push/public-key")]
async fn push_public_key(service: Data<SharedService>) -> impl Responder {
    match service.push_public_key() {
        Some(key) => HttpResponse::Ok().json(json!({ "publicKey": key })),
        None => HttpResponse::NotFound().json(json!({ "error": "push is not configured" })),
    }
}

#[post("/push/subscription/{subject_id}")]
async fn subscribe_push(
    subject_id: web::Path<String>,
    payload: web::Json<PushSubscription>,
    service: Data<SharedService>,
) -> Result<HttpResponse, ReminderError> {
    service.subscribe_push(&subject_id, &payload).await?;
    Ok(HttpResponse::Ok().finish())
}

#[delete("/push/subscription/{subject_id}")]
async fn unsubscribe_push(subject_id: web::Path<String>, service: Data<SharedService>) -> Result<HttpResponse, ReminderError> {
    service.unsubscribe_push(&subject_id).await?;
    Ok(HttpResponse::Ok().finish())
}

#[post("/agent/message")]
async fn agent_message(
    payload: web::Json<AgentMessage>,
    service: Data<SharedService>,
) -> Result<HttpResponse, ReminderError> {
    service.post_agent_message(payload.into_inner()).await?;
    Ok(HttpResponse::Accepted().finish())
}

/// Long-poll used by a notification surface (a native shell or a top-level
/// tab). The surface counts as attached while a poll is pending.
#[get("/notifications/next")]
async fn next_notification(platform: Data<Arc<HostPlatform>>) -> impl Responder {
    let mut surface = platform.attach_surface();
    match timeout(SURFACE_POLL_TIMEOUT, surface.recv()).await {
        Ok(Ok(content)) => HttpResponse::Ok().json(content),
        _ => HttpResponse::NoContent().finish(),
    }
}

#[get("/events")]
async fn events(query: web::Query<EventsQuery>, service: Data<SharedService>) -> impl Responder {
    HttpResponse::Ok().json(service.events_since(query.after.unwrap_or(0)))
}

/// Registers every route. `/monitor/stop` must precede `/monitor/{subject_id}`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(stop_monitoring)
        .service(start_monitoring)
        .service(active_alert)
        .service(mark_taken)
        .service(snooze)
        .service(skip)
        .service(snooze_options)
        .service(request_permission)
        .service(environment)
        .service(report_environment)
        .service(gesture)
        .service(test_alarm)
        .service(test_notification)
        .service(push_public_key)
        .service(subscribe_push)
        .service(unsubscribe_push)
        .service(agent_message)
        .service(next_notification)
        .service(events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::SilentOutput;
    use crate::cache::LocalCache;
    use crate::config::ReminderConfig;
    use crate::gateway::RestGateway;
    use crate::platform::HostPlatform;
    use crate::service::ReminderService;
    use actix_web::{test, App};
    use serde_json::Value;

    fn service() -> SharedService {
        let gateway = Arc::new(RestGateway::new("http://127.0.0.1:9", "test-key").unwrap());
        Arc::new(ReminderService::new(
            ReminderConfig::default(),
            gateway,
            LocalCache::in_memory().unwrap(),
            Arc::new(HostPlatform::new(true)),
            Arc::new(SilentOutput),
        ))
    }

    #[actix_web::test]
    async fn stop_is_not_mistaken_for_a_subject() {
        let app = test::init_service(App::new().app_data(Data::new(service())).configure(configure)).await;
        let req = test::TestRequest::post().uri("/monitor/stop").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["stopped"], false);
    }

    #[actix_web::test]
    async fn unknown_alert_is_404() {
        let app = test::init_service(App::new().app_data(Data::new(service())).configure(configure)).await;
        let req = test::TestRequest::post().uri("/alerts/nope/taken").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn unoffered_snooze_is_rejected() {
        let app = test::init_service(App::new().app_data(Data::new(service())).configure(configure)).await;
        let req = test::TestRequest::post()
            .uri("/alerts/any/snooze")
            .set_json(json!({ "minutes": 7 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn embedded_permission_is_blocked() {
        let app = test::init_service(App::new().app_data(Data::new(service())).configure(configure)).await;
        let req = test::TestRequest::post().uri("/permission").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["outcome"], "blocked-embedded");

        let req = test::TestRequest::get().uri("/snooze-options").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!([5, 10, 15, 30, 60]));
    }

    #[actix_web::test]
    async fn diagnostics_report_to_the_event_feed() {
        let app = test::init_service(App::new().app_data(Data::new(service())).configure(configure)).await;
        let req = test::TestRequest::post().uri("/diagnostics/notification").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["channel"], "visual-alert");

        let req = test::TestRequest::get().uri("/events?after=0").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body[0]["type"], "test-notification");
        assert_eq!(body[0]["seq"], 1);
    }
}
