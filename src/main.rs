// A local companion service that reminds a user to take their medication:
// it polls the remote store, raises alerts and keeps responses until synced.
use actix_web::{error, web::{self, Data}, App, HttpResponse, HttpServer};
use dotenv::dotenv;
use log::{error, info, warn};
use std::{env, process::exit, sync::Arc};

use medication_reminder::agent::spawn_agent;
use medication_reminder::alarm::AudioOutput;
use medication_reminder::cache::LocalCache;
use medication_reminder::config::{ReminderConfig, ServiceSettings};
use medication_reminder::gateway::RestGateway;
use medication_reminder::platform::{HostPlatform, Platform};
use medication_reminder::push::PushSender;
use medication_reminder::routes;
use medication_reminder::types::SharedService;
use medication_reminder::util::{self, HOST, PORT, VAR_REMOTE_API_KEY, VAR_REMOTE_URL};
use medication_reminder::vapid::VapidSigner;
use medication_reminder::ReminderService;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    let check = util::check_environment_vars();
    if check.is_err() {
        eprintln!("Missing environment variable");
        eprintln!("Required environment variables: {VAR_REMOTE_URL} {VAR_REMOTE_API_KEY}");
        exit(1)
    }
    util::init_logging();

    let (service, platform) = match build_service() {
        Ok(built) => built,
        Err(e) => {
            error!("Failed to start: {e}");
            eprintln!("Failed to start: {e}");
            exit(1)
        }
    };
    let service_data = Data::new(service);
    let platform_data = Data::new(platform);

    let host = env::var(HOST).unwrap_or(String::from("127.0.0.1"));
    let port = env::var(PORT).unwrap_or(String::from("9898"));
    info!("Listening on {host}:{port}");

    let server_handle = HttpServer::new(move || {
        let json_cfg = web::JsonConfig::default()
            .error_handler(|err, _req| {
                error!("Json config error: {}", err);
                error::InternalError::from_response(err, HttpResponse::BadRequest().into()).into()
            });
        App::new()
            .app_data(Data::clone(&service_data))
            .app_data(Data::clone(&platform_data))
            .app_data(json_cfg)
            .configure(routes::configure)
    })
        .bind(format!("{}:{}", host, port))?
        .run();

    tokio::select! {
        result = server_handle => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

fn build_service() -> medication_reminder::Result<(SharedService, Arc<HostPlatform>)> {
    let settings = ServiceSettings::from_env()?;
    let config = ReminderConfig::from_env()?;

    let gateway = Arc::new(RestGateway::new(&settings.remote_url, &settings.remote_api_key)?);
    let cache = LocalCache::open(settings.cache_path.clone())?;
    let platform = Arc::new(HostPlatform::new(config.embedded));

    let mut service = ReminderService::new(config, gateway, cache, platform.clone(), audio_output());
    match &settings.vapid_key_path {
        Some(path) => {
            let signer = VapidSigner::load_or_generate(path, &settings.vapid_subject)?;
            info!("Web Push enabled, public key {}", signer.public_key());
            service = service.with_push(PushSender::new(signer)?);
        }
        None => info!("VAPID key path not set, Web Push disabled"),
    }
    let service = Arc::new(service);

    let agent_platform: Arc<dyn Platform> = platform.clone();
    match spawn_agent(agent_platform) {
        Ok((agent, _task)) => {
            service.attach_agent(agent);
        }
        Err(e) => warn!("Background agent unavailable, polling only: {e}"),
    }
    Ok((service, platform))
}

#[cfg(feature = "speaker")]
fn audio_output() -> Arc<dyn AudioOutput> {
    Arc::new(medication_reminder::alarm::speaker::SpeakerOutput::new())
}

#[cfg(not(feature = "speaker"))]
fn audio_output() -> Arc<dyn AudioOutput> {
    Arc::new(medication_reminder::alarm::SilentOutput)
}
