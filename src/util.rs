use std::env::VarError;
use std::env;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

pub const HOST: &str = "HOST";
pub const PORT: &str = "PORT";

pub const VAR_REMOTE_URL: &str = "REMOTE_URL";
pub const VAR_REMOTE_API_KEY: &str = "REMOTE_API_KEY";
pub const VAR_CACHE_PATH: &str = "CACHE_PATH";
pub const VAR_VAPID_KEY_PATH: &str = "VAPID_KEY_PATH";
pub const VAR_VAPID_SUBJECT: &str = "VAPID_SUBJECT";

pub const VAR_TICK_INTERVAL_S: &str = "TICK_INTERVAL_S";
pub const VAR_TOLERANCE_MIN: &str = "TOLERANCE_MIN";
pub const VAR_COOLDOWN_MIN: &str = "COOLDOWN_MIN";
pub const VAR_SNOOZE_OPTIONS_MIN: &str = "SNOOZE_OPTIONS_MIN";
pub const VAR_UTC_OFFSET_MIN: &str = "UTC_OFFSET_MIN";
pub const VAR_EMBEDDED: &str = "EMBEDDED";

pub const LOG_CONFIG_PATH: &str = "log4rs.yaml";

pub fn check_environment_vars() -> Result<(), VarError> {
    env::var(VAR_REMOTE_URL)?;
    env::var(VAR_REMOTE_API_KEY)?;
    Ok(())
}

/// Loads `log4rs.yaml` when present, otherwise logs `info` and above to stdout.
pub fn init_logging() {
    match log4rs::init_file(LOG_CONFIG_PATH, Default::default()) {
        Ok(()) => return,
        Err(e) => eprintln!("Could not load {LOG_CONFIG_PATH} ({e}), logging to stdout"),
    }

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} {l} {t} - {m}{n}")))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info));

    match config {
        Ok(config) => {
            if let Err(e) = log4rs::init_config(config) {
                eprintln!("Failed to initialize logging: {e}");
            }
        }
        Err(e) => eprintln!("Invalid fallback logging config: {e}"),
    }
}

/// Last six characters of an identifier, for logs.
pub fn get_short_token(token: &str) -> String {
    let count = token.chars().count();
    token.chars().skip(count.saturating_sub(6)).collect()
}
