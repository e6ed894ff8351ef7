use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

const DEFAULT_LEVEL: Level = Level::INFO;

/// Max level from `LOG_LEVEL`, falling back to `INFO` when unset or unparsable.
pub fn log_level() -> Level {
    std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|l| Level::from_str(l.trim()).ok())
        .unwrap_or(DEFAULT_LEVEL)
}

pub fn init_tracing() {
    let subscriber = Subscriber::builder()
        .with_max_level(log_level())
        .with_target(false)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("a tracing subscriber is already installed");
    }
}
