use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, fmt::time::OffsetTime, layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::logger::{config::LoggerConfig, error::LoggerError, format::LoggerFormat};

/// Environment variable overriding the configured filter.
pub const LEVEL_ENV: &str = "FLEET_LOG";

pub(crate) fn effective_level(configured: &str, env: Option<String>) -> String {
    env.map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| configured.to_string())
}

pub(crate) fn mk_filter(level: &str) -> Result<EnvFilter, LoggerError> {
    EnvFilter::try_new(level).map_err(|_| LoggerError::InvalidLogLevel(level.to_string()))
}

// Local offset must be resolved before the runtime spawns threads.
fn mk_timer() -> OffsetTime<Rfc3339> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

/// Text or JSON lines on stderr; stdout is left to command output.
pub(crate) fn install_fmt(cfg: &LoggerConfig, filter: EnvFilter) -> Result<(), LoggerError> {
    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(cfg.with_targets)
        .with_timer(mk_timer());
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match cfg.format {
        LoggerFormat::Json => base.json().with_ansi(false).boxed(),
        _ => base.with_ansi(cfg.use_color).boxed(),
    };
    init_with(tracing_subscriber::registry().with(layer).with(filter))
}

fn init_with<S>(subscriber: S) -> Result<(), LoggerError>
where
    S: Subscriber + Send + Sync + 'static,
{
    subscriber.try_init().map_err(|e| {
        let msg = e.to_string();
        if msg.contains("global default") {
            LoggerError::AlreadyInitialized
        } else {
            LoggerError::InitializationFailed(msg)
        }
    })
}

#[cfg(all(target_os = "linux", feature = "journald"))]
pub(crate) fn install_journald(filter: EnvFilter) -> Result<(), LoggerError> {
    let journald = tracing_journald::layer()
        .map_err(|e| LoggerError::InitializationFailed(format!("journald: {e}")))?
        .with_syslog_identifier("fleet-runner".into());
    init_with(tracing_subscriber::registry().with(journald).with(filter))
}

#[cfg(not(all(target_os = "linux", feature = "journald")))]
pub(crate) fn install_journald(_filter: EnvFilter) -> Result<(), LoggerError> {
    Err(LoggerError::JournaldNotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_level_is_rejected() {
        assert!(matches!(
            mk_filter("fleet=verbose"),
            Err(LoggerError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn directive_level_is_accepted() {
        assert!(mk_filter("info,fleet.core=debug").is_ok());
    }

    #[test]
    fn env_filter_wins_unless_blank() {
        assert_eq!(effective_level("info", Some("debug".into())), "debug");
        assert_eq!(effective_level("info", Some("  ".into())), "info");
        assert_eq!(effective_level("warn", None), "warn");
    }
}
