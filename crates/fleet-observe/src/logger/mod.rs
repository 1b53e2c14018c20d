mod config;
mod error;
mod format;
mod log;

pub use config::LoggerConfig;
pub use error::LoggerError;
pub use format::LoggerFormat;
pub use log::LEVEL_ENV;

/// Install the global subscriber described by `cfg`.
///
/// A filter in [`LEVEL_ENV`] takes precedence over `cfg.level`.
pub fn logger_init(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let level = log::effective_level(&cfg.level, std::env::var(LEVEL_ENV).ok());
    let filter = log::mk_filter(&level)?;
    match cfg.format {
        LoggerFormat::Text | LoggerFormat::Json => log::install_fmt(cfg, filter),
        LoggerFormat::Journald => log::install_journald(filter),
    }
}
