use std::time::SystemTime;

use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

pub fn parse_level(log_level: &str) -> LevelFilter {
    match log_level.to_lowercase().trim() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Install the global logger, writing coloured lines to stdout.
pub fn setup_logger(log_level: &str) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new()
        .info(Color::Green)
        .debug(Color::Cyan)
        .trace(Color::Magenta);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(parse_level(log_level))
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
