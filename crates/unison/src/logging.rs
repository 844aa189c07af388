use std::{fs::File, sync::Arc};

use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("open log file: {0}")]
    File(#[from] std::io::Error),
    #[error("install subscriber: {0}")]
    Init(String),
}

/// Installs the global subscriber. `sink` is `console` or a file name;
/// unknown verbosity values mean "off", like the original surface.
pub fn init(sink: &str, verbosity: &str) -> Result<(), LogError> {
    let level = match verbosity {
        "trace" => LevelFilter::TRACE,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "err" => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    };
    if level == LevelFilter::OFF {
        return Ok(());
    }

    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false);
    let res = if sink == "console" {
        builder.try_init()
    } else {
        let file = File::create(sink)?;
        builder.with_writer(Arc::new(file)).with_ansi(false).try_init()
    };
    res.map_err(|e| LogError::Init(e.to_string()))
}
