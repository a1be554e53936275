//! Logging sink driven by `log.{level,path}`.
//!
//! The backend is installed once; a reload can only adjust the global level
//! filter (the sink sticks until the process restarts).

use crate::config::LogConfig;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::OpenOptions;

pub fn init(config: &LogConfig) {
    let level = config
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Trace);

    let mut builder = Builder::new();
    builder.filter_level(level);

    match config.path.as_str() {
        "stdout" => builder.target(Target::Stdout),
        "stderr" => builder.target(Target::Stderr),
        path => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => builder.target(Target::Pipe(Box::new(file))),
            Err(_) => builder.target(Target::Stdout),
        },
    };

    if builder.try_init().is_err() {
        // Already installed, which means this is a reload.
        log::set_max_level(level);
    }
}
