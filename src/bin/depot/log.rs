// Depot backup system.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Log setup for the command-line tool.
//!
//! Messages go to stderr: stdout is the data channel for `restore` and
//! the listing commands.

use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Registry;

pub struct LoggingOptions {
    pub level: tracing::Level,
}

pub fn init(options: LoggingOptions) -> std::result::Result<(), String> {
    let subscriber = Registry::default().with(
        fmt::Layer::default()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(LevelFilter::from(options.level)),
    );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| "Failed to update global default logger".to_string())
}
