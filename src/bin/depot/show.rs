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

//! Text output formats for structured data.
//!
//! These accept rows of content and write them to a file (typically
//! stdout).

use std::io::Write;

use clap::ValueEnum;

use depot::db::BackupRow;
use depot::misc::format_timestamp;
use depot::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Cli,
    Csv,
    Json,
}

/// Print backup rows in the chosen format.
pub fn show_backups(rows: &[BackupRow], format: ListFormat, out: &mut dyn Write) -> Result<()> {
    match format {
        ListFormat::Cli => {
            writeln!(
                out,
                "{:<26} | {:<26} | {:<16}",
                "HOSTNAME", "BACKUP_NAME", "DATE_CREATED"
            )?;
            writeln!(out, "{}", "-".repeat(80))?;
            for row in rows {
                writeln!(
                    out,
                    "{:<26} | {:<26} | {}",
                    row.host,
                    row.name,
                    format_timestamp(row.time_created)
                )?;
            }
        }
        ListFormat::Csv => {
            writeln!(out, "HOSTNAME|BACKUP_NAME|BACKUP_CREATED")?;
            for row in rows {
                writeln!(
                    out,
                    "{}|{}|{}",
                    row.host,
                    row.name,
                    format_timestamp(row.time_created)
                )?;
            }
        }
        ListFormat::Json => {
            serde_json::to_writer(&mut *out, rows).map_err(std::io::Error::from)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
