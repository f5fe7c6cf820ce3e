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

//! Command-line entry point for the depot.

use std::error::Error as StdError;
use std::io;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use depot::backup::BackupState;
use depot::*;

use show::{show_backups, ListFormat};

mod log;
mod show;

#[derive(Debug, Parser)]
#[clap(
    name = "depot",
    about = "A content-addressed deduplicating backup depot",
    author,
    version
)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Set the log level to trace.
    #[clap(long, short = 'D', global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a datastore in an existing, empty directory.
    Create {
        /// Datastore directory.
        #[clap(long, short)]
        dir: PathBuf,
        /// Uncompressed block size, in 1024-notation (e.g. 1MiB).
        #[clap(long, short)]
        blocksize: ByteSize,
    },

    /// Read a backup stream from stdin and record it as (host, name).
    Ingest {
        /// Datastore directory.
        #[clap(long, short)]
        dir: PathBuf,
        /// Client hostname.
        #[clap(long)]
        host: String,
        /// Backup name.
        #[clap(long, short)]
        name: String,
    },

    /// Write a backup's uncompressed block stream to stdout.
    Restore {
        /// Datastore directory.
        #[clap(long, short)]
        dir: PathBuf,
        /// Client hostname.
        #[clap(long)]
        host: String,
        /// Backup name.
        #[clap(long, short)]
        name: String,
    },

    /// List backups.
    ListBackups {
        /// Datastore directory.
        #[clap(long, short)]
        dir: PathBuf,
        /// Limit to the given host.
        #[clap(long)]
        host: Option<String>,
        /// Show backups in this state, or `all`.
        #[clap(long, short, default_value = "ready")]
        state: String,
        /// Output format.
        #[clap(long, short, value_enum, default_value = "cli")]
        format: ListFormat,
    },

    /// Print all block hashes, one per line.
    ListHashes {
        /// Datastore directory.
        #[clap(long, short)]
        dir: PathBuf,
    },

    /// Check that blocks and backups are internally consistent.
    ///
    /// Corrupt blocks are quarantined and the backups referencing them
    /// marked failed.
    Verify {
        /// Datastore directory.
        #[clap(long, short)]
        dir: PathBuf,
        /// Don't move or mark damaged elements, just report.
        #[clap(long, short = 'n')]
        dry: bool,
        /// Skip individual block checking.
        #[clap(long, short = 'b')]
        skip_blocks: bool,
        /// Skip the backup continuity check.
        #[clap(long, short = 'a')]
        skip_backups: bool,
    },

    /// Report damaged blocks and failed or broken backups.
    Health {
        /// Datastore directory.
        #[clap(long, short)]
        dir: PathBuf,
        /// Skip damaged block counting.
        #[clap(long, short = 'b')]
        skip_blocks: bool,
        /// Skip backup state counting.
        #[clap(long, short = 'a')]
        skip_backups: bool,
    },

    /// Clean up stale pending backups and orphaned blocks.
    Clean {
        /// Datastore directory.
        #[clap(long, short)]
        dir: PathBuf,
        /// Don't delete or mark anything, just report.
        #[clap(long, short = 'n')]
        dry: bool,
        /// Fail pending backups and orphaned blocks after this age.
        #[clap(long, short = 'a', default_value = "1d")]
        fail_after: humantime::Duration,
        /// Skip failing stale pending backups.
        #[clap(long, short = 'f')]
        skip_failafter: bool,
        /// Skip cleaning the backup-to-block reference table.
        #[clap(long, short = 'u')]
        skip_unreferenced: bool,
        /// Skip removing block rows and files with no surviving backup.
        #[clap(long, short = 'o')]
        skip_orphaned: bool,
    },
}

#[repr(u8)]
enum CommandExitCode {
    Ok = 0,
    Failed = 1,
}

impl Command {
    fn run(&self) -> Result<CommandExitCode> {
        match self {
            Command::Create { dir, blocksize } => {
                Datastore::create(dir, blocksize.as_u64())?;
                info!("Created new datastore in {:?}", dir);
            }
            Command::Ingest { dir, host, name } => {
                let datastore = Datastore::open(dir)?;
                let stats = ingest(&datastore, host, name, io::stdin().lock())?;
                for line in format!("{stats}").lines() {
                    info!("{line}");
                }
            }
            Command::Restore { dir, host, name } => {
                let datastore = Datastore::open(dir)?;
                let stdout = io::stdout().lock();
                let mut out = BufWriter::new(stdout);
                let stats = restore(&datastore, host, name, &mut out)?;
                for line in format!("{stats}").lines() {
                    info!("{line}");
                }
            }
            Command::ListBackups {
                dir,
                host,
                state,
                format,
            } => {
                let datastore = Datastore::open(dir)?;
                let state = state_filter(state)?;
                let rows = datastore.db().list_backups(host.as_deref(), state)?;
                let stdout = io::stdout().lock();
                let mut out = BufWriter::new(stdout);
                show_backups(&rows, *format, &mut out)?;
                out.flush()?;
            }
            Command::ListHashes { dir } => {
                let datastore = Datastore::open(dir)?;
                let stdout = io::stdout().lock();
                let mut out = BufWriter::new(stdout);
                for hash in datastore.list_hashes()? {
                    writeln!(out, "{hash}")?;
                }
                out.flush()?;
            }
            Command::Verify {
                dir,
                dry,
                skip_blocks,
                skip_backups,
            } => {
                let datastore = Datastore::open(dir)?;
                let options = VerifyOptions {
                    dry_run: *dry,
                    skip_blocks: *skip_blocks,
                    skip_backups: *skip_backups,
                };
                let stats = verify(&datastore, &options)?;
                for line in format!("{stats}").lines() {
                    info!("{line}");
                }
                if stats.has_problems() {
                    return Ok(CommandExitCode::Failed);
                }
            }
            Command::Health {
                dir,
                skip_blocks,
                skip_backups,
            } => {
                let datastore = Datastore::open(dir)?;
                let options = HealthOptions {
                    skip_blocks: *skip_blocks,
                    skip_backups: *skip_backups,
                };
                let report = health(&datastore, &options)?;
                if !report.is_healthy() {
                    return Ok(CommandExitCode::Failed);
                }
            }
            Command::Clean {
                dir,
                dry,
                fail_after,
                skip_failafter,
                skip_unreferenced,
                skip_orphaned,
            } => {
                let datastore = Datastore::open(dir)?;
                let options = CleanOptions {
                    dry_run: *dry,
                    fail_after: (*fail_after).into(),
                    skip_failafter: *skip_failafter,
                    skip_unreferenced: *skip_unreferenced,
                    skip_orphaned: *skip_orphaned,
                };
                let stats = clean(&datastore, &options)?;
                for line in format!("{stats}").lines() {
                    info!("{line}");
                }
            }
        }
        Ok(CommandExitCode::Ok)
    }
}

fn state_filter(state: &str) -> Result<Option<BackupState>> {
    if state == "all" {
        return Ok(None);
    }
    state
        .parse()
        .map(Some)
        .map_err(|_| Error::UnknownState {
            state: state.to_owned(),
        })
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.debug {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };
    if let Err(message) = log::init(log::LoggingOptions { level }) {
        eprintln!("Failed to initialize log system:");
        eprintln!("{message}");
        return ExitCode::from(4);
    }

    match args.command.run() {
        Err(ref e) => {
            error!("{}", e.to_string());
            let mut cause: &dyn StdError = e;
            while let Some(c) = cause.source() {
                error!("  caused by: {c}");
                cause = c;
            }
            // Avoid Rust redundantly printing the error.
            ExitCode::FAILURE
        }
        Ok(code) => ExitCode::from(code as u8),
    }
}

#[test]
fn verify_clap() {
    use clap::CommandFactory;
    Args::command().debug_assert()
}
