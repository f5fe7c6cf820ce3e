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

//! A content-addressed deduplicating backup depot.
//!
//! Backups are sequences of fixed-size blocks; identical blocks across all
//! backups share a single on-disk artifact keyed by the xxh64 hash of the
//! uncompressed content. Metadata lives in SQLite, block artifacts as
//! LZ4-frame files under `blocks/`.

pub mod backup;
pub mod block;
pub mod blockdir;
pub mod blockhash;
pub mod clean;
pub mod compress;
pub mod datastore;
pub mod db;
pub mod errors;
pub mod health;
pub mod ingest;
pub mod misc;
pub mod restore;
pub mod verify;

pub use crate::backup::{Backup, BackupState};
pub use crate::block::Block;
pub use crate::blockhash::{BlockHash, BLOCK_HASH_SIZE_BYTES};
pub use crate::clean::{clean, CleanOptions, CleanStats, DEFAULT_FAIL_AFTER};
pub use crate::datastore::Datastore;
pub use crate::errors::{Error, Result};
pub use crate::health::{health, HealthOptions, HealthReport};
pub use crate::ingest::{ingest, IngestStats};
pub use crate::restore::{restore, RestoreStats};
pub use crate::verify::{verify, VerifyOptions, VerifyStats};

/// Skip reading a body entry entirely when its asserted hash is already
/// in the depot.
pub const SKIP_KNOWN_BLOCKS_ENTIRELY: bool = true;

/// Trust the client-asserted hash for newly stored blocks instead of
/// recomputing it.
///
/// WARNING: leaves transport corruption and malformed blocks undetected
/// until the next verify sweep.
pub const SKIP_VERIFYING_BLOCKS: bool = true;

/// Commit body block inserts once at the end of the body phase instead of
/// per block.
pub const DELAY_DB_BLOCK_COMMIT: bool = true;

/// Commit backup links once at the end of the footer phase instead of
/// per link.
pub const DELAY_DB_LINK_COMMIT: bool = true;

/// Depot version number as a semver string, populated at compile time
/// from `Cargo.toml`.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
