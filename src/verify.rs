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

//! Full integrity sweep over blocks and backups.
//!
//! The block sweep reads every block file back, decompresses it, and
//! recomputes the hash; bad blocks are quarantined into `damaged/` and
//! their metadata rows deleted, committed one block at a time to keep the
//! window of inconsistency small. The backup sweep then re-checks
//! continuity for every `ready` backup, which catches backups that
//! referenced freshly quarantined blocks.

use std::fmt;
use std::io;

use tracing::{debug, error, info, warn};

use crate::backup::{Backup, BackupState};
use crate::block::Block;
use crate::blockdir::codec_is_lz4;
use crate::datastore::Datastore;
use crate::db::BlockRow;
use crate::{Error, Result};

/// Options controlling the behavior of [verify].
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct VerifyOptions {
    /// Report what would change, but write nothing.
    pub dry_run: bool,
    /// Skip reading and checking block contents.
    pub skip_blocks: bool,
    /// Skip the backup continuity sweep.
    pub skip_backups: bool,
}

/// Counters from one verify run.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct VerifyStats {
    pub bad_blocks: usize,
    pub bad_backups: usize,
}

impl VerifyStats {
    pub fn has_problems(&self) -> bool {
        self.bad_blocks > 0 || self.bad_backups > 0
    }
}

impl fmt::Display for VerifyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>12} bad blocks\n{:>12} bad backups",
            self.bad_blocks, self.bad_backups
        )
    }
}

/// Run the integrity sweeps and return what was found.
pub fn verify(datastore: &Datastore, options: &VerifyOptions) -> Result<VerifyStats> {
    let mut stats = VerifyStats::default();
    if !options.skip_blocks {
        stats.bad_blocks = verify_blocks(datastore, options.dry_run)?;
    }
    if !options.skip_backups {
        stats.bad_backups = verify_backups(datastore, options.dry_run)?;
    }
    Ok(stats)
}

/// Read back and re-hash every block; quarantine the bad ones.
fn verify_blocks(datastore: &Datastore, dry_run: bool) -> Result<usize> {
    info!("Verifying blocks");
    let mut bad_blocks = 0;
    for hash in datastore.list_hashes()? {
        debug!("Verifying {hash}");
        let row = datastore.db().block_row(&hash)?;
        if let Err(err) = check_block_content(datastore, &row) {
            error!("Block {hash} failed integrity check: {err}");
            bad_blocks += 1;
            if !dry_run {
                quarantine(datastore, &row)?;
            }
        }
    }
    info!("Done verifying blocks");
    Ok(bad_blocks)
}

/// A block is bad if its file is missing, unreadable, fails
/// decompression, or hashes to something other than its row's hash.
fn check_block_content(datastore: &Datastore, row: &BlockRow) -> Result<()> {
    let raw = datastore.blockdir().get(&row.filename)?;
    let block = if codec_is_lz4(&row.compressed) {
        Block::from_compressed(&raw, None)?
    } else {
        Block::new(raw.into())
    };
    if *block.hash() != row.hash {
        return Err(Error::BlockCorrupt {
            hash: row.hash,
            actual_hash: *block.hash(),
        });
    }
    Ok(())
}

/// Delete the metadata row, then move the file (if still present) into
/// quarantine. Committed immediately to minimize inconsistencies.
fn quarantine(datastore: &Datastore, row: &BlockRow) -> Result<()> {
    datastore.db().delete_block_row(&row.hash, false)?;
    match datastore.blockdir().move_to_damaged(&row.filename) {
        Ok(dst) => warn!("Moved block {} to {}", row.filename, dst.display()),
        Err(Error::QuarantineBlock { ref source, .. })
            if source.kind() == io::ErrorKind::NotFound =>
        {
            warn!("Block file {} already gone", row.filename)
        }
        Err(err) => return Err(err),
    }
    datastore.db().commit()
}

/// Re-check continuity for every `ready` backup; failures become `failed`.
///
/// Backups already marked `broken` are out of scope here.
fn verify_backups(datastore: &Datastore, dry_run: bool) -> Result<usize> {
    info!("Verifying backup integrity");
    let mut bad_backups = 0;
    for row in datastore.backups_by_state(BackupState::Ready)? {
        debug!("Verifying {}:{}", row.host, row.name);
        let backup = Backup::from_name(datastore, &row.host, &row.name)?;
        if !backup.verify_continuity(row.size.unwrap_or(0))? {
            error!("Backup {}:{} failed integrity check", row.host, row.name);
            bad_backups += 1;
            if !dry_run {
                datastore
                    .db()
                    .set_backup_state(row.id, BackupState::Failed)?;
            }
        }
    }
    Ok(bad_backups)
}
