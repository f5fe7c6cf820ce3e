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

//! Clean up database and datastore inconsistencies left behind by failed
//! and removed backups.
//!
//! Four operations, committed one at a time: reap stale pending backups,
//! drop links of dead backups, drop orphaned block rows past the age
//! gate, and delete block files with no row.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::datastore::Datastore;
use crate::misc::unix_time_now;
use crate::Result;

/// Default age after which pending backups are considered stale.
pub const DEFAULT_FAIL_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Options controlling the behavior of [clean].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CleanOptions {
    /// Report what would change, but write nothing.
    pub dry_run: bool,
    /// Age threshold for reaping pending backups and orphan block rows.
    pub fail_after: Duration,
    /// Skip failing stale pending backups.
    pub skip_failafter: bool,
    /// Skip deleting links of missing, failed, or deleted backups.
    pub skip_unreferenced: bool,
    /// Skip deleting orphaned block rows and files.
    pub skip_orphaned: bool,
}

impl Default for CleanOptions {
    fn default() -> CleanOptions {
        CleanOptions {
            dry_run: false,
            fail_after: DEFAULT_FAIL_AFTER,
            skip_failafter: false,
            skip_unreferenced: false,
            skip_orphaned: false,
        }
    }
}

/// Counters from one clean run.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct CleanStats {
    /// Pending backups marked failed.
    pub failed_backups: usize,
    /// Links deleted because their backup is gone or dead.
    pub deleted_links: usize,
    /// Orphan block rows deleted.
    pub deleted_block_rows: usize,
    /// Orphan block files deleted from `blocks/`.
    pub deleted_block_files: usize,
}

impl fmt::Display for CleanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>12} pending backups failed", self.failed_backups)?;
        writeln!(f, "{:>12} dead links deleted", self.deleted_links)?;
        writeln!(f, "{:>12} orphan block rows deleted", self.deleted_block_rows)?;
        write!(f, "{:>12} orphan block files deleted", self.deleted_block_files)
    }
}

/// Run the maintenance operations and return what was (or would be) done.
pub fn clean(datastore: &Datastore, options: &CleanOptions) -> Result<CleanStats> {
    if options.dry_run {
        warn!("Dry-run mode; no changes will be made");
    }
    let mut stats = CleanStats::default();
    let cutoff = unix_time_now() - options.fail_after.as_secs() as i64;

    if options.skip_failafter {
        debug!("clean:failafter skipped; not failing any pending backups");
    } else {
        debug!("clean:failafter marking pending backups older than cutoff as failed");
        stats.failed_backups = datastore
            .db()
            .fail_pending_older_than(cutoff, options.dry_run)?;
        info!(
            "Marked {} stale pending backups as failed",
            stats.failed_backups
        );
    }

    if options.skip_unreferenced {
        debug!("clean:unreferenced skipped; not removing any dead links");
    } else {
        debug!("clean:unreferenced removing links of missing, failed, deleted backups");
        stats.deleted_links = datastore.db().delete_dead_links(options.dry_run)?;
        if stats.deleted_links > 0 {
            info!("Deleted {} backup-block references", stats.deleted_links);
        } else {
            info!("No unreferenced backup-block entries found");
        }
    }

    if options.skip_orphaned {
        debug!("clean:orphaned skipped; not removing orphaned blocks");
    } else {
        debug!("clean:orphaned removing block rows with no surviving link");
        stats.deleted_block_rows = datastore
            .db()
            .delete_orphan_block_rows(cutoff, options.dry_run)?;
        info!(
            "Removed {} orphaned block rows older than the age gate",
            stats.deleted_block_rows
        );
        stats.deleted_block_files = delete_orphan_files(datastore, options.dry_run)?;
        info!(
            "Removed {} orphaned block files from the filesystem",
            stats.deleted_block_files
        );
    }

    Ok(stats)
}

/// Delete files in `blocks/` with no corresponding metadata row.
fn delete_orphan_files(datastore: &Datastore, dry_run: bool) -> Result<usize> {
    let known_files: HashSet<String> = datastore
        .db()
        .list_blocks()?
        .into_iter()
        .map(|row| row.filename)
        .collect();
    debug!("Loaded {} filenames from database", known_files.len());
    let mut deleted = 0;
    for filename in datastore.blockdir().scan()? {
        if !known_files.contains(&filename) {
            debug!("Found orphaned block file: {filename}");
            deleted += 1;
            if !dry_run {
                datastore.blockdir().remove(&filename)?;
            }
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::backup::{Backup, BackupState};
    use crate::block::Block;

    fn scratch_datastore() -> (TempDir, Datastore) {
        let testdir = TempDir::new().unwrap();
        let datastore = Datastore::create(testdir.path(), 4).unwrap();
        (testdir, datastore)
    }

    /// Store a block whose row is old enough to clear the age gate.
    fn old_block(datastore: &Datastore, content: &[u8]) -> Block {
        let block = Block::new(Bytes::copy_from_slice(content));
        let filename = format!("{}.lz4", block.hash());
        let compressed = block.compressed().unwrap();
        datastore.blockdir().put(&filename, &compressed).unwrap();
        datastore
            .db()
            .insert_block(
                &crate::db::BlockRow {
                    hash: *block.hash(),
                    size: block.len() as u64,
                    csize: compressed.len() as u64,
                    compressed: "lz4".to_owned(),
                    filename,
                    time_imported: 100,
                },
                true,
            )
            .unwrap();
        block
    }

    #[test]
    fn stale_pending_backups_are_failed() {
        let (_testdir, datastore) = scratch_datastore();
        // One pending backup imported long ago, one just now.
        datastore
            .db()
            .insert_backup("h1", "stale", "sda", 100, 100)
            .unwrap();
        Backup::create(&datastore, "h1", "fresh", "sda", 100).unwrap();

        let stats = clean(&datastore, &CleanOptions::default()).unwrap();
        assert_eq!(stats.failed_backups, 1);
        assert_eq!(
            datastore.backups_by_state(BackupState::Failed).unwrap()[0].name,
            "stale"
        );
        assert_eq!(datastore.db().count_pending().unwrap(), 1);
    }

    #[test]
    fn orphan_rows_and_files_are_removed() {
        let (_testdir, datastore) = scratch_datastore();
        let linked = old_block(&datastore, b"keep");
        let old_orphan = old_block(&datastore, b"old!");
        let fresh_orphan = Block::new(Bytes::from_static(b"new!"));
        datastore.add_block(&fresh_orphan, true).unwrap();
        let backup = Backup::create(&datastore, "h1", "b1", "sda", 100).unwrap();
        backup.link(1, linked.hash(), true).unwrap();
        backup.finish(4, true).unwrap();

        let stats = clean(&datastore, &CleanOptions::default()).unwrap();
        // Only the orphan past the age gate is reaped; the fresh orphan may
        // belong to an in-flight ingest.
        assert_eq!(stats.deleted_block_rows, 1);
        assert_eq!(stats.deleted_block_files, 1);
        assert!(!datastore.hash_exists(old_orphan.hash()).unwrap());
        assert!(datastore.hash_exists(fresh_orphan.hash()).unwrap());
        assert!(datastore.hash_exists(linked.hash()).unwrap());
        assert_eq!(datastore.blockdir().scan().unwrap().len(), 2);
    }

    #[test]
    fn links_of_failed_backups_are_deleted() {
        let (_testdir, datastore) = scratch_datastore();
        let block = old_block(&datastore, b"data");
        let backup = Backup::create(&datastore, "h1", "b1", "sda", 100).unwrap();
        backup.link(1, block.hash(), true).unwrap();
        datastore
            .db()
            .set_backup_state(backup.id(), BackupState::Failed)
            .unwrap();

        let stats = clean(&datastore, &CleanOptions::default()).unwrap();
        assert_eq!(stats.deleted_links, 1);
        // With the link gone the block row and file are orphans.
        assert_eq!(stats.deleted_block_rows, 1);
        assert_eq!(stats.deleted_block_files, 1);
        assert!(datastore.list_hashes().unwrap().is_empty());
    }

    #[test]
    fn dry_run_only_counts() {
        let (_testdir, datastore) = scratch_datastore();
        let orphan = old_block(&datastore, b"drop");
        datastore
            .db()
            .insert_backup("h1", "stale", "sda", 100, 100)
            .unwrap();

        let options = CleanOptions {
            dry_run: true,
            ..Default::default()
        };
        let stats = clean(&datastore, &options).unwrap();
        assert_eq!(stats.failed_backups, 1);
        assert_eq!(stats.deleted_block_rows, 1);
        assert_eq!(stats.deleted_block_files, 0, "file still has its row");
        assert_eq!(datastore.db().count_pending().unwrap(), 1);
        assert!(datastore.hash_exists(orphan.hash()).unwrap());
    }

    #[test]
    fn file_without_row_is_deleted() {
        let (_testdir, datastore) = scratch_datastore();
        datastore
            .blockdir()
            .put("0011223344556677.lz4", b"stray")
            .unwrap();
        let stats = clean(&datastore, &CleanOptions::default()).unwrap();
        assert_eq!(stats.deleted_block_files, 1);
        assert!(datastore.blockdir().scan().unwrap().is_empty());
    }
}
