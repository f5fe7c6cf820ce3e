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

//! A backup: a named, positionally-ordered sequence of block references
//! under a (host, name) key.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::block::Block;
use crate::datastore::Datastore;
use crate::db::BackupRow;
use crate::misc::unix_time_now;
use crate::{BlockHash, Error, Result};

/// Lifecycle state of a backup.
///
/// Created as `pending`; `ready` after successful finalization; `failed`
/// when finalization fails or the cleaner reaps a stale pending row;
/// `broken` when marked unusable outside the normal sweeps; `deleted` on
/// explicit removal, with row and file cleanup deferred to the cleaner.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    Pending,
    Ready,
    Failed,
    Broken,
    Deleted,
}

/// A thin handle on one backup row.
///
/// Holds only the row id and the (host, name) key; all writes are
/// delegated to the datastore.
#[derive(Debug)]
pub struct Backup<'d> {
    datastore: &'d Datastore,
    id: i64,
    host: String,
    name: String,
}

impl<'d> Backup<'d> {
    /// Insert a new `pending` backup row.
    pub fn create(
        datastore: &'d Datastore,
        host: &str,
        name: &str,
        device: &str,
        time_created: i64,
    ) -> Result<Backup<'d>> {
        if datastore.db().backup_id(host, name)?.is_some() {
            return Err(Error::BackupExists {
                host: host.to_owned(),
                name: name.to_owned(),
            });
        }
        let id = datastore
            .db()
            .insert_backup(host, name, device, time_created, unix_time_now())?;
        Ok(Backup {
            datastore,
            id,
            host: host.to_owned(),
            name: name.to_owned(),
        })
    }

    /// Load an existing backup by its unique (host, name) key.
    pub fn from_name(datastore: &'d Datastore, host: &str, name: &str) -> Result<Backup<'d>> {
        let id = datastore
            .db()
            .backup_id(host, name)?
            .ok_or_else(|| Error::BackupNotFound {
                host: host.to_owned(),
                name: name.to_owned(),
            })?;
        Ok(Backup {
            datastore,
            id,
            host: host.to_owned(),
            name: name.to_owned(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reload this backup's row.
    pub fn row(&self) -> Result<BackupRow> {
        self.datastore
            .db()
            .backup_row(self.id)?
            .ok_or_else(|| Error::BackupNotFound {
                host: self.host.clone(),
                name: self.name.clone(),
            })
    }

    /// Append one position-to-block link.
    ///
    /// Positions must be positive; contiguity is the ingest engine's
    /// responsibility and is re-checked at finalization.
    pub fn link(&self, pos: u64, hash: &BlockHash, commit: bool) -> Result<()> {
        self.datastore.db().insert_link(self.id, pos, hash, commit)
    }

    /// Finalize: verify continuity, then mark `ready` with the final size.
    ///
    /// Only a `pending` backup may be finished. A failed continuity check
    /// marks the backup `failed` and errors out.
    pub fn finish(&self, size: u64, verify: bool) -> Result<()> {
        let row = self.row()?;
        if row.state != BackupState::Pending {
            return Err(Error::NotPending {
                host: self.host.clone(),
                name: self.name.clone(),
                state: row.state,
            });
        }
        if verify && !self.verify_continuity(size)? {
            self.datastore
                .db()
                .set_backup_state(self.id, BackupState::Failed)?;
            return Err(Error::ContinuityBroken {
                host: self.host.clone(),
                name: self.name.clone(),
            });
        }
        self.datastore
            .db()
            .finish_backup(self.id, size, unix_time_now())
    }

    /// Check that this backup's links are usable: positions form 1..N
    /// without gaps, every referenced block exists, and N times the depot
    /// blocksize equals the expected size.
    pub fn verify_continuity(&self, size: u64) -> Result<bool> {
        let links = self.datastore.db().backup_links(self.id)?;
        for (expected_pos, (pos, hash)) in (1u64..).zip(links.iter()) {
            if *pos != expected_pos {
                warn!(
                    "Backup {}:{} has position {pos} where {expected_pos} was expected",
                    self.host, self.name
                );
                return Ok(false);
            }
            if !self.datastore.hash_exists(hash)? {
                warn!(
                    "Backup {}:{} references missing block {hash}",
                    self.host, self.name
                );
                return Ok(false);
            }
        }
        let linked_size = links.len() as u64 * self.datastore.blocksize();
        if linked_size != size {
            warn!(
                "Backup {}:{} links cover {linked_size} bytes but size is {size}",
                self.host, self.name
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Iterate the backup's decompressed blocks in position order.
    pub fn blocks(&self) -> Result<BlockIter<'d>> {
        let links = self.datastore.db().backup_links(self.id)?;
        Ok(BlockIter {
            datastore: self.datastore,
            links: links.into_iter(),
        })
    }
}

/// Lazily yields a backup's blocks in position order.
pub struct BlockIter<'d> {
    datastore: &'d Datastore,
    links: std::vec::IntoIter<(u64, BlockHash)>,
}

impl Iterator for BlockIter<'_> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let (_pos, hash) = self.links.next()?;
        Some(self.datastore.get_block(&hash))
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;

    fn scratch_datastore() -> (TempDir, Datastore) {
        let testdir = TempDir::new().unwrap();
        let datastore = Datastore::create(testdir.path(), 6).unwrap();
        (testdir, datastore)
    }

    fn stored_block(datastore: &Datastore, content: &[u8]) -> BlockHash {
        let block = Block::new(Bytes::copy_from_slice(content));
        datastore.add_block(&block, true).unwrap();
        *block.hash()
    }

    #[test]
    fn state_text_round_trip() {
        assert_eq!(BackupState::Pending.to_string(), "pending");
        assert_eq!("broken".parse::<BackupState>().unwrap(), BackupState::Broken);
        assert!("bogus".parse::<BackupState>().is_err());
    }

    #[test]
    fn create_and_reload() {
        let (_testdir, datastore) = scratch_datastore();
        let backup = Backup::create(&datastore, "h1", "b1", "sda", 100).unwrap();
        assert_eq!(backup.row().unwrap().state, BackupState::Pending);

        let again = Backup::from_name(&datastore, "h1", "b1").unwrap();
        assert_eq!(again.id(), backup.id());

        let err = Backup::create(&datastore, "h1", "b1", "sda", 100).unwrap_err();
        assert!(matches!(err, Error::BackupExists { .. }));

        let err = Backup::from_name(&datastore, "h1", "nope").unwrap_err();
        assert!(matches!(err, Error::BackupNotFound { .. }));
    }

    #[test]
    fn link_finish_and_iterate() {
        let (_testdir, datastore) = scratch_datastore();
        let h1 = stored_block(&datastore, b"first!");
        let h2 = stored_block(&datastore, b"second");
        let backup = Backup::create(&datastore, "h1", "b1", "sda", 100).unwrap();
        backup.link(1, &h1, false).unwrap();
        backup.link(2, &h2, false).unwrap();
        datastore.db().commit().unwrap();
        backup.finish(12, true).unwrap();

        let row = backup.row().unwrap();
        assert_eq!(row.state, BackupState::Ready);
        assert_eq!(row.size, Some(12));

        let contents: Vec<Bytes> = backup
            .blocks()
            .unwrap()
            .map(|block| block.unwrap().bytes().clone())
            .collect();
        assert_eq!(contents, [Bytes::from_static(b"first!"), Bytes::from_static(b"second")]);
    }

    #[test]
    fn finish_refuses_non_pending() {
        let (_testdir, datastore) = scratch_datastore();
        let h1 = stored_block(&datastore, b"first!");
        let backup = Backup::create(&datastore, "h1", "b1", "sda", 100).unwrap();
        backup.link(1, &h1, true).unwrap();
        backup.finish(6, true).unwrap();

        let err = backup.finish(6, true).unwrap_err();
        assert!(matches!(
            err,
            Error::NotPending {
                state: BackupState::Ready,
                ..
            }
        ));
    }

    #[test]
    fn failed_finish_marks_backup_failed() {
        let (_testdir, datastore) = scratch_datastore();
        let h1 = stored_block(&datastore, b"first!");
        let backup = Backup::create(&datastore, "h1", "b1", "sda", 100).unwrap();
        backup.link(1, &h1, true).unwrap();
        // Declared size doesn't match one block of 6 bytes.
        let err = backup.finish(100, true).unwrap_err();
        assert!(matches!(err, Error::ContinuityBroken { .. }));
        assert_eq!(backup.row().unwrap().state, BackupState::Failed);
    }

    #[test]
    fn continuity_rejects_gaps_and_wrong_start() {
        let (_testdir, datastore) = scratch_datastore();
        let h1 = stored_block(&datastore, b"first!");
        let h2 = stored_block(&datastore, b"second");

        let gap = Backup::create(&datastore, "h1", "gap", "sda", 100).unwrap();
        gap.link(1, &h1, false).unwrap();
        gap.link(3, &h2, true).unwrap();
        assert!(!gap.verify_continuity(12).unwrap());

        let late = Backup::create(&datastore, "h1", "late", "sda", 100).unwrap();
        late.link(2, &h1, true).unwrap();
        assert!(!late.verify_continuity(6).unwrap());
    }

    #[test]
    fn continuity_rejects_missing_block() {
        let (_testdir, datastore) = scratch_datastore();
        let ghost = BlockHash::hash_bytes(b"never stored");
        let backup = Backup::create(&datastore, "h1", "b1", "sda", 100).unwrap();
        backup.link(1, &ghost, true).unwrap();
        assert!(!backup.verify_continuity(6).unwrap());
    }

    #[test]
    fn empty_backup_is_continuous_at_size_zero() {
        let (_testdir, datastore) = scratch_datastore();
        let backup = Backup::create(&datastore, "h1", "b1", "sda", 100).unwrap();
        assert!(backup.verify_continuity(0).unwrap());
        assert!(!backup.verify_continuity(6).unwrap());
    }
}
