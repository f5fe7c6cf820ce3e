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

//! The depot datastore: a directory holding the metadata database and the
//! block files.
//!
//! The datastore owns all blocks and all backups and is the sole mutator
//! of the metadata store. [crate::backup::Backup] and [crate::block::Block]
//! are lightweight values carrying at most a handle back to it.

use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use tracing::debug;

use crate::backup::BackupState;
use crate::block::Block;
use crate::blockdir::{block_filename, codec_is_lz4, BlockDir};
use crate::compress::CODEC_LZ4;
use crate::db::{BackupRow, BlockRow, Db};
use crate::misc::unix_time_now;
use crate::{BlockHash, Error, Result};

/// Unified handle over the block store and the metadata store.
#[derive(Debug)]
pub struct Datastore {
    dir: PathBuf,
    db: Db,
    blockdir: BlockDir,
    /// Fixed uncompressed block size in bytes. Set once at creation.
    blocksize: u64,
}

impl Datastore {
    /// Initialize a datastore in an existing empty directory.
    ///
    /// Creates `blocks/` and `damaged/`, writes the metadata schema, and
    /// persists the blocksize.
    pub fn create(dir: &Path, blocksize: u64) -> Result<Datastore> {
        if !dir.is_dir() {
            return Err(Error::DepotDirectoryMissing {
                path: dir.to_owned(),
            });
        }
        if fs::read_dir(dir)?.next().is_some() {
            return Err(Error::DepotDirectoryNotEmpty {
                path: dir.to_owned(),
            });
        }
        let db = Db::create(dir, blocksize)?;
        let blockdir = BlockDir::create(dir)?;
        Ok(Datastore {
            dir: dir.to_owned(),
            db,
            blockdir,
            blocksize,
        })
    }

    /// Open an existing datastore and load its settings.
    pub fn open(dir: &Path) -> Result<Datastore> {
        let db = Db::open(dir)?;
        let blocksize = db
            .setting("blocksize")?
            .and_then(|value| value.parse().ok())
            .ok_or(Error::BadSetting { key: "blocksize" })?;
        Ok(Datastore {
            dir: dir.to_owned(),
            db,
            blockdir: BlockDir::open(dir),
            blocksize,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn blocksize(&self) -> u64 {
        self.blocksize
    }

    /// The metadata store. Maintenance sweeps and the backup record reach
    /// the tables through here; everything else should prefer the
    /// hash-level operations on the datastore itself.
    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn blockdir(&self) -> &BlockDir {
        &self.blockdir
    }

    pub fn hash_exists(&self, hash: &BlockHash) -> Result<bool> {
        self.db.block_exists(hash)
    }

    /// Store a block, unless its hash is already present.
    ///
    /// Returns false on a dedup hit. Otherwise writes the block file first
    /// and the metadata row second: a crash in between leaves a file
    /// without a row, which the cleaner removes; never a row without a
    /// file. With `commit` false the row insert joins the caller's open
    /// transaction.
    pub fn add_block(&self, block: &Block, commit: bool) -> Result<bool> {
        if self.hash_exists(block.hash())? {
            debug!("Skipping existing block {}", block.hash());
            return Ok(false);
        }
        let filename = block_filename(block.hash(), CODEC_LZ4);
        let compressed = block.compressed()?;
        self.blockdir.put(&filename, &compressed)?;
        self.db.insert_block(
            &BlockRow {
                hash: *block.hash(),
                size: block.len() as u64,
                csize: compressed.len() as u64,
                compressed: CODEC_LZ4.to_owned(),
                filename,
                time_imported: unix_time_now(),
            },
            commit,
        )?;
        Ok(true)
    }

    /// Load a block's uncompressed content by hash.
    pub fn get_block(&self, hash: &BlockHash) -> Result<Block> {
        let row = self.db.block_row(hash)?;
        let raw = self.blockdir.get(&row.filename)?;
        if codec_is_lz4(&row.compressed) {
            Block::from_compressed(&raw, Some(*hash))
        } else {
            Ok(Block::with_hash(raw.into(), *hash))
        }
    }

    pub fn list_hashes(&self) -> Result<Vec<BlockHash>> {
        self.db.list_hashes()
    }

    pub fn backups_by_state(&self, state: BackupState) -> Result<Vec<BackupRow>> {
        self.db.backups_by_state(state)
    }

    /// All backups grouped by host, hosts and names ascending.
    pub fn backups_grouped(&self) -> Result<Vec<(String, Vec<BackupRow>)>> {
        Ok(self
            .db
            .list_backups(None, None)?
            .into_iter()
            .group_by(|row| row.host.clone())
            .into_iter()
            .map(|(host, rows)| (host, rows.collect()))
            .collect())
    }

    /// Hashes of quarantined block files in `damaged/`.
    pub fn damaged_hashes(&self) -> Result<Vec<BlockHash>> {
        Ok(self
            .blockdir
            .scan_damaged()?
            .into_iter()
            .map(|(hash, _path)| hash)
            .collect())
    }
}
