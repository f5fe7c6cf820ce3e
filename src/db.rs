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

//! The depot metadata store.
//!
//! Durable tabular state recording settings, blocks, backups, and
//! backup-to-block links, in a single SQLite database file.
//!
//! All mutations run inside transactions. Mutators take a `commit` flag:
//! passing `false` leaves the transaction open so a batch of writes can be
//! committed together at a phase boundary with [Db::commit]. The ingest
//! engine relies on this for its body and link phases.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::debug;

use crate::backup::BackupState;
use crate::{BlockHash, Error, Result};

/// Name of the metadata database file inside the depot directory.
pub const DB_FILENAME: &str = "db.sqlite3";

/// One row of the `blocks` table.
#[derive(Debug, Clone)]
pub struct BlockRow {
    pub hash: BlockHash,
    /// Uncompressed length in bytes.
    pub size: u64,
    /// Compressed length in bytes.
    pub csize: u64,
    /// Codec tag; empty means stored raw.
    pub compressed: String,
    /// Relative filename under `blocks/`; authoritative for reads.
    pub filename: String,
    pub time_imported: i64,
}

/// One row of the `backups` table.
///
/// The surrogate row id is carried for internal joins but not serialized;
/// external output shows the same columns a listing query returns.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRow {
    #[serde(skip)]
    pub id: i64,
    pub name: String,
    pub host: String,
    pub device: String,
    pub size: Option<u64>,
    pub time_created: i64,
    pub time_imported: i64,
    pub state: BackupState,
}

/// Handle on the open metadata database.
#[derive(Debug)]
pub struct Db {
    conn: Connection,
}

fn parse_state(state: String) -> Result<BackupState> {
    state
        .parse()
        .map_err(|_| Error::UnknownState { state })
}

fn parse_hash(text: String) -> Result<BlockHash> {
    text.parse().map_err(|_| Error::InvalidHash { text })
}

impl Db {
    /// The database file path for a depot directory.
    pub fn path_for(depot_dir: &Path) -> PathBuf {
        depot_dir.join(DB_FILENAME)
    }

    /// Create the schema in a new database file and persist the blocksize.
    ///
    /// Fails if the database file already exists.
    pub fn create(depot_dir: &Path, blocksize: u64) -> Result<Db> {
        let path = Db::path_for(depot_dir);
        if path.is_file() {
            return Err(Error::DatabaseExists { path });
        }
        let conn = Connection::open(&path)?;
        debug!("Creating database schema");
        conn.execute_batch(
            "CREATE TABLE settings(key TEXT, value TEXT);\n\
             CREATE TABLE blocks(hash TEXT PRIMARY KEY, size INTEGER, csize INTEGER, \
             compressed TEXT, filename TEXT, time_imported INTEGER);\n\
             CREATE TABLE backups(name TEXT, host TEXT, device TEXT, size INTEGER, \
             time_created INTEGER, time_imported INTEGER, state TEXT CHECK( state IN \
             ('pending','ready','failed','broken','deleted') ), UNIQUE(host,name));\n\
             CREATE TABLE backup_blocks(pos INTEGER, block NOT NULL REFERENCES blocks, \
             backup NOT NULL REFERENCES backups);",
        )?;
        let db = Db { conn };
        db.set_setting("blocksize", &blocksize.to_string())?;
        Ok(db)
    }

    /// Open an existing database file.
    pub fn open(depot_dir: &Path) -> Result<Db> {
        let path = Db::path_for(depot_dir);
        if !path.is_file() {
            return Err(Error::DatabaseMissing { path });
        }
        Ok(Db {
            conn: Connection::open(&path)?,
        })
    }

    // Transaction discipline: mutators lazily open a transaction; `commit`
    // flushes it if one is open. SQLite in autocommit mode otherwise.

    fn begin(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(())
    }

    /// Commit any open transaction. No-op when nothing is pending.
    pub fn commit(&self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn maybe_commit(&self, commit: bool) -> Result<()> {
        if commit {
            self.commit()?;
        }
        Ok(())
    }

    //
    // Settings
    //

    pub fn setting(&self, key: &'static str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM settings WHERE key = :key")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Set a settings key. Settings are written once, at datastore creation.
    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.begin()?;
        self.conn.execute(
            "INSERT INTO settings(key, value) VALUES (:key, :value)",
            params![key, value],
        )?;
        self.commit()
    }

    //
    // Blocks
    //

    pub fn insert_block(&self, row: &BlockRow, commit: bool) -> Result<()> {
        self.begin()?;
        self.conn.execute(
            "INSERT INTO blocks (hash, size, csize, compressed, filename, time_imported) \
             VALUES (:hash, :size, :csize, :compressed, :filename, :time)",
            params![
                row.hash.to_string(),
                row.size,
                row.csize,
                row.compressed,
                row.filename,
                row.time_imported
            ],
        )?;
        self.maybe_commit(commit)
    }

    pub fn block_exists(&self, hash: &BlockHash) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(rowid) FROM blocks WHERE hash = :hash",
            params![hash.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn block_row(&self, hash: &BlockHash) -> Result<BlockRow> {
        let mut stmt = self.conn.prepare(
            "SELECT hash, size, csize, compressed, filename, time_imported \
             FROM blocks WHERE hash = :hash",
        )?;
        let mut rows = stmt.query(params![hash.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(BlockRow {
                hash: parse_hash(row.get(0)?)?,
                size: row.get(1)?,
                csize: row.get(2)?,
                compressed: row.get(3)?,
                filename: row.get(4)?,
                time_imported: row.get(5)?,
            }),
            None => Err(Error::BlockRowMissing { hash: *hash }),
        }
    }

    /// All block hashes, ascending.
    pub fn list_hashes(&self) -> Result<Vec<BlockHash>> {
        let mut stmt = self
            .conn
            .prepare("SELECT hash FROM blocks ORDER BY hash ASC")?;
        let hashes = stmt.query_map([], |row| row.get::<_, String>(0))?;
        hashes
            .map(|text| parse_hash(text?))
            .collect::<Result<Vec<BlockHash>>>()
    }

    /// All block rows, for reconciling against the filesystem.
    pub fn list_blocks(&self) -> Result<Vec<BlockRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT hash, size, csize, compressed, filename, time_imported \
             FROM blocks ORDER BY hash ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        rows.map(|row| {
            let (hash, size, csize, compressed, filename, time_imported) = row?;
            Ok(BlockRow {
                hash: parse_hash(hash)?,
                size,
                csize,
                compressed,
                filename,
                time_imported,
            })
        })
        .collect()
    }

    pub fn delete_block_row(&self, hash: &BlockHash, commit: bool) -> Result<()> {
        self.begin()?;
        self.conn.execute(
            "DELETE FROM blocks WHERE hash = :hash",
            params![hash.to_string()],
        )?;
        self.maybe_commit(commit)
    }

    //
    // Backups
    //

    /// Insert a new `pending` backup row and return its id.
    pub fn insert_backup(
        &self,
        host: &str,
        name: &str,
        device: &str,
        time_created: i64,
        time_imported: i64,
    ) -> Result<i64> {
        self.begin()?;
        self.conn.execute(
            "INSERT INTO backups (name, host, device, time_created, time_imported, state) \
             VALUES (:name, :host, :device, :time_created, :time_imported, :state)",
            params![
                name,
                host,
                device,
                time_created,
                time_imported,
                BackupState::Pending.to_string()
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.commit()?;
        Ok(id)
    }

    pub fn backup_id(&self, host: &str, name: &str) -> Result<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT rowid FROM backups WHERE host = :host AND name = :name")?;
        let mut rows = stmt.query(params![host, name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn backup_rows(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<BackupRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<u64>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        rows.map(|row| {
            let (id, name, host, device, size, time_created, time_imported, state) = row?;
            Ok(BackupRow {
                id,
                name,
                host,
                device,
                size,
                time_created,
                time_imported,
                state: parse_state(state)?,
            })
        })
        .collect()
    }

    const BACKUP_COLUMNS: &'static str =
        "rowid, name, host, device, size, time_created, time_imported, state";

    pub fn backup_row(&self, id: i64) -> Result<Option<BackupRow>> {
        let sql = format!(
            "SELECT {} FROM backups WHERE rowid = :id",
            Db::BACKUP_COLUMNS
        );
        Ok(self.backup_rows(&sql, &[&id])?.into_iter().next())
    }

    /// Finalize a backup: set its size, refresh `time_imported`, mark `ready`.
    pub fn finish_backup(&self, id: i64, size: u64, time_imported: i64) -> Result<()> {
        self.begin()?;
        self.conn.execute(
            "UPDATE backups SET time_imported = :time_imported, state = :state, \
             size = :size WHERE rowid = :id",
            params![time_imported, BackupState::Ready.to_string(), size, id],
        )?;
        self.commit()
    }

    pub fn set_backup_state(&self, id: i64, state: BackupState) -> Result<()> {
        self.begin()?;
        self.conn.execute(
            "UPDATE backups SET state = :state WHERE rowid = :id",
            params![state.to_string(), id],
        )?;
        self.commit()
    }

    pub fn backups_by_state(&self, state: BackupState) -> Result<Vec<BackupRow>> {
        let sql = format!(
            "SELECT {} FROM backups WHERE state = :state ORDER BY host, name",
            Db::BACKUP_COLUMNS
        );
        self.backup_rows(&sql, &[&state.to_string()])
    }

    /// Backups filtered by optional host and state, ordered by (host, name).
    pub fn list_backups(
        &self,
        host: Option<&str>,
        state: Option<BackupState>,
    ) -> Result<Vec<BackupRow>> {
        let state = state.map(|s| s.to_string());
        match (host, &state) {
            (None, None) => {
                let sql = format!(
                    "SELECT {} FROM backups ORDER BY host, name",
                    Db::BACKUP_COLUMNS
                );
                self.backup_rows(&sql, &[])
            }
            (None, Some(state)) => {
                let sql = format!(
                    "SELECT {} FROM backups WHERE state = :state ORDER BY host, name",
                    Db::BACKUP_COLUMNS
                );
                self.backup_rows(&sql, &[state])
            }
            (Some(host), None) => {
                let sql = format!(
                    "SELECT {} FROM backups WHERE host = :host ORDER BY host, name",
                    Db::BACKUP_COLUMNS
                );
                self.backup_rows(&sql, &[&host])
            }
            (Some(host), Some(state)) => {
                let sql = format!(
                    "SELECT {} FROM backups WHERE host = :host AND state = :state \
                     ORDER BY host, name",
                    Db::BACKUP_COLUMNS
                );
                self.backup_rows(&sql, &[&host, state])
            }
        }
    }

    pub fn count_pending(&self) -> Result<u64> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(rowid) FROM backups WHERE state = :state",
            params![BackupState::Pending.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    //
    // Backup-to-block links
    //

    pub fn insert_link(&self, backup_id: i64, pos: u64, hash: &BlockHash, commit: bool) -> Result<()> {
        self.begin()?;
        self.conn.execute(
            "INSERT INTO backup_blocks (pos, block, backup) VALUES (:pos, :block, :backup)",
            params![pos, hash.to_string(), backup_id],
        )?;
        self.maybe_commit(commit)
    }

    /// The links of one backup, ordered by position.
    pub fn backup_links(&self, backup_id: i64) -> Result<Vec<(u64, BlockHash)>> {
        let mut stmt = self.conn.prepare(
            "SELECT pos, block FROM backup_blocks WHERE backup = :backup ORDER BY pos ASC",
        )?;
        let links = stmt.query_map(params![backup_id], |row| {
            Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?))
        })?;
        links
            .map(|link| {
                let (pos, hash) = link?;
                Ok((pos, parse_hash(hash)?))
            })
            .collect()
    }

    //
    // Maintenance
    //

    /// Mark pending backups older than the cutoff as failed.
    ///
    /// Returns the number of affected rows; in dry-run mode only counts.
    pub fn fail_pending_older_than(&self, cutoff: i64, dry_run: bool) -> Result<usize> {
        if dry_run {
            let count: usize = self.conn.query_row(
                "SELECT COUNT(rowid) FROM backups WHERE state = 'pending' \
                 AND time_imported < :olderthan",
                params![cutoff],
                |row| row.get(0),
            )?;
            return Ok(count);
        }
        self.begin()?;
        let count = self.conn.execute(
            "UPDATE backups SET state = 'failed' WHERE state = 'pending' \
             AND time_imported < :olderthan",
            params![cutoff],
        )?;
        self.commit()?;
        Ok(count)
    }

    /// Delete links whose owning backup is missing, failed, or deleted.
    pub fn delete_dead_links(&self, dry_run: bool) -> Result<usize> {
        if dry_run {
            let count: usize = self.conn.query_row(
                "SELECT COUNT(rowid) FROM backup_blocks WHERE NOT EXISTS \
                 ( SELECT rowid FROM backups WHERE rowid = backup_blocks.backup \
                 AND state NOT IN ('failed','deleted') )",
                [],
                |row| row.get(0),
            )?;
            return Ok(count);
        }
        self.begin()?;
        let count = self.conn.execute(
            "DELETE FROM backup_blocks WHERE NOT EXISTS \
             ( SELECT rowid FROM backups WHERE rowid = backup_blocks.backup \
             AND state NOT IN ('failed','deleted') )",
            [],
        )?;
        self.commit()?;
        Ok(count)
    }

    /// Delete block rows with no surviving link and `time_imported` older
    /// than the cutoff. The age gate avoids racing an in-flight ingest that
    /// has stored a block it has not yet linked.
    pub fn delete_orphan_block_rows(&self, cutoff: i64, dry_run: bool) -> Result<usize> {
        if dry_run {
            let count: usize = self.conn.query_row(
                "SELECT COUNT(rowid) FROM blocks WHERE NOT EXISTS \
                 ( SELECT hash FROM backup_blocks WHERE block = blocks.hash ) \
                 AND time_imported < :olderthan",
                params![cutoff],
                |row| row.get(0),
            )?;
            return Ok(count);
        }
        self.begin()?;
        let count = self.conn.execute(
            "DELETE FROM blocks WHERE NOT EXISTS \
             ( SELECT hash FROM backup_blocks WHERE block = blocks.hash ) \
             AND time_imported < :olderthan",
            params![cutoff],
        )?;
        self.commit()?;
        Ok(count)
    }
}
