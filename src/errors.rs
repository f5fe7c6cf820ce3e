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

//! Depot error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::backup::BackupState;
use crate::blockhash::BlockHash;

/// Depot specific error.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("Directory for new depot does not exist: {path:?}")]
    DepotDirectoryMissing { path: PathBuf },

    #[error("Directory for new depot is not empty: {path:?}")]
    DepotDirectoryNotEmpty { path: PathBuf },

    #[error("Depot database already exists: {path:?}")]
    DatabaseExists { path: PathBuf },

    #[error("Depot database does not exist: {path:?}")]
    DatabaseMissing { path: PathBuf },

    #[error("Depot setting {key:?} is missing or invalid")]
    BadSetting { key: &'static str },

    #[error("Stream blocksize {stream} differs from depot blocksize {depot}")]
    BlocksizeMismatch { stream: u64, depot: u64 },

    #[error("Block {hash} corrupt; actual decompressed hash {actual_hash}")]
    BlockCorrupt {
        hash: BlockHash,
        actual_hash: BlockHash,
    },

    #[error("Client hash {client} differs from server hash {actual} for entry {entry:?}")]
    ClientHashMismatch {
        entry: String,
        client: BlockHash,
        actual: BlockHash,
    },

    #[error("Failed to decompress block data")]
    Decompression { source: io::Error },

    #[error(transparent)]
    Compression {
        #[from]
        source: lz4_flex::frame::Error,
    },

    #[error("No such block in database: {hash}")]
    BlockRowMissing { hash: BlockHash },

    #[error("Backup {host}:{name} failed continuity verification")]
    ContinuityBroken { host: String, name: String },

    #[error("Backup {host}:{name} already exists")]
    BackupExists { host: String, name: String },

    #[error("No backup with host {host:?} and name {name:?}")]
    BackupNotFound { host: String, name: String },

    #[error("Cannot finish backup {host}:{name} in state {state}")]
    NotPending {
        host: String,
        name: String,
        state: BackupState,
    },

    #[error("Unknown backup state {state:?}")]
    UnknownState { state: String },

    #[error("Cannot create block file, file already exists: {path:?}")]
    BlockFileExists { path: PathBuf },

    #[error("Block file is locked by another writer: {path:?}")]
    BlockFileLocked { path: PathBuf, source: io::Error },

    #[error("Failed to write block file {filename:?}")]
    WriteBlock { filename: String, source: io::Error },

    #[error("Failed to read block file {filename:?}")]
    ReadBlock { filename: String, source: io::Error },

    #[error("Failed to list block files")]
    ListBlocks { source: io::Error },

    #[error("Failed to quarantine block file {filename:?}")]
    QuarantineBlock { filename: String, source: io::Error },

    #[error("Unexpected entry {name:?} in archive stream")]
    UnexpectedEntry { name: String },

    #[error("Invalid value {value:?} for stream header {name:?}")]
    InvalidHeader { name: String, value: String },

    #[error("Invalid block hash {text:?} in stream")]
    InvalidHash { text: String },

    #[error("Failed to read archive stream")]
    StreamRead { source: io::Error },

    #[error("Archive stream ended in phase {phase}; corrupted or incomplete backup")]
    TruncatedStream { phase: &'static str },

    #[error(transparent)]
    Database {
        #[from]
        source: rusqlite::Error,
    },

    /// Generic IO error.
    #[error(transparent)]
    IOError {
        #[from]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
