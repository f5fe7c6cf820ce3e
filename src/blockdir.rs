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

//! Block artifacts are stored as flat files.
//!
//! Healthy blocks live under `blocks/`, named `<hash>.lz4` for LZ4-frame
//! storage or bare `<hash>` for raw storage. Blocks that fail verification
//! are quarantined under `damaged/` with an epoch-stamped `.broken` suffix.
//!
//! The structure is: depot > blockdir > file.

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::warn;

use crate::compress::CODEC_LZ4;
use crate::misc::unix_time_now;
use crate::{BlockHash, Error, Result, BLOCK_HASH_SIZE_BYTES};

pub const BLOCKS_DIR: &str = "blocks";
pub const DAMAGED_DIR: &str = "damaged";

/// The on-disk filename for a block stored with the given codec tag.
///
/// The filename recorded in the metadata row is authoritative; this is
/// only used when first creating the file.
pub fn block_filename(hash: &BlockHash, codec: &str) -> String {
    if codec.is_empty() {
        hash.to_string()
    } else {
        format!("{hash}.{codec}")
    }
}

/// A directory holding block files, plus its quarantine sibling.
#[derive(Debug, Clone)]
pub struct BlockDir {
    blocks_dir: PathBuf,
    damaged_dir: PathBuf,
}

impl BlockDir {
    /// Access the block directories under an existing depot directory.
    pub fn open(depot_dir: &Path) -> BlockDir {
        BlockDir {
            blocks_dir: depot_dir.join(BLOCKS_DIR),
            damaged_dir: depot_dir.join(DAMAGED_DIR),
        }
    }

    /// Create `blocks/` and `damaged/` under a new depot directory.
    pub fn create(depot_dir: &Path) -> Result<BlockDir> {
        let blockdir = BlockDir::open(depot_dir);
        fs::create_dir(&blockdir.blocks_dir)?;
        fs::create_dir(&blockdir.damaged_dir)?;
        Ok(blockdir)
    }

    pub fn path_for_file(&self, filename: &str) -> PathBuf {
        self.blocks_dir.join(filename)
    }

    /// Exclusively create a block file and write the payload.
    ///
    /// An existing file with the target name indicates metadata/filesystem
    /// divergence and fails loudly. The open descriptor holds an exclusive
    /// non-blocking advisory lock for the duration of the write, so a
    /// concurrent writer racing on the same hash observes a create failure.
    pub fn put(&self, filename: &str, payload: &[u8]) -> Result<()> {
        let path = self.path_for_file(filename);
        if path.exists() {
            return Err(Error::BlockFileExists { path });
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::AlreadyExists {
                    Error::BlockFileExists { path: path.clone() }
                } else {
                    Error::WriteBlock {
                        filename: filename.to_owned(),
                        source,
                    }
                }
            })?;
        file.try_lock_exclusive()
            .map_err(|source| Error::BlockFileLocked {
                path: path.clone(),
                source,
            })?;
        file.write_all(payload).map_err(|source| Error::WriteBlock {
            filename: filename.to_owned(),
            source,
        })?;
        // The advisory lock is released when the descriptor closes.
        Ok(())
    }

    /// Read back the raw contents of a block file, as stored on disk.
    pub fn get(&self, filename: &str) -> Result<Vec<u8>> {
        fs::read(self.path_for_file(filename)).map_err(|source| Error::ReadBlock {
            filename: filename.to_owned(),
            source,
        })
    }

    /// Move a block file into quarantine.
    ///
    /// The quarantined name carries the current epoch, so multiple damaged
    /// versions of the same hash may coexist across time.
    pub fn move_to_damaged(&self, filename: &str) -> Result<PathBuf> {
        let damaged_name = format!("{}.{}.broken", filename, unix_time_now());
        let dst = self.damaged_dir.join(damaged_name);
        fs::rename(self.path_for_file(filename), &dst).map_err(|source| {
            Error::QuarantineBlock {
                filename: filename.to_owned(),
                source,
            }
        })?;
        Ok(dst)
    }

    pub fn remove(&self, filename: &str) -> Result<()> {
        fs::remove_file(self.path_for_file(filename))?;
        Ok(())
    }

    /// Non-recursive listing of the filenames in `blocks/`.
    pub fn scan(&self) -> Result<Vec<String>> {
        let mut filenames = Vec::new();
        for entry in
            fs::read_dir(&self.blocks_dir).map_err(|source| Error::ListBlocks { source })?
        {
            let entry = entry.map_err(|source| Error::ListBlocks { source })?;
            match entry.file_name().into_string() {
                Ok(filename) => filenames.push(filename),
                Err(filename) => warn!("Unexpected file name in blockdir: {filename:?}"),
            }
        }
        filenames.sort_unstable();
        Ok(filenames)
    }

    /// List quarantined files whose names start with a block hash.
    pub fn scan_damaged(&self) -> Result<Vec<(BlockHash, PathBuf)>> {
        let mut damaged = Vec::new();
        for entry in
            fs::read_dir(&self.damaged_dir).map_err(|source| Error::ListBlocks { source })?
        {
            let entry = entry.map_err(|source| Error::ListBlocks { source })?;
            let filename = match entry.file_name().into_string() {
                Ok(filename) => filename,
                Err(filename) => {
                    warn!("Unexpected file name in damaged dir: {filename:?}");
                    continue;
                }
            };
            if let Some(prefix) = filename.get(..BLOCK_HASH_SIZE_BYTES * 2) {
                if let Ok(hash) = prefix.parse::<BlockHash>() {
                    damaged.push((hash, entry.path()));
                    continue;
                }
            }
            warn!("Unexpected file name in damaged dir: {filename:?}");
        }
        damaged.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        Ok(damaged)
    }
}

/// True if the codec tag names LZ4-frame storage.
pub fn codec_is_lz4(codec: &str) -> bool {
    codec == CODEC_LZ4
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    fn setup() -> (TempDir, BlockDir) {
        let testdir = TempDir::new().unwrap();
        let blockdir = BlockDir::create(testdir.path()).unwrap();
        (testdir, blockdir)
    }

    #[test]
    fn put_then_get() {
        let (_testdir, blockdir) = setup();
        blockdir.put("00ff00ff00ff00ff.lz4", b"payload").unwrap();
        assert_eq!(blockdir.get("00ff00ff00ff00ff.lz4").unwrap(), b"payload");
        assert_eq!(blockdir.scan().unwrap(), ["00ff00ff00ff00ff.lz4"]);
    }

    #[test]
    fn put_refuses_existing_file() {
        let (_testdir, blockdir) = setup();
        blockdir.put("00ff00ff00ff00ff.lz4", b"payload").unwrap();
        let err = blockdir
            .put("00ff00ff00ff00ff.lz4", b"other")
            .unwrap_err();
        assert!(matches!(err, Error::BlockFileExists { .. }));
    }

    #[test]
    fn quarantine_moves_and_stamps() {
        let (testdir, blockdir) = setup();
        blockdir.put("00ff00ff00ff00ff.lz4", b"payload").unwrap();
        let dst = blockdir.move_to_damaged("00ff00ff00ff00ff.lz4").unwrap();
        assert!(dst.starts_with(testdir.path().join(DAMAGED_DIR)));
        let dst_name = dst.file_name().unwrap().to_str().unwrap().to_owned();
        assert!(dst_name.starts_with("00ff00ff00ff00ff.lz4."));
        assert!(dst_name.ends_with(".broken"));
        assert!(blockdir.scan().unwrap().is_empty());

        let damaged = blockdir.scan_damaged().unwrap();
        assert_eq!(damaged.len(), 1);
        assert_eq!(damaged[0].0.to_string(), "00ff00ff00ff00ff");
    }

    #[test]
    fn filename_convention() {
        let hash: BlockHash = "0123456789abcdef".parse().unwrap();
        assert_eq!(block_filename(&hash, "lz4"), "0123456789abcdef.lz4");
        assert_eq!(block_filename(&hash, ""), "0123456789abcdef");
    }
}
