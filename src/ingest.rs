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

//! Ingest a backup stream into the datastore.
//!
//! The stream is a TAR archive with a fixed shape: a header section naming
//! the backup, a body of previously-unseen blocks, and a footer carrying
//! the ordered block list. The engine walks the archive in a single pass
//! through the HEADER, BODY, FOOTER and DONE phases, deduplicating blocks
//! against the depot and linking the new backup as it goes.
//!
//! An aborted ingest leaves the `pending` backup row in place for the
//! cleaner to reap; blocks already stored remain valid dedup targets for
//! the next attempt.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;

use bytes::Bytes;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info};

use crate::backup::Backup;
use crate::block::Block;
use crate::compress::lz4::Decompressor;
use crate::datastore::Datastore;
use crate::{
    BlockHash, Error, Result, DELAY_DB_BLOCK_COMMIT, DELAY_DB_LINK_COMMIT,
    SKIP_KNOWN_BLOCKS_ENTIRELY, SKIP_VERIFYING_BLOCKS,
};

/// Header entries that must all arrive, in any order, before the body.
pub const TAR_HEADERS: [&str; 6] = [
    "/backup/host",
    "/backup/device",
    "/backup/blocksize",
    "/backup/filesize",
    "/backup/created",
    "/dedup/version",
];

/// Footer entries that must all arrive after the body.
pub const TAR_FOOTERS: [&str; 1] = ["/backup/list"];

lazy_static! {
    static ref BODY_ENTRY: Regex =
        Regex::new(r"^/newblocks/([0-9a-fA-F]{16})\.(lz4|tar)$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Body,
    Footer,
    Done,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Header => "HEADER",
            Phase::Body => "BODY",
            Phase::Footer => "FOOTER",
            Phase::Done => "DONE",
        }
    }
}

/// Counters from one ingest run.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct IngestStats {
    /// Blocks newly written to the depot.
    pub written_blocks: usize,
    /// Blocks already present; skipped or no-op inserts.
    pub deduplicated_blocks: usize,
    /// Links recorded for the new backup.
    pub linked_blocks: usize,
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>12} new blocks stored", self.written_blocks)?;
        writeln!(f, "{:>12} blocks deduplicated", self.deduplicated_blocks)?;
        write!(f, "{:>12} blocks linked", self.linked_blocks)
    }
}

/// Read one backup stream and record it as (host, name).
pub fn ingest<R: Read>(
    datastore: &Datastore,
    host: &str,
    name: &str,
    source: R,
) -> Result<IngestStats> {
    Ingest {
        datastore,
        host,
        name,
        values: HashMap::new(),
        need_headers: TAR_HEADERS.to_vec(),
        need_footers: TAR_FOOTERS.to_vec(),
        filesize: 0,
        backup: None,
        stats: IngestStats::default(),
    }
    .run(source)
}

struct Ingest<'d> {
    datastore: &'d Datastore,
    host: &'d str,
    name: &'d str,
    /// Text contents of header and footer entries, keyed by entry name.
    values: HashMap<String, String>,
    need_headers: Vec<&'static str>,
    need_footers: Vec<&'static str>,
    filesize: u64,
    backup: Option<Backup<'d>>,
    stats: IngestStats,
}

impl<'d> Ingest<'d> {
    fn run<R: Read>(mut self, source: R) -> Result<IngestStats> {
        let mut archive = tar::Archive::new(source);
        let mut phase = Phase::Header;
        info!("Starting TAR read");
        for entry in archive
            .entries()
            .map_err(|source| Error::StreamRead { source })?
        {
            let mut entry = entry.map_err(|source| Error::StreamRead { source })?;
            let entry_name = entry_name(&entry)?;

            if phase == Phase::Header {
                self.header_entry(&entry_name, &mut entry)?;
                if self.need_headers.is_empty() {
                    info!("TAR header done");
                    self.begin_body()?;
                    phase = Phase::Body;
                }
                continue;
            }

            if phase == Phase::Body {
                if let Some(captures) = BODY_ENTRY.captures(&entry_name) {
                    let client_hash: BlockHash = captures[1]
                        .to_ascii_lowercase()
                        .parse()
                        .map_err(|_| Error::InvalidHash {
                            text: captures[1].to_owned(),
                        })?;
                    let compressed = &captures[2] == "lz4";
                    self.body_entry(&entry_name, client_hash, compressed, &mut entry)?;
                    continue;
                }
                // First non-block entry starts the footer.
                if DELAY_DB_BLOCK_COMMIT {
                    self.datastore.db().commit()?;
                }
                info!("TAR body done");
                phase = Phase::Footer;
            }

            if phase == Phase::Footer {
                self.footer_entry(&entry_name, &mut entry)?;
                if self.need_footers.is_empty() {
                    self.link_and_finish()?;
                    phase = Phase::Done;
                    break;
                }
            }
        }

        if phase != Phase::Done {
            return Err(Error::TruncatedStream {
                phase: phase.name(),
            });
        }
        info!("Done processing");
        Ok(self.stats)
    }

    fn header_entry<R: Read>(&mut self, entry_name: &str, entry: &mut tar::Entry<R>) -> Result<()> {
        read_text_entry(&mut self.values, &mut self.need_headers, entry_name, entry)?;
        debug!(
            "Got tar header {entry_name}; {} remaining",
            self.need_headers.len()
        );
        Ok(())
    }

    fn header_value(&self, name: &'static str) -> &str {
        // Only called after the required header set is complete.
        &self.values[name]
    }

    fn parsed_header<T: std::str::FromStr>(&self, name: &'static str) -> Result<T> {
        let value = self.header_value(name);
        value.trim().parse().map_err(|_| Error::InvalidHeader {
            name: name.to_owned(),
            value: value.to_owned(),
        })
    }

    /// All headers arrived: verify the blocksize and open the backup record.
    fn begin_body(&mut self) -> Result<()> {
        let stream_blocksize: u64 = self.parsed_header("/backup/blocksize")?;
        if stream_blocksize != self.datastore.blocksize() {
            return Err(Error::BlocksizeMismatch {
                stream: stream_blocksize,
                depot: self.datastore.blocksize(),
            });
        }
        debug!("Verified backup blocksize {stream_blocksize} ok");
        self.filesize = self.parsed_header("/backup/filesize")?;
        let time_created: i64 = self.parsed_header("/backup/created")?;
        let device = self.header_value("/backup/device").to_owned();
        self.backup = Some(Backup::create(
            self.datastore,
            self.host,
            self.name,
            &device,
            time_created,
        )?);
        Ok(())
    }

    fn body_entry<R: Read>(
        &mut self,
        entry_name: &str,
        client_hash: BlockHash,
        compressed: bool,
        entry: &mut tar::Entry<R>,
    ) -> Result<()> {
        if SKIP_KNOWN_BLOCKS_ENTIRELY && self.datastore.hash_exists(&client_hash)? {
            self.stats.deduplicated_blocks += 1;
            return Ok(());
        }
        let mut raw = Vec::new();
        entry
            .read_to_end(&mut raw)
            .map_err(|source| Error::StreamRead { source })?;
        let bytes = if compressed {
            Bytes::from(Decompressor::new().decompress(&raw)?)
        } else {
            Bytes::from(raw)
        };
        let block = if SKIP_VERIFYING_BLOCKS {
            Block::with_hash(bytes, client_hash)
        } else {
            let block = Block::new(bytes);
            if *block.hash() != client_hash {
                return Err(Error::ClientHashMismatch {
                    entry: entry_name.to_owned(),
                    client: client_hash,
                    actual: *block.hash(),
                });
            }
            block
        };
        if self.datastore.add_block(&block, !DELAY_DB_BLOCK_COMMIT)? {
            self.stats.written_blocks += 1;
        } else {
            self.stats.deduplicated_blocks += 1;
        }
        Ok(())
    }

    fn footer_entry<R: Read>(&mut self, entry_name: &str, entry: &mut tar::Entry<R>) -> Result<()> {
        info!("TAR footer: {entry_name}");
        read_text_entry(&mut self.values, &mut self.need_footers, entry_name, entry)
    }

    /// The footer set is complete: link the listed hashes in position
    /// order, commit, and finalize the backup.
    fn link_and_finish(&mut self) -> Result<()> {
        info!("TAR complete; linking backup");
        let backup = self.backup.as_ref().expect("backup created in header phase");
        let list = &self.values["/backup/list"];
        let mut pos = 0u64;
        for line in list.lines() {
            let hash: BlockHash = line.trim().parse().map_err(|_| Error::InvalidHash {
                text: line.to_owned(),
            })?;
            pos += 1;
            backup.link(pos, &hash, !DELAY_DB_LINK_COMMIT)?;
        }
        self.datastore.db().commit()?;
        backup.finish(self.filesize, true)?;
        self.stats.linked_blocks = pos as usize;
        info!("Backup linked and finished");
        Ok(())
    }
}

/// Record one required text entry from the header or footer set.
///
/// An entry outside the remaining-required set is fatal, which also
/// catches repeated entries.
fn read_text_entry<R: Read>(
    values: &mut HashMap<String, String>,
    needed: &mut Vec<&'static str>,
    entry_name: &str,
    entry: &mut tar::Entry<R>,
) -> Result<()> {
    let Some(pos) = needed.iter().position(|name| *name == entry_name) else {
        return Err(Error::UnexpectedEntry {
            name: entry_name.to_owned(),
        });
    };
    needed.remove(pos);
    let mut value = String::new();
    entry
        .read_to_string(&mut value)
        .map_err(|source| Error::StreamRead { source })?;
    if entry_name == "/backup/list" {
        debug!("Config: {entry_name} = [...]");
    } else {
        debug!("Config: {entry_name} = {value}");
    }
    values.insert(entry_name.to_owned(), value);
    Ok(())
}

/// The entry's stored name, canonicalized to a leading-slash form.
///
/// Clients write absolute names like `/backup/host`; some tar writers
/// strip the leading slash, so it is restored here before matching.
fn entry_name<R: Read>(entry: &tar::Entry<R>) -> Result<String> {
    let bytes = entry.path_bytes();
    let name = std::str::from_utf8(&bytes)
        .map_err(|_| Error::UnexpectedEntry {
            name: String::from_utf8_lossy(&bytes).into_owned(),
        })?
        .to_owned();
    if name.starts_with('/') {
        Ok(name)
    } else {
        Ok(format!("/{name}"))
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::backup::BackupState;
    use crate::compress::lz4::Compressor;

    fn scratch_datastore(blocksize: u64) -> (TempDir, Datastore) {
        let testdir = TempDir::new().unwrap();
        let datastore = Datastore::create(testdir.path(), blocksize).unwrap();
        (testdir, datastore)
    }

    fn append_text(builder: &mut tar::Builder<Vec<u8>>, name: &str, content: &str) {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }

    fn append_block(builder: &mut tar::Builder<Vec<u8>>, content: &[u8]) -> BlockHash {
        let hash = BlockHash::hash_bytes(content);
        let compressed = Compressor::new().compress(content).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(compressed.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                format!("newblocks/{hash}.lz4"),
                compressed.as_slice(),
            )
            .unwrap();
        hash
    }

    fn stream_headers(builder: &mut tar::Builder<Vec<u8>>, blocksize: u64, filesize: u64) {
        append_text(builder, "backup/host", "h1");
        append_text(builder, "backup/device", "sda");
        append_text(builder, "backup/blocksize", &blocksize.to_string());
        append_text(builder, "backup/filesize", &filesize.to_string());
        append_text(builder, "backup/created", "100");
        append_text(builder, "dedup/version", "2");
    }

    /// A complete well-formed stream over the given block contents.
    fn build_stream(blocksize: u64, blocks: &[&[u8]]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let filesize = blocksize * blocks.len() as u64;
        stream_headers(&mut builder, blocksize, filesize);
        let mut hashes = Vec::new();
        for content in blocks {
            hashes.push(append_block(&mut builder, content));
        }
        let list = hashes
            .iter()
            .map(|hash| hash.to_string())
            .collect::<Vec<String>>()
            .join("\n");
        append_text(&mut builder, "backup/list", &list);
        builder.into_inner().unwrap()
    }

    #[test]
    fn ingest_stores_links_and_finishes() {
        let (_testdir, datastore) = scratch_datastore(4);
        let stream = build_stream(4, &[b"aaaa", b"bbbb", b"cccc"]);
        let stats = ingest(&datastore, "h1", "b1", stream.as_slice()).unwrap();
        assert_eq!(stats.written_blocks, 3);
        assert_eq!(stats.deduplicated_blocks, 0);
        assert_eq!(stats.linked_blocks, 3);

        let backup = Backup::from_name(&datastore, "h1", "b1").unwrap();
        let row = backup.row().unwrap();
        assert_eq!(row.state, BackupState::Ready);
        assert_eq!(row.size, Some(12));
        assert_eq!(datastore.list_hashes().unwrap().len(), 3);
    }

    #[test]
    fn reingest_is_all_dedup_hits() {
        let (testdir, datastore) = scratch_datastore(4);
        let stream = build_stream(4, &[b"aaaa", b"bbbb", b"cccc"]);
        ingest(&datastore, "h1", "b1", stream.as_slice()).unwrap();
        let stats = ingest(&datastore, "h1", "b2", stream.as_slice()).unwrap();
        assert_eq!(stats.written_blocks, 0);
        assert_eq!(stats.deduplicated_blocks, 3);
        assert_eq!(stats.linked_blocks, 3);
        assert_eq!(
            std::fs::read_dir(testdir.path().join("blocks"))
                .unwrap()
                .count(),
            3
        );
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let (_testdir, datastore) = scratch_datastore(4);
        let stream = build_stream(4, &[b"aaaa"]);
        ingest(&datastore, "h1", "b1", stream.as_slice()).unwrap();
        let err = ingest(&datastore, "h1", "b1", stream.as_slice()).unwrap_err();
        assert!(matches!(err, Error::BackupExists { .. }));
    }

    #[test]
    fn blocksize_mismatch_is_fatal() {
        let (_testdir, datastore) = scratch_datastore(8);
        let stream = build_stream(4, &[b"aaaa"]);
        let err = ingest(&datastore, "h1", "b1", stream.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            Error::BlocksizeMismatch {
                stream: 4,
                depot: 8
            }
        ));
    }

    #[test]
    fn unexpected_header_entry_is_fatal() {
        let (_testdir, datastore) = scratch_datastore(4);
        let mut builder = tar::Builder::new(Vec::new());
        append_text(&mut builder, "backup/host", "h1");
        append_text(&mut builder, "backup/surprise", "?");
        let stream = builder.into_inner().unwrap();
        let err = ingest(&datastore, "h1", "b1", stream.as_slice()).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEntry { .. }));
    }

    #[test]
    fn repeated_header_entry_is_fatal() {
        let (_testdir, datastore) = scratch_datastore(4);
        let mut builder = tar::Builder::new(Vec::new());
        append_text(&mut builder, "backup/host", "h1");
        append_text(&mut builder, "backup/host", "h1");
        let stream = builder.into_inner().unwrap();
        let err = ingest(&datastore, "h1", "b1", stream.as_slice()).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEntry { .. }));
    }

    #[test]
    fn truncated_stream_leaves_backup_pending() {
        let (_testdir, datastore) = scratch_datastore(4);
        let mut builder = tar::Builder::new(Vec::new());
        stream_headers(&mut builder, 4, 4);
        append_block(&mut builder, b"aaaa");
        // No footer.
        let stream = builder.into_inner().unwrap();
        let err = ingest(&datastore, "h1", "b1", stream.as_slice()).unwrap_err();
        assert!(matches!(err, Error::TruncatedStream { phase: "BODY" }));

        let backup = Backup::from_name(&datastore, "h1", "b1").unwrap();
        assert_eq!(backup.row().unwrap().state, BackupState::Pending);
    }

    #[test]
    fn raw_tar_body_entries_are_accepted() {
        let (_testdir, datastore) = scratch_datastore(4);
        let mut builder = tar::Builder::new(Vec::new());
        stream_headers(&mut builder, 4, 4);
        let content = b"dddd";
        let hash = BlockHash::hash_bytes(content);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("newblocks/{hash}.tar"), &content[..])
            .unwrap();
        append_text(&mut builder, "backup/list", &hash.to_string());
        let stream = builder.into_inner().unwrap();

        let stats = ingest(&datastore, "h1", "b1", stream.as_slice()).unwrap();
        assert_eq!(stats.written_blocks, 1);
        // Raw entries are still stored compressed on disk.
        let row = datastore.db().block_row(&hash).unwrap();
        assert_eq!(row.compressed, "lz4");
        assert_eq!(
            datastore.get_block(&hash).unwrap().bytes().as_ref(),
            &content[..]
        );
    }

    #[test]
    fn footer_listing_unknown_hash_fails_finish() {
        let (_testdir, datastore) = scratch_datastore(4);
        let mut builder = tar::Builder::new(Vec::new());
        stream_headers(&mut builder, 4, 8);
        let hash = append_block(&mut builder, b"aaaa");
        let ghost = BlockHash::hash_bytes(b"not sent");
        let list = format!("{hash}\n{ghost}");
        append_text(&mut builder, "backup/list", &list);
        let stream = builder.into_inner().unwrap();

        let err = ingest(&datastore, "h1", "b1", stream.as_slice()).unwrap_err();
        assert!(matches!(err, Error::ContinuityBroken { .. }));
        let backup = Backup::from_name(&datastore, "h1", "b1").unwrap();
        assert_eq!(backup.row().unwrap().state, BackupState::Failed);
    }
}
