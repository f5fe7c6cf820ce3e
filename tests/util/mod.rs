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

//! Helpers shared by the integration tests: synthesized client streams.

use depot::compress::lz4::Compressor;
use depot::BlockHash;

/// Append a small text entry, as the client writes headers and footers.
pub fn append_text(builder: &mut tar::Builder<Vec<u8>>, name: &str, content: &str) {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, content.as_bytes())
        .unwrap();
}

/// Append one `/newblocks/<hash>.lz4` body entry.
pub fn append_block(builder: &mut tar::Builder<Vec<u8>>, content: &[u8]) -> BlockHash {
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

/// A complete well-formed backup stream over the given block contents.
///
/// The declared filesize is `blocksize * blocks.len()`, matching a client
/// that pads its final block.
pub fn build_stream(host: &str, blocksize: u64, blocks: &[&[u8]]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let filesize = blocksize * blocks.len() as u64;
    append_text(&mut builder, "backup/host", host);
    append_text(&mut builder, "backup/device", "sda");
    append_text(&mut builder, "backup/blocksize", &blocksize.to_string());
    append_text(&mut builder, "backup/filesize", &filesize.to_string());
    append_text(&mut builder, "backup/created", "100");
    append_text(&mut builder, "dedup/version", "2");
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
