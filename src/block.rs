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

//! A block of backup content, identified by the hash of its
//! uncompressed bytes.

use bytes::Bytes;

use crate::compress::lz4::{Compressor, Decompressor};
use crate::{BlockHash, Result};

/// One uncompressed span of backup content plus its content hash.
///
/// Blocks are value objects: they carry no reference to the datastore
/// that owns them.
#[derive(Debug, Clone)]
pub struct Block {
    bytes: Bytes,
    hash: BlockHash,
}

impl Block {
    /// Build a block from uncompressed bytes, computing the hash.
    pub fn new(bytes: Bytes) -> Block {
        let hash = BlockHash::hash_bytes(&bytes);
        Block { bytes, hash }
    }

    /// Build a block from uncompressed bytes with a caller-asserted hash.
    ///
    /// The hash is trusted, not recomputed.
    pub fn with_hash(bytes: Bytes, hash: BlockHash) -> Block {
        Block { bytes, hash }
    }

    /// Build a block from an LZ4 frame, optionally trusting an asserted hash.
    pub fn from_compressed(compressed: &[u8], hash: Option<BlockHash>) -> Result<Block> {
        let bytes = Bytes::from(Decompressor::new().decompress(compressed)?);
        Ok(match hash {
            Some(hash) => Block::with_hash(bytes, hash),
            None => Block::new(bytes),
        })
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }

    /// Uncompressed length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The uncompressed content.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// The content as an LZ4 frame, for on-disk storage.
    pub fn compressed(&self) -> Result<Vec<u8>> {
        Compressor::new().compress(&self.bytes)
    }
}
