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

//! Abstracted compression algorithms.
//!
//! Block identity is always the hash of the uncompressed bytes;
//! compression is an on-disk optimization invisible to identity.

pub mod lz4;

/// Codec tag persisted in block metadata for LZ4-frame storage.
///
/// An empty tag means the block is stored raw.
pub const CODEC_LZ4: &str = "lz4";
