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

//! LZ4-frame compression.

use std::io::{Read, Write};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::{Error, Result};

/// Holds a reusable buffer for LZ4 compression.
#[derive(Default)]
pub struct Compressor {}

impl Compressor {
    pub fn new() -> Compressor {
        Compressor::default()
    }

    /// Compress bytes into an LZ4 frame.
    pub fn compress(&mut self, in_buf: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = FrameEncoder::new(Vec::with_capacity(in_buf.len() / 2 + 64));
        encoder.write_all(in_buf)?;
        Ok(encoder.finish()?)
    }
}

/// Holds a reusable buffer for LZ4 decompression.
#[derive(Default)]
pub struct Decompressor {}

impl Decompressor {
    pub fn new() -> Decompressor {
        Decompressor::default()
    }

    /// Decompress an LZ4 frame into the original bytes.
    ///
    /// Corrupt input is reported as [Error::Decompression] so callers can
    /// distinguish bad block data from other IO failures.
    pub fn decompress(&mut self, compressed: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(compressed.len() * 2);
        FrameDecoder::new(compressed)
            .read_to_end(&mut out)
            .map_err(|source| Error::Decompression { source })?;
        Ok(out)
    }
}
