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

//! Restore a backup by streaming its blocks back out in position order.

use std::fmt;
use std::io::Write;

use tracing::{info, warn};

use crate::backup::{Backup, BackupState};
use crate::datastore::Datastore;
use crate::Result;

/// Counters from one restore run.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct RestoreStats {
    pub blocks: usize,
    pub uncompressed_bytes: u64,
}

impl fmt::Display for RestoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>12} blocks restored\n{:>12} bytes written",
            self.blocks, self.uncompressed_bytes
        )
    }
}

/// Write the backup's decompressed blocks, concatenated without framing,
/// to the output sink.
pub fn restore(
    datastore: &Datastore,
    host: &str,
    name: &str,
    out: &mut dyn Write,
) -> Result<RestoreStats> {
    let backup = Backup::from_name(datastore, host, name)?;
    let row = backup.row()?;
    if row.state != BackupState::Ready {
        warn!(
            "Backup {host}:{name} is in state {}, not ready",
            row.state
        );
    }
    let mut stats = RestoreStats::default();
    info!("Loaded backup");
    for block in backup.blocks()? {
        let block = block?;
        out.write_all(block.bytes())?;
        stats.blocks += 1;
        stats.uncompressed_bytes += block.len() as u64;
    }
    out.flush()?;
    info!("Done restoring");
    Ok(stats)
}
