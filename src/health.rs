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

//! Read-only report on the depot's current state: damaged blocks in
//! quarantine, and backups marked failed or broken.

use tracing::{info, warn};

use crate::backup::BackupState;
use crate::datastore::Datastore;
use crate::db::BackupRow;
use crate::{BlockHash, Result};

/// Options controlling the behavior of [health].
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct HealthOptions {
    /// Skip counting damaged block files.
    pub skip_blocks: bool,
    /// Skip counting failed and broken backups.
    pub skip_backups: bool,
}

/// What the health check found. Purely observational; nothing is changed.
#[derive(Debug, Default)]
pub struct HealthReport {
    pub damaged_blocks: Vec<BlockHash>,
    pub failed_backups: Vec<BackupRow>,
    pub broken_backups: Vec<BackupRow>,
}

impl HealthReport {
    /// Healthy iff zero damaged blocks, zero failed backups, and zero
    /// broken backups.
    pub fn is_healthy(&self) -> bool {
        self.damaged_blocks.is_empty()
            && self.failed_backups.is_empty()
            && self.broken_backups.is_empty()
    }
}

/// Collect and log the depot's health.
pub fn health(datastore: &Datastore, options: &HealthOptions) -> Result<HealthReport> {
    let mut report = HealthReport::default();

    if !options.skip_blocks {
        report.damaged_blocks = datastore.damaged_hashes()?;
        if report.damaged_blocks.is_empty() {
            info!("Have zero damaged blocks");
        } else {
            warn!("Have {} damaged blocks", report.damaged_blocks.len());
            for hash in &report.damaged_blocks {
                info!("-> Hash {hash}");
            }
        }
    }

    if !options.skip_backups {
        report.failed_backups = datastore.backups_by_state(BackupState::Failed)?;
        if report.failed_backups.is_empty() {
            info!("Have zero failed backups");
        } else {
            warn!("Have {} failed backups", report.failed_backups.len());
            for row in &report.failed_backups {
                info!("-> Backup {}:{}", row.host, row.name);
            }
        }
        report.broken_backups = datastore.backups_by_state(BackupState::Broken)?;
        if report.broken_backups.is_empty() {
            info!("Have zero broken backups");
        } else {
            warn!("Have {} broken backups", report.broken_backups.len());
            for row in &report.broken_backups {
                info!("-> Backup {}:{}", row.host, row.name);
            }
        }
    }

    if report.is_healthy() {
        info!("Overall state: healthy");
    } else {
        warn!("Overall state: damaged");
    }
    Ok(report)
}
