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

//! Generally useful functions.

use std::time::{SystemTime, UNIX_EPOCH};

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");

/// Whole seconds since the Unix epoch.
pub fn unix_time_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Render an epoch-seconds timestamp as `YYYY-MM-DD_HH-MM-SS` (UTC).
pub fn format_timestamp(secs: i64) -> String {
    OffsetDateTime::from_unix_timestamp(secs)
        .ok()
        .and_then(|t| t.format(TIMESTAMP_FORMAT).ok())
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
mod test {
    use super::format_timestamp;

    #[test]
    fn timestamp_format() {
        assert_eq!(format_timestamp(0), "1970-01-01_00-00-00");
        assert_eq!(format_timestamp(100), "1970-01-01_00-01-40");
    }
}
