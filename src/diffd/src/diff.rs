// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Diff descriptors.
//!
//! A descriptor identifies a diff job by the two time windows it covers. The
//! id is a name-based UUID over the minute-truncated windows, so any two
//! requests naming the same truncated windows address the same job.

use chrono::{DateTime, DurationRound, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use thiserror::Error;
use uuid::Uuid;

/// Namespace under which diff ids are derived.
static DIFF_NAMESPACE: Lazy<Uuid> = Lazy::new(|| Uuid::new_v5(&Uuid::nil(), b"diff"));

/// An invalid pair of time windows.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidWindows {
    #[error("start should be before stop")]
    InvertedRange,
    #[error("the previous range should be before the next range")]
    MisorderedRanges,
}

/// Identifies a diff of the network graphs of two time windows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diff {
    pub id: String,
    pub previous_start: DateTime<Utc>,
    pub previous_stop: DateTime<Utc>,
    pub next_start: DateTime<Utc>,
    pub next_stop: DateTime<Utc>,
}

impl Diff {
    /// Validates the two windows, truncates them to whole minutes, and
    /// derives the diff id.
    ///
    /// Truncation happens before id derivation, so instants that differ only
    /// below the minute produce the same descriptor. Anything with more
    /// precision does not fit the flow-log filter granularity.
    pub fn from_windows(
        previous_start: DateTime<Utc>,
        previous_stop: DateTime<Utc>,
        next_start: DateTime<Utc>,
        next_stop: DateTime<Utc>,
    ) -> Result<Diff, InvalidWindows> {
        validate_windows(previous_start, previous_stop, next_start, next_stop)?;
        let previous_start = truncate_minute(previous_start);
        let previous_stop = truncate_minute(previous_stop);
        let next_start = truncate_minute(next_start);
        let next_stop = truncate_minute(next_stop);
        let name = format!(
            "{}{}{}{}",
            rfc3339_nanos(previous_start),
            rfc3339_nanos(previous_stop),
            rfc3339_nanos(next_start),
            rfc3339_nanos(next_stop),
        );
        let id = Uuid::new_v5(&DIFF_NAMESPACE, name.as_bytes()).to_string();
        Ok(Diff {
            id,
            previous_start,
            previous_stop,
            next_start,
            next_stop,
        })
    }

    /// Builds a descriptor around an externally supplied id, as carried by
    /// queued job payloads. The windows are validated but not re-truncated.
    pub fn with_id(
        id: String,
        previous_start: DateTime<Utc>,
        previous_stop: DateTime<Utc>,
        next_start: DateTime<Utc>,
        next_stop: DateTime<Utc>,
    ) -> Result<Diff, InvalidWindows> {
        validate_windows(previous_start, previous_stop, next_start, next_stop)?;
        Ok(Diff {
            id,
            previous_start,
            previous_stop,
            next_start,
            next_stop,
        })
    }
}

/// Formats an instant in the RFC3339 form with nanosecond precision used on
/// the wire and in marker bodies.
pub fn rfc3339_nanos(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn validate_windows(
    previous_start: DateTime<Utc>,
    previous_stop: DateTime<Utc>,
    next_start: DateTime<Utc>,
    next_stop: DateTime<Utc>,
) -> Result<(), InvalidWindows> {
    if previous_start > previous_stop || next_start > next_stop {
        return Err(InvalidWindows::InvertedRange);
    }
    if previous_start > next_start || previous_stop > next_stop {
        return Err(InvalidWindows::MisorderedRanges);
    }
    Ok(())
}

fn truncate_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(chrono::Duration::minutes(1))
        .expect("one minute is a valid truncation granularity")
}
