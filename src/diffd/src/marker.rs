// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-progress markers.
//!
//! A marker is a side-channel object recording that a diff job is under
//! production. Its body is the timestamp of the mark, which lets observers
//! age markers out (see [`crate::storage::InProgress`]) instead of trusting
//! them forever: a crashed worker leaves its marker behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusoto_s3::{DeleteObjectRequest, PutObjectRequest, S3Client, S3};

use crate::diff::rfc3339_nanos;

/// Suffix under which in-progress markers are stored.
pub const IN_PROGRESS_SUFFIX: &str = "_in_progress";

/// Flags diffs as being in progress.
#[async_trait]
pub trait Marker: Send + Sync {
    /// Flags the diff identified by `key` as being in progress. Marking an
    /// already-marked key refreshes its timestamp.
    async fn mark(&self, key: &str) -> Result<(), anyhow::Error>;

    /// Clears the in-progress flag for `key`. Unmarking an unmarked key is a
    /// no-op.
    async fn unmark(&self, key: &str) -> Result<(), anyhow::Error>;
}

/// A [`Marker`] backed by an S3 bucket.
pub struct S3Marker {
    bucket: String,
    client: S3Client,
    now: fn() -> DateTime<Utc>,
}

impl S3Marker {
    pub fn new(bucket: String, client: S3Client) -> S3Marker {
        S3Marker {
            bucket,
            client,
            now: Utc::now,
        }
    }

    #[cfg(test)]
    fn with_now(bucket: String, client: S3Client, now: fn() -> DateTime<Utc>) -> S3Marker {
        S3Marker { bucket, client, now }
    }
}

#[async_trait]
impl Marker for S3Marker {
    async fn mark(&self, key: &str) -> Result<(), anyhow::Error> {
        // The body must always carry the timestamp; an empty marker could
        // never be aged out by the staleness rule.
        let body = rfc3339_nanos((self.now)());
        self.client
            .put_object(PutObjectRequest {
                bucket: self.bucket.clone(),
                key: format!("{}{}", key, IN_PROGRESS_SUFFIX),
                body: Some(body.into_bytes().into()),
                ..Default::default()
            })
            .await
            .map_err(|err| anyhow::Error::new(err).context("writing in-progress marker"))?;
        Ok(())
    }

    async fn unmark(&self, key: &str) -> Result<(), anyhow::Error> {
        // S3 deletes of absent keys succeed, which gives unmark its no-op
        // semantics for free.
        self.client
            .delete_object(DeleteObjectRequest {
                bucket: self.bucket.clone(),
                key: format!("{}{}", key, IN_PROGRESS_SUFFIX),
                ..Default::default()
            })
            .await
            .map_err(|err| anyhow::Error::new(err).context("deleting in-progress marker"))?;
        Ok(())
    }
}
