// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Storage for completed diff documents.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusoto_core::RusotoError;
use rusoto_s3::{
    GetObjectError, GetObjectRequest, HeadObjectError, HeadObjectRequest, PutObjectRequest,
    S3Client, S3,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::marker::IN_PROGRESS_SUFFIX;

/// Suffix under which completed diff documents are stored.
const KEY_SUFFIX: &str = ".dot";

/// A readable payload returned by [`Storage::get`].
pub type Payload = Pin<Box<dyn AsyncRead + Send>>;

/// An error produced by a storage operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No completed diff exists under the requested key.
    #[error("diff {0} was not found")]
    NotFound(String),
    /// The diff is in the process of being created.
    #[error("diff {0} is being created")]
    InProgress(String),
    /// The backing object store failed.
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

/// Access to created diffs.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns the diff stored under `key`.
    async fn get(&self, key: &str) -> Result<Payload, StorageError>;

    /// Reports whether a diff exists under `key` without downloading it.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Stores a diff under `key`. Storing is an overwrite, so repeated
    /// production of the same key is idempotent.
    async fn store(&self, key: &str, data: Payload) -> Result<(), StorageError>;
}

/// A [`Storage`] backed by an S3 bucket.
pub struct S3Storage {
    pub bucket: String,
    pub client: S3Client,
}

#[async_trait]
impl Storage for S3Storage {
    async fn get(&self, key: &str) -> Result<Payload, StorageError> {
        let res = self
            .client
            .get_object(GetObjectRequest {
                bucket: self.bucket.clone(),
                key: format!("{}{}", key, KEY_SUFFIX),
                ..Default::default()
            })
            .await
            .map_err(|err| match err {
                RusotoError::Service(GetObjectError::NoSuchKey(_)) => {
                    StorageError::NotFound(key.to_string())
                }
                err if is_unknown_not_found(&err) => StorageError::NotFound(key.to_string()),
                err => StorageError::Operation(
                    anyhow::Error::new(err).context("fetching diff object"),
                ),
            })?;
        match res.body {
            Some(body) => Ok(Box::pin(body.into_async_read())),
            None => Ok(Box::pin(std::io::Cursor::new(Vec::new()))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let res = self
            .client
            .head_object(HeadObjectRequest {
                bucket: self.bucket.clone(),
                key: format!("{}{}", key, KEY_SUFFIX),
                ..Default::default()
            })
            .await;
        match res {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(HeadObjectError::NoSuchKey(_))) => Ok(false),
            Err(err) if is_unknown_not_found(&err) => Ok(false),
            Err(err) => Err(StorageError::Operation(
                anyhow::Error::new(err).context("checking for diff object"),
            )),
        }
    }

    async fn store(&self, key: &str, mut data: Payload) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)
            .await
            .map_err(|err| anyhow::Error::new(err).context("reading diff document"))?;
        self.client
            .put_object(PutObjectRequest {
                bucket: self.bucket.clone(),
                key: format!("{}{}", key, KEY_SUFFIX),
                body: Some(buf.into()),
                ..Default::default()
            })
            .await
            .map_err(|err| anyhow::Error::new(err).context("storing diff object"))?;
        Ok(())
    }
}

/// Decorates a [`Storage`] with awareness of in-progress markers.
///
/// While a fresh marker object exists for a key, `get` and `exists` fail
/// with [`StorageError::InProgress`]. A marker older than `staleness` is
/// treated as if absent, which lets a new admission re-enqueue a job whose
/// worker crashed. Observers never delete expired markers; cleanup belongs
/// to the successful producer.
pub struct InProgress<S> {
    pub bucket: String,
    pub staleness: Duration,
    pub client: S3Client,
    pub storage: S,
}

impl<S> InProgress<S> {
    async fn is_in_progress(&self, key: &str) -> Result<bool, StorageError> {
        let res = match self
            .client
            .get_object(GetObjectRequest {
                bucket: self.bucket.clone(),
                key: format!("{}{}", key, IN_PROGRESS_SUFFIX),
                ..Default::default()
            })
            .await
        {
            Ok(res) => res,
            Err(RusotoError::Service(GetObjectError::NoSuchKey(_))) => return Ok(false),
            Err(err) if is_unknown_not_found(&err) => return Ok(false),
            Err(err) => {
                return Err(StorageError::Operation(
                    anyhow::Error::new(err).context("reading in-progress marker"),
                ))
            }
        };
        let mut body = String::new();
        if let Some(stream) = res.body {
            stream
                .into_async_read()
                .read_to_string(&mut body)
                .await
                .map_err(|err| anyhow::Error::new(err).context("reading in-progress marker"))?;
        }
        // A marker whose body does not parse dates from the distant past and
        // is therefore stale.
        let marked_at = DateTime::parse_from_rfc3339(body.trim())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(Utc::now() < marked_at + self.staleness)
    }
}

#[async_trait]
impl<S: Storage> Storage for InProgress<S> {
    async fn get(&self, key: &str) -> Result<Payload, StorageError> {
        if self.is_in_progress(key).await? {
            return Err(StorageError::InProgress(key.to_string()));
        }
        self.storage.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        if self.is_in_progress(key).await? {
            return Err(StorageError::InProgress(key.to_string()));
        }
        self.storage.exists(key).await
    }

    async fn store(&self, key: &str, data: Payload) -> Result<(), StorageError> {
        self.storage.store(key, data).await
    }
}

/// Matches the undocumented `NotFound` S3 error, which rusoto surfaces as an
/// unparsed 404; there is no error-code constant for it. S3 produces it on
/// HEAD requests and on GETs against some S3-compatible stores.
fn is_unknown_not_found<E>(err: &RusotoError<E>) -> bool {
    matches!(err, RusotoError::Unknown(res) if res.status.as_u16() == 404)
}
