// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Queuing of diff jobs onto a streaming appliance.

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::diff::{rfc3339_nanos, Diff};
use crate::retry::Retry;

/// A serialized job descriptor, as delivered back to the production
/// endpoint by the streaming appliance.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub id: String,
    pub previous_start: String,
    pub previous_stop: String,
    pub next_start: String,
    pub next_stop: String,
}

impl From<&Diff> for JobPayload {
    fn from(diff: &Diff) -> JobPayload {
        JobPayload {
            id: diff.id.clone(),
            previous_start: rfc3339_nanos(diff.previous_start),
            previous_stop: rfc3339_nanos(diff.previous_stop),
            next_start: rfc3339_nanos(diff.next_start),
            next_stop: rfc3339_nanos(diff.next_stop),
        }
    }
}

/// An error produced while enqueueing a job.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unexpected response from streaming appliance: {0}")]
    UnexpectedStatus(StatusCode),
    #[error("streaming appliance transport: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Queues diff jobs for out-of-band production.
#[async_trait]
pub trait Queuer: Send + Sync {
    async fn queue(&self, diff: &Diff) -> Result<(), QueueError>;
}

/// A [`Queuer`] that posts job descriptors to a streaming appliance.
pub struct HttpQueuer {
    client: reqwest::Client,
    endpoint: Url,
    retry: Retry,
}

impl HttpQueuer {
    pub fn new(client: reqwest::Client, endpoint: Url) -> HttpQueuer {
        HttpQueuer {
            client,
            endpoint,
            retry: Retry::default(),
        }
    }
}

#[async_trait]
impl Queuer for HttpQueuer {
    async fn queue(&self, diff: &Diff) -> Result<(), QueueError> {
        let body = serde_json::to_vec(&JobPayload::from(diff))
            .expect("job payload serialization cannot fail");
        let res = self
            .retry
            .request(|| {
                self.client
                    .post(self.endpoint.clone())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(body.clone())
                    .send()
            })
            .await?;
        if res.status() != StatusCode::OK {
            return Err(QueueError::UnexpectedStatus(res.status()));
        }
        Ok(())
    }
}
