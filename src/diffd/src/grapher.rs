// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client for the upstream graph-generation service.
//!
//! Starting a graph job is a POST; the upstream answers 202 when the job is
//! scheduled and 409 when a job for the same window already exists. Either
//! way the graph is then awaited by polling a GET with the same parameters,
//! which answers 204 until the graph is ready and 200 with the document once
//! it is.

use std::io::Cursor;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::StatusCode;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::time::{self, Instant};
use url::Url;

use crate::diff::rfc3339_nanos;
use crate::retry::Retry;

const QUERY_START: &str = "start";
const QUERY_STOP: &str = "stop";

/// A readable graph document.
pub type GraphStream = Pin<Box<dyn AsyncRead + Send>>;

/// An error produced while driving a graph job.
#[derive(Debug, Error)]
pub enum GrapherError {
    #[error("received unexpected response from grapher {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("request time out reached after {attempts} attempt(s)")]
    PollTimeout { attempts: u64 },
    #[error("grapher transport: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Produces the network graph covering a time window.
#[async_trait]
pub trait Grapher: Send + Sync {
    /// Starts a graph job for `[start, stop]` and waits for its completion.
    /// On success the graph content is returned as a readable stream.
    async fn graph(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<GraphStream, GrapherError>;
}

/// A [`Grapher`] backed by the graph-generation HTTP service.
pub struct HttpGrapher {
    client: reqwest::Client,
    endpoint: Url,
    poll_timeout: Duration,
    polling_interval: Duration,
    retry: Retry,
}

impl HttpGrapher {
    pub fn new(
        client: reqwest::Client,
        endpoint: Url,
        poll_timeout: Duration,
        polling_interval: Duration,
    ) -> HttpGrapher {
        HttpGrapher {
            client,
            endpoint,
            poll_timeout,
            polling_interval,
            retry: Retry::default(),
        }
    }

    fn request_url(&self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair(QUERY_START, &rfc3339_nanos(start))
            .append_pair(QUERY_STOP, &rfc3339_nanos(stop));
        url
    }

    async fn wait_for_graph(
        &self,
        url: &Url,
        deadline: Instant,
    ) -> Result<GraphStream, GrapherError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let poll = self.retry.request(|| self.client.get(url.clone()).send());
            let res = match time::timeout_at(deadline, poll).await {
                Ok(res) => res?,
                Err(_) => return Err(GrapherError::PollTimeout { attempts }),
            };
            match res.status() {
                StatusCode::OK => {
                    // The graph is ready. The body is read fully so the
                    // upstream connection can be reused.
                    let body = match time::timeout_at(deadline, res.bytes()).await {
                        Ok(body) => body?,
                        Err(_) => return Err(GrapherError::PollTimeout { attempts }),
                    };
                    return Ok(Box::pin(Cursor::new(body)));
                }
                StatusCode::NO_CONTENT => {}
                status => {
                    let body = res.text().await.unwrap_or_default();
                    return Err(GrapherError::UnexpectedStatus { status, body });
                }
            }
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    return Err(GrapherError::PollTimeout { attempts });
                }
                _ = time::sleep(self.polling_interval) => {}
            }
        }
    }
}

#[async_trait]
impl Grapher for HttpGrapher {
    async fn graph(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<GraphStream, GrapherError> {
        let url = self.request_url(start, stop);
        let res = self
            .retry
            .request(|| self.client.post(url.clone()).send())
            .await?;
        // 202 means the job is scheduled, 409 that it already exists; in
        // both cases the GET endpoint is polled for a 200.
        if res.status() != StatusCode::ACCEPTED && res.status() != StatusCode::CONFLICT {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(GrapherError::UnexpectedStatus { status, body });
        }
        let deadline = Instant::now() + self.poll_timeout;
        self.wait_for_graph(&url, deadline).await
    }
}
