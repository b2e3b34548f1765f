// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Bounded retry of HTTP requests.

use std::future::Future;
use std::time::Duration;

use http::StatusCode;
use tokio::time;

/// Statuses on which a request is reissued. Requests to the grapher and the
/// streaming appliance are idempotent, so replaying them is safe.
const RETRY_STATUSES: [StatusCode; 3] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
];

/// Configures a bounded retry loop with fixed backoff.
#[derive(Clone, Copy, Debug)]
pub struct Retry {
    pub max_tries: usize,
    pub backoff: Duration,
}

impl Default for Retry {
    fn default() -> Retry {
        Retry {
            max_tries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl Retry {
    /// Issues `f` until it yields a response whose status is outside the
    /// retry whitelist or the try limit is reached. Transport errors are
    /// retried on the same schedule. The final response or error is returned
    /// either way; callers decide what a still-failing status means.
    pub async fn request<F, U>(self, mut f: F) -> Result<reqwest::Response, reqwest::Error>
    where
        F: FnMut() -> U,
        U: Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            let last = f().await;
            match &last {
                Ok(res) if !RETRY_STATUSES.contains(&res.status()) => return last,
                _ if tries >= self.max_tries => return last,
                _ => time::sleep(self.backoff).await,
            }
        }
    }
}
