// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Admission and retrieval handlers.

use std::sync::Arc;

use axum::body::StreamBody;
use axum::extract::Query;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use chrono::SecondsFormat;
use http::{header, StatusCode};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::diff::Diff;
use crate::storage::StorageError;

use super::{internal_error, json_response, parse_instant, Diffd};

/// Query parameters identifying the two windows of a diff.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DiffParams {
    previous_start: String,
    previous_stop: String,
    next_start: String,
    next_stop: String,
}

impl DiffParams {
    /// Parses and validates the parameters into a descriptor. The windows
    /// are truncated to the minute and the diff id derived from them, so
    /// equal truncated windows always address the same diff.
    fn into_diff(self) -> Result<Diff, String> {
        let previous_start = parse_instant(&self.previous_start)?;
        let previous_stop = parse_instant(&self.previous_stop)?;
        let next_start = parse_instant(&self.next_start)?;
        let next_stop = parse_instant(&self.next_stop)?;
        Diff::from_windows(previous_start, previous_stop, next_start, next_stop)
            .map_err(|err| err.to_string())
    }
}

/// Handles an admission request: derives the diff id, checks that the diff
/// neither exists nor is in progress, enqueues the job, and marks the id.
pub async fn handle_post(
    Extension(diffd): Extension<Arc<Diffd>>,
    Query(params): Query<DiffParams>,
) -> Response {
    let diff = match params.into_diff() {
        Ok(diff) => diff,
        Err(reason) => {
            info!(%reason, "invalid input");
            return json_response(StatusCode::BAD_REQUEST, reason);
        }
    };
    let exists = match diffd.storage.exists(&diff.id).await {
        Ok(exists) => exists,
        Err(err @ StorageError::InProgress(_)) => {
            info!(reason = %err, "conflict");
            return json_response(StatusCode::CONFLICT, err.to_string());
        }
        Err(err) => {
            error!(dependency = "storage", reason = %err, "dependency failure");
            return internal_error();
        }
    };
    if exists {
        let msg = format!(
            "diff for the time range {} to {} and time range {} to {} already exists",
            diff.previous_start.to_rfc3339_opts(SecondsFormat::Secs, true),
            diff.previous_stop.to_rfc3339_opts(SecondsFormat::Secs, true),
            diff.next_start.to_rfc3339_opts(SecondsFormat::Secs, true),
            diff.next_stop.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        info!(reason = %msg, "conflict");
        return json_response(StatusCode::CONFLICT, msg);
    }
    if let Err(err) = diffd.queuer.queue(&diff).await {
        error!(dependency = "queuer", reason = %err, "dependency failure");
        return internal_error();
    }
    // A failed mark must not fail the request: the queued job is the
    // authoritative signal that the diff exists, and admission stays
    // idempotent either way.
    if let Err(err) = diffd.marker.mark(&diff.id).await {
        info!(dependency = "marker", reason = %err, "dependency failure");
    }
    StatusCode::ACCEPTED.into_response()
}

/// Handles a retrieval request: streams the completed diff back, or reports
/// that it is still in progress (204) or absent (404).
pub async fn handle_get(
    Extension(diffd): Extension<Arc<Diffd>>,
    Query(params): Query<DiffParams>,
) -> Response {
    let diff = match params.into_diff() {
        Ok(diff) => diff,
        Err(reason) => {
            info!(%reason, "invalid input");
            return json_response(StatusCode::BAD_REQUEST, reason);
        }
    };
    match diffd.storage.get(&diff.id).await {
        Ok(body) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            StreamBody::new(ReaderStream::new(body)),
        )
            .into_response(),
        Err(StorageError::InProgress(_)) => StatusCode::NO_CONTENT.into_response(),
        Err(err @ StorageError::NotFound(_)) => {
            info!(reason = %err, "not found");
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            error!(dependency = "storage", reason = %err, "dependency failure");
            internal_error()
        }
    }
}
