// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Production handler: performs the diff job and stores the result.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Path;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use bytes::Bytes;
use http::StatusCode;
use tracing::{error, info};

use crate::diff::Diff;
use crate::queuer::JobPayload;

use super::{internal_error, json_response, parse_instant, Diffd};

/// Handles a production request from the worker draining the streaming
/// appliance: computes the diff of the two windows, stores the document
/// under the job id, and clears the in-progress marker.
///
/// The topic and event path parameters exist for routing compatibility with
/// the appliance's delivery scheme and are not consumed.
pub async fn handle_produce(
    Extension(diffd): Extension<Arc<Diffd>>,
    Path((_topic, _event)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    // The appliance delivers the JSON descriptor as an opaque octet stream,
    // so the body is decoded by hand rather than through a typed extractor.
    let payload: JobPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            info!(reason = %err, "invalid input");
            return json_response(StatusCode::BAD_REQUEST, err.to_string());
        }
    };
    let diff = match diff_from_payload(payload) {
        Ok(diff) => diff,
        Err(reason) => {
            info!(%reason, "invalid input");
            return json_response(StatusCode::BAD_REQUEST, reason);
        }
    };

    let started = Instant::now();
    let document = match diffd.differ.diff(&diff).await {
        Ok(document) => document,
        Err(err) => {
            error!(dependency = "differ", reason = %err, "dependency failure");
            return internal_error();
        }
    };
    if let Err(err) = diffd.storage.store(&diff.id, document).await {
        error!(dependency = "storage", reason = %err, "dependency failure");
        return internal_error();
    }
    // An orphan marker leaves the id looking in-progress until staleness
    // expires, so an unmark failure is surfaced to request a retry. The
    // retry is safe: store overwrites by key and unmark is a no-op once the
    // marker is gone.
    if let Err(err) = diffd.marker.unmark(&diff.id).await {
        error!(dependency = "marker", reason = %err, "dependency failure");
        return internal_error();
    }
    diffd.metrics.diffs_produced.inc();
    diffd
        .metrics
        .diff_duration_seconds
        .observe(started.elapsed().as_secs_f64());
    StatusCode::NO_CONTENT.into_response()
}

fn diff_from_payload(payload: JobPayload) -> Result<Diff, String> {
    if payload.id.is_empty() {
        return Err("missing ID field".into());
    }
    let previous_start = parse_instant(&payload.previous_start)?;
    let previous_stop = parse_instant(&payload.previous_stop)?;
    let next_start = parse_instant(&payload.next_start)?;
    let next_stop = parse_instant(&payload.next_stop)?;
    Diff::with_id(
        payload.id,
        previous_start,
        previous_stop,
        next_start,
        next_stop,
    )
    .map_err(|err| err.to_string())
}
