// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Embedded HTTP server for the differencing service.
//!
//! Three routes: admission (`POST /`) and retrieval (`GET /`) identify a
//! diff by its two time windows in query parameters; production
//! (`POST /{topic}/{event}`) is invoked by the worker draining the
//! streaming appliance with a JSON job descriptor.

// Axum handlers must use async, but don't always await.
#![allow(clippy::unused_async)]

use std::sync::Arc;

use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{routing, Extension, Json, Router};
use chrono::{DateTime, Utc};
use http::{Request, StatusCode};
use serde::Serialize;

use crate::differ::Differ;
use crate::marker::Marker;
use crate::metrics::Metrics;
use crate::queuer::Queuer;
use crate::storage::Storage;

mod diff;
mod produce;

/// The pluggable modules the handlers operate on.
pub struct Diffd {
    pub storage: Arc<dyn Storage>,
    pub queuer: Arc<dyn Queuer>,
    pub marker: Arc<dyn Marker>,
    pub differ: Arc<dyn Differ>,
    pub metrics: Metrics,
}

/// Builds the service router.
pub fn router(diffd: Arc<Diffd>) -> Router {
    let metrics = diffd.metrics.clone();
    Router::new()
        .route("/", routing::post(diff::handle_post).get(diff::handle_get))
        .route("/:topic/:event", routing::post(produce::handle_produce))
        .layer(middleware::from_fn(move |req, next| {
            let metrics = metrics.clone();
            async move { track_requests(req, next, metrics).await }
        }))
        .layer(Extension(diffd))
}

async fn track_requests<B>(req: Request<B>, next: Next<B>, metrics: Metrics) -> Response {
    let route = req
        .extensions()
        .get::<axum::extract::MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let res = next.run(req).await;
    metrics
        .requests
        .with_label_values(&[&route, res.status().as_str()])
        .inc();
    res
}

/// JSON body carried by non-2xx responses.
#[derive(Serialize)]
struct Message {
    message: String,
}

fn json_response(status: StatusCode, message: String) -> Response {
    (status, Json(Message { message })).into_response()
}

fn internal_error() -> Response {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error".into(),
    )
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| format!("parsing instant {:?}: {}", s, err))
}
