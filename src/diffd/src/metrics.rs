// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Metrics for the differencing service.
//!
//! Each subsystem keeps its metrics in a scoped struct which is registered
//! once into the process registry; prometheus metrics clone cheaply, so
//! handlers hold their own copies.

use axum::response::IntoResponse;
use http::StatusCode;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Metrics tracked by the HTTP front-end and the production path.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Requests served, by route and response status.
    pub requests: IntCounterVec,
    /// Diff documents successfully produced and stored.
    pub diffs_produced: IntCounter,
    /// Wall-clock seconds spent producing a diff document.
    pub diff_duration_seconds: Histogram,
}

impl Metrics {
    pub fn register_into(registry: &Registry) -> Metrics {
        let requests = IntCounterVec::new(
            Opts::new("diffd_requests_total", "Requests served."),
            &["route", "status"],
        )
        .expect("valid metric definition");
        let diffs_produced = IntCounter::new(
            "diffd_diffs_produced_total",
            "Diff documents successfully produced and stored.",
        )
        .expect("valid metric definition");
        let diff_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "diffd_diff_duration_seconds",
            "Wall-clock seconds spent producing a diff document.",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(requests.clone()))
            .expect("metric registered once");
        registry
            .register(Box::new(diffs_produced.clone()))
            .expect("metric registered once");
        registry
            .register(Box::new(diff_duration_seconds.clone()))
            .expect("metric registered once");
        Metrics {
            requests,
            diffs_produced,
            diff_duration_seconds,
        }
    }
}

/// Renders a registry in the Prometheus text exposition format.
pub fn handle_prometheus(registry: &Registry) -> impl IntoResponse {
    let mut buf = String::new();
    match TextEncoder::new().encode_utf8(&registry.gather(), &mut buf) {
        Ok(()) => (StatusCode::OK, buf),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}
