// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An asynchronous differencing service for network-flow graphs.
//!
//! Given two time windows covering flow-log data, the service computes the
//! set of communication flows that exist in one window but not the other and
//! persists the result as a DOT document addressable by a deterministic id.
//!
//! The service is assembled from a handful of subsystems:
//!
//!   * [`diff`] holds the diff descriptor: two validated, minute-aligned
//!     time windows and the id derived from them.
//!   * [`differ`] streams two DOT graphs and emits their edge-level
//!     symmetric difference.
//!   * [`grapher`] drives the upstream graph-generation job to completion by
//!     polling.
//!   * [`storage`] and [`marker`] persist completed diff documents and
//!     in-progress markers in S3.
//!   * [`queuer`] hands diff jobs off to a streaming appliance.
//!   * [`http`] exposes admission, retrieval, and production over HTTP.

pub mod diff;
pub mod differ;
pub mod grapher;
pub mod http;
pub mod marker;
pub mod metrics;
pub mod queuer;
pub mod retry;
pub mod storage;
