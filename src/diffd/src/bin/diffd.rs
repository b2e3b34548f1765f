// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! diffd: the network-flow graph differencing service.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{routing, Router};
use clap::Parser;
use prometheus::Registry;
use rusoto_core::Region;
use tokio::signal::unix::{self, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;

use diffd::differ::DotDiffer;
use diffd::grapher::HttpGrapher;
use diffd::http::{self, Diffd};
use diffd::marker::S3Marker;
use diffd::metrics::{self, Metrics};
use diffd::queuer::HttpQueuer;
use diffd::storage::{InProgress, S3Storage};

/// Asynchronous differencing service for network-flow graphs.
#[derive(clap::Parser)]
#[clap(name = "diffd")]
struct Args {
    // === Connection options. ===
    /// The address on which to listen for HTTP requests.
    #[clap(
        long,
        env = "LISTEN_ADDR",
        value_name = "HOST:PORT",
        default_value = "0.0.0.0:8080"
    )]
    listen_addr: SocketAddr,
    /// The address on which to expose Prometheus metrics, if any.
    #[clap(long, env = "METRICS_LISTEN_ADDR", value_name = "HOST:PORT")]
    metrics_listen_addr: Option<SocketAddr>,

    // === Storage options. ===
    /// Bucket holding completed diff documents.
    #[clap(long, env = "DIFF_STORAGE_BUCKET", value_name = "BUCKET")]
    diff_storage_bucket: String,
    /// Region of the completed-diff bucket.
    #[clap(long, env = "DIFF_STORAGE_BUCKET_REGION", value_name = "REGION")]
    diff_storage_bucket_region: String,
    /// Bucket holding in-progress markers. May coincide with the diff
    /// storage bucket.
    #[clap(long, env = "DIFF_PROGRESS_BUCKET", value_name = "BUCKET")]
    diff_progress_bucket: String,
    /// Region of the marker bucket.
    #[clap(long, env = "DIFF_PROGRESS_BUCKET_REGION", value_name = "REGION")]
    diff_progress_bucket_region: String,
    /// Milliseconds after which an in-progress marker is considered stale.
    #[clap(long, env = "DIFF_PROGRESS_TIMEOUT", value_name = "MS")]
    diff_progress_timeout: u64,

    // === Job fan-out options. ===
    /// Endpoint of the streaming appliance that queues diff jobs.
    #[clap(long, env = "STREAM_APPLIANCE_ENDPOINT", value_name = "URL")]
    stream_appliance_endpoint: Url,
    /// Endpoint of the graph-generation service.
    #[clap(long, env = "GRAPHER_ENDPOINT", value_name = "URL")]
    grapher_endpoint: Url,
    /// Milliseconds to wait for a graph before giving up.
    #[clap(long, env = "GRAPHER_POLLING_TIMEOUT", value_name = "MS")]
    grapher_polling_timeout: u64,
    /// Milliseconds between polls of the grapher.
    #[clap(long, env = "GRAPHER_POLLING_INTERVAL", value_name = "MS")]
    grapher_polling_interval: u64,

    // === AWS options. ===
    /// Path to a shared AWS credentials file. When absent, credentials are
    /// loaded from the instance role or the ambient environment.
    #[clap(long, env = "AWS_CREDENTIALS_FILE", value_name = "PATH")]
    aws_credentials_file: Option<String>,
    /// Profile to read from the shared AWS credentials file.
    #[clap(long, env = "AWS_CREDENTIALS_PROFILE", value_name = "PROFILE")]
    aws_credentials_profile: Option<String>,

    // === Logging options. ===
    /// Which log messages to emit.
    #[clap(long, env = "LOG_FILTER", value_name = "FILTER", default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("diffd: fatal: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter).context("parsing log filter")?)
        .init();

    let storage_region: Region = args
        .diff_storage_bucket_region
        .parse()
        .context("parsing diff storage bucket region")?;
    let progress_region: Region = args
        .diff_progress_bucket_region
        .parse()
        .context("parsing diff progress bucket region")?;
    let storage_client = aws_util::s3::client(aws_util::s3::ConnectInfo::new(
        storage_region,
        args.aws_credentials_file.clone(),
        args.aws_credentials_profile.clone(),
    )?)
    .context("creating storage S3 client")?;
    let progress_client = aws_util::s3::client(aws_util::s3::ConnectInfo::new(
        progress_region,
        args.aws_credentials_file,
        args.aws_credentials_profile,
    )?)
    .context("creating progress S3 client")?;

    let http_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(1))
        .pool_max_idle_per_host(100)
        .build()
        .context("creating HTTP client")?;

    let storage = InProgress {
        bucket: args.diff_progress_bucket.clone(),
        staleness: chrono::Duration::milliseconds(
            i64::try_from(args.diff_progress_timeout).context("progress timeout out of range")?,
        ),
        client: progress_client.clone(),
        storage: S3Storage {
            bucket: args.diff_storage_bucket,
            client: storage_client,
        },
    };
    let marker = S3Marker::new(args.diff_progress_bucket, progress_client);
    let queuer = HttpQueuer::new(http_client.clone(), args.stream_appliance_endpoint);
    let grapher = HttpGrapher::new(
        http_client,
        args.grapher_endpoint,
        Duration::from_millis(args.grapher_polling_timeout),
        Duration::from_millis(args.grapher_polling_interval),
    );

    let registry = Registry::new();
    let metrics = Metrics::register_into(&registry);
    let diffd = Arc::new(Diffd {
        storage: Arc::new(storage),
        queuer: Arc::new(queuer),
        marker: Arc::new(marker),
        differ: Arc::new(DotDiffer::new(Arc::new(grapher))),
        metrics,
    });

    if let Some(addr) = args.metrics_listen_addr {
        let router = Router::new().route(
            "/metrics",
            routing::get(move || {
                let registry = registry.clone();
                async move { metrics::handle_prometheus(&registry) }
            }),
        );
        info!("serving metrics on {}", addr);
        tokio::spawn(async move {
            if let Err(err) = axum::Server::bind(&addr)
                .serve(router.into_make_service())
                .await
            {
                error!("metrics server failed: {}", err);
            }
        });
    }

    info!("listening on {}", args.listen_addr);
    axum::Server::bind(&args.listen_addr)
        .serve(http::router(diffd).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        unix::signal(SignalKind::terminate()).expect("installing SIGTERM handler cannot fail");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = sigterm.recv() => (),
    }
    info!("shutting down");
}
