// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Utility functions for AWS S3 clients.

use std::time::Duration;

use anyhow::Context;
use rusoto_core::{HttpClient, Region};
use rusoto_credential::{AutoRefreshingProvider, ChainProvider, ProfileProvider};
use rusoto_s3::S3Client;
use tracing::info;

/// Information required to connect to S3.
///
/// The shared credentials file is optional because in most deployments the
/// process should rely on the [`ChainProvider`] to pull credentials from the
/// instance role or the ambient environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectInfo {
    /// The AWS region to connect to.
    pub region: Region,
    /// Shared credentials file configuration, if not using the chain.
    pub(crate) credentials_file: Option<CredentialsFile>,
}

/// Location of a shared AWS credentials file and the profile to read from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CredentialsFile {
    path: String,
    profile: String,
}

impl ConnectInfo {
    /// Constructs a `ConnectInfo`.
    pub fn new(
        region: Region,
        credentials_path: Option<String>,
        credentials_profile: Option<String>,
    ) -> Result<ConnectInfo, anyhow::Error> {
        match (credentials_path, credentials_profile) {
            (Some(path), Some(profile)) => Ok(ConnectInfo {
                region,
                credentials_file: Some(CredentialsFile { path, profile }),
            }),
            (None, None) => Ok(ConnectInfo {
                region,
                credentials_file: None,
            }),
            (_, _) => {
                anyhow::bail!(
                    "Both aws_credentials_file and aws_credentials_profile \
                     must be provided, or neither"
                );
            }
        }
    }
}

/// Create an S3 client.
///
/// If a shared credentials file is not configured, the client will load
/// credentials using a chain provider wrapped in an
/// [`AutoRefreshingProvider`], which caches the underlying provider's AWS
/// credentials and automatically fetches updated credentials when they have
/// expired.
pub fn client(conn_info: ConnectInfo) -> Result<S3Client, anyhow::Error> {
    let request_dispatcher = HttpClient::new().context("creating HTTP client for S3 client")?;
    let s3_client = match conn_info.credentials_file {
        Some(credentials_file) => {
            info!("Creating a new S3 client from the shared credentials file");
            let provider = ProfileProvider::with_configuration(
                credentials_file.path,
                credentials_file.profile,
            );
            S3Client::new_with(request_dispatcher, provider, conn_info.region)
        }
        None => {
            info!(
                "Shared credentials file not configured, \
                 creating a new S3 client using a chain provider."
            );
            let mut provider = ChainProvider::new();
            provider.set_timeout(Duration::from_secs(10));
            let provider =
                AutoRefreshingProvider::new(provider).context("generating AWS credentials")?;
            S3Client::new_with(request_dispatcher, provider, conn_info.region)
        }
    };
    Ok(s3_client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_info_requires_matched_credentials_options() {
        let region = Region::UsEast1;
        assert!(ConnectInfo::new(region.clone(), None, None).is_ok());
        assert!(ConnectInfo::new(
            region.clone(),
            Some("/etc/aws/credentials".into()),
            Some("diffd".into())
        )
        .is_ok());
        assert!(
            ConnectInfo::new(region.clone(), Some("/etc/aws/credentials".into()), None).is_err()
        );
        assert!(ConnectInfo::new(region, None, Some("diffd".into())).is_err());
    }
}
