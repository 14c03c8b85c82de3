//! Per-cluster HTTP client construction.
//!
//! Clients are rebuilt whenever a cluster's connection-relevant config
//! changes; there are no dynamic certificate callbacks, so reasoning about
//! which TLS material a request uses is trivial.

use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};
use vice_crypto::Encryptor;
use zeroize::Zeroizing;

use crate::store::ClusterRecord;

/// Overall request timeout shared by every deployer client.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on idle connections kept per deployer.
const MAX_IDLE_PER_HOST: usize = 8;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster {cluster:?} enables mTLS but is missing certificate material"))]
    MissingMaterial { cluster: String },

    #[snafu(display("failed to decrypt the client key of cluster {cluster:?}"))]
    DecryptKey {
        source: vice_crypto::Error,
        cluster: String,
    },

    #[snafu(display("client certificate or key of cluster {cluster:?} is unusable"))]
    InvalidIdentity {
        source: reqwest::Error,
        cluster: String,
    },

    #[snafu(display("CA certificate of cluster {cluster:?} is unusable"))]
    InvalidCaCert {
        source: reqwest::Error,
        cluster: String,
    },

    #[snafu(display("failed to build the HTTP client for cluster {cluster:?}"))]
    Build {
        source: reqwest::Error,
        cluster: String,
    },
}

/// Builds the HTTP client used to reach one cluster's deployer.
///
/// With mTLS on, the sealed client key is decrypted, paired with the client
/// certificate, and the deployer's server certificate is verified against
/// the cluster's private CA. TLS 1.2 is the floor.
pub fn build_client(record: &ClusterRecord, encryptor: &Encryptor) -> Result<reqwest::Client> {
    let builder = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST);

    if !record.mtls_enabled {
        return builder.build().context(BuildSnafu {
            cluster: &record.name,
        });
    }

    let ca_cert = record.ca_cert.as_deref().context(MissingMaterialSnafu {
        cluster: &record.name,
    })?;
    let client_cert = record.client_cert.as_deref().context(MissingMaterialSnafu {
        cluster: &record.name,
    })?;
    let sealed_key = record
        .client_key_encrypted
        .as_deref()
        .context(MissingMaterialSnafu {
            cluster: &record.name,
        })?;

    let client_key = Zeroizing::new(encryptor.decrypt(sealed_key).context(DecryptKeySnafu {
        cluster: &record.name,
    })?);

    let mut identity_pem = Zeroizing::new(Vec::with_capacity(
        client_cert.len() + client_key.len() + 1,
    ));
    identity_pem.extend_from_slice(client_cert.as_bytes());
    identity_pem.push(b'\n');
    identity_pem.extend_from_slice(&client_key);

    let identity =
        reqwest::Identity::from_pem(&identity_pem).context(InvalidIdentitySnafu {
            cluster: &record.name,
        })?;
    let ca = reqwest::Certificate::from_pem(ca_cert.as_bytes()).context(InvalidCaCertSnafu {
        cluster: &record.name,
    })?;

    builder
        .use_rustls_tls()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .add_root_certificate(ca)
        .identity(identity)
        .build()
        .context(BuildSnafu {
            cluster: &record.name,
        })
}
