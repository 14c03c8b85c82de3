//! File-transfer orchestration against the in-pod sidecar.
//!
//! The deployer never moves data itself; it finds the per-analysis service,
//! asks the file-transfer sidecar behind it to start an upload or download,
//! and either hands the transfer id straight back (async) or polls until the
//! sidecar reports a terminal state.

use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube::{Api, ResourceExt, api::ListParams};
use serde::Deserialize;
use snafu::{OptionExt, ResultExt};
use tracing::debug;
use vice_spec::model::responses::TransferResponse;

use super::{
    DeploymentEngine, ListSnafu, NoServiceSnafu, Result, TransferBodySnafu, TransferRequestSnafu,
};

/// How often a synchronous transfer polls the sidecar.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Transfer directions the sidecar understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    /// Analysis outputs back to the data store.
    Upload,
    /// Analysis inputs into the working directory.
    Download,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upload" => Some(Self::Upload),
            "download" => Some(Self::Download),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TransferStarted {
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct TransferState {
    status: String,
}

/// Builds the sidecar base URL from the in-cluster service coordinates.
fn sidecar_base(service: &str, ns: &str, port: u16, base_path: &str) -> String {
    let path = base_path.trim_end_matches('/');
    format!("http://{service}.{ns}:{port}{path}")
}

impl DeploymentEngine {
    /// Starts a transfer and, unless `async_mode` is set, polls the sidecar
    /// every five seconds until it reports `completed` or `failed`.
    pub async fn trigger_transfer(
        &self,
        external_id: &str,
        ns: &str,
        kind: TransferKind,
        async_mode: bool,
    ) -> Result<TransferResponse> {
        let services = Api::<Service>::namespaced(self.client.clone(), ns)
            .list(&ListParams::default().labels(&Self::selector(external_id)))
            .await
            .context(ListSnafu {
                kind: "services",
                external_id,
            })?;
        let service = services
            .items
            .first()
            .context(NoServiceSnafu { external_id })?
            .name_any();

        let base = sidecar_base(
            &service,
            ns,
            self.file_transfer_port,
            &self.transfer_base_path,
        );

        let start_url = format!("{base}/{}", kind.as_str());
        let started: TransferStarted = self
            .http
            .post(&start_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(TransferRequestSnafu { url: &start_url })?
            .json()
            .await
            .context(TransferBodySnafu)?;

        debug!(external_id, uuid = %started.uuid, kind = kind.as_str(), "transfer started");

        if async_mode {
            return Ok(TransferResponse {
                status: "in_progress".to_string(),
                kind: kind.as_str().to_string(),
                uuid: Some(started.uuid),
                error: None,
            });
        }

        let status_url = format!("{base}/status/{}", started.uuid);
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let state: TransferState = self
                .http
                .get(&status_url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .context(TransferRequestSnafu { url: &status_url })?
                .json()
                .await
                .context(TransferBodySnafu)?;

            debug!(external_id, uuid = %started.uuid, status = %state.status, "transfer poll");

            if state.status == "completed" || state.status == "failed" {
                return Ok(TransferResponse {
                    status: state.status,
                    kind: kind.as_str().to_string(),
                    uuid: Some(started.uuid),
                    error: None,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("/", "http://vice-inv-1.vice-apps:60001")]
    #[case("", "http://vice-inv-1.vice-apps:60001")]
    #[case("/transfers/", "http://vice-inv-1.vice-apps:60001/transfers")]
    fn sidecar_base_urls(#[case] base_path: &str, #[case] expected: &str) {
        assert_eq!(
            sidecar_base("vice-inv-1", "vice-apps", 60001, base_path),
            expected
        );
    }

    #[rstest]
    #[case("upload", Some(TransferKind::Upload))]
    #[case("download", Some(TransferKind::Download))]
    #[case("sideways", None)]
    fn kind_parsing(#[case] raw: &str, #[case] expected: Option<TransferKind>) {
        assert_eq!(TransferKind::parse(raw), expected);
    }
}
