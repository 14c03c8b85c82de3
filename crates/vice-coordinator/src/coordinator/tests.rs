use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use vice_crypto::{Encryptor, generate_key};
use vice_spec::{
    BuilderConfig, SpecBuilder, UserInfo,
    analysis::{Analysis, ContainerImage, ContainerSpec},
    model::responses::{
        CreateResponse, DeleteResponse, DeploymentStatus, HealthResponse, LogsResponse,
    },
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use super::*;
use crate::{
    registry::ClusterSpec,
    selector::SelectionStrategy,
    store::MemClusterStore,
};

struct StubApps;

#[async_trait]
impl UserInfo for StubApps {
    async fn get_user_ip(
        &self,
        _user_id: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Some("10.0.0.1".to_string()))
    }
}

fn analysis(invocation_id: &str) -> Analysis {
    Analysis {
        invocation_id: invocation_id.to_string(),
        analysis_id: "analysis-1".to_string(),
        app_id: "app-1".to_string(),
        app_name: "JupyterLab".to_string(),
        analysis_name: "jl run".to_string(),
        user_id: "u-1".to_string(),
        username: "ipcdev".to_string(),
        output_dir: "/iplant/home/ipcdev/analyses/jl-1".to_string(),
        container: ContainerSpec {
            image: ContainerImage {
                name: "quay.io/cyverse/jupyterlab".to_string(),
                tag: "4.1".to_string(),
            },
            ..ContainerSpec::default()
        },
        ..Analysis::default()
    }
}

struct Stack {
    coordinator: Coordinator,
    store: Arc<MemClusterStore>,
    cluster_ids: Vec<String>,
}

/// Wires a full coordinator against the given mock deployers, priority in
/// listed order.
async fn stack(servers: &[&MockServer]) -> Stack {
    let store = Arc::new(MemClusterStore::new());
    let registry = Arc::new(ClusterRegistry::new(
        store.clone(),
        Arc::new(Encryptor::new(&generate_key()).expect("fixed key size")),
        Duration::from_secs(30),
    ));

    let mut cluster_ids = Vec::new();
    for (i, server) in servers.iter().enumerate() {
        let record = registry
            .register_cluster(ClusterSpec {
                name: format!("cluster-{i}"),
                deployer_url: server.uri(),
                enabled: true,
                priority: (i as i32 + 1) * 10,
                ..ClusterSpec::default()
            })
            .await
            .expect("cluster registration");
        cluster_ids.push(record.id);
    }

    let client = DeployerClient::new(registry.clone());
    let selector = ClusterSelector::new(
        registry.clone(),
        client.clone(),
        SelectionStrategy::Priority,
    );
    let builder = SpecBuilder::new(
        BuilderConfig::default(),
        Arc::new(StubApps) as Arc<dyn UserInfo>,
    );

    Stack {
        coordinator: Coordinator::new(registry, client, selector, builder, store.clone()),
        store,
        cluster_ids,
    }
}

async fn mock_health(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(HealthResponse {
            status: "healthy".to_string(),
            version: "v1.31.0".to_string(),
            kubernetes: true,
            message: None,
        }))
        .mount(server)
        .await;
}

async fn mock_status(server: &MockServer, external_id: &str, exists: bool) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v1/deployments/{external_id}/status")))
        .respond_with(ResponseTemplate::new(200).set_body_json(DeploymentStatus {
            exists,
            ..DeploymentStatus::default()
        }))
        .mount(server)
        .await;
}

#[tokio::test]
async fn launch_dispatches_and_records_ownership() {
    let server = MockServer::start().await;
    mock_health(&server).await;
    mock_status(&server, "inv-1", false).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/deployments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(CreateResponse {
            status: "created".to_string(),
            external_id: "inv-1".to_string(),
            resources_created: vec![
                "configmap:excludes-file-inv-1".to_string(),
                "persistentvolumeclaim:working-dir-inv-1".to_string(),
                "deployment:inv-1".to_string(),
                "poddisruptionbudget:inv-1".to_string(),
                "service:vice-inv-1".to_string(),
                "ingress:inv-1".to_string(),
            ],
            error: None,
        }))
        .expect(1)
        .mount(&server)
        .await;

    let stack = stack(&[&server]).await;
    let response = stack.coordinator.launch(&analysis("inv-1")).await.unwrap();

    assert_eq!(response.status, "created");
    assert_eq!(response.resources_created.len(), 6);
    assert_eq!(
        stack.store.get_ownership("inv-1").await.unwrap(),
        Some(stack.cluster_ids[0].clone())
    );
}

#[tokio::test]
async fn relaunch_of_a_running_analysis_is_a_no_op() {
    let server = MockServer::start().await;
    mock_health(&server).await;
    mock_status(&server, "inv-2", true).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/deployments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let stack = stack(&[&server]).await;
    let response = stack.coordinator.launch(&analysis("inv-2")).await.unwrap();

    assert_eq!(response.status, "exists");
    assert!(response.resources_created.is_empty());
}

#[tokio::test]
async fn exit_finds_the_owner_without_local_tracking() {
    let server = MockServer::start().await;
    mock_status(&server, "inv-2", true).await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/deployments/inv-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(DeleteResponse {
            status: "deleted".to_string(),
            external_id: "inv-2".to_string(),
            resources_deleted: vec!["deployment:inv-2".to_string()],
        }))
        .expect(1)
        .mount(&server)
        .await;

    // The ownership table is intentionally empty; the probe must find the
    // deployment on its own.
    let stack = stack(&[&server]).await;
    let response = stack.coordinator.exit("inv-2").await.unwrap();

    assert_eq!(response.status, "deleted");
    assert_eq!(response.resources_deleted, ["deployment:inv-2"]);
    assert_eq!(stack.store.get_ownership("inv-2").await.unwrap(), None);
}

#[tokio::test]
async fn exit_of_an_unknown_analysis_succeeds() {
    let server = MockServer::start().await;
    mock_status(&server, "inv-9", false).await;

    let stack = stack(&[&server]).await;
    // A stale row must not keep the exit from succeeding, and is cleaned up.
    stack
        .store
        .upsert_ownership("inv-9", &stack.cluster_ids[0])
        .await
        .unwrap();

    let response = stack.coordinator.exit("inv-9").await.unwrap();
    assert_eq!(response.status, "deleted");
    assert!(response.resources_deleted.is_empty());
    assert_eq!(stack.store.get_ownership("inv-9").await.unwrap(), None);
}

#[tokio::test]
async fn launch_to_cluster_rejects_unknown_and_disabled() {
    let server = MockServer::start().await;
    mock_health(&server).await;

    let stack = stack(&[&server]).await;
    let err = stack
        .coordinator
        .launch_to_cluster(&analysis("inv-3"), "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownClusterName { .. }));

    stack
        .coordinator
        .registry
        .set_enabled(&stack.cluster_ids[0], false)
        .await
        .unwrap();
    let err = stack
        .coordinator
        .launch_to_cluster(&analysis("inv-3"), "cluster-0")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClusterDisabled { .. }));
}

#[tokio::test]
async fn deployment_cluster_heals_the_ownership_table() {
    let server = MockServer::start().await;
    mock_status(&server, "inv-4", true).await;

    let stack = stack(&[&server]).await;
    assert_eq!(stack.store.get_ownership("inv-4").await.unwrap(), None);

    let cluster = stack
        .coordinator
        .deployment_cluster("inv-4")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cluster.id, stack.cluster_ids[0]);

    // Discovered ownership is written back so the next lookup skips the
    // cross-cluster probe.
    assert_eq!(
        stack.store.get_ownership("inv-4").await.unwrap(),
        Some(stack.cluster_ids[0].clone())
    );
}

#[tokio::test]
async fn status_of_an_unknown_analysis_is_empty() {
    let server = MockServer::start().await;
    mock_status(&server, "inv-5", false).await;

    let stack = stack(&[&server]).await;
    let status = stack.coordinator.status("inv-5").await.unwrap();
    assert!(!status.exists);

    let ready = stack.coordinator.url_ready("inv-5").await.unwrap();
    assert!(!ready.ready);

    let logs = stack
        .coordinator
        .logs("inv-5", &LogsRequest::default())
        .await
        .unwrap();
    assert_eq!(logs, LogsResponse::default());
}

#[tokio::test]
async fn transfer_requires_a_running_analysis() {
    let server = MockServer::start().await;
    mock_status(&server, "inv-6", false).await;

    let stack = stack(&[&server]).await;
    let err = stack
        .coordinator
        .trigger_transfer("inv-6", "download", true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotDeployed { .. }));
}
