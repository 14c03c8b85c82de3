//! The analysis workload: a single-replica Deployment whose pod runs the
//! authenticating proxy, the optional file-transfer sidecar, and the
//! analysis container itself.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Affinity, Container, ContainerPort, EnvVar, HTTPGetAction, NodeAffinity, NodeSelector,
            NodeSelectorRequirement, NodeSelectorTerm, PodAffinityTerm, PodAntiAffinity,
            PodSecurityContext, PodSpec, PodTemplateSpec, PreferredSchedulingTerm, Probe,
            ResourceRequirements, Toleration, WeightedPodAffinityTerm,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};

use super::{
    ANALYSIS_CONTAINER, BuildContext, EXCLUDES_MOUNT, FILE_TRANSFER_PORT, INPUT_PORT_NAME,
    PATH_LIST_MOUNT, PROXY_CONTAINER, PROXY_PORT, PROXY_PORT_NAME, TRANSFER_CONTAINER,
    TRANSFER_INIT_CONTAINER, WORKING_DIR_INIT_CONTAINER, byte_quantity, config_blobs, cpu_quantity,
    storage::{self, StoragePlan},
};
use crate::labels::APP_TYPE_INTERACTIVE;

/// Node label selecting hosts that accept analysis workloads; doubles as the
/// taint key those hosts carry.
const ANALYSIS_NODE_KEY: &str = "analysis";

/// Node label and taint key of GPU hosts.
const GPU_NODE_KEY: &str = "gpu";

/// Node label of hosts preferred for interactive workloads.
const VICE_NODE_KEY: &str = "vice";

const TOPOLOGY_KEY_HOSTNAME: &str = "kubernetes.io/hostname";

/// Extended resource name for GPU scheduling.
const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// UID analyses run under when the tool declares none.
const DEFAULT_UID: i64 = 1000;

const DEFAULT_CPU_REQUEST: f64 = 1.0;
const DEFAULT_CPU_LIMIT: f64 = 2.0;
const DEFAULT_MEMORY_REQUEST: &str = "2Gi";
const DEFAULT_MEMORY_LIMIT: &str = "8Gi";
const DEFAULT_EPHEMERAL_REQUEST: &str = "1Gi";

pub(crate) fn build(ctx: &BuildContext<'_>, plan: &StoragePlan) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(ctx.external_id.to_string()),
            namespace: Some(ctx.config.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(ctx.selector_labels()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ctx.labels.clone()),
                    ..ObjectMeta::default()
                }),
                spec: Some(pod_spec(ctx, plan)),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

fn pod_spec(ctx: &BuildContext<'_>, plan: &StoragePlan) -> PodSpec {
    let uid = ctx.analysis.container.uid.unwrap_or(DEFAULT_UID);
    let gpu = ctx.analysis.needs_gpu();

    let mut containers = vec![proxy_container(ctx)];
    let mut init_containers = Vec::new();

    if ctx.config.use_csi_driver {
        init_containers.push(working_dir_init_container(ctx, plan));
    } else {
        init_containers.push(transfer_container(ctx, plan, true));
        containers.push(transfer_container(ctx, plan, false));
    }
    containers.push(analysis_container(ctx, plan));

    PodSpec {
        hostname: Some(ctx.subdomain.clone()),
        restart_policy: Some("Always".to_string()),
        automount_service_account_token: Some(false),
        security_context: Some(PodSecurityContext {
            run_as_user: Some(uid),
            fs_group: Some(uid),
            ..PodSecurityContext::default()
        }),
        tolerations: Some(tolerations(gpu)),
        affinity: Some(Affinity {
            node_affinity: Some(node_affinity(gpu)),
            pod_anti_affinity: Some(pod_anti_affinity()),
            ..Affinity::default()
        }),
        init_containers: Some(init_containers),
        containers,
        volumes: Some(plan.volumes.clone()),
        ..PodSpec::default()
    }
}

/// The sidecar terminating the user's connection and enforcing access.
fn proxy_container(ctx: &BuildContext<'_>) -> Container {
    let backend_port = ctx
        .analysis
        .container
        .ports
        .first()
        .map_or(8888, |port| port.container_port);

    let mut args = vec![
        "--backend-url".to_string(),
        format!("http://localhost:{backend_port}"),
        "--ws-backend-url".to_string(),
        format!("ws://localhost:{backend_port}"),
        "--external-id".to_string(),
        ctx.external_id.to_string(),
        "--frontend-url".to_string(),
        ctx.frontend_url.clone(),
        "--listen-port".to_string(),
        PROXY_PORT.to_string(),
        "--get-analysis-id-base".to_string(),
        ctx.config.get_analysis_id_base.clone(),
        "--check-resource-access-base".to_string(),
        ctx.config.check_resource_access_base.clone(),
        "--keycloak-base-url".to_string(),
        ctx.config.oidc_base_url.clone(),
        "--keycloak-realm".to_string(),
        ctx.config.oidc_realm.clone(),
        "--keycloak-client-id".to_string(),
        ctx.config.oidc_client_id.clone(),
    ];
    if ctx.config.disable_proxy_auth {
        args.push("--disable-auth".to_string());
    }

    Container {
        name: PROXY_CONTAINER.to_string(),
        image: Some(ctx.config.proxy_image.clone()),
        args: Some(args),
        ports: Some(vec![ContainerPort {
            name: Some(PROXY_PORT_NAME.to_string()),
            container_port: PROXY_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        ..Container::default()
    }
}

/// The file-transfer binary, either as the one-shot staging init container
/// (`init == true`) or the long-running transfer server sidecar.
fn transfer_container(ctx: &BuildContext<'_>, plan: &StoragePlan, init: bool) -> Container {
    let mut args = vec![
        "--listen-port".to_string(),
        FILE_TRANSFER_PORT.to_string(),
        "--user".to_string(),
        ctx.username.to_string(),
        "--invocation-id".to_string(),
        ctx.external_id.to_string(),
        "--analysis-id".to_string(),
        ctx.analysis.analysis_id.clone(),
        "--upload-destination".to_string(),
        ctx.analysis.output_dir.clone(),
        "--irods-zone".to_string(),
        ctx.config.irods_zone.clone(),
        "--excludes-file".to_string(),
        format!("{EXCLUDES_MOUNT}/{}", config_blobs::EXCLUDES_KEY),
    ];
    if plan
        .transfer_mounts
        .iter()
        .any(|mount| mount.mount_path == PATH_LIST_MOUNT)
    {
        args.push("--path-list-file".to_string());
        args.push(format!("{PATH_LIST_MOUNT}/{}", config_blobs::PATH_LIST_KEY));
    }
    if init {
        args.push("--no-service".to_string());
    }

    let ports = if init {
        None
    } else {
        Some(vec![ContainerPort {
            name: Some(INPUT_PORT_NAME.to_string()),
            container_port: FILE_TRANSFER_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }])
    };

    Container {
        name: if init {
            TRANSFER_INIT_CONTAINER.to_string()
        } else {
            TRANSFER_CONTAINER.to_string()
        },
        image: Some(ctx.config.staging_image.clone()),
        args: Some(args),
        ports,
        volume_mounts: Some(plan.transfer_mounts.clone()),
        ..Container::default()
    }
}

/// With the storage driver mounted there is nothing to copy, but the mount
/// layout still has to exist before the analysis starts.
fn working_dir_init_container(ctx: &BuildContext<'_>, plan: &StoragePlan) -> Container {
    Container {
        name: WORKING_DIR_INIT_CONTAINER.to_string(),
        image: Some(ctx.config.staging_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![format!(
            "mkdir -p {base}/output {base}/input",
            base = super::CSI_MOUNT
        )]),
        volume_mounts: Some(plan.analysis_mounts.clone()),
        ..Container::default()
    }
}

fn analysis_container(ctx: &BuildContext<'_>, plan: &StoragePlan) -> Container {
    let container = &ctx.analysis.container;

    let mut env: Vec<EnvVar> = container
        .environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..EnvVar::default()
        })
        .collect();
    env.extend([
        EnvVar {
            name: "REDIRECT_URL".to_string(),
            value: Some(ctx.frontend_url.clone()),
            ..EnvVar::default()
        },
        EnvVar {
            name: "IPLANT_USER".to_string(),
            value: Some(ctx.username.to_string()),
            ..EnvVar::default()
        },
        EnvVar {
            name: "IPLANT_EXECUTION_ID".to_string(),
            value: Some(ctx.external_id.to_string()),
            ..EnvVar::default()
        },
    ]);

    let ports: Vec<ContainerPort> = container
        .ports
        .iter()
        .enumerate()
        .map(|(i, port)| ContainerPort {
            name: Some(format!("tcp-a-{i}")),
            container_port: port.container_port,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        })
        .collect();

    let readiness_probe = container.ports.first().map(|port| Probe {
        http_get: Some(HTTPGetAction {
            port: IntOrString::Int(port.container_port),
            ..HTTPGetAction::default()
        }),
        ..Probe::default()
    });

    Container {
        name: ANALYSIS_CONTAINER.to_string(),
        image: Some(container.image.reference()),
        command: container.entrypoint.clone().map(|entrypoint| vec![entrypoint]),
        args: if container.args.is_empty() {
            None
        } else {
            Some(container.args.clone())
        },
        working_dir: Some(
            container
                .working_directory
                .clone()
                .unwrap_or_else(|| storage::DEFAULT_WORKING_DIR.to_string()),
        ),
        env: Some(env),
        ports: if ports.is_empty() { None } else { Some(ports) },
        readiness_probe,
        resources: Some(resource_requirements(ctx)),
        volume_mounts: Some(plan.analysis_mounts.clone()),
        ..Container::default()
    }
}

/// Requests and limits with documented defaults: 1 core / 2Gi / 1Gi
/// requested, 2 cores / 8Gi limits. The limit defaults can be individually
/// switched off, in which case only the explicit hints produce limits.
fn resource_requirements(ctx: &BuildContext<'_>) -> ResourceRequirements {
    let hints = &ctx.analysis.container.resources;

    let mut requests = BTreeMap::from([
        (
            "cpu".to_string(),
            cpu_quantity(hints.min_cpu_cores.unwrap_or(DEFAULT_CPU_REQUEST)),
        ),
        (
            "memory".to_string(),
            hints
                .min_memory_limit
                .map_or_else(|| Quantity(DEFAULT_MEMORY_REQUEST.to_string()), byte_quantity),
        ),
        (
            "ephemeral-storage".to_string(),
            hints
                .min_disk_space
                .map_or_else(|| Quantity(DEFAULT_EPHEMERAL_REQUEST.to_string()), byte_quantity),
        ),
    ]);

    let mut limits = BTreeMap::new();
    match hints.max_cpu_cores {
        Some(cores) => {
            limits.insert("cpu".to_string(), cpu_quantity(cores));
        }
        None if ctx.config.apply_default_cpu_limit => {
            limits.insert("cpu".to_string(), cpu_quantity(DEFAULT_CPU_LIMIT));
        }
        None => {}
    }
    match hints.memory_limit {
        Some(bytes) => {
            limits.insert("memory".to_string(), byte_quantity(bytes));
        }
        None if ctx.config.apply_default_memory_limit => {
            limits.insert(
                "memory".to_string(),
                Quantity(DEFAULT_MEMORY_LIMIT.to_string()),
            );
        }
        None => {}
    }

    if ctx.analysis.needs_gpu() {
        let count = Quantity(ctx.analysis.gpu_count().to_string());
        limits.insert(GPU_RESOURCE.to_string(), count.clone());
        requests.insert(GPU_RESOURCE.to_string(), count);
    }

    ResourceRequirements {
        requests: Some(requests),
        limits: if limits.is_empty() { None } else { Some(limits) },
        ..ResourceRequirements::default()
    }
}

fn tolerations(gpu: bool) -> Vec<Toleration> {
    let mut tolerations = vec![Toleration {
        key: Some(ANALYSIS_NODE_KEY.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Toleration::default()
    }];
    if gpu {
        tolerations.push(Toleration {
            key: Some(GPU_NODE_KEY.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Toleration::default()
        });
    }
    tolerations
}

fn node_affinity(gpu: bool) -> NodeAffinity {
    let mut required = vec![NodeSelectorRequirement {
        key: ANALYSIS_NODE_KEY.to_string(),
        operator: "In".to_string(),
        values: Some(vec!["true".to_string()]),
    }];
    if gpu {
        required.push(NodeSelectorRequirement {
            key: GPU_NODE_KEY.to_string(),
            operator: "In".to_string(),
            values: Some(vec!["true".to_string()]),
        });
    }

    NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(required),
                ..NodeSelectorTerm::default()
            }],
        }),
        preferred_during_scheduling_ignored_during_execution: Some(vec![
            PreferredSchedulingTerm {
                weight: 100,
                preference: NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: VICE_NODE_KEY.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec!["true".to_string()]),
                    }]),
                    ..NodeSelectorTerm::default()
                },
            },
        ]),
    }
}

/// Spreads interactive pods across hosts; soft so a small cluster can still
/// schedule everything.
fn pod_anti_affinity() -> PodAntiAffinity {
    PodAntiAffinity {
        preferred_during_scheduling_ignored_during_execution: Some(vec![
            WeightedPodAffinityTerm {
                weight: 100,
                pod_affinity_term: PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            "app-type".to_string(),
                            APP_TYPE_INTERACTIVE.to_string(),
                        )])),
                        ..LabelSelector::default()
                    }),
                    topology_key: TOPOLOGY_KEY_HOSTNAME.to_string(),
                    ..PodAffinityTerm::default()
                },
            },
        ]),
        ..PodAntiAffinity::default()
    }
}
