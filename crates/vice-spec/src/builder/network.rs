//! Service, ingress and disruption budget for one analysis.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        core::v1::{Service, ServicePort, ServiceSpec},
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
        policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec},
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};

use super::{
    BuildContext, FILE_TRANSFER_PORT, INPUT_PORT_NAME, PROXY_PORT, PROXY_PORT_NAME,
};

pub(crate) fn service_name(external_id: &str) -> String {
    format!("vice-{external_id}")
}

/// Cluster-internal service in front of the pod: `tcp-proxy` for the user's
/// connection, `tcp-input` for file-transfer requests.
pub(crate) fn service(ctx: &BuildContext<'_>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(service_name(ctx.external_id)),
            namespace: Some(ctx.config.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(ctx.selector_labels()),
            ports: Some(vec![
                ServicePort {
                    name: Some(PROXY_PORT_NAME.to_string()),
                    port: PROXY_PORT,
                    target_port: Some(IntOrString::String(PROXY_PORT_NAME.to_string())),
                    protocol: Some("TCP".to_string()),
                    ..ServicePort::default()
                },
                ServicePort {
                    name: Some(INPUT_PORT_NAME.to_string()),
                    port: FILE_TRANSFER_PORT,
                    target_port: Some(IntOrString::String(INPUT_PORT_NAME.to_string())),
                    protocol: Some("TCP".to_string()),
                    ..ServicePort::default()
                },
            ]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Ingress exposing the proxy under the per-analysis subdomain. Interactive
/// sessions hold websockets open for hours, hence the generous timeouts.
pub(crate) fn ingress(ctx: &BuildContext<'_>) -> Ingress {
    let service_name = service_name(ctx.external_id);

    let annotations = BTreeMap::from([
        (
            "nginx.ingress.kubernetes.io/proxy-read-timeout".to_string(),
            "2592000".to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/proxy-send-timeout".to_string(),
            "2592000".to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/websocket-services".to_string(),
            service_name.clone(),
        ),
    ]);

    Ingress {
        metadata: ObjectMeta {
            name: Some(ctx.external_id.to_string()),
            namespace: Some(ctx.config.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(ctx.config.ingress_class.clone()),
            default_backend: Some(IngressBackend {
                service: Some(IngressServiceBackend {
                    name: ctx.config.default_backend_service.clone(),
                    port: Some(ServiceBackendPort {
                        number: Some(ctx.config.default_backend_port),
                        ..ServiceBackendPort::default()
                    }),
                }),
                ..IngressBackend::default()
            }),
            rules: Some(vec![IngressRule {
                host: Some(ctx.subdomain.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service_name,
                                port: Some(ServiceBackendPort {
                                    name: Some(PROXY_PORT_NAME.to_string()),
                                    ..ServiceBackendPort::default()
                                }),
                            }),
                            ..IngressBackend::default()
                        },
                    }],
                }),
            }]),
            ..IngressSpec::default()
        }),
        ..Ingress::default()
    }
}

/// Interactive pods must not be evicted by voluntary disruptions; a user's
/// session dies with the pod.
pub(crate) fn disruption_budget(ctx: &BuildContext<'_>) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(ctx.external_id.to_string()),
            namespace: Some(ctx.config.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(0)),
            selector: Some(LabelSelector {
                match_labels: Some(ctx.selector_labels()),
                ..LabelSelector::default()
            }),
            ..PodDisruptionBudgetSpec::default()
        }),
        ..PodDisruptionBudget::default()
    }
}
