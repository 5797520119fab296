//! Converges one `Workspace`'s desired resources (Deployment, Service,
//! optional Ingress) and records observed status, mirroring the write-phase
//! shape of `storage_operator::clusters::actions`.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar as K8sEnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend,
    IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};

use guildnet_common::annotations;
use guildnet_types::{Workspace, WorkspacePhase};

use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "guildnet-hostapp";

fn owner_ref(ws: &Workspace) -> OwnerReference {
    ws.controller_owner_ref(&()).expect("Workspace is namespaced")
}

fn labels(ws: &Workspace) -> BTreeMap<String, String> {
    let mut labels = ws.spec.labels.clone();
    labels.insert("guildnet.io/workspace".into(), ws.name_any());
    labels
}

pub async fn apply_deployment(client: &Client, ws: &Workspace) -> Result<Deployment> {
    let name = ws.name_any();
    let namespace = ws.namespace().ok_or_else(|| Error::Internal("workspace has no namespace".into()))?;
    let labels = labels(ws);

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_ref(ws)]),
            annotations: Some(BTreeMap::from([(
                annotations::CREATED_BY.to_string(),
                FIELD_MANAGER.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "workspace".into(),
                        image: Some(ws.spec.image.clone()),
                        args: Some(ws.spec.args.clone()),
                        env: Some(
                            ws.spec
                                .env
                                .iter()
                                .map(|e| K8sEnvVar {
                                    name: e.name.clone(),
                                    value: Some(e.value.clone()),
                                    ..Default::default()
                                })
                                .collect(),
                        ),
                        ports: Some(
                            ws.spec
                                .ports
                                .iter()
                                .map(|p| ContainerPort {
                                    name: Some(p.name.clone()),
                                    container_port: p.container_port as i32,
                                    ..Default::default()
                                })
                                .collect(),
                        ),
                        resources: Some(ResourceRequirements {
                            requests: None,
                            limits: None,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    image_pull_secrets: None,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    };

    let api: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Apply(&deployment),
    )
    .await
    .map_err(Error::Kube)
}

pub async fn apply_service(client: &Client, ws: &Workspace) -> Result<Service> {
    let name = ws.name_any();
    let namespace = ws.namespace().ok_or_else(|| Error::Internal("workspace has no namespace".into()))?;
    let labels = labels(ws);

    let service = Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_ref(ws)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(
                ws.spec
                    .ports
                    .iter()
                    .map(|p| ServicePort {
                        name: Some(p.name.clone()),
                        port: p.container_port as i32,
                        target_port: Some(IntOrString::Int(p.container_port as i32)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            type_: Some("LoadBalancer".into()),
            ..Default::default()
        }),
        status: None,
    };

    let api: Api<Service> = Api::namespaced(client.clone(), &namespace);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Apply(&service),
    )
    .await
    .map_err(Error::Kube)
}

pub async fn apply_ingress(
    client: &Client,
    ws: &Workspace,
    ingress_domain: &str,
    ingress_class: Option<&str>,
) -> Result<Ingress> {
    let name = ws.name_any();
    let namespace = ws.namespace().ok_or_else(|| Error::Internal("workspace has no namespace".into()))?;
    let Some(port) = ws.spec.ports.first() else {
        return Err(Error::ValidationFailed(vec![
            "workspace declares no ports; cannot create an Ingress".into(),
        ]));
    };
    let host = format!("{name}.{ingress_domain}");

    let ingress = Ingress {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            owner_references: Some(vec![owner_ref(ws)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: ingress_class.map(str::to_string),
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".into()),
                        path_type: "Prefix".into(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(port.container_port as i32),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        status: None,
    };

    let api: Api<Ingress> = Api::namespaced(client.clone(), &namespace);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Apply(&ingress),
    )
    .await
    .map_err(Error::Kube)
}

pub async fn set_phase(client: Client, ws: &Workspace, phase: WorkspacePhase, message: Option<String>) -> Result<Workspace> {
    super::patch::patch_status(client, ws, |status| {
        status.phase = phase;
        status.message = message;
    })
    .await
}
