//! Kube Client Factory: turns a Cluster record's kubeconfig blob into a typed
//! client, with a bounded-TTL cache keyed by cluster id. Entries are dropped
//! on rotation or delete so a stale client is never reused.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use parking_lot::Mutex;
use guildnet_types::{ClusterSettings, Workspace, WorkspaceSpec};

use crate::error::{Error, Result};

const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct CacheEntry {
    client: Client,
    at: Instant,
}

#[derive(Default, Clone)]
pub struct KubeClientFactory {
    cache: Arc<Mutex<HashMap<uuid::Uuid, CacheEntry>>>,
}

/// Which path the factory picked to reach a pod/service, recorded per-request
/// for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPath {
    ExplicitProxyUrl,
    ApiServerProxy,
    PortForward,
    DirectApiAddress,
}

impl KubeClientFactory {
    pub fn invalidate(&self, cluster_id: uuid::Uuid) {
        self.cache.lock().remove(&cluster_id);
    }

    pub async fn client_for(
        &self,
        cluster_id: uuid::Uuid,
        kubeconfig_yaml: &str,
    ) -> Result<Client> {
        if let Some(entry) = self.cache.lock().get(&cluster_id).cloned()
            && entry.at.elapsed() < CACHE_TTL
        {
            return Ok(entry.client);
        }
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml)
            .map_err(|e| Error::ValidationFailed(vec![format!("invalid kubeconfig: {e}")]))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Unreachable(format!("kubeconfig rejected: {e}")))?;
        let client = Client::try_from(config).map_err(Error::Kube)?;
        self.cache.lock().insert(
            cluster_id,
            CacheEntry {
                client: client.clone(),
                at: Instant::now(),
            },
        );
        Ok(client)
    }

    /// A lightweight API-server health call with a deadline.
    pub async fn probe(client: &Client, deadline: Duration) -> Result<()> {
        tokio::time::timeout(deadline, client.apiserver_version())
            .await
            .map_err(|_| Error::Timeout("API server probe exceeded deadline".into()))?
            .map_err(Error::Kube)?;
        Ok(())
    }

    pub fn workspaces_api(client: &Client, namespace: &str) -> Api<Workspace> {
        Api::namespaced(client.clone(), namespace)
    }

    pub async fn get_workspace(client: &Client, ns: &str, name: &str) -> Result<Workspace> {
        Self::workspaces_api(client, ns)
            .get(name)
            .await
            .map_err(Error::Kube)
    }

    pub async fn create_workspace(
        client: &Client,
        ns: &str,
        name: &str,
        spec: WorkspaceSpec,
    ) -> Result<Workspace> {
        spec.validate()
            .map_err(|e| Error::ValidationFailed(vec![e]))?;
        let mut ws = Workspace::new(name, spec);
        ws.metadata.namespace = Some(ns.to_string());
        Self::workspaces_api(client, ns)
            .create(&Default::default(), &ws)
            .await
            .map_err(Error::Kube)
    }

    pub async fn delete_workspace(client: &Client, ns: &str, name: &str) -> Result<()> {
        match Self::workspaces_api(client, ns)
            .delete(name, &Default::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    pub async fn list_workspaces(client: &Client, ns: &str) -> Result<Vec<Workspace>> {
        Ok(Self::workspaces_api(client, ns)
            .list(&ListParams::default())
            .await
            .map_err(Error::Kube)?
            .items)
    }

    /// Resolve a running pod's IP and primary container port.
    pub async fn pod_address(client: &Client, ns: &str, pod_name: &str) -> Result<(String, u16)> {
        let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
        let pod = pods.get(pod_name).await.map_err(Error::Kube)?;
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .ok_or_else(|| Error::Unreachable(format!("pod {pod_name} has no IP yet")))?;
        let port = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.ports.as_ref())
            .and_then(|p| p.first())
            .map(|p| p.container_port as u16)
            .unwrap_or(80);
        Ok((ip, port))
    }

    /// Picks at most one resolution path per request, in priority order:
    /// explicit proxy URL, then API-server proxy, then port-forward, then
    /// direct API address (itself split into pod-direct/direct-service by
    /// `prefer_pod_proxy` at the call site).
    pub fn resolution_path(settings: &ClusterSettings) -> ResolutionPath {
        if settings.proxy_url_override.is_some() {
            ResolutionPath::ExplicitProxyUrl
        } else if settings.use_api_server_proxy {
            ResolutionPath::ApiServerProxy
        } else if settings.use_port_forward {
            ResolutionPath::PortForward
        } else {
            ResolutionPath::DirectApiAddress
        }
    }

    pub async fn port_forward(
        client: &Client,
        ns: &str,
        pod_name: &str,
        port: u16,
    ) -> Result<kube::api::Portforwarder> {
        let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
        pods.portforward(pod_name, &[port]).await.map_err(Error::Kube)
    }
}
