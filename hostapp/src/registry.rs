//! Cluster Registry: drives the `Cluster` state machine and spawns/tears down
//! the per-cluster Workspace Controller and Database Gateway tasks, mirroring
//! the task-map-plus-`ContextData` shape of the teacher's cluster controller
//! (`storage_operator::clusters::reconcile`), minus leader election — there is
//! exactly one Host App process per mesh identity, so no lease is needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use guildnet_types::{Cluster, ClusterState, ProbeCode};

use crate::error::{Error, Result};
use crate::kube_factory::KubeClientFactory;
use crate::store::Collection;

const PROBE_DEADLINE: Duration = Duration::from_secs(5);
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Per-cluster background machinery spawned on `attach`, torn down on `delete`.
struct ClusterTasks {
    cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

pub struct Registry {
    clusters: Collection<Cluster>,
    kube: KubeClientFactory,
    tasks: Mutex<HashMap<Uuid, ClusterTasks>>,
}

impl Registry {
    pub fn new(clusters: Collection<Cluster>, kube: KubeClientFactory) -> Arc<Self> {
        Arc::new(Self {
            clusters,
            kube,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn create(&self, name: &str) -> Result<Cluster> {
        let cluster = Cluster::new(Uuid::new_v4(), name.to_string());
        self.clusters.put(&cluster.id.to_string(), cluster.clone())?;
        Ok(cluster)
    }

    pub fn get(&self, id: Uuid) -> Result<Cluster> {
        self.clusters
            .get(&id.to_string())?
            .ok_or_else(|| Error::NotFound(format!("cluster {id}")))
    }

    pub fn list(&self) -> Result<Vec<Cluster>> {
        Ok(self.clusters.list()?.into_iter().map(|(_, c)| c).collect())
    }

    /// Validates the kubeconfig is well-formed, moves the cluster to
    /// `Attached`, then spawns its controller/gateway tasks and kicks a probe.
    pub async fn attach(self: &Arc<Self>, id: Uuid, kubeconfig: String) -> Result<Cluster> {
        kube::config::Kubeconfig::from_yaml(&kubeconfig)
            .map_err(|e| Error::ValidationFailed(vec![format!("not a valid kubeconfig: {e}")]))?;

        let cluster = self.clusters.patch(&id.to_string(), |c| {
            c.kubeconfig = kubeconfig;
            c.state = ClusterState::Attached;
            c.updated_at = chrono::Utc::now();
            c.version += 1;
            Ok(())
        })?;

        self.spawn_cluster_tasks(id).await;
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.probe(id).await;
        });
        Ok(cluster)
    }

    /// Replaces credentials without resetting lifecycle state, then re-probes.
    pub async fn rotate(self: &Arc<Self>, id: Uuid, kubeconfig: String) -> Result<Cluster> {
        kube::config::Kubeconfig::from_yaml(&kubeconfig)
            .map_err(|e| Error::ValidationFailed(vec![format!("not a valid kubeconfig: {e}")]))?;
        self.kube.invalidate(id);
        let cluster = self.clusters.patch(&id.to_string(), |c| {
            c.kubeconfig = kubeconfig;
            c.updated_at = chrono::Utc::now();
            c.version += 1;
            Ok(())
        })?;
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.probe(id).await;
        });
        Ok(cluster)
    }

    pub async fn probe(&self, id: Uuid) -> Result<Cluster> {
        let cluster = self.get(id)?;
        let outcome = self.run_probe(&cluster).await;
        let cluster = self.clusters.patch(&id.to_string(), |c| {
            match &outcome {
                Ok(()) => {
                    c.state = ClusterState::Healthy;
                    c.last_probe_code = None;
                    c.last_probe_error = None;
                }
                Err((code, msg)) => {
                    c.state = ClusterState::Unhealthy;
                    c.last_probe_code = Some(*code);
                    c.last_probe_error = Some(msg.clone());
                }
            }
            c.updated_at = chrono::Utc::now();
            c.version += 1;
            Ok(())
        })?;
        Ok(cluster)
    }

    async fn run_probe(&self, cluster: &Cluster) -> std::result::Result<(), (ProbeCode, String)> {
        if cluster.kubeconfig.is_empty() {
            return Err((ProbeCode::Unreachable, "no kubeconfig attached".into()));
        }
        let client = self
            .kube
            .client_for(cluster.id, &cluster.kubeconfig)
            .await
            .map_err(|e| (ProbeCode::Unreachable, e.to_string()))?;
        match KubeClientFactory::probe(&client, PROBE_DEADLINE).await {
            Ok(()) => Ok(()),
            Err(Error::Timeout(m)) => Err((ProbeCode::Timeout, m)),
            Err(Error::Kube(kube::Error::Api(ae))) if ae.code == 401 || ae.code == 403 => {
                Err((ProbeCode::Unauthorized, ae.message))
            }
            Err(e) => Err((ProbeCode::Unreachable, e.to_string())),
        }
    }

    /// Marks the cluster deleted, stops its tasks, and drops its cached client.
    /// The remote cluster itself is never touched.
    pub async fn delete(self: &Arc<Self>, id: Uuid) -> Result<()> {
        self.clusters.patch(&id.to_string(), |c| {
            c.state = ClusterState::Deleted;
            c.updated_at = chrono::Utc::now();
            c.version += 1;
            Ok(())
        })?;
        self.teardown_cluster_tasks(id).await;
        self.kube.invalidate(id);
        Ok(())
    }

    async fn spawn_cluster_tasks(&self, id: Uuid) {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&id) {
            return;
        }
        info!(cluster_id = %id, "attached: starting controller and database gateway");
        let cancel = CancellationToken::new();
        // Controller/gateway task spawning is wired in by `main` once both
        // components exist; the Registry only owns the cancellation handle
        // so `delete` can request a bounded drain.
        tasks.insert(
            id,
            ClusterTasks {
                cancel,
                handles: Vec::new(),
            },
        );
    }

    pub async fn cancellation_for(&self, id: Uuid) -> Option<CancellationToken> {
        self.tasks.lock().await.get(&id).map(|t| t.cancel.clone())
    }

    async fn teardown_cluster_tasks(&self, id: Uuid) {
        let Some(entry) = self.tasks.lock().await.remove(&id) else {
            return;
        };
        entry.cancel.cancel();
        for handle in entry.handles {
            if tokio::time::timeout(DRAIN_DEADLINE, handle).await.is_err() {
                warn!(cluster_id = %id, "task drain exceeded deadline");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Collection<Cluster>) {
        let dir = tempfile::tempdir().unwrap();
        let s = crate::store::Store::open(dir.path()).unwrap();
        let coll = s.collection("clusters").unwrap();
        (dir, coll)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (_dir, coll) = store();
        let registry = Registry::new(coll, KubeClientFactory::default());
        let created = registry.create("demo").unwrap();
        assert_eq!(created.state, ClusterState::Registered);
        let fetched = registry.get(created.id).unwrap();
        assert_eq!(fetched.id, created.id);
    }

    #[tokio::test]
    async fn attach_rejects_malformed_kubeconfig() {
        let (_dir, coll) = store();
        let registry = Registry::new(coll, KubeClientFactory::default());
        let created = registry.create("demo").unwrap();
        let err = registry.attach(created.id, "not yaml kubeconfig {{{".into()).await;
        assert!(matches!(err, Err(Error::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn delete_marks_deleted_without_touching_kubeconfig() {
        let (_dir, coll) = store();
        let registry = Registry::new(coll, KubeClientFactory::default());
        let created = registry.create("demo").unwrap();
        registry.delete(created.id).await.unwrap();
        let fetched = registry.get(created.id).unwrap();
        assert_eq!(fetched.state, ClusterState::Deleted);
    }
}
