use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ClusterState {
    #[default]
    Registered,
    Attached,
    Healthy,
    Unhealthy,
    Deleted,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterState::Registered => "registered",
            ClusterState::Attached => "attached",
            ClusterState::Healthy => "healthy",
            ClusterState::Unhealthy => "unhealthy",
            ClusterState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// Cause of the last failed probe.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeCode {
    Unreachable,
    Unauthorized,
    CrdMissing,
    Timeout,
}

impl fmt::Display for ProbeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeCode::Unreachable => "Unreachable",
            ProbeCode::Unauthorized => "Unauthorized",
            ProbeCode::CrdMissing => "CRDMissing",
            ProbeCode::Timeout => "Timeout",
        };
        write!(f, "{s}")
    }
}

/// Proxy-mode selection for a cluster. Precedence when multiple flags are set is
/// explicit-proxy-url > api-server-proxy > port-forward > prefer-pod-proxy > direct-service.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ClusterSettings {
    #[serde(default)]
    pub namespace: String,
    pub ingress_domain: Option<String>,
    pub image_pull_secret: Option<String>,
    pub proxy_url_override: Option<String>,
    #[serde(default)]
    pub force_http: bool,
    #[serde(default)]
    pub prefer_pod_proxy: bool,
    #[serde(default)]
    pub use_port_forward: bool,
    #[serde(default)]
    pub use_api_server_proxy: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    pub state: ClusterState,
    /// Opaque kubeconfig blob. Empty until `attach` succeeds.
    #[serde(default)]
    pub kubeconfig: String,
    #[serde(default)]
    pub settings: ClusterSettings,
    pub org_id: Option<String>,
    pub last_probe_code: Option<ProbeCode>,
    pub last_probe_error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Optimistic-concurrency version for `patch`.
    #[serde(default)]
    pub version: u64,
}

impl Cluster {
    pub fn new(id: Uuid, name: String) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            name,
            state: ClusterState::Registered,
            kubeconfig: String::new(),
            settings: ClusterSettings::default(),
            org_id: None,
            last_probe_code: None,
            last_probe_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}
