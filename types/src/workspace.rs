use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PortSpec {
    pub name: String,
    pub container_port: u16,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceSpec {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "guildnet.io",
    version = "v1",
    kind = "Workspace",
    plural = "workspaces",
    derive = "PartialEq",
    status = "WorkspaceStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }")]
#[kube(printcolumn = "{\"jsonPath\": \".status.serviceDNS\", \"name\": \"SERVICE\", \"type\": \"string\" }")]
pub struct WorkspaceSpec {
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Ordered name→value pairs. Order is significant; duplicates are rejected on admission.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl WorkspaceSpec {
    /// Admission check: duplicate env-var names are rejected.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for e in &self.env {
            if !seen.insert(e.name.as_str()) {
                return Err(format!("duplicate env var: {}", e.name));
            }
        }
        if self.image.trim().is_empty() {
            return Err("image must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum WorkspacePhase {
    #[default]
    Pending,
    Running,
    Failed,
    Terminating,
}

impl FromStr for WorkspacePhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(WorkspacePhase::Pending),
            "Running" => Ok(WorkspacePhase::Running),
            "Failed" => Ok(WorkspacePhase::Failed),
            "Terminating" => Ok(WorkspacePhase::Terminating),
            _ => Err(()),
        }
    }
}

impl fmt::Display for WorkspacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspacePhase::Pending => write!(f, "Pending"),
            WorkspacePhase::Running => write!(f, "Running"),
            WorkspacePhase::Failed => write!(f, "Failed"),
            WorkspacePhase::Terminating => write!(f, "Terminating"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct WorkspaceStatus {
    pub phase: WorkspacePhase,
    #[serde(default)]
    pub ready_replicas: i32,
    pub proxy_target: Option<String>,
    #[serde(rename = "serviceDNS")]
    pub service_dns: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
