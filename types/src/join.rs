use serde::{Deserialize, Serialize};

/// Canonical join-bundle (schema version 2). The deprecated v1 shape is mapped
/// into this one before anything is persisted.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct JoinBundleV2 {
    pub version: u32,
    pub hostapp: HostAppJoin,
    pub cluster: ClusterJoin,
    pub tailscale: TailscaleJoin,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HostAppJoin {
    pub url: String,
    pub ca_pem: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ClusterJoin {
    pub name: String,
    pub kubeconfig: String,
    pub namespace: Option<String>,
    pub ingress_domain: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct TailscaleJoin {
    pub login_server: String,
    pub preauth_key: String,
    pub hostname: String,
}

/// The deprecated v1 shape: a flat join bundle with no `version` field and a
/// single `kubeconfig`/`cluster_name` pair instead of a nested `cluster` object.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct JoinBundleV1 {
    pub hostapp_url: String,
    pub cluster_name: String,
    pub kubeconfig: String,
    pub login_server: String,
    pub preauth_key: String,
    pub hostname: String,
}

impl From<JoinBundleV1> for JoinBundleV2 {
    fn from(v1: JoinBundleV1) -> Self {
        JoinBundleV2 {
            version: 2,
            hostapp: HostAppJoin {
                url: v1.hostapp_url,
                ca_pem: None,
            },
            cluster: ClusterJoin {
                name: v1.cluster_name,
                kubeconfig: v1.kubeconfig,
                namespace: None,
                ingress_domain: None,
            },
            tailscale: TailscaleJoin {
                login_server: v1.login_server,
                preauth_key: v1.preauth_key,
                hostname: v1.hostname,
            },
        }
    }
}

/// Accepts either shape on the wire; always normalizes to v2.
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum JoinBundle {
    V2(JoinBundleV2),
    V1(JoinBundleV1),
}

impl JoinBundle {
    pub fn into_v2(self) -> JoinBundleV2 {
        match self {
            JoinBundle::V2(v2) => v2,
            JoinBundle::V1(v1) => v1.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_maps_into_v2_fields() {
        let v1 = JoinBundleV1 {
            hostapp_url: "https://host".into(),
            cluster_name: "c1".into(),
            kubeconfig: "kc".into(),
            login_server: "https://login".into(),
            preauth_key: "key".into(),
            hostname: "host1".into(),
        };
        let v2: JoinBundleV2 = v1.into();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.cluster.name, "c1");
        assert_eq!(v2.tailscale.hostname, "host1");
    }

    #[test]
    fn untagged_bundle_prefers_v2_shape() {
        let raw = serde_json::json!({
            "version": 2,
            "hostapp": {"url": "https://h"},
            "cluster": {"name": "c1", "kubeconfig": "kc"},
            "tailscale": {"login_server": "l", "preauth_key": "k", "hostname": "h"}
        });
        let bundle: JoinBundle = serde_json::from_value(raw).unwrap();
        let v2 = bundle.into_v2();
        assert_eq!(v2.cluster.name, "c1");
    }
}
