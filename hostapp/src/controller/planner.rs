//! Pure decision functions for the Workspace Controller's reconcile loop.
//! Kept free of any `kube::Client` so they can be tested without a cluster,
//! the same separation the teacher draws between
//! `storage_operator::clusters::planner` and `reconcile`.

use std::time::Duration;

use guildnet_types::WorkspacePhase;

/// Order resources are created in; reversed for deletion.
pub const CREATE_ORDER: [&str; 3] = ["Deployment", "Service", "Ingress"];

pub fn delete_order() -> [&'static str; 3] {
    let mut order = CREATE_ORDER;
    order.reverse();
    order
}

pub fn service_dns(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}.svc.cluster.local")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    LoadBalancer,
    NodePort,
}

/// Falls back to node-port if no load-balancer address showed up within the deadline.
pub fn service_type_for(requested_at_elapsed: Duration, lb_address_assigned: bool, deadline: Duration) -> ServiceType {
    if lb_address_assigned {
        ServiceType::LoadBalancer
    } else if requested_at_elapsed < deadline {
        ServiceType::LoadBalancer
    } else {
        ServiceType::NodePort
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedState {
    pub deleting: bool,
    pub deployment_ready_replicas: i32,
    pub service_has_endpoint: bool,
    pub container_backoff_exceeded: bool,
}

/// Status machine: Pending -> Running -> Failed -> Terminating, one-way
/// except Running <-> Pending on transient readiness loss.
pub fn next_phase(current: WorkspacePhase, observed: ObservedState) -> WorkspacePhase {
    if observed.deleting {
        return WorkspacePhase::Terminating;
    }
    if current == WorkspacePhase::Terminating {
        return WorkspacePhase::Terminating;
    }
    if observed.container_backoff_exceeded {
        return WorkspacePhase::Failed;
    }
    if observed.deployment_ready_replicas >= 1 && observed.service_has_endpoint {
        WorkspacePhase::Running
    } else {
        WorkspacePhase::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_dns_matches_cluster_local_convention() {
        assert_eq!(
            service_dns("notebook", "team-a"),
            "notebook.team-a.svc.cluster.local"
        );
    }

    #[test]
    fn delete_order_is_create_order_reversed() {
        assert_eq!(delete_order(), ["Ingress", "Service", "Deployment"]);
    }

    #[test]
    fn falls_back_to_node_port_past_deadline() {
        let deadline = Duration::from_secs(30);
        assert_eq!(
            service_type_for(Duration::from_secs(5), false, deadline),
            ServiceType::LoadBalancer
        );
        assert_eq!(
            service_type_for(Duration::from_secs(60), false, deadline),
            ServiceType::NodePort
        );
        assert_eq!(
            service_type_for(Duration::from_secs(60), true, deadline),
            ServiceType::LoadBalancer
        );
    }

    #[test]
    fn pending_until_deployment_and_service_are_both_ready() {
        let observed = ObservedState {
            deleting: false,
            deployment_ready_replicas: 0,
            service_has_endpoint: false,
            container_backoff_exceeded: false,
        };
        assert_eq!(
            next_phase(WorkspacePhase::Pending, observed),
            WorkspacePhase::Pending
        );
    }

    #[test]
    fn running_once_both_converge() {
        let observed = ObservedState {
            deleting: false,
            deployment_ready_replicas: 1,
            service_has_endpoint: true,
            container_backoff_exceeded: false,
        };
        assert_eq!(
            next_phase(WorkspacePhase::Pending, observed),
            WorkspacePhase::Running
        );
    }

    #[test]
    fn running_drops_back_to_pending_on_transient_loss() {
        let observed = ObservedState {
            deleting: false,
            deployment_ready_replicas: 0,
            service_has_endpoint: false,
            container_backoff_exceeded: false,
        };
        assert_eq!(
            next_phase(WorkspacePhase::Running, observed),
            WorkspacePhase::Pending
        );
    }

    #[test]
    fn backoff_exceeded_fails_regardless_of_current_phase() {
        let observed = ObservedState {
            deleting: false,
            deployment_ready_replicas: 0,
            service_has_endpoint: false,
            container_backoff_exceeded: true,
        };
        assert_eq!(
            next_phase(WorkspacePhase::Running, observed),
            WorkspacePhase::Failed
        );
    }

    #[test]
    fn terminating_is_sticky() {
        let observed = ObservedState {
            deleting: false,
            deployment_ready_replicas: 1,
            service_has_endpoint: true,
            container_backoff_exceeded: false,
        };
        assert_eq!(
            next_phase(WorkspacePhase::Terminating, observed),
            WorkspacePhase::Terminating
        );
    }
}
