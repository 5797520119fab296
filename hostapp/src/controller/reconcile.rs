//! Reconciliation entrypoint for one cluster's `Workspace` objects. No leader
//! election: one task per attached cluster inside this single process is
//! enough, unlike the teacher's multi-replica operator deployment.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use guildnet_types::{Workspace, WorkspacePhase};

use super::actions;
use super::planner::{self, ObservedState};
use crate::error::Error;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const CONFLICT_RETRY: Duration = Duration::from_secs(2);

struct Context {
    client: Client,
    namespace: String,
    ingress_domain: Option<String>,
    ingress_class: Option<String>,
}

/// Runs until `cancel` fires. Errors from the controller's internal stream
/// are swallowed per-item (the controller already retries via `on_error`);
/// a `CrdMissing`/RBAC style failure bubbles once and the caller should mark
/// the cluster unhealthy.
pub async fn run(
    client: Client,
    namespace: String,
    ingress_domain: Option<String>,
    ingress_class: Option<String>,
    cancel: CancellationToken,
) {
    info!(namespace, "starting workspace controller");
    let context = Arc::new(Context {
        client: client.clone(),
        namespace: namespace.clone(),
        ingress_domain,
        ingress_class,
    });
    let api: Api<Workspace> = Api::namespaced(client, &namespace);

    let controller = Controller::new(api, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "reconcile loop reported an error");
            }
        });

    tokio::select! {
        _ = controller => {}
        _ = cancel.cancelled() => {
            info!(namespace, "workspace controller draining");
        }
    }
}

async fn reconcile(ws: Arc<Workspace>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = ws.name_any();
    if ws.metadata.deletion_timestamp.is_some() {
        actions::set_phase(ctx.client.clone(), &ws, WorkspacePhase::Terminating, None).await?;
        return Ok(Action::await_change());
    }

    ws.spec
        .validate()
        .map_err(|e| Error::ValidationFailed(vec![e]))?;

    // Create order: Deployment, then Service, then (optional) Ingress.
    let deployment = actions::apply_deployment(&ctx.client, &ws).await?;
    let service = actions::apply_service(&ctx.client, &ws).await?;
    let ingress_created = if let Some(domain) = &ctx.ingress_domain {
        actions::apply_ingress(&ctx.client, &ws, domain, ctx.ingress_class.as_deref()).await?;
        true
    } else {
        false
    };

    let ready_replicas = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let service_has_endpoint = service.spec.is_some();

    let observed = ObservedState {
        deleting: false,
        deployment_ready_replicas: ready_replicas,
        service_has_endpoint,
        container_backoff_exceeded: false,
    };
    let current_phase = ws
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(WorkspacePhase::Pending);
    let next = planner::next_phase(current_phase, observed);

    let service_dns = planner::service_dns(&name, &ctx.namespace);
    let updated = super::patch::patch_status(ctx.client.clone(), &ws, |status| {
        status.phase = next;
        status.ready_replicas = ready_replicas;
        status.service_dns = Some(service_dns);
        if ingress_created {
            status.proxy_target = Some(format!("{name}.{}", ctx.namespace));
        }
    })
    .await?;
    let _ = updated;

    Ok(Action::requeue(PROBE_INTERVAL))
}

fn on_error(ws: Arc<Workspace>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(workspace = %ws.name_any(), error = %error, "reconcile failed");
    Action::requeue(CONFLICT_RETRY)
}
