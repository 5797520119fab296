mod config;
mod controller;
mod db;
mod error;
mod http;
mod jobs;
mod kube_factory;
mod logs;
mod mesh;
mod proxy;
mod registry;
mod store;

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use guildnet_types::{ClusterState, JobKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use config::Args;
use db::DbGateway;
use error::Result;
use http::AppState;
use jobs::JobQueue;
use kube_factory::KubeClientFactory;
use logs::LogStreamer;
use mesh::MeshTransport;
use proxy::ProxyEngine;
use registry::Registry;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    guildnet_common::init();
    tracing_subscriber::fmt::init();
    guildnet_common::metrics::maybe_spawn_metrics_server();

    let args = Args::parse();
    run(args).await
}

async fn run(args: Args) -> Result<()> {
    let state_dir = std::path::Path::new(&args.state.state_dir);
    let store = Store::open(state_dir)?;

    let mesh = MeshTransport::start(
        state_dir,
        &args.mesh.login_server,
        &args.mesh.preauth_key,
        &args.mesh.hostname,
        args.listen.mesh_port,
        args.listen.admin_port,
        std::time::Duration::from_secs(args.mesh.connect_timeout_secs),
    )
    .await?;
    info!(hostname = mesh.hostname(), machine_id = %mesh.machine_id(), "mesh identity ready");

    let kube = KubeClientFactory::default();
    let registry = Registry::new(store.collection("clusters")?, kube.clone());
    let jobs = JobQueue::new(store.collection("jobs")?);
    let logs = LogStreamer::new();
    let proxy = Arc::new(ProxyEngine::new(Arc::new(kube.clone())));

    let pool = guildnet_common::postgres::create_pool(args.postgres.clone()).await;
    let db = Arc::new(DbGateway::new(
        store.collection("databases")?,
        store.collection("audit")?,
        store.collection("permissions")?,
        pool,
    ));

    let shutdown = CancellationToken::new();

    // The task map a restarted process inherits from the store is empty, so
    // every already-attached cluster needs its controller re-spawned here;
    // `Registry::attach` only does this for clusters attached during this
    // process's own lifetime.
    for cluster in registry.list()? {
        if matches!(cluster.state, ClusterState::Attached | ClusterState::Healthy | ClusterState::Unhealthy)
            && let Err(e) = spawn_controller_for(&registry, &kube, &cluster, args.ingress_class_name.clone()).await
        {
            error!(cluster_id = %cluster.id, error = %e, "failed to respawn controller on startup");
        }
    }

    let app_state = AppState {
        registry: registry.clone(),
        kube: Arc::new(kube),
        jobs: jobs.clone(),
        db,
        logs,
        proxy,
        ingress_domain: None,
        ingress_class: args.ingress_class_name.clone(),
        operator_token: args.auth.operator_token.clone(),
        shutdown: shutdown.clone(),
    };

    let worker_jobs = jobs.clone();
    let worker_cancel = shutdown.clone();
    let worker_db = app_state.db.clone();
    let worker = tokio::spawn(async move {
        worker_jobs
            .run_worker(worker_cancel, move |job, queue| {
                let db = worker_db.clone();
                async move { run_job(job, queue, db).await }
            })
            .await;
    });

    let mesh_listener = mesh.listener().await?;
    let admin_listener = mesh.admin_listener().await?;
    guildnet_common::signal_ready();

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        guildnet_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    http::serve(mesh_listener, admin_listener, app_state, shutdown.clone()).await?;

    jobs.close();
    let _ = worker.await;
    mesh::drain(&shutdown, std::time::Duration::from_secs(10)).await;
    info!("guildnet-hostapp stopped gracefully");
    Ok(())
}

async fn spawn_controller_for(
    registry: &Arc<Registry>,
    kube: &KubeClientFactory,
    cluster: &guildnet_types::Cluster,
    ingress_class: Option<String>,
) -> Result<()> {
    let client = kube.client_for(cluster.id, &cluster.kubeconfig).await?;
    let Some(cancel) = registry.cancellation_for(cluster.id).await else {
        return Ok(());
    };
    let namespace = if cluster.settings.namespace.is_empty() {
        "default".to_string()
    } else {
        cluster.settings.namespace.clone()
    };
    let ingress_domain = cluster.settings.ingress_domain.clone();
    tokio::spawn(controller::run(client, namespace, ingress_domain, ingress_class, cancel));
    Ok(())
}

/// Executes one dequeued job; the queue itself is kind-agnostic.
async fn run_job(job: guildnet_types::Job, queue: JobQueue, db: Arc<DbGateway>) -> std::result::Result<(), String> {
    match job.kind {
        JobKind::ClusterBootstrap => Ok(()),
        JobKind::BulkImport => run_bulk_import(job, queue, db).await,
    }
}

/// Validates and (unless `dryRun`) writes every row, recording a per-row
/// result set on the job instead of aborting on the first bad row.
async fn run_bulk_import(job: guildnet_types::Job, queue: JobQueue, db: Arc<DbGateway>) -> std::result::Result<(), String> {
    let db_id = job.payload.get("dbId").and_then(|v| v.as_str()).ok_or("missing dbId")?.to_string();
    let table = job.payload.get("table").and_then(|v| v.as_str()).ok_or("missing table")?.to_string();
    let rows = job.payload.get("rows").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let mapping: HashMap<String, String> = job
        .payload
        .get("mapping")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let dry_run = job.payload.get("dryRun").and_then(|v| v.as_bool()).unwrap_or(false);
    let results = db.bulk_import(&db_id, &table, &rows, &mapping, dry_run).await.map_err(|e| e.to_string())?;
    queue.set_result(job.id, serde_json::json!({"rows": results}));
    queue.report_progress(job.id, 1.0);
    Ok(())
}
