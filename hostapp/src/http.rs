//! HTTP Surface: the dual-router, dual-listener wiring follows
//! `meta::server`/`iam::server::{internal,public}` — one router bound to the
//! Mesh Transport listener for peer traffic, one bound to loopback for admin
//! and shutdown. Access logging and CORS reuse `common::access_log` and
//! `common::cors` directly; routing itself (`/api/cluster/{id}/...` dispatch)
//! has no teacher counterpart and is new.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch as patch_method, post, put};
use axum::{Json, Router};
use futures::{Stream, StreamExt as _};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use guildnet_types::{
    Cluster, ColumnDef, DatabaseHandle, JobKind, JoinBundle, PermissionBinding, Role, TableSchema,
    WorkspaceSpec,
};

use crate::controller;
use crate::db::{DbGateway, ExportFormat};
use crate::error::{Error, Result};
use crate::jobs::JobQueue;
use crate::kube_factory::KubeClientFactory;
use crate::logs::{LogEvent, LogStreamer};
use crate::proxy::ProxyEngine;
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub kube: Arc<KubeClientFactory>,
    pub jobs: JobQueue,
    pub db: Arc<DbGateway>,
    pub logs: LogStreamer,
    pub proxy: Arc<ProxyEngine>,
    pub ingress_domain: Option<String>,
    pub ingress_class: Option<String>,
    pub operator_token: Option<String>,
    pub shutdown: CancellationToken,
}

pub fn public_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/health", get(api_health))
        .route("/bootstrap", post(bootstrap))
        .route("/api/deploy/clusters", get(list_clusters))
        .route("/api/deploy/clusters", post(create_cluster))
        .route("/api/deploy/clusters/{id}", get(cluster_action))
        .route("/api/deploy/clusters/{id}", post(cluster_action))
        .route("/api/deploy/clusters/{id}", delete(delete_cluster))
        .route("/api/cluster/{id}/servers", get(list_workspaces))
        .route("/api/cluster/{id}/workspaces", post(create_workspace))
        .route("/api/cluster/{id}/workspaces/{name}", get(get_workspace))
        .route("/api/cluster/{id}/workspaces/{name}", delete(delete_workspace))
        .route("/api/cluster/{id}/workspaces/{name}/logs", get(logs_snapshot))
        .route("/api/cluster/{id}/workspaces/{name}/logs/stream", get(logs_stream))
        .route("/api/cluster/{id}/proxy/server/{name}/{*path}", get(proxy_tunnel).post(proxy_tunnel))
        .route(
            "/api/cluster/{id}/proxy/server/{name}/{*path}",
            put(proxy_tunnel).delete(proxy_tunnel).patch(proxy_tunnel),
        )
        .route("/api/cluster/{id}/db", get(list_databases))
        .route("/api/cluster/{id}/db", post(create_database))
        .route("/api/cluster/{id}/db/{db_id}/tables", get(list_tables))
        .route("/api/cluster/{id}/db/{db_id}/tables", post(create_table))
        .route("/api/cluster/{id}/db/{db_id}/tables/{table}", get(get_table))
        .route("/api/cluster/{id}/db/{db_id}/tables/{table}", patch_method(patch_table_schema))
        .route("/api/cluster/{id}/db/{db_id}/tables/{table}", delete(delete_table))
        .route("/api/cluster/{id}/db/{db_id}/tables/{table}/rows", get(query_rows))
        .route("/api/cluster/{id}/db/{db_id}/tables/{table}/rows", post(insert_row))
        .route("/api/cluster/{id}/db/{db_id}/tables/{table}/rows/{row_id}", delete(delete_row))
        .route("/api/cluster/{id}/db/{db_id}/tables/{table}/rows/{row_id}", patch_method(patch_row))
        .route("/api/cluster/{id}/db/{db_id}/tables/{table}/export", get(export_table))
        .route("/api/cluster/{id}/db/{db_id}/tables/{table}/import", post(import_table))
        .route("/api/cluster/{id}/db/{db_id}/audit", get(list_audit))
        .route("/api/cluster/{id}/db/{db_id}/audit/restore", post(restore_audit))
        .route("/api/cluster/{id}/db/{db_id}/permissions", get(list_permissions))
        .route("/api/cluster/{id}/db/{db_id}/permissions", post(grant_permission))
        .route("/api/cluster/{id}/db/{db_id}/permissions", delete(revoke_permission))
        .route("/api/cluster/{id}/jobs/bulk-import", post(enqueue_bulk_import))
        .route("/api/jobs/{id}", get(get_job))
        .layer(axum::middleware::from_fn(guildnet_common::access_log::public))
        .layer(guildnet_common::cors::dev())
        .with_state(state)
}

pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/internal/shutdown", post(shutdown))
        .layer(axum::middleware::from_fn(guildnet_common::access_log::admin))
        .with_state(state)
}

/// Runs both listeners until `cancel` fires, then drains each with a
/// graceful shutdown.
pub async fn serve(
    mesh_listener: TcpListener,
    admin_listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> Result<()> {
    let public = public_router(state.clone());
    let admin = admin_router(state);

    let mesh_cancel = cancel.clone();
    let admin_cancel = cancel.clone();
    let mesh = axum::serve(mesh_listener, public)
        .with_graceful_shutdown(async move { mesh_cancel.cancelled().await });
    let loopback = axum::serve(admin_listener, admin)
        .with_graceful_shutdown(async move { admin_cancel.cancelled().await });

    let (mesh_res, admin_res) = tokio::join!(mesh, loopback);
    mesh_res.map_err(Error::Io)?;
    admin_res.map_err(Error::Io)?;
    Ok(())
}

fn respond<T: serde::Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(v) => Json(v).into_response(),
        Err(e) => {
            e.log(&Uuid::new_v4().to_string());
            e.into_response()
        }
    }
}

fn require_operator(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let Some(expected) = &state.operator_token else {
        return Ok(());
    };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(Error::Unauthorized("missing or invalid operator token".into()))
    }
}

fn role_from_headers(headers: &HeaderMap) -> Role {
    headers
        .get("x-guildnet-role")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| serde_json::from_value(Value::String(v.to_lowercase())).ok())
        .unwrap_or(Role::Admin)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn api_health(State(state): State<AppState>) -> Response {
    let clusters = match state.registry.list() {
        Ok(list) => list,
        Err(e) => return e.into_response(),
    };
    let clusters: Vec<Value> = clusters
        .into_iter()
        .map(|c| {
            json!({
                "id": c.id,
                "status": c.state,
                "code": c.last_probe_code,
                "error": c.last_probe_error,
            })
        })
        .collect();
    Json(json!({
        "status": "ok",
        "components": {
            "mesh": "ok",
            "store": "ok",
            "clusters": clusters,
        }
    }))
    .into_response()
}

async fn shutdown(State(state): State<AppState>) -> &'static str {
    info!("shutdown requested via admin socket");
    state.shutdown.cancel();
    "shutting down"
}

async fn bootstrap(State(state): State<AppState>, headers: HeaderMap, Json(bundle): Json<JoinBundle>) -> Response {
    if let Err(e) = require_operator(&state, &headers) {
        return e.into_response();
    }
    let bundle = bundle.into_v2();
    let result = async {
        let cluster = state.registry.create(&bundle.cluster.name)?;
        let cluster = state.registry.attach(cluster.id, bundle.cluster.kubeconfig).await?;
        spawn_controller(&state, &cluster, bundle.cluster.namespace, bundle.cluster.ingress_domain).await?;
        Ok::<_, Error>(cluster)
    }
    .await;
    respond(result.map(|c| json!({"clusterId": c.id})))
}

/// Namespace/ingress-domain overrides win when present (e.g. from a join
/// bundle); otherwise the cluster's own settings apply.
async fn spawn_controller(
    state: &AppState,
    cluster: &Cluster,
    namespace_override: Option<String>,
    ingress_domain_override: Option<String>,
) -> Result<()> {
    let client = state.kube.client_for(cluster.id, &cluster.kubeconfig).await?;
    let Some(cancel) = state.registry.cancellation_for(cluster.id).await else {
        return Ok(());
    };
    let namespace = namespace_override.unwrap_or_else(|| namespace_of(cluster));
    let ingress_domain = ingress_domain_override
        .or_else(|| cluster.settings.ingress_domain.clone())
        .or_else(|| state.ingress_domain.clone());
    let ingress_class = state.ingress_class.clone();
    tokio::spawn(controller::run(client, namespace, ingress_domain, ingress_class, cancel));
    Ok(())
}

async fn list_clusters(State(state): State<AppState>) -> Response {
    respond(state.registry.list())
}

#[derive(Deserialize)]
struct CreateClusterRequest {
    name: String,
}

async fn create_cluster(State(state): State<AppState>, Json(req): Json<CreateClusterRequest>) -> Response {
    respond(state.registry.create(&req.name))
}

#[derive(Deserialize)]
struct ClusterActionQuery {
    action: Option<String>,
}

#[derive(Deserialize)]
struct KubeconfigBody {
    kubeconfig: String,
}

async fn cluster_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<ClusterActionQuery>,
    method: Method,
    body: axum::body::Bytes,
) -> Response {
    let result = async {
        match (method, q.action.as_deref()) {
            (Method::GET, Some("health") | None) => state.registry.probe(id).await,
            (Method::GET, Some("kubeconfig")) => state.registry.get(id),
            (Method::POST, Some("attach-kubeconfig")) => {
                let req: KubeconfigBody = serde_json::from_slice(&body)?;
                let cluster = state.registry.attach(id, req.kubeconfig).await?;
                spawn_controller(&state, &cluster, None, None).await?;
                Ok(cluster)
            }
            (Method::POST, Some("kubeconfig")) => {
                let req: KubeconfigBody = serde_json::from_slice(&body)?;
                state.registry.rotate(id, req.kubeconfig).await
            }
            (Method::POST, Some("health") | None) => state.registry.probe(id).await,
            _ => state.registry.get(id),
        }
    }
    .await;
    respond(result)
}

async fn delete_cluster(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    respond(state.registry.delete(id).await)
}

async fn list_workspaces(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let result = async {
        let cluster = state.registry.get(id)?;
        let client = state.kube.client_for(cluster.id, &cluster.kubeconfig).await?;
        let ns = namespace_of(&cluster);
        KubeClientFactory::list_workspaces(&client, &ns).await
    }
    .await;
    respond(result)
}

async fn create_workspace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(spec): Json<WorkspaceSpecRequest>,
) -> Response {
    let result = async {
        let cluster = state.registry.get(id)?;
        let client = state.kube.client_for(cluster.id, &cluster.kubeconfig).await?;
        let ns = namespace_of(&cluster);
        let name = spec.name.clone();
        KubeClientFactory::create_workspace(&client, &ns, &name, spec.into_spec()).await
    }
    .await;
    respond(result)
}

#[derive(Deserialize)]
struct WorkspaceSpecRequest {
    name: String,
    image: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    ports: Vec<guildnet_types::PortSpec>,
}

impl WorkspaceSpecRequest {
    fn into_spec(self) -> WorkspaceSpec {
        WorkspaceSpec {
            image: self.image,
            args: self.args,
            ports: self.ports,
            ..Default::default()
        }
    }
}

async fn get_workspace(State(state): State<AppState>, Path((id, name)): Path<(Uuid, String)>) -> Response {
    let result = async {
        let cluster = state.registry.get(id)?;
        let client = state.kube.client_for(cluster.id, &cluster.kubeconfig).await?;
        let ns = namespace_of(&cluster);
        KubeClientFactory::get_workspace(&client, &ns, &name).await
    }
    .await;
    respond(result)
}

async fn delete_workspace(State(state): State<AppState>, Path((id, name)): Path<(Uuid, String)>) -> Response {
    let result = async {
        let cluster = state.registry.get(id)?;
        let client = state.kube.client_for(cluster.id, &cluster.kubeconfig).await?;
        let ns = namespace_of(&cluster);
        state.proxy.invalidate(id, &name).await;
        KubeClientFactory::delete_workspace(&client, &ns, &name).await
    }
    .await;
    respond(result)
}

async fn logs_snapshot(State(state): State<AppState>, Path((id, name)): Path<(Uuid, String)>) -> Response {
    let (ring, _rx) = state.logs.subscribe(id, &name).await;
    let lines: Vec<Value> = ring
        .into_iter()
        .map(|l| json!({"t": l.timestamp.to_rfc3339(), "msg": l.line}))
        .collect();
    Json(lines).into_response()
}

async fn logs_stream(
    State(state): State<AppState>,
    Path((id, name)): Path<(Uuid, String)>,
) -> Sse<impl Stream<Item = std::result::Result<Event, std::convert::Infallible>>> {
    let (ring, rx) = state.logs.subscribe(id, &name).await;
    let backlog = tokio_stream::iter(ring.into_iter().map(LogEvent::Line));
    let live = futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => Some((event, rx)),
            Err(_) => None,
        }
    });
    let events = backlog.chain(live).map(|event| {
        let payload = match event {
            LogEvent::Line(l) => json!({"t": l.timestamp.to_rfc3339(), "msg": l.line}),
            LogEvent::Lagged => json!({"t": chrono::Utc::now().to_rfc3339(), "msg": "<lagged, some lines dropped>"}),
        };
        Ok(Event::default().data(payload.to_string()))
    });
    Sse::new(events)
}

/// Dispatches to a WebSocket tunnel or a plain HTTP proxy depending on
/// whether the request carries an `Upgrade: websocket` header.
/// `WebSocketUpgrade` has no `Option<_>` extractor impl, so the upgrade
/// path is extracted manually from the request parts instead of relying
/// on axum to make the choice for us.
async fn proxy_tunnel(
    State(state): State<AppState>,
    Path((id, name, _path)): Path<(Uuid, String, String)>,
    req: axum::extract::Request,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let method = parts.method.clone();
    let uri = parts.uri.clone();
    let headers = parts.headers.clone();
    let is_upgrade = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    let result = async {
        let cluster = state.registry.get(id)?;
        let client = state.kube.client_for(cluster.id, &cluster.kubeconfig).await?;
        if is_upgrade {
            let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state)
                .await
                .map_err(|e| Error::ValidationFailed(vec![e.to_string()]))?;
            return state.proxy.tunnel_websocket(ws, cluster, client, name).await;
        }
        state.proxy.proxy_http(&cluster, &client, &name, method, &uri, headers, body).await
    }
    .await;
    match result {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn list_databases(State(state): State<AppState>, Path(_id): Path<Uuid>) -> Response {
    respond(state.db.list_databases())
}

#[derive(Deserialize)]
struct CreateDatabaseRequest {
    #[serde(rename = "dbId")]
    db_id: String,
    name: String,
    description: Option<String>,
}

async fn create_database(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    Json(req): Json<CreateDatabaseRequest>,
) -> Response {
    let handle = DatabaseHandle {
        cluster_id,
        db_id: req.db_id,
        name: req.name,
        description: req.description,
        tables: Vec::new(),
    };
    respond(state.db.create_database(handle))
}

#[derive(Deserialize)]
struct CreateTableRequest {
    name: String,
    #[serde(rename = "primaryKey")]
    primary_key: String,
    columns: Vec<ColumnDef>,
}

async fn create_table(
    State(state): State<AppState>,
    Path((_cluster_id, db_id)): Path<(Uuid, String)>,
    Json(req): Json<CreateTableRequest>,
) -> Response {
    let schema = TableSchema {
        name: req.name,
        primary_key: req.primary_key,
        columns: req.columns,
    };
    respond(state.db.create_table(&db_id, schema).await)
}

async fn list_tables(State(state): State<AppState>, Path((_cluster_id, db_id)): Path<(Uuid, String)>) -> Response {
    respond(state.db.list_tables(&db_id))
}

async fn get_table(
    State(state): State<AppState>,
    Path((_cluster_id, db_id, table)): Path<(Uuid, String, String)>,
) -> Response {
    respond(state.db.get_table(&db_id, &table))
}

#[derive(Deserialize)]
struct PatchSchemaRequest {
    #[serde(rename = "primaryKey")]
    primary_key: String,
    columns: Vec<ColumnDef>,
}

async fn patch_table_schema(
    State(state): State<AppState>,
    Path((_cluster_id, db_id, table)): Path<(Uuid, String, String)>,
    Json(req): Json<PatchSchemaRequest>,
) -> Response {
    let schema = TableSchema {
        name: table.clone(),
        primary_key: req.primary_key,
        columns: req.columns,
    };
    respond(state.db.patch_schema(&db_id, &table, schema).await)
}

async fn delete_table(
    State(state): State<AppState>,
    Path((_cluster_id, db_id, table)): Path<(Uuid, String, String)>,
) -> Response {
    respond(state.db.delete_table(&db_id, &table).await)
}

#[derive(Deserialize)]
struct QueryRowsQuery {
    limit: Option<i64>,
    /// JSON-encoded object of column-equality filters, e.g. `filter={"status":"active"}`.
    filter: Option<String>,
    /// Primary-key value to resume after, for keyset pagination.
    cursor: Option<String>,
}

async fn query_rows(
    State(state): State<AppState>,
    Path((_cluster_id, db_id, table)): Path<(Uuid, String, String)>,
    Query(q): Query<QueryRowsQuery>,
    headers: HeaderMap,
) -> Response {
    let role = role_from_headers(&headers);
    let filter = match q.filter.as_deref().map(serde_json::from_str::<HashMap<String, Value>>) {
        Some(Ok(f)) => Some(f),
        Some(Err(e)) => return Error::ValidationFailed(vec![format!("invalid filter: {e}")]).into_response(),
        None => None,
    };
    respond(
        state
            .db
            .query_rows(&db_id, &table, role, q.limit.unwrap_or(100), filter.as_ref(), q.cursor.as_deref())
            .await,
    )
}

async fn export_table(
    State(state): State<AppState>,
    Path((_cluster_id, db_id, table)): Path<(Uuid, String, String)>,
    Query(q): Query<ExportQuery>,
    headers: HeaderMap,
) -> Response {
    let role = role_from_headers(&headers);
    let format: ExportFormat = match q.format.parse() {
        Ok(f) => f,
        Err(e) => return <Error as IntoResponse>::into_response(e),
    };
    let stream = match state.db.export_rows(&db_id, &table, role, format).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv",
    };
    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[derive(Deserialize)]
struct ExportQuery {
    format: String,
}

#[derive(Deserialize)]
struct ImportQuery {
    dry_run: Option<String>,
}

#[derive(Deserialize)]
struct ImportTableRequest {
    rows: Vec<Value>,
    #[serde(default)]
    mapping: HashMap<String, String>,
}

async fn import_table(
    State(state): State<AppState>,
    Path((_cluster_id, db_id, table)): Path<(Uuid, String, String)>,
    Query(q): Query<ImportQuery>,
    Json(req): Json<ImportTableRequest>,
) -> Response {
    let dry_run = matches!(q.dry_run.as_deref(), Some("1") | Some("true"));
    let result = state.db.bulk_import(&db_id, &table, &req.rows, &req.mapping, dry_run).await;
    respond(result.map(|rows| json!({"rows": rows})))
}

async fn list_audit(
    State(state): State<AppState>,
    Path((_cluster_id, db_id)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> Response {
    let role = role_from_headers(&headers);
    respond(state.db.list_audit(&db_id, role))
}

#[derive(Deserialize)]
struct RestoreRequest {
    #[serde(rename = "eventId")]
    event_id: String,
}

async fn restore_audit(
    State(state): State<AppState>,
    Path((_cluster_id, db_id)): Path<(Uuid, String)>,
    Json(req): Json<RestoreRequest>,
) -> Response {
    respond(state.db.restore_event(&db_id, &req.event_id).await.map(|_| json!({"ok": true})))
}

async fn list_permissions(
    State(state): State<AppState>,
    Path((_cluster_id, _db_id)): Path<(Uuid, String)>,
) -> Response {
    respond(state.db.list_permissions())
}

#[derive(Deserialize)]
struct GrantRequest {
    principal: String,
    scope: String,
    role: Role,
}

async fn grant_permission(
    State(state): State<AppState>,
    Path((_cluster_id, _db_id)): Path<(Uuid, String)>,
    Json(req): Json<GrantRequest>,
) -> Response {
    let binding = PermissionBinding {
        principal: req.principal,
        scope: req.scope,
        role: req.role,
    };
    respond(state.db.grant(binding).map(|_| json!({"ok": true})))
}

#[derive(Deserialize)]
struct RevokeQuery {
    principal: String,
    scope: String,
}

async fn revoke_permission(
    State(state): State<AppState>,
    Path((_cluster_id, _db_id)): Path<(Uuid, String)>,
    Query(q): Query<RevokeQuery>,
) -> Response {
    respond(state.db.revoke(&q.principal, &q.scope).map(|_| json!({"ok": true})))
}

async fn insert_row(
    State(state): State<AppState>,
    Path((_cluster_id, db_id, table)): Path<(Uuid, String, String)>,
    Json(row): Json<Value>,
) -> Response {
    respond(state.db.insert_row(&db_id, &table, &row, true).await.map(|_| json!({"ok": true})))
}

async fn patch_row(
    State(state): State<AppState>,
    Path((_cluster_id, db_id, table, row_id)): Path<(Uuid, String, String, String)>,
    Json(patch): Json<Value>,
) -> Response {
    respond(state.db.patch_row(&db_id, &table, &row_id, &patch).await.map(|_| json!({"ok": true})))
}

async fn delete_row(
    State(state): State<AppState>,
    Path((_cluster_id, db_id, table, row_id)): Path<(Uuid, String, String, String)>,
) -> Response {
    respond(state.db.delete_row(&db_id, &table, &row_id).await.map(|_| json!({"ok": true})))
}

#[derive(Deserialize)]
struct BulkImportRequest {
    db_id: String,
    table: String,
    rows: Vec<Value>,
    #[serde(default)]
    mapping: HashMap<String, String>,
    #[serde(default, rename = "dryRun")]
    dry_run: bool,
}

async fn enqueue_bulk_import(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    Json(req): Json<BulkImportRequest>,
) -> Response {
    let payload = json!({
        "clusterId": cluster_id,
        "dbId": req.db_id,
        "table": req.table,
        "rows": req.rows,
        "mapping": req.mapping,
        "dryRun": req.dry_run,
    });
    respond(state.jobs.enqueue(JobKind::BulkImport, payload))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let result = state.jobs.get(id).and_then(|maybe| maybe.ok_or_else(|| Error::NotFound(format!("job {id}"))));
    respond(result)
}

fn namespace_of(cluster: &Cluster) -> String {
    if cluster.settings.namespace.is_empty() {
        "default".to_string()
    } else {
        cluster.settings.namespace.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let request = axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap();
        let response = Router::new().route("/healthz", get(healthz)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn role_from_headers_defaults_to_admin() {
        let headers = HeaderMap::new();
        assert_eq!(role_from_headers(&headers), Role::Admin);
    }

    #[test]
    fn role_from_headers_parses_viewer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-guildnet-role", "viewer".parse().unwrap());
        assert_eq!(role_from_headers(&headers), Role::Viewer);
    }
}
