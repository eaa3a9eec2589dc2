//! HTTP control plane. All writes are delegated to `AdminService` so cache
//! invalidation and upstream swaps stay coupled to the store mutation.

use crate::admin::{AdminError, AdminService};
use crate::policy::types::{BlocklistMode, ClientProfile, GlobalBlockedApps, RuleAction};
use crate::settings::RawDnsSettings;
use crate::stats::StatsCollector;
use crate::store::{RuleStore, StoreError};
use axum::{
    extract::{Json as AxumJson, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;

struct ApiState {
    admin: Arc<AdminService>,
    stats: Arc<StatsCollector>,
}

struct ApiError(AdminError);

impl From<AdminError> for ApiError {
    fn from(e: AdminError) -> Self {
        ApiError(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(AdminError::Store(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            AdminError::NotFound => (StatusCode::NOT_FOUND, self.0.to_string()),
            AdminError::Settings(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            AdminError::Store(StoreError::Conflict(domain)) => (
                StatusCode::CONFLICT,
                format!("a rule for '{}' already exists", domain),
            ),
            AdminError::Store(e) => {
                tracing::error!("API store error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "store error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub async fn start_api_server(
    admin: Arc<AdminService>,
    stats: Arc<StatsCollector>,
    port: u16,
) {
    let state = Arc::new(ApiState { admin, stats });

    let app = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/stats", get(get_stats))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/{domain}", delete(delete_rule))
        .route("/api/blocklists", get(list_blocklists).post(create_blocklist))
        .route("/api/blocklists/{id}", patch(update_blocklist).delete(delete_blocklist))
        .route("/api/blocklists/{id}/refresh", post(refresh_blocklist))
        .route("/api/refresh", post(refresh_all))
        .route("/api/clients", get(list_clients).post(upsert_client))
        .route("/api/clients/{id}", delete(delete_client))
        .route("/api/apps", get(get_apps).put(put_apps))
        .route("/api/rewrites", get(list_rewrites).post(create_rewrite))
        .route("/api/rewrites/{id}", delete(delete_rewrite))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/logs", get(get_logs))
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("API server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let settings = state.admin.dns_settings().await?;
    Ok(Json(serde_json::json!({
        "upstream_mode": settings.upstream_mode,
        "stats": state.stats.snapshot(),
    })))
}

async fn get_stats(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

// ---- Rules ----

#[derive(Deserialize)]
struct CreateRule {
    domain: String,
    action: RuleAction,
}

async fn list_rules(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let rules = state.admin.store().list_rules().await?;
    let rules: Vec<_> = rules
        .into_iter()
        .map(|(domain, action, category)| {
            serde_json::json!({ "domain": domain, "action": action, "category": category })
        })
        .collect();
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<Arc<ApiState>>,
    AxumJson(payload): AxumJson<CreateRule>,
) -> Result<impl IntoResponse, ApiError> {
    state.admin.create_rule(payload.domain, payload.action).await?;
    Ok(StatusCode::CREATED)
}

async fn delete_rule(
    State(state): State<Arc<ApiState>>,
    Path(domain): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.admin.delete_rule(domain).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Blocklists ----

#[derive(Deserialize)]
struct CreateBlocklist {
    name: String,
    url: String,
}

#[derive(Deserialize)]
struct UpdateBlocklist {
    enabled: Option<bool>,
    mode: Option<BlocklistMode>,
}

async fn list_blocklists(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.admin.store().list_blocklists().await?))
}

async fn create_blocklist(
    State(state): State<Arc<ApiState>>,
    AxumJson(payload): AxumJson<CreateBlocklist>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.admin.create_blocklist(payload.name, payload.url).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn update_blocklist(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    AxumJson(payload): AxumJson<UpdateBlocklist>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .admin
        .set_blocklist_state(id, payload.enabled, payload.mode)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_blocklist(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.admin.delete_blocklist(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh_blocklist(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    state.admin.trigger_refresh(Some(id)).await;
    Json(serde_json::json!({ "status": "refresh_triggered", "id": id }))
}

async fn refresh_all(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.admin.trigger_refresh(None).await;
    Json(serde_json::json!({ "status": "refresh_triggered" }))
}

// ---- Client profiles ----

#[derive(Deserialize)]
struct UpsertClient {
    name: String,
    ip: IpAddr,
    #[serde(default = "default_true")]
    use_global_settings: bool,
    #[serde(default = "default_true")]
    use_global_categories: bool,
    #[serde(default = "default_true")]
    use_global_apps: bool,
    #[serde(default)]
    assigned_blocklists: Vec<i64>,
}

fn default_true() -> bool {
    true
}

async fn list_clients(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.admin.store().list_client_profiles().await?))
}

async fn upsert_client(
    State(state): State<Arc<ApiState>>,
    AxumJson(payload): AxumJson<UpsertClient>,
) -> Result<impl IntoResponse, ApiError> {
    let profile = ClientProfile {
        id: 0,
        name: payload.name,
        ip: payload.ip,
        use_global_settings: payload.use_global_settings,
        use_global_categories: payload.use_global_categories,
        use_global_apps: payload.use_global_apps,
        assigned_blocklists: payload.assigned_blocklists,
    };
    let id = state.admin.upsert_client_profile(profile).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn delete_client(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.admin.delete_client_profile(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Global apps ----

async fn get_apps(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.admin.store().global_blocked_apps().await?))
}

async fn put_apps(
    State(state): State<Arc<ApiState>>,
    AxumJson(payload): AxumJson<GlobalBlockedApps>,
) -> Result<impl IntoResponse, ApiError> {
    state.admin.set_global_blocked_apps(payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Rewrites ----

#[derive(Deserialize)]
struct CreateRewrite {
    domain: String,
    target: String,
}

async fn list_rewrites(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.admin.store().list_rewrites().await?))
}

async fn create_rewrite(
    State(state): State<Arc<ApiState>>,
    AxumJson(payload): AxumJson<CreateRewrite>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.admin.create_rewrite(payload.domain, payload.target).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn delete_rewrite(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.admin.delete_rewrite(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Upstream settings ----

async fn get_settings(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.admin.dns_settings().await?))
}

async fn put_settings(
    State(state): State<Arc<ApiState>>,
    AxumJson(payload): AxumJson<RawDnsSettings>,
) -> Result<impl IntoResponse, ApiError> {
    let settings = state.admin.update_dns_settings(payload).await?;
    Ok(Json(settings))
}

// ---- Query logs ----

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    100
}

async fn get_logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.admin.store().recent_logs(query.limit).await?))
}
