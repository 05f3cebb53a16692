//! HTTP boundary for the gateway.
//!
//! Validates request shape, builds the request context (generating a session
//! id when absent), invokes the engine, and shapes responses. Internal errors
//! map onto the error taxonomy: invalid input 400, conflicts 409, not found
//! 404, unavailable dependencies 503, deadline overruns 504, everything else
//! 500 — always as `{"error": {"kind", "message"}}`, never echoing the prompt.

use crate::engine::Engine;
use crate::metrics;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use psg_common::GatewayError;
use psg_common::types::{
    Action, Channel, Decision, DetectorKind, ListKind, RequestContext, Severity,
};
use psg_store::{NewListEntry, NewRule};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Error wrapper implementing the wire contract.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DependencyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

fn default_tenant() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
struct DecideRequest {
    prompt: String,
    user_id: Option<String>,
    session_id: Option<String>,
    #[serde(default = "default_tenant")]
    tenant: String,
    #[serde(default)]
    channel: Channel,
    #[serde(default)]
    user_roles: Vec<String>,
    #[serde(default)]
    user_permissions: Vec<String>,
    #[allow(dead_code)]
    metadata: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ResponseCheckRequest {
    response: String,
    original_prompt: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
    #[serde(default = "default_tenant")]
    tenant: String,
    #[serde(default)]
    channel: Channel,
    #[serde(default)]
    user_roles: Vec<String>,
    #[serde(default)]
    user_permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreateBundleRequest {
    tenant: String,
    name: String,
    version: String,
    #[serde(default)]
    channel: Channel,
    max_prompt_length: Option<usize>,
    allowed_languages: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ActivateRequest {
    tenant: String,
    #[serde(default)]
    channel: Channel,
    bundle_id: i64,
}

#[derive(Debug, Deserialize)]
struct RuleRequest {
    rule_id: Option<i64>,
    bundle_id: i64,
    #[serde(rename = "type")]
    rule_type: DetectorKind,
    pattern: String,
    threshold: Option<f64>,
    action: Action,
    #[serde(default)]
    context: JsonValue,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ListEntryRequest {
    bundle_id: i64,
    kind: ListKind,
    value: String,
    scope: Option<String>,
    expire_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct BlockedPromptRequest {
    #[serde(default = "default_tenant")]
    tenant: String,
    prompt: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default = "default_severity")]
    severity: Severity,
}

fn default_category() -> String {
    "known_injection".to_string()
}

fn default_severity() -> Severity {
    Severity::High
}

#[derive(Debug, Deserialize)]
struct RulesQuery {
    bundle_id: i64,
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    window_secs: Option<u64>,
}

/// Build the request context from the body and transport headers.
fn build_context(
    tenant: String,
    channel: Channel,
    user_id: Option<String>,
    session_id: Option<String>,
    user_roles: Vec<String>,
    user_permissions: Vec<String>,
    headers: &HeaderMap,
    route: &str,
) -> RequestContext {
    RequestContext {
        tenant,
        user_id,
        session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        client_ip: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string()),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        channel,
        user_roles,
        user_permissions,
        route: route.to_string(),
    }
}

/// Create the gateway router.
pub fn create_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/decide", post(decide))
        .route("/response/check", post(response_check))
        .route("/policy/status", get(policy_status))
        .route("/policy/bundle", post(create_bundle))
        .route("/policy/bundle/activate", post(activate_bundle))
        .route("/policy/rule", post(upsert_rule))
        .route("/policy/rules", get(list_rules))
        .route("/policy/allowlist", post(add_allowlist))
        .route("/policy/blocklist", post(add_blocklist))
        .route("/similarity/blocked", post(add_blocked_prompt))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(engine)
}

async fn decide(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    Json(req): Json<DecideRequest>,
) -> Result<Json<Decision>, ApiError> {
    let ctx = build_context(
        req.tenant,
        req.channel,
        req.user_id,
        req.session_id,
        req.user_roles,
        req.user_permissions,
        &headers,
        "/decide",
    );
    let decision = engine.decide(&req.prompt, &ctx).await?;
    Ok(Json(decision))
}

async fn response_check(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    Json(req): Json<ResponseCheckRequest>,
) -> Result<Json<Decision>, ApiError> {
    let ctx = build_context(
        req.tenant,
        req.channel,
        req.user_id,
        req.session_id,
        req.user_roles,
        req.user_permissions,
        &headers,
        "/response/check",
    );
    let decision = engine
        .check_response(&req.response, req.original_prompt.as_deref(), &ctx)
        .await?;
    Ok(Json(decision))
}

async fn policy_status(
    State(engine): State<Arc<Engine>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(engine.policy_status().await?))
}

async fn create_bundle(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CreateBundleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = engine
        .store()
        .create_bundle(
            &req.tenant,
            &req.name,
            &req.version,
            req.channel,
            req.max_prompt_length,
            req.allowed_languages,
        )
        .await
        .map_err(crate::engine::store_err)?;
    Ok((StatusCode::CREATED, Json(bundle)))
}

async fn activate_bundle(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<ActivateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = engine
        .activate_bundle(&req.tenant, req.channel, req.bundle_id)
        .await?;
    Ok(Json(bundle))
}

async fn upsert_rule(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<RuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = engine
        .store()
        .upsert_rule(
            req.rule_id,
            NewRule {
                bundle_id: req.bundle_id,
                rule_type: req.rule_type,
                pattern: req.pattern,
                threshold: req.threshold,
                action: req.action,
                context: req.context,
                enabled: req.enabled,
            },
        )
        .await
        .map_err(crate::engine::store_err)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn list_rules(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<RulesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rules = engine
        .store()
        .list_rules(query.bundle_id)
        .await
        .map_err(crate::engine::store_err)?;
    Ok(Json(rules))
}

async fn add_allowlist(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<ListEntryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = engine
        .store()
        .add_allowlist_entry(NewListEntry {
            bundle_id: req.bundle_id,
            kind: req.kind,
            value: req.value,
            scope: req.scope,
            expire_at: req.expire_at,
        })
        .await
        .map_err(crate::engine::store_err)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn add_blocklist(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<ListEntryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = engine
        .store()
        .add_blocklist_entry(NewListEntry {
            bundle_id: req.bundle_id,
            kind: req.kind,
            value: req.value,
            scope: req.scope,
            expire_at: req.expire_at,
        })
        .await
        .map_err(crate::engine::store_err)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn add_blocked_prompt(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<BlockedPromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.prompt.is_empty() {
        return Err(GatewayError::InvalidInput("empty prompt".into()).into());
    }
    let id = engine
        .add_blocked_prompt(&req.tenant, &req.prompt, &req.category, req.severity)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn stats(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<StatsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let window = Duration::from_secs(query.window_secs.unwrap_or(86_400));
    let stats = engine.stats(window).await?;
    Ok(Json(json!({
        "window_secs": window.as_secs(),
        "stats": stats,
    })))
}

async fn health(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": engine.uptime().as_secs(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Start the HTTP server.
pub async fn start_server(
    addr: std::net::SocketAddr,
    engine: Arc<Engine>,
) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
    let router = create_router(engine);
    tracing::info!("gateway listening on {}", addr);
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await
    })
}
