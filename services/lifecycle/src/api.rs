use crate::config::ApiConfig;
use crate::context::ExecutionContext;
use crate::criteria::{resolve_age, ArchivalCriteria, Predicate, QueryCriteria, TieringCriteria};
use crate::error::PolicyError;
use crate::manager::DataLifecycleManager;
use crate::provider::DataTier;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Header carrying the caller's correlation ID
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Source tag for operations started through the API
const API_SOURCE: &str = "operations_api";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DataLifecycleManager>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Body of a tier move request
#[derive(Debug, Default, Deserialize)]
pub struct TierMoveRequest {
    /// Only move records older than this, e.g. `"30_days"`
    #[serde(default)]
    pub age: Option<String>,
    /// Extra condition, e.g. `"status = 'closed'"`
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub remove_from_source: bool,
}

/// Body of an archive request
#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    /// Archive records older than this, e.g. `"1_year"`
    pub age: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub remove_after_archive: bool,
}

/// Response to a cancellation request
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub operation_id: String,
    pub cancelled: bool,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/operations", get(list_operations))
        .route("/api/v1/operations/:operation_id/cancel", post(cancel_operation))
        .route("/api/v1/metrics", get(get_metrics))
        .route("/api/v1/scheduler", get(get_scheduler))
        .route("/api/v1/lifecycle/run", post(run_cycle))
        .route("/api/v1/retention/apply", post(apply_retention))
        .route("/api/v1/tables/:table/tier/:tier", post(move_table))
        .route("/api/v1/tables/:table/archive", post(archive_table))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Context for a request, reusing the caller's correlation ID when given
fn request_context(headers: &HeaderMap) -> ExecutionContext {
    let ctx = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ExecutionContext::new)
        .unwrap_or_default();
    ctx.with_metadata(crate::context::SOURCE_KEY, API_SOURCE)
}

fn build_criteria(
    age: Option<&str>,
    condition: Option<&str>,
) -> Result<QueryCriteria, PolicyError> {
    let mut criteria = match age {
        Some(age) => QueryCriteria::older_than(resolve_age(age, Utc::now())?),
        None => QueryCriteria::all(),
    };
    if let Some(condition) = condition {
        criteria = criteria.with(Predicate::parse_condition(condition)?);
    }
    Ok(criteria)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "lifecycle-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.manager.provider_health().await;
    let ready = providers.iter().all(|p| p.healthy) && !state.manager.is_shut_down();

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "not_ready" },
            "providers": providers,
        })),
    )
}

async fn list_operations(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.operations())
}

#[instrument(skip(state))]
async fn cancel_operation(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    if state.manager.cancel_operation(&operation_id) {
        Ok(Json(CancelResponse {
            operation_id,
            cancelled: true,
        }))
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            "OPERATION_NOT_FOUND",
            format!("Operation {} is not in flight", operation_id),
        ))
    }
}

async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.metrics())
}

async fn get_scheduler(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = state.manager.scheduler_state();
    Json(serde_json::json!({
        "enabled": scheduler.is_some(),
        "scheduler": scheduler,
        "schedule_secs": state.manager.settings().schedule.interval().as_secs(),
    }))
}

/// Run one lifecycle cycle on demand
#[instrument(skip(state, headers))]
async fn run_cycle(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let ctx = request_context(&headers);
    match state.manager.run_cycle(&ctx).await {
        Ok(report) => Ok(Json(report)),
        Err(e) if e.is_cancelled() => Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "SHUTTING_DOWN",
            e,
        )),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "CYCLE_FAILED", e)),
    }
}

#[instrument(skip(state, headers))]
async fn apply_retention(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let ctx = request_context(&headers);
    Json(state.manager.apply_retention_policies(&ctx).await)
}

/// Move a table's records to another tier
#[instrument(skip(state, headers, request))]
async fn move_table(
    State(state): State<AppState>,
    Path((table, tier)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<TierMoveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tier: DataTier = tier
        .parse()
        .map_err(|e: String| api_error(StatusCode::BAD_REQUEST, "INVALID_TIER", e))?;
    let criteria = build_criteria(request.age.as_deref(), request.condition.as_deref())
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_CRITERIA", e))?;

    let ctx = request_context(&headers);
    info!(table = %table, tier = %tier, operation_id = %ctx.correlation_id, "Tier move requested");

    let result = state
        .manager
        .move_to_tier(
            &table,
            tier,
            &TieringCriteria::new(criteria, request.remove_from_source),
            &ctx,
        )
        .await;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(result)))
}

/// Archive a table's old records
#[instrument(skip(state, headers, request))]
async fn archive_table(
    State(state): State<AppState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ArchiveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let older_than = resolve_age(&request.age, Utc::now())
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_CRITERIA", e))?;
    let mut criteria = ArchivalCriteria::new(older_than, request.remove_after_archive);
    if let Some(condition) = request.condition.as_deref() {
        let condition = build_criteria(None, Some(condition))
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_CRITERIA", e))?;
        criteria = criteria.with_condition(condition);
    }

    let ctx = request_context(&headers);
    let result = state.manager.archive(&table, &criteria, &ctx).await;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(result)))
}

/// Start the operations API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting lifecycle operations API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerSettings;
    use crate::policy::{LifecyclePolicy, LifecycleRule, RuleAction};
    use crate::provider::{MemoryProvider, Record, StorageProvider, TechnologyClass};
    use crate::registry::ProviderRegistry;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<MemoryProvider>, Arc<MemoryProvider>) {
        app_with_policies(Vec::new()).await
    }

    async fn app_with_policies(
        policies: Vec<LifecyclePolicy>,
    ) -> (Router, Arc<MemoryProvider>, Arc<MemoryProvider>) {
        let warm = Arc::new(MemoryProvider::new("warm"));
        let cold = Arc::new(MemoryProvider::new("cold"));
        let created = Utc::now() - chrono::Duration::days(60);
        let records: Vec<Record> = (0..4).map(|i| Record::new(format!("s-{i}"), created)).collect();
        warm.insert_batch("sessions", &records, &ExecutionContext::new("seed"))
            .await
            .unwrap();

        let registry = ProviderRegistry::builder()
            .register("warm", TechnologyClass::Relational, [DataTier::Warm], warm.clone())
            .register("cold", TechnologyClass::ObjectStore, [DataTier::Cold], cold.clone())
            .route("sessions", "warm")
            .build()
            .unwrap();
        let manager = Arc::new(DataLifecycleManager::new(
            Arc::new(registry),
            policies,
            ManagerSettings::default(),
        ));

        let router = create_router(AppState { manager }, &ApiConfig::default());
        (router, warm, cold)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header(CORRELATION_HEADER, "req-1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let (router, _, _) = app().await;

        let health = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let ready = router
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
        let body = json_body(ready).await;
        assert_eq!(body["providers"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_move_table_to_cold() {
        let (router, warm, cold) = app().await;

        let response = router
            .oneshot(post_json(
                "/api/v1/tables/sessions/tier/cold",
                serde_json::json!({"age": "30_days", "remove_from_source": true}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["operation_id"], "req-1");
        assert_eq!(body["records_processed"], 4);
        assert_eq!(cold.len("sessions"), 4);
        assert!(warm.is_empty("sessions"));
    }

    #[tokio::test]
    async fn test_invalid_tier_and_age_rejected() {
        let (router, _, _) = app().await;

        let bad_tier = router
            .clone()
            .oneshot(post_json("/api/v1/tables/sessions/tier/lukewarm", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(bad_tier.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(bad_tier).await["code"], "INVALID_TIER");

        let bad_age = router
            .oneshot(post_json(
                "/api/v1/tables/sessions/archive",
                serde_json::json!({"age": "3_eons"}),
            ))
            .await
            .unwrap();
        assert_eq!(bad_age.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(bad_age).await["code"], "INVALID_CRITERIA");
    }

    #[tokio::test]
    async fn test_archive_endpoint() {
        let (router, warm, cold) = app().await;

        let response = router
            .oneshot(post_json(
                "/api/v1/tables/sessions/archive",
                serde_json::json!({"age": "30_days", "remove_after_archive": true}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["records_archived"], 4);
        assert_eq!(body["archive_location"], "cold/sessions_archive");
        assert_eq!(cold.len("sessions_archive"), 4);
        assert!(warm.is_empty("sessions"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_operation_is_not_found() {
        let (router, _, _) = app().await;

        let response = router
            .oneshot(post_json("/api/v1/operations/nope/cancel", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "OPERATION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_run_cycle_and_metrics() {
        let (router, _, _) = app().await;

        let run = router
            .clone()
            .oneshot(post_json("/api/v1/lifecycle/run", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(run.status(), StatusCode::OK);

        let metrics = router
            .clone()
            .oneshot(Request::builder().uri("/api/v1/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(metrics).await["cycles_run"], 1);

        let scheduler = router
            .oneshot(Request::builder().uri("/api/v1/scheduler").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(scheduler).await;
        assert_eq!(body["enabled"], false);
        assert_eq!(body["schedule_secs"], 86_400);
    }

    #[tokio::test]
    async fn test_apply_retention_endpoint() {
        let policy = LifecyclePolicy::new("expire")
            .table("sessions")
            .rule(LifecycleRule::new(RuleAction::Delete).with_age("30_days"));
        let (router, warm, _) = app_with_policies(vec![policy]).await;

        let response = router
            .oneshot(post_json("/api/v1/retention/apply", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["tables_processed"], 1);
        assert_eq!(body["total_records_deleted"], 4);
        assert!(warm.is_empty("sessions"));
    }
}
