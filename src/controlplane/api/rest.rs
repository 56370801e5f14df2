//! REST API Handlers
//!
//! Exposes the block driver operations as JSON endpoints. Requests carry
//! the volume as the host volume manager knows it, provider location
//! included; responses return new provider locations for the caller to
//! persist.

use crate::controlplane::driver::BlockDriver;
use crate::domain::ports::{Connector, VolumeSpec};
use crate::error::{Error, Result};
use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

const GIB: u64 = 1 << 30;

// =============================================================================
// Request/Response Types
// =============================================================================

/// Volume create request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    /// Size in GiB
    #[serde(default)]
    pub size_gb: Option<u64>,
    /// Size as a quantity (e.g., "100Gi", "1Ti"), rounded up to GiB
    #[serde(default)]
    pub capacity: Option<String>,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

/// Request naming one existing volume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    pub volume: VolumeSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendVolumeRequest {
    pub volume: VolumeSpec,
    pub new_size_gb: u64,
}

/// Copy request: a new volume (or snapshot) and the volume it copies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyVolumeRequest {
    pub volume: VolumeSpec,
    pub source: VolumeSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub volume: VolumeSpec,
    pub connector: Connector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetypeRequest {
    pub volume: VolumeSpec,
    pub new_extra_specs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateRequest {
    pub volume: VolumeSpec,
    /// Target `array#pool#policy`
    pub location_info: String,
}

/// Volume response carrying the location to persist
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeResponse {
    pub name: String,
    pub size_gb: u64,
    pub provider_location: String,
}

/// Outcome of retype and migrate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeResponse {
    pub changed: bool,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    driver: Arc<BlockDriver>,
}

impl RestRouter {
    pub fn new(driver: Arc<BlockDriver>) -> Self {
        Self { driver }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            driver: self.driver,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", post(create_volume))
            .route("/v1/volumes/delete", post(delete_volume))
            .route("/v1/volumes/extend", post(extend_volume))
            .route("/v1/volumes/clone", post(clone_volume))
            .route("/v1/volumes/from-snapshot", post(volume_from_snapshot))
            .route("/v1/volumes/retype", post(retype_volume))
            .route("/v1/volumes/migrate", post(migrate_volume))
            // Snapshot endpoints
            .route("/v1/snapshots", post(create_snapshot))
            .route("/v1/snapshots/delete", post(delete_snapshot))
            // Connection endpoints
            .route("/v1/connections", post(initialize_connection))
            .route("/v1/connections/terminate", post(terminate_connection))
            // Backend endpoints
            .route("/v1/stats", get(volume_stats))
            .route("/v1/setup/check", post(check_setup))
            // Health and metrics
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    driver: Arc<BlockDriver>,
}

// =============================================================================
// Error Mapping
// =============================================================================

fn error_response(operation: &str, e: Error) -> Response {
    let (status, code) = match &e {
        Error::ApiValidation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        Error::InvalidProviderLocation(_) => (StatusCode::BAD_REQUEST, "invalid_provider_location"),
        Error::ResourceNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        Error::NotExtendable { .. } => (StatusCode::CONFLICT, "not_extendable"),
        Error::InvalidConfiguration(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_configuration"),
        Error::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        Error::Transport { .. } => (StatusCode::BAD_GATEWAY, "array_unreachable"),
        Error::ProvisioningFailed { .. } | Error::BackendOperationFailed { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "backend_failed")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    error!("{} failed: {}", operation, e);

    (
        status,
        Json(ApiErrorResponse {
            error: code.into(),
            message: e.to_string(),
            details: e.is_retryable().then(|| "retryable".to_string()),
        }),
    )
        .into_response()
}

fn volume_response(volume: &VolumeSpec, result: Result<String>, operation: &str) -> Response {
    match result {
        Ok(location) => (
            StatusCode::CREATED,
            Json(VolumeResponse {
                name: volume.name.clone(),
                size_gb: volume.size_gb,
                provider_location: location,
            }),
        )
            .into_response(),
        Err(e) => error_response(operation, e),
    }
}

// =============================================================================
// Volume Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    info!("Creating volume: {}", request.name);

    let size_gb = match (request.size_gb, request.capacity.as_deref()) {
        (Some(size_gb), _) => size_gb,
        (None, Some(capacity)) => match parse_capacity(capacity) {
            Ok(bytes) => bytes.div_ceil(GIB),
            Err(e) => return error_response("create_volume", e),
        },
        (None, None) => {
            return error_response(
                "create_volume",
                Error::ApiValidation("either sizeGb or capacity is required".into()),
            )
        }
    };
    if size_gb == 0 {
        return error_response(
            "create_volume",
            Error::ApiValidation("volume size must be positive".into()),
        );
    }

    let mut volume = VolumeSpec::new(request.name, size_gb);
    volume.extra_specs = request.extra_specs;
    let result = state.driver.create_volume(&volume).await;
    volume_response(&volume, result, "create_volume")
}

async fn delete_volume(
    State(state): State<AppState>,
    Json(request): Json<VolumeRequest>,
) -> Response {
    match state.driver.delete_volume(&request.volume).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response("delete_volume", e),
    }
}

async fn extend_volume(
    State(state): State<AppState>,
    Json(request): Json<ExtendVolumeRequest>,
) -> Response {
    match state
        .driver
        .extend_volume(&request.volume, request.new_size_gb)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response("extend_volume", e),
    }
}

async fn clone_volume(
    State(state): State<AppState>,
    Json(request): Json<CopyVolumeRequest>,
) -> Response {
    let result = state
        .driver
        .create_cloned_volume(&request.volume, &request.source)
        .await;
    volume_response(&request.volume, result, "create_cloned_volume")
}

async fn volume_from_snapshot(
    State(state): State<AppState>,
    Json(request): Json<CopyVolumeRequest>,
) -> Response {
    let result = state
        .driver
        .create_volume_from_snapshot(&request.volume, &request.source)
        .await;
    volume_response(&request.volume, result, "create_volume_from_snapshot")
}

async fn retype_volume(
    State(state): State<AppState>,
    Json(request): Json<RetypeRequest>,
) -> Response {
    match state
        .driver
        .retype(&request.volume, &request.new_extra_specs)
        .await
    {
        Ok(changed) => (StatusCode::OK, Json(ChangeResponse { changed })).into_response(),
        Err(e) => error_response("retype", e),
    }
}

async fn migrate_volume(
    State(state): State<AppState>,
    Json(request): Json<MigrateRequest>,
) -> Response {
    match state
        .driver
        .migrate_volume(&request.volume, &request.location_info)
        .await
    {
        Ok(changed) => (StatusCode::OK, Json(ChangeResponse { changed })).into_response(),
        Err(e) => error_response("migrate_volume", e),
    }
}

// =============================================================================
// Snapshot Handlers
// =============================================================================

async fn create_snapshot(
    State(state): State<AppState>,
    Json(request): Json<CopyVolumeRequest>,
) -> Response {
    let result = state
        .driver
        .create_snapshot(&request.volume, &request.source)
        .await;
    volume_response(&request.volume, result, "create_snapshot")
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Json(request): Json<VolumeRequest>,
) -> Response {
    match state.driver.delete_snapshot(&request.volume).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response("delete_snapshot", e),
    }
}

// =============================================================================
// Connection Handlers
// =============================================================================

async fn initialize_connection(
    State(state): State<AppState>,
    Json(request): Json<ConnectionRequest>,
) -> Response {
    info!(
        "Attaching {} to host {}",
        request.volume.name, request.connector.host
    );
    match state
        .driver
        .initialize_connection(&request.volume, &request.connector)
        .await
    {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response("initialize_connection", e),
    }
}

async fn terminate_connection(
    State(state): State<AppState>,
    Json(request): Json<ConnectionRequest>,
) -> Response {
    info!(
        "Detaching {} from host {}",
        request.volume.name, request.connector.host
    );
    match state
        .driver
        .terminate_connection(&request.volume, &request.connector)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => error_response("terminate_connection", e),
    }
}

// =============================================================================
// Backend Handlers
// =============================================================================

async fn volume_stats(State(state): State<AppState>) -> Response {
    match state.driver.get_volume_stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => error_response("get_volume_stats", e),
    }
}

async fn check_setup(State(state): State<AppState>) -> Response {
    match state.driver.check_for_setup_error().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "array": state.driver.config().array,
            })),
        )
            .into_response(),
        Err(e) => error_response("check_for_setup_error", e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "version": crate::VERSION,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

/// Readiness: the array answers and the configured objects exist
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.driver.check_for_setup_error().await {
        Ok(()) => (StatusCode::OK, "ready".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.driver.metrics().encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response("metrics", e),
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Parse capacity string (e.g., "100Gi", "1Ti") to bytes
fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::ApiValidation("empty capacity string".into()));
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_str, unit_str) = (&s[..num_end], s[num_end..].trim());

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::ApiValidation(format!("invalid capacity number: {}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1 << 10,
        "M" | "MB" | "MI" | "MIB" => 1 << 20,
        "G" | "GB" | "GI" | "GIB" => 1 << 30,
        "T" | "TB" | "TI" | "TIB" => 1 << 40,
        _ => {
            return Err(Error::ApiValidation(format!(
                "unknown capacity unit: {}",
                unit_str
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::SimulatedArray;
    use crate::config::{DriverConfig, PollSettings};
    use crate::domain::ports::ConnectionInfo;
    use crate::metrics::DriverMetrics;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const ARRAY: &str = "000195900551";

    fn router() -> Router {
        let sim = SimulatedArray::builder(ARRAY)
            .pool("gold", 100 * GIB, 0)
            .port_group("OS-PG1", &["iqn.1992-04.com.emc:50000973f006dd80"])
            .job_latency(1)
            .build();
        let config = DriverConfig {
            array: ARRAY.into(),
            pool: "gold".into(),
            port_groups: vec!["OS-PG1".into()],
            poll: PollSettings {
                interval_ms: 1,
                timeout_secs: 5,
            },
            ..Default::default()
        };
        let driver = BlockDriver::new(config, sim, None, Arc::new(DriverMetrics::new().unwrap()));
        RestRouter::new(driver).build()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("100").unwrap(), 100);
        assert_eq!(parse_capacity("1Ki").unwrap(), 1024);
        assert_eq!(parse_capacity("1G").unwrap(), 1 << 30);
        assert_eq!(parse_capacity("100Gi").unwrap(), 100 << 30);
        assert_eq!(parse_capacity("1.5Ti").unwrap(), 3 << 39);

        assert!(parse_capacity("").is_err());
        assert!(parse_capacity("abc").is_err());
        assert!(parse_capacity("100X").is_err());
    }

    #[tokio::test]
    async fn test_volume_attach_flow() {
        let app = router();

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/volumes",
                serde_json::json!({ "name": "vol1", "capacity": "1Gi" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: VolumeResponse = json_body(response).await;
        assert_eq!(created.size_gb, 1);

        let volume = serde_json::json!({
            "name": "vol1",
            "sizeGb": 1,
            "providerLocation": created.provider_location,
        });
        let connector = serde_json::json!({
            "host": "fakehost",
            "initiator": "iqn.1993-08.org.debian:01:222",
        });

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/connections",
                serde_json::json!({ "volume": volume, "connector": connector }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info: ConnectionInfo = json_body(response).await;
        assert_eq!(info.data.host_lun_id, 1);
        assert_eq!(info.data.masking_view, "OS-fakehost-gold-I-MV");

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/volumes/extend",
                serde_json::json!({ "volume": volume, "newSizeGb": 1 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(post_json(
                "/v1/volumes/delete",
                serde_json::json!({ "volume": volume }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_create_requires_size() {
        let response = router()
            .oneshot(post_json("/v1/volumes", serde_json::json!({ "name": "vol1" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ApiErrorResponse = json_body(response).await;
        assert_eq!(body.error, "invalid_request");
    }

    #[tokio::test]
    async fn test_bad_provider_location() {
        let response = router()
            .oneshot(post_json(
                "/v1/volumes/extend",
                serde_json::json!({
                    "volume": { "name": "vol1", "sizeGb": 1, "providerLocation": "{}" },
                    "newSizeGb": 2,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_health_and_metrics() {
        let app = router();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/v1/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats: serde_json::Value = json_body(response).await;
        assert_eq!(stats["totalCapacityGb"], 100);
        assert_eq!(stats["locationInfo"], "000195900551#gold#None");

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("smis_driver_operations_total"));
    }
}
