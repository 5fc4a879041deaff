use std::{any::Any, env, net::SocketAddr, sync::Arc, time::Duration};

use crate::middleware::cors::{cors_layer, AllowedOrigins, CorsPolicy};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use shelf_kernel::{KernelConfig, KernelError, LatestResolution, ShelfKernel, UploadGrant};
use shelf_store::{S3ObjectStore, S3Settings};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};
use utoipa::{IntoParams, ToSchema};

const INTERNAL_ERROR: &str = "Internal Server Error";
const NOT_FOUND: &str = "Not Found";
const STORE_FAILURE_DETAIL: &str = "object store request failed";

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let store = S3ObjectStore::connect(config.s3.clone())
        .await
        .context("failed to configure S3 client")?;
    let kernel = ShelfKernel::new(Arc::new(store), config.kernel.clone());
    let state = Arc::new(AppState { kernel });

    let app = build_router(state, &config.http).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        bucket = %config.s3.bucket,
        "shelf-daemon listening"
    );
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

/// Routes plus the error boundary. Layers run outermost-last: CORS wraps the
/// timeout, which wraps the panic catcher, so even a panic response is
/// CORS-decorated.
fn build_router(state: Arc<AppState>, http: &HttpSettings) -> Router {
    Router::new()
        .route("/sign-upload", post(sign_upload).fallback(not_found))
        .route("/latest", get(latest).head(not_found).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TimeoutLayer::new(http.request_timeout))
        .layer(cors_layer(CorsPolicy::new(&http.allowed_origins)))
}

#[derive(Clone)]
struct AppState {
    kernel: ShelfKernel,
}

#[derive(Debug, Clone)]
struct HttpSettings {
    allowed_origins: AllowedOrigins,
    request_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            allowed_origins: AllowedOrigins::Any,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    s3: S3Settings,
    kernel: KernelConfig,
    http: HttpSettings,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("SHELF_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid SHELF_API_ADDR")?;

        let bucket = non_empty_env("SHELF_BUCKET")
            .or_else(|| non_empty_env("BUCKET"))
            .context("SHELF_BUCKET or BUCKET must be configured")?;

        let s3 = S3Settings {
            bucket,
            region: non_empty_env("SHELF_S3_REGION"),
            endpoint_url: non_empty_env("SHELF_S3_ENDPOINT"),
            force_path_style: bool_env("SHELF_S3_FORCE_PATH_STYLE").unwrap_or(false),
        };

        let kernel = KernelConfig {
            verify_artifact: bool_env("SHELF_VERIFY_ARTIFACT").unwrap_or(false),
            ..KernelConfig::default()
        };

        let allowed_origins = non_empty_env("SHELF_ALLOWED_ORIGINS")
            .or_else(|| non_empty_env("ALLOWED_ORIGINS"))
            .map(|raw| AllowedOrigins::parse(&raw))
            .unwrap_or_default();

        let mut http = HttpSettings {
            allowed_origins,
            ..HttpSettings::default()
        };
        if let Some(raw) = non_empty_env("SHELF_REQUEST_TIMEOUT_SECS") {
            let seconds: u64 = raw
                .parse()
                .context("invalid SHELF_REQUEST_TIMEOUT_SECS")?;
            anyhow::ensure!(seconds > 0, "SHELF_REQUEST_TIMEOUT_SECS must be positive");
            http.request_timeout = Duration::from_secs(seconds);
        }

        Ok(Self {
            listen_addr,
            s3,
            kernel,
            http,
        })
    }
}

#[utoipa::path(
    post,
    path = "/sign-upload",
    request_body = SignUploadBody,
    responses(
        (status = 200, description = "Write capabilities for artifact and pointer", body = SignUploadResponse),
        (status = 400, description = "Missing or blank tool", body = ErrorBody),
        (status = 500, description = "Unreadable body or store failure", body = ErrorBody)
    )
)]
async fn sign_upload(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SignUploadResponse>, ApiError> {
    let payload: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body).map_err(ApiError::internal)?
    };
    let tool = payload.get("tool").and_then(Value::as_str);

    let grant = state.kernel.sign_upload(tool).await?;
    Ok(Json(SignUploadResponse::from(grant)))
}

#[utoipa::path(
    get,
    path = "/latest",
    params(LatestQuery),
    responses(
        (status = 200, description = "Read capabilities for the latest artifact", body = LatestResponse),
        (status = 400, description = "Missing tool query parameter", body = ErrorBody),
        (status = 404, description = "Nothing published for this tool", body = ErrorBody),
        (status = 500, description = "Pointer unusable or store failure", body = ErrorBody)
    )
)]
async fn latest(
    State(state): State<Arc<AppState>>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<LatestResponse>, ApiError> {
    let pairs = match query {
        Ok(Query(pairs)) => pairs,
        Err(rejection) => {
            info!(%rejection, "unreadable query string");
            Vec::new()
        }
    };
    // First occurrence wins when `tool` is repeated.
    let tool = pairs
        .iter()
        .find(|(name, _)| name == "tool")
        .map(|(_, value)| value.as_str());

    let resolution = state.kernel.resolve_latest(tool).await?;
    Ok(Json(LatestResponse::from(resolution)))
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, NOT_FOUND)
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    };
    error!(%detail, "request handler panicked");
    ApiError::internal_with_detail("handler panicked").into_response()
}

/// Request body accepted by `POST /sign-upload`.
#[allow(dead_code)]
#[derive(Debug, ToSchema)]
struct SignUploadBody {
    tool: String,
}

/// Query accepted by `GET /latest`.
#[allow(dead_code)]
#[derive(Debug, IntoParams)]
#[into_params(parameter_in = Query)]
struct LatestQuery {
    /// Tool namespace to resolve.
    tool: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct SignUploadResponse {
    upload_url: String,
    key: String,
    latest_key: String,
    latest_put_url: String,
    expires_in_seconds: u64,
}

impl From<UploadGrant> for SignUploadResponse {
    fn from(grant: UploadGrant) -> Self {
        Self {
            upload_url: grant.artifact.url,
            key: grant.key,
            latest_key: grant.latest_key,
            latest_put_url: grant.pointer.url,
            expires_in_seconds: grant.expires_in.as_secs(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct LatestResponse {
    latest_url: String,
    data_url: String,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
}

impl From<LatestResolution> for LatestResponse {
    fn from(resolution: LatestResolution) -> Self {
        Self {
            latest_url: resolution.pointer.url,
            data_url: resolution.artifact.url,
            key: resolution.key,
            updated_at: resolution.updated_at,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    detail: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::internal_with_detail(err.to_string())
    }

    fn internal_with_detail(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: INTERNAL_ERROR.to_string(),
            detail: Some(detail.into()),
        }
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Validation(message) => ApiError::bad_request(message),
            KernelError::NotPublished(_) => ApiError::new(
                StatusCode::NOT_FOUND,
                "no published artifact for this tool yet",
            ),
            KernelError::InconsistentPointer { reason, .. } => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, reason)
            }
            err @ KernelError::MalformedPointer { .. } => ApiError::internal(err),
            KernelError::Store(err) => {
                error!(error = ?anyhow::Error::new(err), "object store failure");
                ApiError::internal_with_detail(STORE_FAILURE_DETAIL)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, detail = ?self.detail, "api error");
        } else {
            info!(status = %self.status, message = %self.message, "request rejected");
        }
        let body = Json(ErrorBody {
            message: self.message,
            detail: self.detail,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

pub mod docs {
    use super::*;
    use utoipa::OpenApi;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Tool Shelf API", version = "0.1.0"),
        paths(sign_upload, latest),
        components(schemas(SignUploadBody, SignUploadResponse, LatestResponse, ErrorBody))
    )]
    pub struct ApiDoc;
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn bool_env(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}
