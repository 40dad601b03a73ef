use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        ws::WebSocketUpgrade,
        ConnectInfo, DefaultBodyLimit, FromRequestParts, Multipart, Query, State,
    },
    http::{header, request::Parts, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tokio::io::AsyncWriteExt;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::audio::{content_type_ok, format_file_size, normalize_content_type, upload_suffix};
use crate::config::Config;
use crate::error::PipelineError;
use crate::guard::{check_upload_size, RateLimiter, TempArtifact};
use crate::metrics::TransportKind;
use crate::models::*;
use crate::pipeline::Pipeline;
use crate::session::Session;
use crate::transport::WsTransport;

// =============================================================================
// Application State
// - ハンドラ間で共有する情報を集約（設定、パイプライン、レート制限）
// - エンジンは起動時に 1 度だけ読み込まれ、パイプライン経由で参照される
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Pipeline,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Config, pipeline: Pipeline) -> Self {
        let limiter = RateLimiter::per_minute(config.limits.ratelimit_rpm);
        Self {
            config: Arc::new(config),
            pipeline,
            limiter: Arc::new(limiter),
        }
    }
}

// =============================================================================
// Error Handling
// - 型安全な API エラーを定義し、`IntoResponse` で JSON へ変換
// =============================================================================

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    pub details: Option<String>,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry_after_secs: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        match self.code {
            ApiErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ApiErrorCode::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiErrorCode::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiErrorCode::ModelNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::TranscriptionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::PayloadTooLarge { .. } => {
                ApiError::new(ApiErrorCode::FileTooLarge, "File too large").with_details(err.to_string())
            }
            PipelineError::RateLimited { retry_after_secs } => {
                let mut api = ApiError::new(ApiErrorCode::RateLimited, "Rate limit exceeded");
                api.retry_after_secs = Some(retry_after_secs);
                api
            }
            PipelineError::EngineNotReady => ApiError::new(ApiErrorCode::ModelNotLoaded, "Model not ready"),
            PipelineError::Format(e) => {
                ApiError::new(ApiErrorCode::UnsupportedFormat, "Unsupported or invalid audio format")
                    .with_details(e.to_string())
            }
            PipelineError::Transcription(e) => {
                ApiError::new(ApiErrorCode::TranscriptionFailed, format!("Transcription failed: {e}"))
            }
            PipelineError::Protocol(m) | PipelineError::InvalidRequest(m) => {
                ApiError::new(ApiErrorCode::InvalidInput, m)
            }
            // 詳細はログ済み。クライアントには返さない
            PipelineError::Internal(_) => ApiError::new(ApiErrorCode::InternalError, "Internal Server Error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.status();
        let retry_after = self.retry_after_secs;

        let response = ErrorResponse {
            error: self.message,
            code: self.code.as_str().to_string(),
            details: self.details,
        };

        let mut response = (status_code, Json(response)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// =============================================================================
// Extractors
// =============================================================================

/// レート制限のキー（接続元 IP）。接続情報が無い場合は "unknown"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl<S> FromRequestParts<S> for ClientKey
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ClientKey(key))
    }
}

// =============================================================================
// Request Handlers
// =============================================================================

/// 単発アップロード（multipart `file` + 任意の `language` / `initial_prompt`）
/// - 判定順: サイズ上限(413) → レート制限(429) → モデル準備(503)
/// - 一時ファイルは成功・失敗・切断いずれでも返却前に削除される
pub async fn transcribe_upload(
    State(state): State<AppState>,
    ClientKey(client): ClientKey,
    Query(query): Query<TranscribeQuery>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<TranscriptionResult>> {
    let limit = state.config.max_upload_bytes();
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    check_upload_size(declared, limit)?;
    state.limiter.check(&client)?;
    state.pipeline.ensure_ready()?;

    let mut multipart = multipart.map_err(|e| ApiError::new(ApiErrorCode::InvalidInput, e.body_text()))?;

    let pipeline = &state.pipeline;
    let result = pipeline
        .observe(TransportKind::Http, async {
            let (input, form) = receive_upload(pipeline, &mut multipart, limit).await?;

            // multipart フィールドがクエリより優先
            let config = SessionConfig {
                language: normalize_language(form.language.or(query.language)),
                initial_prompt: form
                    .initial_prompt
                    .or(query.initial_prompt)
                    .filter(|p| !p.trim().is_empty()),
            };
            pipeline.process_file(input, &config).await
        })
        .await?;

    Ok(Json(result))
}

#[derive(Default)]
struct UploadForm {
    language: Option<String>,
    initial_prompt: Option<String>,
}

/// `file` フィールドをチャンクごとに一時ファイルへ書き出す
async fn receive_upload(
    pipeline: &Pipeline,
    multipart: &mut Multipart,
    limit: u64,
) -> Result<(TempArtifact, UploadForm), PipelineError> {
    let mut upload: Option<TempArtifact> = None;
    let mut form = UploadForm::default();

    while let Some(mut field) = multipart.next_field().await.map_err(|e| multipart_error(e, limit))? {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);

                // 寛容に扱う: 怪しい Content-Type でも ffmpeg に判断させる
                if !content_type_ok(content_type.as_deref()) {
                    warn!(
                        content_type = %normalize_content_type(content_type.as_deref()),
                        "suspicious content-type, attempting conversion anyway"
                    );
                }

                let suffix = upload_suffix(filename.as_deref(), content_type.as_deref());
                let artifact = pipeline.workspace().acquire(&suffix)?;
                let mut file = tokio::fs::File::create(artifact.path()).await?;
                let mut written: u64 = 0;

                while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, limit))? {
                    written += chunk.len() as u64;
                    if written > limit {
                        return Err(PipelineError::PayloadTooLarge { limit });
                    }
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;

                debug!(
                    filename = filename.as_deref().unwrap_or("-"),
                    size = %format_file_size(written),
                    "upload received"
                );
                upload = Some(artifact);
            }
            Some("language") => {
                form.language = Some(field.text().await.map_err(|e| multipart_error(e, limit))?);
            }
            Some("initial_prompt") => {
                form.initial_prompt = Some(field.text().await.map_err(|e| multipart_error(e, limit))?);
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| PipelineError::InvalidRequest("file field is required".to_string()))?;
    Ok((upload, form))
}

fn multipart_error(err: MultipartError, limit: u64) -> PipelineError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        PipelineError::PayloadTooLarge { limit }
    } else {
        PipelineError::InvalidRequest(err.body_text())
    }
}

/// WebSocket ストリーミング（セッションが Closed になるまで接続を保持）
pub async fn transcribe_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let pipeline = state.pipeline.clone();
    let initial_config_timeout = state.config.initial_config_timeout();

    ws.on_upgrade(move |socket| async move {
        Session::new(WsTransport::new(socket), pipeline, initial_config_timeout)
            .run()
            .await;
    })
}

/// ヘルスチェックエンドポイント
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: state.config.app.version.clone(),
        env: state.config.app.env.clone(),
    })
}

pub async fn version_info(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        name: state.config.app.name.clone(),
        version: state.config.app.version.clone(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.pipeline.metrics().render(),
    )
}

// =============================================================================
// Router
// =============================================================================

pub fn build_cors(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins()
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .allow_credentials(config.server.cors_allow_credentials)
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.max_upload_bytes()).unwrap_or(usize::MAX);
    let cors = build_cors(&state.config);

    Router::new()
        .route("/webhook/audio", post(transcribe_upload))
        .route("/ws/transcribe", get(transcribe_ws))
        .route("/health", get(health_check))
        .route("/version", get(version_info))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
