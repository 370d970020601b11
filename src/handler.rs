use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
    Router,
};
use base64::Engine;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::batch::{spawn_batch, BatchJobHandle, BatchRunner, BatchStatus};
use crate::error::PeopleFlowError;
use crate::live::LiveDetectionGate;

/// 每次启动批处理时创建新的 runner（独立的检测后端实例）
pub type RunnerFactory = Box<dyn Fn() -> Result<BatchRunner, PeopleFlowError> + Send + Sync>;

/// HTTP 层共享状态
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    gate: LiveDetectionGate,
    runner_factory: RunnerFactory,
    batch: Mutex<Option<BatchJobHandle>>,
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl AppState {
    pub fn new(
        gate: LiveDetectionGate,
        runner_factory: RunnerFactory,
        input_dir: PathBuf,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                gate,
                runner_factory,
                batch: Mutex::new(None),
                input_dir,
                output_dir,
            }),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        // 实时单帧检测，请求体为原始图像
        .route("/detect", post(handle_detect))
        .route("/latest", get(handle_latest))
        // 后台批处理
        .route("/batch", post(handle_start_batch).get(handle_batch_status))
        .with_state(state)
}

/// 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

type ApiError = (StatusCode, ResponseJson<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        ResponseJson(ErrorResponse {
            success: false,
            message: message.into(),
        }),
    )
}

/// 检测错误对应的 HTTP 状态码
pub fn status_for(e: &PeopleFlowError) -> StatusCode {
    match e {
        PeopleFlowError::Decode(_) => StatusCode::BAD_REQUEST,
        PeopleFlowError::GateTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// 实时检测响应
#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub success: bool,
    /// base64 编码的标注后 JPEG
    pub image: String,
    pub people_count: usize,
    pub inference_time_ms: f64,
    pub timestamp: f64,
}

/// 最近一次检测结果（不含图像）
#[derive(Debug, Serialize)]
pub struct LatestResponse {
    pub people_count: usize,
    pub inference_time_ms: f64,
    pub timestamp: f64,
}

#[derive(Debug, Serialize)]
pub struct BatchStartResponse {
    pub success: bool,
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct BatchStatusResponse {
    pub job_id: String,
    #[serde(flatten)]
    pub status: BatchStatus,
}

/// 健康检查 Handler
pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn handle_detect(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<ResponseJson<DetectResponse>, ApiError> {
    // 空请求体同样交给检测门处理，以便记入错误日志
    let result = state
        .inner
        .gate
        .detect_bytes(&body)
        .await
        .map_err(|e| api_error(status_for(&e), e.to_string()))?;

    Ok(ResponseJson(DetectResponse {
        success: true,
        image: base64::engine::general_purpose::STANDARD.encode(&result.image_bytes),
        people_count: result.people_count,
        inference_time_ms: result.inference_time_ms,
        timestamp: result.timestamp,
    }))
}

pub async fn handle_latest(
    State(state): State<AppState>,
) -> Result<ResponseJson<LatestResponse>, ApiError> {
    let latest = state
        .inner
        .gate
        .latest_result()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "no result yet"))?;

    Ok(ResponseJson(LatestResponse {
        people_count: latest.people_count,
        inference_time_ms: latest.inference_time_ms,
        timestamp: latest.timestamp,
    }))
}

/// 正在运行的批处理任务返回 409
fn ensure_idle(slot: &Option<BatchJobHandle>) -> Result<(), ApiError> {
    match slot {
        Some(handle) if !handle.status().is_terminal() => Err(api_error(
            StatusCode::CONFLICT,
            format!("批处理任务 {} 仍在运行", handle.id()),
        )),
        _ => Ok(()),
    }
}

pub async fn handle_start_batch(
    State(state): State<AppState>,
) -> Result<(StatusCode, ResponseJson<BatchStartResponse>), ApiError> {
    ensure_idle(&*state.inner.batch.lock().await)?;

    // 检测后端可能持有阻塞式 HTTP 客户端，不能在异步上下文中创建；创建期间不持有锁
    let factory_state = state.clone();
    let runner = tokio::task::spawn_blocking(move || (factory_state.inner.runner_factory)())
        .await
        .map_err(|e| PeopleFlowError::Processing(format!("创建检测后端异常退出: {}", e)))
        .and_then(|r| r)
        .map_err(|e| {
            warn!("⚠️  [批量处理] 创建检测后端失败: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    // 创建期间可能已有其他请求启动了任务
    let mut slot = state.inner.batch.lock().await;
    ensure_idle(&slot)?;
    let handle = spawn_batch(
        runner,
        state.inner.input_dir.clone(),
        state.inner.output_dir.clone(),
    );
    let job_id = handle.id().to_string();
    info!("已启动批处理任务 {}", job_id);
    *slot = Some(handle);

    Ok((
        StatusCode::ACCEPTED,
        ResponseJson(BatchStartResponse {
            success: true,
            job_id,
        }),
    ))
}

pub async fn handle_batch_status(
    State(state): State<AppState>,
) -> Result<ResponseJson<BatchStatusResponse>, ApiError> {
    let slot = state.inner.batch.lock().await;
    let handle = slot
        .as_ref()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "尚未启动批处理任务"))?;

    Ok(ResponseJson(BatchStatusResponse {
        job_id: handle.id().to_string(),
        status: handle.status(),
    }))
}
