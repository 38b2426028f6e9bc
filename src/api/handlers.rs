use crate::config::ErpConfig;
use crate::error::SyncError;
use crate::models::{SyncKind, SyncProgress, SyncRun, SyncState, SyncSummary};
use crate::service::{
    Credentials, ErpClient, ProgressCallback, ProxyRequest, StartCallback, SyncEngine, SyncOptions,
};
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 共享状态
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub client: Arc<ErpClient>,
    /// 请求未携带地址/密钥时使用的默认值
    pub erp: ErpConfig,
    /// 最近一次进度快照
    pub progress: Arc<watch::Sender<Option<SyncProgress>>>,
    /// 当前手动同步的取消令牌
    pub active: Arc<Mutex<Option<CancellationToken>>>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, client: Arc<ErpClient>, erp: ErpConfig) -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            engine,
            client,
            erp,
            progress: Arc::new(progress),
            active: Arc::new(Mutex::new(None)),
        }
    }

    fn set_active(&self, token: Option<CancellationToken>) {
        if let Ok(mut active) = self.active.lock() {
            *active = token;
        }
    }
}

/// 请求体: 发起同步
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub kind: SyncKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

/// 响应体
#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub message: String,
    pub summary: Option<SyncSummary>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    #[serde(default = "default_runs_limit")]
    pub limit: i64,
}

fn default_runs_limit() -> i64 {
    20
}

/// 测试连接请求体
#[derive(Debug, Deserialize)]
pub struct ConnectionTestRequest {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// 请求值优先, 否则回退到配置
fn resolve(erp: &ErpConfig, base_url: Option<String>, api_key: Option<String>) -> (String, Credentials) {
    let base_url = base_url
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| erp.base_url.clone());
    let api_key = api_key
        .filter(|k| !k.trim().is_empty())
        .or_else(|| erp.api_key.clone());
    (base_url, Credentials::new(api_key))
}

fn error_status(error: &SyncError) -> StatusCode {
    match error {
        SyncError::AlreadyRunning { .. } => StatusCode::CONFLICT,
        SyncError::Config(_) => StatusCode::BAD_REQUEST,
        SyncError::Auth
        | SyncError::EndpointMissing(_)
        | SyncError::UpstreamServer { .. }
        | SyncError::Http { .. }
        | SyncError::Timeout(_)
        | SyncError::Network(_)
        | SyncError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        SyncError::Persistence { .. } | SyncError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 发起一次同步 (阻塞至完成)
pub async fn start_sync(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> Response {
    let (base_url, credentials) = resolve(&state.erp, req.base_url, req.api_key);

    let token = CancellationToken::new();
    let sender = state.progress.clone();
    let on_progress: ProgressCallback = Arc::new(move |p: &SyncProgress| {
        sender.send_replace(Some(p.clone()));
    });

    // 只有抢到锁之后才登记令牌, 被拒绝的请求不会覆盖正在运行的同步
    let registered = Arc::new(AtomicBool::new(false));
    let on_start: StartCallback = {
        let state = state.clone();
        let registered = registered.clone();
        let token = token.clone();
        Arc::new(move || {
            state.set_active(Some(token.clone()));
            registered.store(true, Ordering::SeqCst);
        })
    };

    let mut options = SyncOptions::new(req.kind)
        .with_progress(on_progress)
        .with_cancel(token)
        .with_on_start(on_start);
    if let Some(max_pages) = req.max_pages {
        options = options.with_max_pages(max_pages);
    }

    let result = state.engine.run_sync(&base_url, &credentials, options).await;
    if registered.load(Ordering::SeqCst) {
        state.set_active(None);
    }

    match result {
        Ok(summary) => {
            let message = if summary.cancelled {
                format!("Sync cancelled after {} pages", summary.pages_fetched)
            } else {
                format!(
                    "Sync finished: {} new, {} updated, {} unchanged, {} cancelled",
                    summary.inserted_count,
                    summary.updated_count,
                    summary.unchanged_count,
                    summary.cancelled_count
                )
            };
            let response = SyncResponse {
                success: true,
                message,
                summary: Some(summary),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            let response = SyncResponse {
                success: false,
                message: format!("Error: {}", e),
                summary: None,
            };
            (error_status(&e), Json(response)).into_response()
        }
    }
}

/// 请求取消当前同步 (协作式, 在下一页边界生效)
pub async fn cancel_sync(State(state): State<AppState>) -> Response {
    let token = state.active.lock().ok().and_then(|active| active.clone());

    match token {
        Some(token) => {
            token.cancel();
            let response = MessageResponse {
                success: true,
                message: "Cancellation requested".to_string(),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        None => {
            let response = MessageResponse {
                success: false,
                message: "No sync in progress".to_string(),
            };
            (StatusCode::NOT_FOUND, Json(response)).into_response()
        }
    }
}

/// 最近一次进度快照
pub async fn sync_progress(State(state): State<AppState>) -> Json<Option<SyncProgress>> {
    Json(state.progress.borrow().clone())
}

/// 运行记录
pub async fn sync_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<SyncRun>>, (StatusCode, String)> {
    state
        .engine
        .ledger()
        .recent(query.limit.clamp(1, 200))
        .await
        .map(Json)
        .map_err(|e| (error_status(&e), format!("Error: {}", e)))
}

/// 同步状态
pub async fn sync_state(
    State(state): State<AppState>,
) -> Result<Json<SyncState>, (StatusCode, String)> {
    state
        .engine
        .state()
        .await
        .map(Json)
        .map_err(|e| (error_status(&e), format!("Error: {}", e)))
}

/// 通用转发代理
pub async fn erp_proxy(
    State(state): State<AppState>,
    Json(req): Json<ProxyRequest>,
) -> Response {
    let (status, body) = state.client.forward(req).await;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json::<Value>(body)).into_response()
}

/// 测试 ERP 连接
pub async fn test_connection(
    State(state): State<AppState>,
    Json(req): Json<ConnectionTestRequest>,
) -> Response {
    let (base_url, credentials) = resolve(&state.erp, req.base_url, req.api_key);
    if base_url.trim().is_empty() {
        let response = MessageResponse {
            success: false,
            message: "ERP base url is not configured".to_string(),
        };
        return (StatusCode::BAD_REQUEST, Json(response)).into_response();
    }

    match state.client.test_connection(&base_url, &credentials).await {
        Ok(message) => {
            let response = MessageResponse { success: true, message };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            let response = MessageResponse {
                success: false,
                message: format!("Error: {}", e),
            };
            (error_status(&e), Json(response)).into_response()
        }
    }
}
