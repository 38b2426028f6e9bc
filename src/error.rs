use thiserror::Error;

/// 同步引擎错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 上游返回 401
    #[error("Unauthorized (401): check the ERP API key")]
    Auth,

    /// 上游返回 404
    #[error("Endpoint not found (404): {0}")]
    EndpointMissing(String),

    /// 上游返回 5xx
    #[error("Upstream server error ({status}): {message}")]
    UpstreamServer { status: u16, message: String },

    /// 其他非 2xx 状态
    #[error("Upstream returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// 单条记录写入失败
    #[error("Persistence error for invoice {invoice}: {message}")]
    Persistence { invoice: i64, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// 已有同步在运行 (互斥锁被占用)
    #[error("A sync is already in progress (held by {holder})")]
    AlreadyRunning { holder: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// 是否值得重试: 5xx、超时、网络错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::UpstreamServer { .. } | SyncError::Timeout(_) | SyncError::Network(_)
        )
    }

    /// 按 HTTP 状态码分类上游失败
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => SyncError::Auth,
            404 => SyncError::EndpointMissing(message),
            500..=599 => SyncError::UpstreamServer { status, message },
            _ => SyncError::Http { status, message },
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
