use serde::{Deserialize, Serialize};

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub erp: ErpConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/erp_sync".to_string(),
        }
    }
}

/// ERP 接入配置
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpConfig {
    /// ERP 分页接口地址
    pub base_url: String,
    pub api_key: Option<String>,
    /// 转发代理地址; 为空时直连 ERP
    pub proxy_url: Option<String>,
}

// api_key 不进日志
impl std::fmt::Debug for ErpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErpConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("proxy_url", &self.proxy_url)
            .finish()
    }
}

/// 重试策略: 指数退避, 每次延迟翻倍
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待时间 (attempt 从 1 开始)
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        std::time::Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// 同步参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: u64,
    pub delay_between_pages_ms: u64,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// 增量同步: 连续多少页全部未变化后提前停止
    pub early_stop_threshold: u32,
    /// 互斥锁超过该时长视为失效
    pub stale_lock_minutes: i64,
    pub full_sync_interval_hours: i64,
    pub auto_sync_enabled: bool,
    pub sync_interval_minutes: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            delay_between_pages_ms: 500,
            request_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            early_stop_threshold: 50,
            stale_lock_minutes: 30,
            full_sync_interval_hours: 24,
            auto_sync_enabled: false,
            sync_interval_minutes: 5,
        }
    }
}

impl AppConfig {
    /// 加载配置: 默认值 -> config/erp-sync.toml (可选) -> 环境变量
    ///
    /// 环境变量格式为 `ERP_SYNC__SYNC__PAGE_SIZE=200`;
    /// 同时兼容 `SERVER_HOST`、`SERVER_PORT`、`DATABASE_URL`。
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/erp-sync").required(false))
            .add_source(
                config::Environment::with_prefix("ERP_SYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("server.host", std::env::var("SERVER_HOST").ok())?
            .set_override_option("server.port", std::env::var("SERVER_PORT").ok())?
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .build()?;

        settings.try_deserialize()
    }
}
