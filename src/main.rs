use axum::{routing::{get, post}, Router};
use erp_sync::{api, create_pool, db, AppConfig, PgStore, SyncEngine};
use erp_sync::service::{scheduler, Credentials, ErpClient};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 本地时间格式
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::load()?;
    info!("Starting server with config: {:?}", config);

    // 创建数据库连接池并执行迁移
    let pool = create_pool(&config.database.url).await?;
    info!("Database pool created");
    db::run_migrations(&pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let client = Arc::new(ErpClient::new(
        config.erp.proxy_url.clone(),
        config.sync.request_timeout_ms,
    )?);

    let engine = Arc::new(SyncEngine::new(
        client.clone(),
        store.clone(),
        store.clone(),
        store,
        config.sync.clone(),
    ));

    // 自动同步
    let shutdown = CancellationToken::new();
    let scheduler_handle = if config.sync.auto_sync_enabled && !config.erp.base_url.trim().is_empty() {
        Some(scheduler::spawn_auto_sync(
            engine.clone(),
            config.erp.base_url.clone(),
            Credentials::new(config.erp.api_key.clone()),
            Duration::from_secs(config.sync.sync_interval_minutes.max(1) * 60),
            shutdown.clone(),
        ))
    } else {
        info!("Auto sync disabled");
        None
    };

    let state = api::AppState::new(engine, client, config.erp.clone());

    // 构建路由
    let app = Router::new()
        .route("/health", get(api::health_check))
        .route("/api/sync", post(api::start_sync))
        .route("/api/sync/cancel", post(api::cancel_sync))
        .route("/api/sync/progress", get(api::sync_progress))
        .route("/api/sync/runs", get(api::sync_runs))
        .route("/api/sync/state", get(api::sync_state))
        .route("/api/erp-proxy", post(api::erp_proxy))
        .route("/api/erp/test", post(api::test_connection))
        .with_state(state)
        .layer(ServiceBuilder::new());

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/sync            - Run full / incremental sync");
    info!("  POST /api/sync/cancel     - Cancel running sync");
    info!("  GET  /api/sync/progress   - Latest progress snapshot");
    info!("  GET  /api/sync/runs       - Sync run history");
    info!("  POST /api/erp-proxy       - Forwarding proxy");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }

    Ok(())
}
