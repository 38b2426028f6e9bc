use crate::error::SyncError;
use crate::models::SyncKind;
use crate::service::driver::{SyncEngine, SyncOptions};
use crate::service::fetcher::Credentials;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 自动同步: 按固定间隔触发, 到期时做全量, 否则增量
///
/// 与手动同步共用互斥锁; 锁被占用时跳过本轮。
pub fn spawn_auto_sync(
    engine: Arc<SyncEngine>,
    base_url: String,
    credentials: Credentials,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs(), "Auto sync scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Auto sync scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    run_once(&engine, &base_url, &credentials, &shutdown).await;
                }
            }
        }
    })
}

/// 选择同步类型并执行一次
pub async fn run_once(
    engine: &SyncEngine,
    base_url: &str,
    credentials: &Credentials,
    shutdown: &CancellationToken,
) {
    let kind = match engine.state().await {
        Ok(state) if state.full_sync_due => SyncKind::Full,
        Ok(_) => SyncKind::Incremental,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read sync state, falling back to incremental");
            SyncKind::Incremental
        }
    };

    let options = SyncOptions::new(kind).with_cancel(shutdown.child_token());
    match engine.run_sync(base_url, credentials, options).await {
        Ok(summary) => tracing::info!(
            kind = %kind,
            inserted = summary.inserted_count,
            updated = summary.updated_count,
            cancelled = summary.cancelled_count,
            errors = summary.errors_count,
            "Auto sync finished"
        ),
        Err(SyncError::AlreadyRunning { holder }) => {
            tracing::info!(holder = %holder, "Sync already running, skipping scheduled run")
        }
        Err(e) => tracing::error!(kind = %kind, error = %e, "Auto sync failed"),
    }
}
