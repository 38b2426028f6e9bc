use crate::error::SyncResult;
use crate::models::{SyncKind, SyncRun, SyncStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// 同步运行台账: 审计与崩溃可见性
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// 新建 running 状态的记录
    async fn begin(&self, kind: SyncKind) -> SyncResult<Uuid>;

    async fn update_progress(&self, id: Uuid, pages: u32, invoices: usize) -> SyncResult<()>;

    async fn complete(&self, id: Uuid, pages: u32, invoices: usize) -> SyncResult<()>;

    async fn fail(&self, id: Uuid, message: &str) -> SyncResult<()>;

    async fn cancel(&self, id: Uuid, pages: u32, invoices: usize) -> SyncResult<()>;

    /// 最近的运行记录, 按开始时间倒序
    async fn recent(&self, limit: i64) -> SyncResult<Vec<SyncRun>>;

    /// 最近一次成功完成的时间; kind 为 None 时不区分类型
    async fn last_completed(&self, kind: Option<SyncKind>) -> SyncResult<Option<DateTime<Utc>>>;
}

/// 单次运行的台账句柄, 保证终态只写一次
pub struct RunTracker {
    ledger: Arc<dyn RunLedger>,
    id: Uuid,
    terminal: Option<SyncStatus>,
}

impl RunTracker {
    pub async fn begin(ledger: Arc<dyn RunLedger>, kind: SyncKind) -> SyncResult<Self> {
        let id = ledger.begin(kind).await?;
        tracing::info!(run_id = %id, kind = %kind, "Sync run started");
        Ok(Self {
            ledger,
            id,
            terminal: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 进度写入失败只记日志, 不中断运行
    pub async fn progress(&self, pages: u32, invoices: usize) {
        if let Err(e) = self.ledger.update_progress(self.id, pages, invoices).await {
            tracing::warn!(run_id = %self.id, page = pages, error = %e, "Failed to update sync ledger progress");
        }
    }

    pub async fn complete(&mut self, pages: u32, invoices: usize) {
        if !self.mark(SyncStatus::Completed) {
            return;
        }
        if let Err(e) = self.ledger.complete(self.id, pages, invoices).await {
            tracing::error!(run_id = %self.id, error = %e, "Failed to mark sync run completed");
        }
    }

    pub async fn fail(&mut self, message: &str) {
        if !self.mark(SyncStatus::Failed) {
            return;
        }
        if let Err(e) = self.ledger.fail(self.id, message).await {
            tracing::error!(run_id = %self.id, error = %e, "Failed to mark sync run failed");
        }
    }

    pub async fn cancel(&mut self, pages: u32, invoices: usize) {
        if !self.mark(SyncStatus::Cancelled) {
            return;
        }
        if let Err(e) = self.ledger.cancel(self.id, pages, invoices).await {
            tracing::error!(run_id = %self.id, error = %e, "Failed to mark sync run cancelled");
        }
    }

    fn mark(&mut self, status: SyncStatus) -> bool {
        if let Some(existing) = self.terminal {
            tracing::warn!(
                run_id = %self.id,
                existing = existing.as_str(),
                requested = status.as_str(),
                "Sync run already finalized, ignoring"
            );
            return false;
        }
        self.terminal = Some(status);
        true
    }
}

impl Drop for RunTracker {
    fn drop(&mut self) {
        if self.terminal.is_none() {
            tracing::error!(run_id = %self.id, "Sync run dropped without a terminal ledger update");
        }
    }
}
