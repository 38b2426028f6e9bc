use super::{ledger, lock, queries};
use crate::error::{SyncError, SyncResult};
use crate::models::{InvoiceAggregate, PriorRecord, SyncKind, SyncRun, SyncStatus};
use crate::service::{InvoiceStore, RunLedger, SyncLock};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Postgres 实现: 发票存储 + 运行台账 + 同步锁
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn stale_secs(stale_after: Duration) -> f64 {
    stale_after.num_milliseconds().max(0) as f64 / 1000.0
}

#[async_trait]
impl InvoiceStore for PgStore {
    async fn load_prior_state(&self, numbers: &[i64]) -> SyncResult<Vec<PriorRecord>> {
        Ok(queries::load_prior_state(&self.pool, numbers).await?)
    }

    async fn list_open_unassigned(&self) -> SyncResult<Vec<PriorRecord>> {
        Ok(queries::list_open_unassigned(&self.pool).await?)
    }

    async fn upsert_invoice(&self, invoice: &InvoiceAggregate) -> SyncResult<()> {
        queries::upsert_invoice(&self.pool, invoice)
            .await
            .map_err(|e| SyncError::Persistence {
                invoice: invoice.number,
                message: e.to_string(),
            })
    }

    async fn flag_cancelled(&self, numbers: &[i64]) -> SyncResult<u64> {
        Ok(queries::flag_cancelled(&self.pool, numbers).await?)
    }
}

#[async_trait]
impl RunLedger for PgStore {
    async fn begin(&self, kind: SyncKind) -> SyncResult<Uuid> {
        Ok(ledger::insert_run(&self.pool, kind).await?)
    }

    async fn update_progress(&self, id: Uuid, pages: u32, invoices: usize) -> SyncResult<()> {
        Ok(ledger::update_run_progress(&self.pool, id, pages, invoices).await?)
    }

    async fn complete(&self, id: Uuid, pages: u32, invoices: usize) -> SyncResult<()> {
        Ok(ledger::finish_run(&self.pool, id, SyncStatus::Completed, pages, invoices).await?)
    }

    async fn fail(&self, id: Uuid, message: &str) -> SyncResult<()> {
        Ok(ledger::fail_run(&self.pool, id, message).await?)
    }

    async fn cancel(&self, id: Uuid, pages: u32, invoices: usize) -> SyncResult<()> {
        Ok(ledger::finish_run(&self.pool, id, SyncStatus::Cancelled, pages, invoices).await?)
    }

    async fn recent(&self, limit: i64) -> SyncResult<Vec<SyncRun>> {
        Ok(ledger::recent_runs(&self.pool, limit).await?)
    }

    async fn last_completed(&self, kind: Option<SyncKind>) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(ledger::last_completed_at(&self.pool, kind).await?)
    }
}

#[async_trait]
impl SyncLock for PgStore {
    async fn try_acquire(&self, owner: &str, stale_after: Duration) -> SyncResult<Option<String>> {
        Ok(lock::acquire_lock(&self.pool, owner, stale_secs(stale_after)).await?)
    }

    async fn refresh(&self, owner: &str) -> SyncResult<bool> {
        Ok(lock::refresh_lock(&self.pool, owner).await?)
    }

    async fn release(&self, owner: &str) -> SyncResult<()> {
        if !lock::release_lock(&self.pool, owner).await? {
            tracing::warn!(owner = %owner, "Sync lock was not held by this owner");
        }
        Ok(())
    }

    async fn is_held(&self, stale_after: Duration) -> SyncResult<bool> {
        Ok(lock::lock_is_held(&self.pool, stale_secs(stale_after)).await?)
    }
}
