use crate::models::{SyncKind, SyncRun, SyncStatus};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// sync_history 原始行 (类型/状态以文本存储)
#[derive(Debug, sqlx::FromRow)]
struct SyncHistoryRow {
    id: Uuid,
    sync_type: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    total_pages: i32,
    total_invoices: i32,
    error_message: Option<String>,
}

impl TryFrom<SyncHistoryRow> for SyncRun {
    type Error = sqlx::Error;

    fn try_from(row: SyncHistoryRow) -> Result<Self, Self::Error> {
        let kind = row
            .sync_type
            .parse::<SyncKind>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        let status = row
            .status
            .parse::<SyncStatus>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;

        Ok(SyncRun {
            id: row.id,
            kind,
            started_at: row.started_at,
            completed_at: row.completed_at,
            status,
            total_pages: row.total_pages,
            total_invoices: row.total_invoices,
            error_message: row.error_message,
        })
    }
}

fn clamp_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// 新建 running 记录
pub async fn insert_run(pool: &PgPool, kind: SyncKind) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO sync_history (id, sync_type, status, started_at, total_pages, total_invoices)
        VALUES ($1, $2, 'running', now(), 0, 0)
        "#
    )
    .bind(id)
    .bind(kind.as_str())
    .execute(pool)
    .await?;
    Ok(id)
}

/// 运行中更新计数; 已进入终态的记录不再修改
pub async fn update_run_progress(
    pool: &PgPool,
    id: Uuid,
    pages: u32,
    invoices: usize,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE sync_history
        SET total_pages = $2, total_invoices = $3
        WHERE id = $1 AND status = 'running'
        "#
    )
    .bind(id)
    .bind(clamp_i32(pages as usize))
    .bind(clamp_i32(invoices))
    .execute(pool)
    .await?;
    Ok(())
}

/// 写入终态 (completed / cancelled)
pub async fn finish_run(
    pool: &PgPool,
    id: Uuid,
    status: SyncStatus,
    pages: u32,
    invoices: usize,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE sync_history
        SET status = $2, completed_at = now(), total_pages = $3, total_invoices = $4
        WHERE id = $1 AND status = 'running'
        "#
    )
    .bind(id)
    .bind(status.as_str())
    .bind(clamp_i32(pages as usize))
    .bind(clamp_i32(invoices))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fail_run(pool: &PgPool, id: Uuid, message: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE sync_history
        SET status = 'failed', completed_at = now(), error_message = $2
        WHERE id = $1 AND status = 'running'
        "#
    )
    .bind(id)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(())
}

/// 最近 N 条运行记录
pub async fn recent_runs(pool: &PgPool, limit: i64) -> Result<Vec<SyncRun>, sqlx::Error> {
    let rows = sqlx::query_as::<_, SyncHistoryRow>(
        r#"
        SELECT id, sync_type, status, started_at, completed_at,
               total_pages, total_invoices, error_message
        FROM sync_history
        ORDER BY started_at DESC
        LIMIT $1
        "#
    )
    .bind(limit.max(1))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(SyncRun::try_from).collect()
}

/// 最近一次成功完成时间
pub async fn last_completed_at(
    pool: &PgPool,
    kind: Option<SyncKind>,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT max(completed_at)
        FROM sync_history
        WHERE status = 'completed'
          AND ($1::text IS NULL OR sync_type = $1)
        "#
    )
    .bind(kind.map(|k| k.as_str()))
    .fetch_one(pool)
    .await
}
