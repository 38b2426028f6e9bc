use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 同步类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    /// 全量: 遍历所有页
    Full,
    /// 增量: 连续未变化页达到阈值后提前停止
    Incremental,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Full => "full",
            SyncKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncKind::Full),
            "incremental" => Ok(SyncKind::Incremental),
            other => Err(format!("unknown sync kind: {}", other)),
        }
    }
}

/// 同步运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "cancelled" => Ok(SyncStatus::Cancelled),
            other => Err(format!("unknown sync status: {}", other)),
        }
    }
}

/// 同步运行记录 (sync_history 表)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub kind: SyncKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub total_pages: i32,
    pub total_invoices: i32,
    pub error_message: Option<String>,
}

/// 每页结束后推送给观察者的进度快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub current_page: u32,
    pub total_pages: Option<u32>,
    pub invoices_processed: usize,
    pub percentage: f64,
    pub estimated_seconds_remaining: Option<f64>,
    pub new_count: usize,
    pub updated_count: usize,
    pub unchanged_count: usize,
    pub cancelled_count: usize,
    pub stopped_early: bool,
}

/// 一次同步的最终汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub kind: SyncKind,
    pub inserted_count: usize,
    pub updated_count: usize,
    pub unchanged_count: usize,
    pub cancelled_count: usize,
    pub errors_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pages_fetched: u32,
    pub total_pages: Option<u32>,
    pub skipped_pages: Vec<u32>,
    /// 增量同步在覆盖全部已知页之前停止
    pub stopped_early: bool,
    /// 被调用方协作式取消
    pub cancelled: bool,
}

/// 同步状态 (由运行记录推导)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub full_sync_due: bool,
    pub sync_in_progress: bool,
}

impl SyncState {
    /// 从未做过全量, 或距上次全量超过 interval_hours
    pub fn full_sync_due(
        last_full_sync_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        interval_hours: i64,
    ) -> bool {
        match last_full_sync_at {
            None => true,
            Some(at) => now - at >= chrono::Duration::hours(interval_hours),
        }
    }
}
