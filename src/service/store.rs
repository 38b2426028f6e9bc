use crate::error::SyncResult;
use crate::models::{InvoiceAggregate, PriorRecord};
use async_trait::async_trait;
use chrono::Duration;

/// 发票持久化接口: 对比状态读取 + 写入
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// 按单据号批量读取已存指纹与分配标记
    async fn load_prior_state(&self, numbers: &[i64]) -> SyncResult<Vec<PriorRecord>>;

    /// 所有未取消且未分配的记录 (取消检测候选)
    async fn list_open_unassigned(&self) -> SyncResult<Vec<PriorRecord>>;

    /// 写入发票表头并替换明细
    async fn upsert_invoice(&self, invoice: &InvoiceAggregate) -> SyncResult<()>;

    /// 标记取消 (不物理删除), 返回受影响行数
    async fn flag_cancelled(&self, numbers: &[i64]) -> SyncResult<u64>;
}

/// 同步互斥: 单行 "活动运行" 锁, 超时视为失效
#[async_trait]
pub trait SyncLock: Send + Sync {
    /// 抢锁; 已被他人持有且未过期时返回 Ok(Some(持有者))
    async fn try_acquire(&self, owner: &str, stale_after: Duration) -> SyncResult<Option<String>>;

    /// 续期自己持有的锁; 锁已被他人接管时返回 false
    async fn refresh(&self, owner: &str) -> SyncResult<bool>;

    async fn release(&self, owner: &str) -> SyncResult<()>;

    async fn is_held(&self, stale_after: Duration) -> SyncResult<bool>;
}
