use crate::models::{InvoiceAggregate, PriorRecord};
use crate::service::hasher;
use serde::Serialize;
use std::collections::HashMap;

/// 单张发票的分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Updated,
    Unchanged,
}

/// 分类计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub cancelled: usize,
}

impl ReconcileCounts {
    fn bump(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::New => self.new += 1,
            ChangeKind::Updated => self.updated += 1,
            ChangeKind::Unchanged => self.unchanged += 1,
        }
    }

    fn drop_one(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::New => self.new = self.new.saturating_sub(1),
            ChangeKind::Updated => self.updated = self.updated.saturating_sub(1),
            ChangeKind::Unchanged => self.unchanged = self.unchanged.saturating_sub(1),
        }
    }

    pub fn processed(&self) -> usize {
        self.new + self.updated + self.unchanged
    }
}

/// 一页的对账结果
#[derive(Debug, Default)]
pub struct PageOutcome {
    /// 需要写入的发票 (新增 + 更新), 已带上新指纹
    pub to_write: Vec<InvoiceAggregate>,
    pub counts: ReconcileCounts,
}

impl PageOutcome {
    /// 本页至少有一张发票且全部未变化
    pub fn all_unchanged(&self) -> bool {
        self.counts.unchanged > 0 && self.counts.new == 0 && self.counts.updated == 0
    }
}

/// 对账引擎: 用内容指纹对比新拉取的发票与已持久化状态
///
/// 每个单据号在一次运行中只计数一次; 跨页重复出现的单据重新计算指纹,
/// 必要时把 "未变化" 改判为 "更新"。
#[derive(Debug, Default)]
pub struct Reconciler {
    prior: HashMap<i64, PriorRecord>,
    classified: HashMap<i64, ChangeKind>,
    counts: ReconcileCounts,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 载入一批已持久化记录的对比状态
    pub fn absorb_prior(&mut self, records: impl IntoIterator<Item = PriorRecord>) {
        for record in records {
            self.prior.insert(record.number, record);
        }
    }

    /// 计算指纹并分类; 同时把持久化的分配标记带回聚合
    pub fn classify(&mut self, invoice: &mut InvoiceAggregate) -> ChangeKind {
        let hash = hasher::fingerprint(invoice);
        let kind = match self.prior.get(&invoice.number) {
            None => ChangeKind::New,
            Some(prior) => {
                invoice.is_assigned = prior.is_assigned;
                if prior.is_cancelled || prior.api_hash.as_deref() != Some(hash.as_str()) {
                    ChangeKind::Updated
                } else {
                    ChangeKind::Unchanged
                }
            }
        };
        invoice.fingerprint = Some(hash);
        invoice.is_cancelled = false;

        match self.classified.get(&invoice.number).copied() {
            None => {
                self.classified.insert(invoice.number, kind);
                self.counts.bump(kind);
                kind
            }
            Some(previous) if previous == ChangeKind::Unchanged && kind == ChangeKind::Updated => {
                self.classified.insert(invoice.number, kind);
                self.counts.drop_one(previous);
                self.counts.bump(kind);
                kind
            }
            Some(previous) => previous,
        }
    }

    /// 对一页发票分类, 返回需要写入的部分
    pub fn reconcile_page(&mut self, invoices: Vec<InvoiceAggregate>) -> PageOutcome {
        let mut outcome = PageOutcome::default();

        for mut invoice in invoices {
            let kind = self.classify(&mut invoice);
            outcome.counts.bump(kind);
            if kind != ChangeKind::Unchanged {
                outcome.to_write.push(invoice);
            }
        }

        outcome
    }

    /// 找出本次完整拉取中消失的未分配记录 (视为已取消)
    ///
    /// 已分配 (绑定装载图) 的记录即使消失也绝不取消。
    pub fn detect_cancellations(&mut self, persisted: impl IntoIterator<Item = PriorRecord>) -> Vec<i64> {
        let cancelled: Vec<i64> = persisted
            .into_iter()
            .filter(|r| !r.is_assigned && !r.is_cancelled)
            .filter(|r| !self.classified.contains_key(&r.number))
            .map(|r| r.number)
            .collect();

        self.counts.cancelled += cancelled.len();
        cancelled
    }

    pub fn kind_of(&self, number: i64) -> Option<ChangeKind> {
        self.classified.get(&number).copied()
    }

    pub fn was_seen(&self, number: i64) -> bool {
        self.classified.contains_key(&number)
    }

    pub fn counts(&self) -> ReconcileCounts {
        self.counts
    }
}
