use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 发票明细 (一个商品行)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceItem {
    pub sku: String,
    pub description: String,
    pub quantity: f64,
    pub unit: String,
    pub weight_kg: f64,
    /// 仓库分拣已拣数量, 同步时初始化为 0
    pub quantity_picked: f64,
}

/// 发票聚合: 由同一单据号的多条交易行折叠而成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceAggregate {
    /// `nf-{公司}-{单据号}`
    pub id: String,
    pub number: i64,
    pub company_code: i64,
    pub customer_name: String,
    pub customer_city: String,
    pub issue_date: String,
    pub total_value: f64,
    pub total_weight: f64,
    pub items: Vec<InvoiceItem>,
    /// 已绑定装载图; 同步不得删除或自动取消
    pub is_assigned: bool,
    pub fingerprint: Option<String>,
    pub is_cancelled: bool,
}

impl InvoiceAggregate {
    pub fn identity(company_code: i64, number: i64) -> String {
        format!("nf-{}-{}", company_code, number)
    }
}

/// 已持久化发票的对比状态 (上次指纹 + 分配标记)
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PriorRecord {
    pub number: i64,
    pub api_hash: Option<String>,
    pub is_assigned: bool,
    pub is_cancelled: bool,
}
