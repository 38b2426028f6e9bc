//! 响应归一化: 不同 ERP 部署对分页信封字段命名不一,
//! 这里按固定顺序的别名表逐个探测, 取第一个有效值。

use serde_json::Value;

/// 记录数组字段别名 (按优先级)
pub const ITEM_ALIASES: &[&str] = &["data", "items", "results", "records", "rows", "registros"];

/// 总记录数字段别名
pub const TOTAL_ALIASES: &[&str] = &[
    "total",
    "totalCount",
    "total_count",
    "count",
    "totalRecords",
    "total_records",
    "totalItems",
    "qtd_total",
    "total_registros",
];

/// 每页条数字段别名
pub const LIMIT_ALIASES: &[&str] = &[
    "limit",
    "pageSize",
    "page_size",
    "perPage",
    "per_page",
    "tamanho_pagina",
];

/// 当前页码字段别名
pub const PAGE_ALIASES: &[&str] = &["page", "currentPage", "pageNumber", "pagina"];

/// 一页归一化后的结果
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPage {
    pub items: Vec<Value>,
    /// None 表示总数未知 (与已知为 0 不同, 决定分页终止策略)
    pub total: Option<u64>,
    pub limit: u64,
    pub page: u64,
    /// 信封中找不到任何记录数组
    pub malformed: bool,
}

impl NormalizedPage {
    pub fn from_payload(payload: &Value, default_limit: u64, default_page: u64) -> Self {
        Self {
            items: extract_items(payload),
            total: extract_total(payload),
            limit: extract_limit(payload, default_limit),
            page: extract_page(payload, default_page),
            malformed: !has_item_array(payload),
        }
    }

    /// 已知总数时的总页数
    pub fn total_pages(&self) -> Option<u32> {
        let total = self.total?;
        let limit = self.limit.max(1);
        Some(total.div_ceil(limit).min(u32::MAX as u64) as u32)
    }
}

/// 数字或数字字符串 -> f64
pub fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<f64>()
                .ok()
                .or_else(|| s.replace(',', ".").parse::<f64>().ok())
        }
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

/// 字符串/数字/布尔 -> String; null 与复合值返回 None
pub fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn first_positive(payload: &Value, aliases: &[&str]) -> Option<u64> {
    let object = payload.as_object()?;
    aliases
        .iter()
        .filter_map(|alias| object.get(*alias))
        .filter_map(coerce_number)
        .find(|n| *n > 0.0)
        .map(|n| n.floor() as u64)
}

fn has_item_array(payload: &Value) -> bool {
    payload.is_array()
        || payload
            .as_object()
            .map(|o| ITEM_ALIASES.iter().any(|a| o.get(*a).map_or(false, Value::is_array)))
            .unwrap_or(false)
}

/// 提取记录数组, 找不到时返回空数组
pub fn extract_items(payload: &Value) -> Vec<Value> {
    if let Value::Array(items) = payload {
        return items.clone();
    }

    payload
        .as_object()
        .and_then(|object| {
            ITEM_ALIASES
                .iter()
                .find_map(|alias| object.get(*alias).and_then(Value::as_array))
        })
        .cloned()
        .unwrap_or_default()
}

/// 提取总记录数; 没有任何别名给出正数时为 None
pub fn extract_total(payload: &Value) -> Option<u64> {
    first_positive(payload, TOTAL_ALIASES)
}

pub fn extract_limit(payload: &Value, default_limit: u64) -> u64 {
    first_positive(payload, LIMIT_ALIASES).unwrap_or(default_limit)
}

pub fn extract_page(payload: &Value, default_page: u64) -> u64 {
    first_positive(payload, PAGE_ALIASES).unwrap_or(default_page)
}
