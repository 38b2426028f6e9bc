//! 发票内容指纹: 只覆盖业务相关字段, 用于判断 "这张发票是否真的变了"。

use crate::models::InvoiceAggregate;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// 计算发票指纹 (SHA-256, 64 位十六进制)
///
/// 金额保留 2 位、重量保留 3 位; 明细按规范化编码排序,
/// 所有对象键递归排序, 因此与字段插入顺序和明细顺序无关。
pub fn fingerprint(invoice: &InvoiceAggregate) -> String {
    let canonical = sort_keys(canonical_value(invoice));
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 参与指纹的规范化对象
pub fn canonical_value(invoice: &InvoiceAggregate) -> Value {
    let mut items: Vec<Value> = invoice
        .items
        .iter()
        .map(|item| {
            sort_keys(json!({
                "sku": item.sku,
                "quantity": item.quantity,
                "weightKg": format!("{:.3}", item.weight_kg),
            }))
        })
        .collect();
    items.sort_by_cached_key(|item| item.to_string());

    json!({
        "customerName": invoice.customer_name,
        "customerCity": invoice.customer_city,
        "totalValue": format!("{:.2}", invoice.total_value),
        "totalWeight": format!("{:.3}", invoice.total_weight),
        "itemCount": invoice.items.len(),
        "items": items,
    })
}

/// 递归按字母序重排对象键
pub fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
