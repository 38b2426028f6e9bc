use crate::models::{InvoiceAggregate, InvoiceItem, TransactionLine};
use indexmap::IndexMap;

/// 单据号 -> 发票聚合, 保持首次出现顺序
pub type AggregateMap = IndexMap<i64, InvoiceAggregate>;

/// 按 `{:.N}` 四舍五入, 与指纹中的格式化保持一致
pub fn round_to(value: f64, decimals: usize) -> f64 {
    format!("{:.*}", decimals, value).parse().unwrap_or(value)
}

/// 将一页交易行折叠为发票聚合
///
/// 同一单据的表头字段以第一行为准, 后续行只追加明细并累加金额与重量。
/// 金额与重量最终保留 2 位 (展示/存储精度; 指纹内部另按 3 位格式化重量)。
pub fn build_aggregates(lines: &[TransactionLine]) -> AggregateMap {
    let mut invoices = AggregateMap::new();

    for line in lines {
        let Some(number) = line.document_number else {
            tracing::warn!(
                sku = %line.sku,
                "Transaction line without document number, skipping"
            );
            continue;
        };

        let invoice = invoices.entry(number).or_insert_with(|| InvoiceAggregate {
            id: InvoiceAggregate::identity(line.company_code, number),
            number,
            company_code: line.company_code,
            customer_name: line.customer_name.clone(),
            customer_city: line.city_label(),
            issue_date: line.issue_date().to_string(),
            total_value: 0.0,
            total_weight: 0.0,
            items: Vec::new(),
            is_assigned: false,
            fingerprint: None,
            is_cancelled: false,
        });

        invoice.items.push(InvoiceItem {
            sku: line.sku.clone(),
            description: line.description.clone(),
            quantity: line.quantity,
            unit: line.unit.clone(),
            weight_kg: line.weight_kg,
            quantity_picked: 0.0,
        });
        invoice.total_value += line.net_value;
        invoice.total_weight += line.weight_kg;
    }

    for invoice in invoices.values_mut() {
        invoice.total_value = round_to(invoice.total_value, 2);
        invoice.total_weight = round_to(invoice.total_weight, 2);
    }

    invoices
}

/// 合并一页的聚合结果到整次运行的集合
///
/// 正常情况下单据不会跨页; 若跨页, 追加明细并重新累加, 不丢数据。
/// 返回本页中此前已出现过的单据号。
pub fn merge_into(target: &mut AggregateMap, page: AggregateMap) -> Vec<i64> {
    let mut repeated = Vec::new();

    for (number, invoice) in page {
        match target.get_mut(&number) {
            Some(existing) => {
                existing.items.extend(invoice.items);
                existing.total_value = round_to(existing.total_value + invoice.total_value, 2);
                existing.total_weight = round_to(existing.total_weight + invoice.total_weight, 2);
                existing.fingerprint = None;
                repeated.push(number);
            }
            None => {
                target.insert(number, invoice);
            }
        }
    }

    repeated
}
