use crate::models::{InvoiceAggregate, PriorRecord};
use bigdecimal::{BigDecimal, Zero};
use sqlx::PgPool;
use std::collections::HashMap;
use std::str::FromStr;

/// 单条 SQL 中 ANY($1) 的最大元素数
const CHUNK_SIZE: usize = 1000;

/// f64 -> NUMERIC, 按指定小数位格式化后解析
pub fn to_decimal(value: f64, scale: usize) -> BigDecimal {
    BigDecimal::from_str(&format!("{:.*}", scale, value)).unwrap_or_else(|_| BigDecimal::zero())
}

/// 按单据号批量查询对比状态 (分块处理)
pub async fn load_prior_state(
    pool: &PgPool,
    numbers: &[i64],
) -> Result<Vec<PriorRecord>, sqlx::Error> {
    let mut records = Vec::with_capacity(numbers.len());
    for chunk in numbers.chunks(CHUNK_SIZE) {
        let mut rows = sqlx::query_as::<_, PriorRecord>(
            r#"
            SELECT number, api_hash, is_assigned, is_cancelled
            FROM invoices
            WHERE number = ANY($1)
            "#
        )
        .bind(chunk)
        .fetch_all(pool)
        .await?;
        records.append(&mut rows);
    }
    Ok(records)
}

/// 查询所有未取消且未分配的发票
pub async fn list_open_unassigned(pool: &PgPool) -> Result<Vec<PriorRecord>, sqlx::Error> {
    sqlx::query_as::<_, PriorRecord>(
        r#"
        SELECT number, api_hash, is_assigned, is_cancelled
        FROM invoices
        WHERE is_cancelled = FALSE
          AND is_assigned = FALSE
        "#
    )
    .fetch_all(pool)
    .await
}

/// 写入发票: 表头 upsert + 明细整体替换, 同一事务
///
/// 不覆盖 is_assigned; 已拣数量按 SKU 继承 (不超过新数量)。
pub async fn upsert_invoice(
    pool: &PgPool,
    invoice: &InvoiceAggregate,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let invoice_id: String = sqlx::query_scalar(
        r#"
        INSERT INTO invoices (
            id, number, company_code, customer_name, customer_city, issue_date,
            total_value, total_weight, is_assigned, is_cancelled, api_hash,
            last_modified_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10, now(), now())
        ON CONFLICT (number) DO UPDATE SET
            customer_name = EXCLUDED.customer_name,
            customer_city = EXCLUDED.customer_city,
            issue_date = EXCLUDED.issue_date,
            total_value = EXCLUDED.total_value,
            total_weight = EXCLUDED.total_weight,
            is_cancelled = FALSE,
            api_hash = EXCLUDED.api_hash,
            last_modified_at = now(),
            updated_at = now()
        RETURNING id
        "#
    )
    .bind(&invoice.id)
    .bind(invoice.number)
    .bind(invoice.company_code)
    .bind(&invoice.customer_name)
    .bind(&invoice.customer_city)
    .bind(&invoice.issue_date)
    .bind(to_decimal(invoice.total_value, 2))
    .bind(to_decimal(invoice.total_weight, 3))
    .bind(invoice.is_assigned)
    .bind(&invoice.fingerprint)
    .fetch_one(&mut *tx)
    .await?;

    let picked_rows: Vec<(String, BigDecimal)> = sqlx::query_as(
        "SELECT sku, quantity_picked FROM invoice_items WHERE invoice_id = $1"
    )
    .bind(&invoice_id)
    .fetch_all(&mut *tx)
    .await?;

    let mut picked: HashMap<String, BigDecimal> = HashMap::new();
    for (sku, qty) in picked_rows {
        let entry = picked.entry(sku).or_insert_with(BigDecimal::zero);
        *entry = &*entry + qty;
    }

    sqlx::query("DELETE FROM invoice_items WHERE invoice_id = $1")
        .bind(&invoice_id)
        .execute(&mut *tx)
        .await?;

    if !invoice.items.is_empty() {
        let rows: Vec<_> = invoice
            .items
            .iter()
            .map(|item| {
                let quantity = to_decimal(item.quantity, 3);
                let carried = match picked.get_mut(&item.sku) {
                    Some(available) if *available > BigDecimal::zero() => {
                        let used = std::cmp::min(available.clone(), quantity.clone());
                        *available = &*available - &used;
                        used
                    }
                    _ => to_decimal(item.quantity_picked, 3),
                };
                (item, quantity, carried)
            })
            .collect();

        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO invoice_items (
                invoice_id, sku, description, quantity, unit, weight_kg, quantity_picked
            ) "
        );
        query_builder.push_values(rows, |mut b, (item, quantity, carried)| {
            b.push_bind(invoice_id.clone())
                .push_bind(item.sku.clone())
                .push_bind(item.description.clone())
                .push_bind(quantity)
                .push_bind(item.unit.clone())
                .push_bind(to_decimal(item.weight_kg, 3))
                .push_bind(carried);
        });
        query_builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::debug!(invoice = invoice.number, items = invoice.items.len(), "Invoice upserted");
    Ok(())
}

/// 标记取消 (仅限未分配记录), 返回受影响行数
pub async fn flag_cancelled(pool: &PgPool, numbers: &[i64]) -> Result<u64, sqlx::Error> {
    let mut affected = 0;
    for chunk in numbers.chunks(CHUNK_SIZE) {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET is_cancelled = TRUE,
                last_modified_at = now(),
                updated_at = now()
            WHERE number = ANY($1)
              AND is_assigned = FALSE
              AND is_cancelled = FALSE
            "#
        )
        .bind(chunk)
        .execute(pool)
        .await?;
        affected += result.rows_affected();
    }
    Ok(affected)
}
