use crate::service::normalizer::{coerce_number, coerce_string};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// ERP 交易明细行 (一张单据的一行商品)
///
/// 字段名沿用 ERP 接口原名; 数值字段兼容数字与数字字符串。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionLine {
    #[serde(rename = "nr_docto", default, deserialize_with = "lenient_doc_number")]
    pub document_number: Option<i64>,
    #[serde(rename = "cod_empresa", default, deserialize_with = "lenient_i64")]
    pub company_code: i64,
    #[serde(rename = "nome_pessoa", default, deserialize_with = "lenient_string")]
    pub customer_name: String,
    #[serde(rename = "cidade_pessoa", default, deserialize_with = "lenient_string")]
    pub customer_city: String,
    #[serde(rename = "uf_pessoa", default, deserialize_with = "lenient_string")]
    pub customer_state: String,
    #[serde(rename = "data_dcto", default, deserialize_with = "lenient_string")]
    pub document_date: String,
    #[serde(rename = "cod_item", default, deserialize_with = "lenient_string")]
    pub sku: String,
    #[serde(rename = "descricao", default, deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(rename = "unidade", default, deserialize_with = "lenient_string")]
    pub unit: String,
    #[serde(rename = "quantidade", default, deserialize_with = "lenient_f64")]
    pub quantity: f64,
    #[serde(rename = "valor_liquido", default, deserialize_with = "lenient_f64")]
    pub net_value: f64,
    /// 行级重量 (kg), 已是该行合计, 不再乘数量
    #[serde(rename = "quantidade_kgl", default, deserialize_with = "lenient_f64")]
    pub weight_kg: f64,
}

impl TransactionLine {
    /// 单据日期只取日期部分 (`2024-05-01T00:00:00` -> `2024-05-01`)
    pub fn issue_date(&self) -> &str {
        self.document_date
            .split('T')
            .next()
            .unwrap_or(&self.document_date)
    }

    /// 客户城市展示格式: `城市 - 州`
    pub fn city_label(&self) -> String {
        match (self.customer_city.is_empty(), self.customer_state.is_empty()) {
            (false, false) => format!("{} - {}", self.customer_city, self.customer_state),
            (false, true) => self.customer_city.clone(),
            (true, false) => self.customer_state.clone(),
            (true, true) => String::new(),
        }
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_number(&value).unwrap_or(0.0))
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_number(&value)
        .filter(|n| n.fract() == 0.0)
        .map(|n| n as i64)
        .unwrap_or(0))
}

fn lenient_doc_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_number(&value)
        .filter(|n| n.fract() == 0.0)
        .map(|n| n as i64))
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_string(&value).unwrap_or_default())
}
