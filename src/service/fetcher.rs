use crate::error::{SyncError, SyncResult};
use crate::service::normalizer::NormalizedPage;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// 上游错误详情最多保留的字符数
const MAX_DETAIL_CHARS: usize = 3000;

/// ERP 访问凭证
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Credentials {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if let Some(key) = &self.api_key {
            headers.insert("Authorization".to_string(), format!("Bearer {}", key));
        }
        headers
    }
}

/// 分页数据源: 返回某一页的原始 JSON 信封
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        base_url: &str,
        page: u32,
        limit: u64,
        credentials: &Credentials,
    ) -> SyncResult<Value>;
}

/// 转发代理请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// ERP HTTP 客户端 (直连或经转发代理)
pub struct ErpClient {
    client: Client,
    proxy_url: Option<String>,
    timeout_ms: u64,
}

impl ErpClient {
    pub fn new(proxy_url: Option<String>, timeout_ms: u64) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            proxy_url: proxy_url.filter(|u| !u.trim().is_empty()),
            timeout_ms,
        })
    }

    /// `{base_url}?page=N&limit=L`, 保留已有查询参数
    pub fn page_url(base_url: &str, page: u32, limit: u64) -> SyncResult<Url> {
        let mut url = Url::parse(base_url.trim())
            .map_err(|e| SyncError::Config(format!("Invalid ERP base url {}: {}", base_url, e)))?;
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "page" && k != "limit")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }

    fn map_send_error(&self, e: reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout(self.timeout_ms)
        } else {
            SyncError::Network(e.to_string())
        }
    }

    /// 发送请求; 非 2xx 按状态码分类, 非 JSON 响应包装为 `{"raw": text}`
    async fn send(&self, request: RequestBuilder) -> SyncResult<Value> {
        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_send_error(e))?;

        if !status.is_success() {
            let detail: String = text.chars().take(300).collect();
            return Err(SyncError::from_status(status.as_u16(), detail));
        }

        Ok(parse_body(&text))
    }

    /// 连接测试: 拉取第 1 页并报告记录数
    pub async fn test_connection(&self, base_url: &str, credentials: &Credentials) -> SyncResult<String> {
        let payload = self.fetch_page(base_url, 1, 1, credentials).await?;
        let page = NormalizedPage::from_payload(&payload, 1, 1);
        if page.malformed {
            return Err(SyncError::MalformedResponse(
                "response does not contain an item array".to_string(),
            ));
        }
        match page.total {
            Some(total) => Ok(format!("Connection succeeded: {} records available", total)),
            None => Ok(format!("Connection succeeded: {} records on first page", page.items.len())),
        }
    }

    /// 通用转发: 把 JSON 描述的请求转发给任意 http/https 地址
    ///
    /// 返回 (状态码, 响应体)。上游失败时响应体为 `{error, details}`。
    pub async fn forward(&self, request: ProxyRequest) -> (u16, Value) {
        let url = request.url.trim();
        if url.is_empty() {
            return (400, json!({ "error": "url is required" }));
        }
        let parsed = match Url::parse(url) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => u,
            _ => return (400, json!({ "error": "Invalid URL (only http/https)" })),
        };

        let method_name = request.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = match method_name.as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            other => return (400, json!({ "error": format!("Unsupported method {}", other) })),
        };

        let mut builder = self
            .client
            .request(method, parsed)
            .header("Accept", "application/json")
            .header("ngrok-skip-browser-warning", "true");
        for (name, value) in request.headers.unwrap_or_default() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body.filter(|b| !b.is_null()) {
            builder = builder.json(&body);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Proxy request failed");
                let status = if e.is_timeout() { 504 } else { 502 };
                return (status, json!({ "error": e.to_string() }));
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let details: String = text.chars().take(MAX_DETAIL_CHARS).collect();
            return (
                status.as_u16(),
                json!({
                    "error": format!(
                        "Upstream returned {}: {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("")
                    ),
                    "details": details,
                }),
            );
        }

        (200, parse_body(&text))
    }
}

fn parse_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "raw": text }))
}

#[async_trait]
impl PageSource for ErpClient {
    async fn fetch_page(
        &self,
        base_url: &str,
        page: u32,
        limit: u64,
        credentials: &Credentials,
    ) -> SyncResult<Value> {
        let url = Self::page_url(base_url, page, limit)?;

        let request = match &self.proxy_url {
            Some(proxy) => self.client.post(proxy).json(&ProxyRequest {
                url: url.to_string(),
                method: Some("GET".to_string()),
                headers: Some(credentials.headers()),
                body: None,
            }),
            None => {
                let mut builder = self.client.get(url).header("Accept", "application/json");
                for (name, value) in credentials.headers() {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                builder
            }
        };

        self.send(request).await
    }
}
