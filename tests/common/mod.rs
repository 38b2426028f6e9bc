#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use erp_sync::config::{RetryPolicy, SyncConfig};
use erp_sync::error::{SyncError, SyncResult};
use erp_sync::models::{InvoiceAggregate, PriorRecord, SyncKind, SyncRun, SyncStatus};
use erp_sync::service::{Credentials, InvoiceStore, PageSource, RunLedger, SyncEngine, SyncLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const BASE_URL: &str = "https://erp.test/api/notas";

/// 内存存储: 发票 + 台账 + 锁
#[derive(Default)]
pub struct MemoryStore {
    pub invoices: Mutex<BTreeMap<i64, InvoiceAggregate>>,
    pub failing_writes: Mutex<HashSet<i64>>,
    pub upserts: Mutex<Vec<i64>>,
    pub runs: Mutex<Vec<SyncRun>>,
    pub progress_updates: Mutex<Vec<(u32, usize)>>,
    pub lock: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn invoice(&self, number: i64) -> Option<InvoiceAggregate> {
        self.invoices.lock().unwrap().get(&number).cloned()
    }

    pub fn count(&self) -> usize {
        self.invoices.lock().unwrap().len()
    }

    pub fn assign(&self, number: i64) {
        if let Some(invoice) = self.invoices.lock().unwrap().get_mut(&number) {
            invoice.is_assigned = true;
        }
    }

    /// 预置一条与 ERP 无关的历史记录
    pub fn seed(&self, number: i64, assigned: bool) {
        let invoice = InvoiceAggregate {
            id: InvoiceAggregate::identity(1, number),
            number,
            company_code: 1,
            customer_name: "HISTORICO".to_string(),
            customer_city: "MARINGA - PR".to_string(),
            issue_date: "2023-12-01".to_string(),
            total_value: 1.0,
            total_weight: 1.0,
            items: Vec::new(),
            is_assigned: assigned,
            fingerprint: Some("stale".to_string()),
            is_cancelled: false,
        };
        self.invoices.lock().unwrap().insert(number, invoice);
    }

    pub fn fail_writes_for(&self, number: i64) {
        self.failing_writes.lock().unwrap().insert(number);
    }

    pub fn hold_lock(&self, holder: &str) {
        *self.lock.lock().unwrap() = Some((holder.to_string(), Utc::now()));
    }

    /// 把锁的获取时间往前推, 模拟长时间未续期
    pub fn age_lock(&self, minutes: i64) {
        if let Some((_, at)) = self.lock.lock().unwrap().as_mut() {
            *at = Utc::now() - Duration::minutes(minutes);
        }
    }

    pub fn lock_age(&self) -> Option<Duration> {
        self.lock.lock().unwrap().as_ref().map(|(_, at)| Utc::now() - *at)
    }

    pub fn lock_holder(&self) -> Option<String> {
        self.lock.lock().unwrap().as_ref().map(|(holder, _)| holder.clone())
    }

    pub fn runs(&self) -> Vec<SyncRun> {
        self.runs.lock().unwrap().clone()
    }

    pub fn progress_updates(&self) -> Vec<(u32, usize)> {
        self.progress_updates.lock().unwrap().clone()
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.lock().unwrap().len()
    }

    fn update_run(&self, id: Uuid, apply: impl FnOnce(&mut SyncRun)) -> SyncResult<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.iter_mut().find(|r| r.id == id) {
            apply(run);
        }
        Ok(())
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn load_prior_state(&self, numbers: &[i64]) -> SyncResult<Vec<PriorRecord>> {
        let invoices = self.invoices.lock().unwrap();
        Ok(numbers
            .iter()
            .filter_map(|n| invoices.get(n))
            .map(|i| PriorRecord {
                number: i.number,
                api_hash: i.fingerprint.clone(),
                is_assigned: i.is_assigned,
                is_cancelled: i.is_cancelled,
            })
            .collect())
    }

    async fn list_open_unassigned(&self) -> SyncResult<Vec<PriorRecord>> {
        let invoices = self.invoices.lock().unwrap();
        Ok(invoices
            .values()
            .filter(|i| !i.is_assigned && !i.is_cancelled)
            .map(|i| PriorRecord {
                number: i.number,
                api_hash: i.fingerprint.clone(),
                is_assigned: i.is_assigned,
                is_cancelled: i.is_cancelled,
            })
            .collect())
    }

    async fn upsert_invoice(&self, invoice: &InvoiceAggregate) -> SyncResult<()> {
        if self.failing_writes.lock().unwrap().contains(&invoice.number) {
            return Err(SyncError::Persistence {
                invoice: invoice.number,
                message: "constraint violation".to_string(),
            });
        }

        let mut invoices = self.invoices.lock().unwrap();
        let assigned = invoices.get(&invoice.number).map_or(false, |i| i.is_assigned);
        let mut stored = invoice.clone();
        stored.is_assigned = assigned;
        stored.is_cancelled = false;
        invoices.insert(invoice.number, stored);
        self.upserts.lock().unwrap().push(invoice.number);
        Ok(())
    }

    async fn flag_cancelled(&self, numbers: &[i64]) -> SyncResult<u64> {
        let mut invoices = self.invoices.lock().unwrap();
        let mut flagged = 0;
        for number in numbers {
            if let Some(invoice) = invoices.get_mut(number) {
                if !invoice.is_assigned && !invoice.is_cancelled {
                    invoice.is_cancelled = true;
                    flagged += 1;
                }
            }
        }
        Ok(flagged)
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn begin(&self, kind: SyncKind) -> SyncResult<Uuid> {
        let id = Uuid::new_v4();
        self.runs.lock().unwrap().push(SyncRun {
            id,
            kind,
            started_at: Utc::now(),
            completed_at: None,
            status: SyncStatus::Running,
            total_pages: 0,
            total_invoices: 0,
            error_message: None,
        });
        Ok(id)
    }

    async fn update_progress(&self, id: Uuid, pages: u32, invoices: usize) -> SyncResult<()> {
        self.progress_updates.lock().unwrap().push((pages, invoices));
        self.update_run(id, |run| {
            run.total_pages = pages as i32;
            run.total_invoices = invoices as i32;
        })
    }

    async fn complete(&self, id: Uuid, pages: u32, invoices: usize) -> SyncResult<()> {
        self.update_run(id, |run| {
            run.status = SyncStatus::Completed;
            run.completed_at = Some(Utc::now());
            run.total_pages = pages as i32;
            run.total_invoices = invoices as i32;
        })
    }

    async fn fail(&self, id: Uuid, message: &str) -> SyncResult<()> {
        self.update_run(id, |run| {
            run.status = SyncStatus::Failed;
            run.completed_at = Some(Utc::now());
            run.error_message = Some(message.to_string());
        })
    }

    async fn cancel(&self, id: Uuid, pages: u32, invoices: usize) -> SyncResult<()> {
        self.update_run(id, |run| {
            run.status = SyncStatus::Cancelled;
            run.completed_at = Some(Utc::now());
            run.total_pages = pages as i32;
            run.total_invoices = invoices as i32;
        })
    }

    async fn recent(&self, limit: i64) -> SyncResult<Vec<SyncRun>> {
        let mut runs = self.runs();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn last_completed(&self, kind: Option<SyncKind>) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self
            .runs()
            .iter()
            .filter(|r| r.status == SyncStatus::Completed)
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .filter_map(|r| r.completed_at)
            .max())
    }
}

#[async_trait]
impl SyncLock for MemoryStore {
    async fn try_acquire(&self, owner: &str, stale_after: Duration) -> SyncResult<Option<String>> {
        let mut lock = self.lock.lock().unwrap();
        if let Some((holder, at)) = lock.as_ref() {
            if Utc::now() - *at < stale_after {
                return Ok(Some(holder.clone()));
            }
        }
        *lock = Some((owner.to_string(), Utc::now()));
        Ok(None)
    }

    async fn refresh(&self, owner: &str) -> SyncResult<bool> {
        let mut lock = self.lock.lock().unwrap();
        match lock.as_mut() {
            Some((holder, at)) if holder == owner => {
                *at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, owner: &str) -> SyncResult<()> {
        let mut lock = self.lock.lock().unwrap();
        if lock.as_ref().map_or(false, |(holder, _)| holder == owner) {
            *lock = None;
        }
        Ok(())
    }

    async fn is_held(&self, stale_after: Duration) -> SyncResult<bool> {
        let lock = self.lock.lock().unwrap();
        Ok(lock.as_ref().map_or(false, |(_, at)| Utc::now() - *at < stale_after))
    }
}

/// 按页返回预设响应; 可为某页预置若干次失败 (HTTP 状态码)
#[derive(Default)]
pub struct ScriptedSource {
    pub pages: Mutex<HashMap<u32, Value>>,
    pub failures: Mutex<HashMap<u32, VecDeque<u16>>>,
    pub stalls: Mutex<HashMap<u32, VecDeque<std::time::Duration>>>,
    pub calls: Mutex<Vec<u32>>,
}

impl ScriptedSource {
    pub fn new(pages: Vec<Value>) -> Arc<Self> {
        let source = Self::default();
        {
            let mut map = source.pages.lock().unwrap();
            for (i, page) in pages.into_iter().enumerate() {
                map.insert(i as u32 + 1, page);
            }
        }
        Arc::new(source)
    }

    pub fn fail_page(&self, page: u32, statuses: &[u16]) {
        self.failures
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .extend(statuses.iter().copied());
    }

    /// 该页接下来的若干次请求先挂起指定时长再返回
    pub fn stall_page(&self, page: u32, delays: &[std::time::Duration]) {
        self.stalls
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .extend(delays.iter().copied());
    }

    pub fn set_page(&self, page: u32, payload: Value) {
        self.pages.lock().unwrap().insert(page, payload);
    }

    fn next_stall(&self, page: u32) -> Option<std::time::Duration> {
        self.stalls.lock().unwrap().get_mut(&page).and_then(VecDeque::pop_front)
    }

    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, page: u32) -> usize {
        self.calls().iter().filter(|p| **p == page).count()
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch_page(
        &self,
        _base_url: &str,
        page: u32,
        _limit: u64,
        _credentials: &Credentials,
    ) -> SyncResult<Value> {
        self.calls.lock().unwrap().push(page);

        if let Some(delay) = self.next_stall(page) {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&page)
            .and_then(VecDeque::pop_front);
        if let Some(status) = failure {
            return Err(SyncError::from_status(status, "scripted failure"));
        }

        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&page)
            .cloned()
            .unwrap_or_else(|| json!({ "data": [] })))
    }
}

/// 一条 ERP 交易行
pub fn line(doc: i64, sku: &str, quantity: f64, value: f64, weight: f64) -> Value {
    json!({
        "nr_docto": doc,
        "cod_empresa": 1,
        "nome_pessoa": format!("CLIENTE {}", doc),
        "cidade_pessoa": "LONDRINA",
        "uf_pessoa": "PR",
        "data_dcto": "2024-05-01T00:00:00",
        "cod_item": sku,
        "descricao": "Fertilizante",
        "unidade": "SC",
        "quantidade": quantity,
        "valor_liquido": value,
        "quantidade_kgl": weight
    })
}

/// 每页 2 张单据, 每张 1 行, 共 `pages` 页, 带 total
pub fn catalog(pages: u32) -> Vec<Value> {
    let total = pages as u64 * 2;
    (1..=pages)
        .map(|p| {
            let first = p as i64 * 10;
            json!({
                "data": [
                    line(first, "SKU-A", 2.0, 100.0, 50.0),
                    line(first + 1, "SKU-B", 1.0, 80.5, 25.0)
                ],
                "total": total,
                "limit": 2,
                "page": p
            })
        })
        .collect()
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        page_size: 2,
        delay_between_pages_ms: 0,
        request_timeout_ms: 1_000,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
        },
        early_stop_threshold: 3,
        ..SyncConfig::default()
    }
}

pub fn engine(source: Arc<ScriptedSource>, store: Arc<MemoryStore>) -> SyncEngine {
    engine_with(source, store, test_config())
}

pub fn engine_with(source: Arc<ScriptedSource>, store: Arc<MemoryStore>, config: SyncConfig) -> SyncEngine {
    SyncEngine::new(source, store.clone(), store.clone(), store, config)
}

pub fn credentials() -> Credentials {
    Credentials::new(Some("test-key".to_string()))
}
