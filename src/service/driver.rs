use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{InvoiceAggregate, SyncKind, SyncProgress, SyncState, SyncSummary, TransactionLine};
use crate::service::aggregate::{build_aggregates, merge_into, AggregateMap};
use crate::service::fetcher::{Credentials, PageSource};
use crate::service::ledger::{RunLedger, RunTracker};
use crate::service::normalizer::NormalizedPage;
use crate::service::reconcile::{ChangeKind, ReconcileCounts, Reconciler};
use crate::service::store::{InvoiceStore, SyncLock};
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 总数未知时, 连续失败多少页后停止翻页
const MAX_CONSECUTIVE_PAGE_FAILURES: u32 = 3;

/// 预计剩余时间使用的滑动窗口大小
const TIMING_WINDOW: usize = 5;

/// 进度观察者
pub type ProgressCallback = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

/// 抢到互斥锁、开始拉取之前调用
pub type StartCallback = Arc<dyn Fn() + Send + Sync>;

/// 单次同步参数
#[derive(Clone)]
pub struct SyncOptions {
    pub kind: SyncKind,
    pub on_progress: Option<ProgressCallback>,
    pub max_pages: Option<u32>,
    pub cancel: Option<CancellationToken>,
    pub on_start: Option<StartCallback>,
}

impl SyncOptions {
    pub fn new(kind: SyncKind) -> Self {
        Self {
            kind,
            on_progress: None,
            max_pages: None,
            cancel: None,
            on_start: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_on_start(mut self, callback: StartCallback) -> Self {
        self.on_start = Some(callback);
        self
    }
}

/// 每页耗时滑动平均
#[derive(Debug, Default)]
struct PageTimer {
    samples: VecDeque<Duration>,
}

impl PageTimer {
    fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == TIMING_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    fn average_secs(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(Duration::as_secs_f64).sum();
        Some(total / self.samples.len() as f64)
    }
}

/// 一次运行过程中的可变状态
struct RunState {
    run_id: Uuid,
    kind: SyncKind,
    pages_fetched: u32,
    total_pages: Option<u32>,
    skipped_pages: Vec<u32>,
    page_errors: usize,
    /// 写入失败的单据号 -> 分类; 后续重写成功会移除
    failed_writes: HashMap<i64, ChangeKind>,
    cancelled_count: usize,
    stopped_early: bool,
    truncated: bool,
    cancelled: bool,
    timer: PageTimer,
}

impl RunState {
    fn new(run_id: Uuid, kind: SyncKind) -> Self {
        Self {
            run_id,
            kind,
            pages_fetched: 0,
            total_pages: None,
            skipped_pages: Vec::new(),
            page_errors: 0,
            failed_writes: HashMap::new(),
            cancelled_count: 0,
            stopped_early: false,
            truncated: false,
            cancelled: false,
            timer: PageTimer::default(),
        }
    }

    /// 本次拉取是否覆盖了全部数据 (取消检测的前提)
    fn pull_complete(&self) -> bool {
        !self.stopped_early && !self.truncated && !self.cancelled && self.skipped_pages.is_empty()
    }

    fn errors(&self) -> usize {
        self.page_errors + self.failed_writes.len()
    }

    fn progress(&self, page: u32, counts: ReconcileCounts, delay: Duration, finished: bool) -> SyncProgress {
        let percentage = if finished {
            100.0
        } else {
            match self.total_pages {
                Some(total) if total > 0 => (page as f64 * 100.0 / total as f64).min(100.0),
                _ => 0.0,
            }
        };

        let estimated_seconds_remaining = if finished {
            Some(0.0)
        } else {
            match (self.total_pages, self.timer.average_secs()) {
                (Some(total), Some(avg)) => {
                    let remaining = total.saturating_sub(page) as f64;
                    Some(remaining * (avg + delay.as_secs_f64()))
                }
                _ => None,
            }
        };

        SyncProgress {
            current_page: page,
            total_pages: self.total_pages,
            invoices_processed: counts.processed(),
            percentage,
            estimated_seconds_remaining,
            new_count: counts.new,
            updated_count: counts.updated,
            unchanged_count: counts.unchanged,
            cancelled_count: self.cancelled_count,
            stopped_early: self.stopped_early,
        }
    }

    fn summary(&self, counts: ReconcileCounts) -> SyncSummary {
        let failed = |kind: ChangeKind| self.failed_writes.values().filter(|k| **k == kind).count();
        SyncSummary {
            run_id: self.run_id,
            kind: self.kind,
            inserted_count: counts.new.saturating_sub(failed(ChangeKind::New)),
            updated_count: counts.updated.saturating_sub(failed(ChangeKind::Updated)),
            unchanged_count: counts.unchanged,
            cancelled_count: self.cancelled_count,
            errors_count: self.errors(),
            last_sync_at: Some(Utc::now()),
            pages_fetched: self.pages_fetched,
            total_pages: self.total_pages,
            skipped_pages: self.skipped_pages.clone(),
            stopped_early: self.stopped_early,
            cancelled: self.cancelled,
        }
    }
}

/// 同步引擎: 分页拉取 -> 归一化 -> 聚合 -> 对账 -> 写入
pub struct SyncEngine {
    source: Arc<dyn PageSource>,
    store: Arc<dyn InvoiceStore>,
    ledger: Arc<dyn RunLedger>,
    lock: Arc<dyn SyncLock>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn PageSource>,
        store: Arc<dyn InvoiceStore>,
        ledger: Arc<dyn RunLedger>,
        lock: Arc<dyn SyncLock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            store,
            ledger,
            lock,
            config,
        }
    }

    pub fn ledger(&self) -> Arc<dyn RunLedger> {
        self.ledger.clone()
    }

    fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.stale_lock_minutes)
    }

    /// 当前同步状态 (上次同步时间、是否需要全量、是否有运行中的同步)
    pub async fn state(&self) -> SyncResult<SyncState> {
        let last_sync_at = self.ledger.last_completed(None).await?;
        let last_full_sync_at = self.ledger.last_completed(Some(SyncKind::Full)).await?;
        let sync_in_progress = self.lock.is_held(self.stale_after()).await?;

        Ok(SyncState {
            last_sync_at,
            last_full_sync_at,
            full_sync_due: SyncState::full_sync_due(
                last_full_sync_at,
                Utc::now(),
                self.config.full_sync_interval_hours,
            ),
            sync_in_progress,
        })
    }

    /// 同步入口
    ///
    /// 与其他同步互斥: 锁被占用时直接返回 `AlreadyRunning`, 不排队。
    /// 第 1 页重试后仍失败时整次运行失败; 其余页失败只跳过该页。
    pub async fn run_sync(
        &self,
        base_url: &str,
        credentials: &Credentials,
        options: SyncOptions,
    ) -> SyncResult<SyncSummary> {
        if base_url.trim().is_empty() {
            return Err(SyncError::Config("ERP base url is not configured".to_string()));
        }

        let owner = format!("{}-{}", options.kind, Uuid::new_v4());
        if let Some(holder) = self.lock.try_acquire(&owner, self.stale_after()).await? {
            tracing::info!(holder = %holder, "Sync already in progress, refusing to start");
            return Err(SyncError::AlreadyRunning { holder });
        }

        if let Some(on_start) = &options.on_start {
            on_start();
        }

        let result = self.run_locked(base_url, credentials, &options, &owner).await;

        if let Err(e) = self.lock.release(&owner).await {
            tracing::error!(owner = %owner, error = %e, "Failed to release sync lock");
        }

        result
    }

    async fn run_locked(
        &self,
        base_url: &str,
        credentials: &Credentials,
        options: &SyncOptions,
        owner: &str,
    ) -> SyncResult<SyncSummary> {
        let mut tracker = RunTracker::begin(self.ledger.clone(), options.kind).await?;
        let run_id = tracker.id();
        let cancel = options.cancel.clone().unwrap_or_else(CancellationToken::new);
        let delay = Duration::from_millis(self.config.delay_between_pages_ms);
        let limit = self.config.page_size.max(1);
        let threshold = self.config.early_stop_threshold;

        let mut state = RunState::new(run_id, options.kind);
        let mut reconciler = Reconciler::new();
        let mut all = AggregateMap::new();
        let mut unchanged_streak: u32 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut page: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                state.cancelled = true;
                break;
            }
            if let Some(total) = state.total_pages {
                if page > total {
                    break;
                }
            }
            if let Some(max) = options.max_pages {
                if page > max {
                    state.truncated = state.total_pages.map_or(true, |total| page <= total);
                    tracing::info!(run_id = %run_id, max_pages = max, "Reached max page cap");
                    break;
                }
            }

            let started = Instant::now();
            let payload = match self.fetch_with_retry(base_url, page, limit, credentials, run_id).await {
                Ok(payload) => payload,
                Err(e) if page == 1 => {
                    tracing::error!(run_id = %run_id, page = page, error = %e, "First page failed, aborting sync");
                    tracker.fail(&e.to_string()).await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, page = page, error = %e, "Page failed after retries, skipping");
                    state.page_errors += 1;
                    state.skipped_pages.push(page);
                    consecutive_failures += 1;
                    if state.total_pages.is_none() && consecutive_failures >= MAX_CONSECUTIVE_PAGE_FAILURES {
                        tracing::warn!(run_id = %run_id, page = page, "Too many consecutive page failures with unknown total, stopping");
                        state.truncated = true;
                        break;
                    }
                    tracker.progress(state.pages_fetched, reconciler.counts().processed()).await;
                    self.keep_lock(owner, run_id).await;
                    self.emit(options, state.progress(page, reconciler.counts(), delay, false));
                    page += 1;
                    if self.pause(delay, &cancel).await {
                        state.cancelled = true;
                        break;
                    }
                    continue;
                }
            };
            consecutive_failures = 0;
            state.pages_fetched += 1;

            let normalized = NormalizedPage::from_payload(&payload, limit, page as u64);
            if normalized.malformed {
                // 无法确认该页内容, 本次拉取不能视为完整
                tracing::warn!(run_id = %run_id, page = page, "Response has no item array, skipping page");
                state.page_errors += 1;
                state.skipped_pages.push(page);
            } else if normalized.page != page as u64 {
                tracing::warn!(
                    run_id = %run_id,
                    page = page,
                    reported_page = normalized.page,
                    "ERP reported a different page than requested"
                );
            }
            if state.total_pages.is_none() {
                state.total_pages = normalized.total_pages();
            }
            let empty_page = normalized.items.is_empty();

            let lines = parse_lines(&normalized.items, run_id, page);
            let page_map = build_aggregates(&lines);
            let outcome = match self.reconcile_page(&mut reconciler, &mut all, page_map).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(run_id = %run_id, page = page, error = %e, "Failed to load prior state, skipping page");
                    state.page_errors += 1;
                    state.skipped_pages.push(page);
                    None
                }
            };

            if let Some(outcome) = outcome {
                for invoice in &outcome.to_write {
                    self.write_invoice(&mut state, &reconciler, invoice, page).await;
                }

                if outcome.all_unchanged() {
                    unchanged_streak += 1;
                } else if outcome.counts.processed() > 0 {
                    unchanged_streak = 0;
                }
            }

            state.timer.record(started.elapsed());
            let counts = reconciler.counts();
            tracker.progress(state.pages_fetched, counts.processed()).await;
            self.keep_lock(owner, run_id).await;

            let early_stop = options.kind == SyncKind::Incremental && threshold > 0 && unchanged_streak >= threshold;
            if early_stop {
                state.stopped_early = state.total_pages.map_or(true, |total| page < total);
                tracing::info!(
                    run_id = %run_id,
                    page = page,
                    streak = unchanged_streak,
                    stopped_early = state.stopped_early,
                    "Consecutive unchanged pages reached threshold, stopping incremental sync"
                );
            }

            self.emit(options, state.progress(page, counts, delay, false));

            tracing::info!(
                run_id = %run_id,
                page = page,
                total_pages = ?state.total_pages,
                new = counts.new,
                updated = counts.updated,
                unchanged = counts.unchanged,
                "Page processed"
            );

            if early_stop || (empty_page && state.total_pages.is_none()) {
                break;
            }

            page += 1;
            if self.pause(delay, &cancel).await {
                state.cancelled = true;
                break;
            }
        }

        if state.pull_complete() {
            self.detect_cancellations(&mut state, &mut reconciler).await;
        } else {
            tracing::info!(
                run_id = %run_id,
                stopped_early = state.stopped_early,
                truncated = state.truncated,
                cancelled = state.cancelled,
                skipped = state.skipped_pages.len(),
                "Pull incomplete, skipping cancellation detection"
            );
        }

        let counts = reconciler.counts();
        if state.cancelled {
            tracker.cancel(state.pages_fetched, counts.processed()).await;
        } else {
            tracker.complete(state.pages_fetched, counts.processed()).await;
        }

        let summary = state.summary(counts);
        self.emit(options, state.progress(state.pages_fetched, counts, delay, !state.cancelled));

        tracing::info!(
            run_id = %run_id,
            kind = %options.kind,
            inserted = summary.inserted_count,
            updated = summary.updated_count,
            unchanged = summary.unchanged_count,
            cancelled = summary.cancelled_count,
            errors = summary.errors_count,
            pages = summary.pages_fetched,
            stopped_early = summary.stopped_early,
            "Sync finished"
        );

        Ok(summary)
    }

    /// 单页拉取, 可重试错误按指数退避重试
    async fn fetch_with_retry(
        &self,
        base_url: &str,
        page: u32,
        limit: u64,
        credentials: &Credentials,
        run_id: Uuid,
    ) -> SyncResult<Value> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let deadline = Duration::from_millis(self.config.request_timeout_ms);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(
                deadline,
                self.source.fetch_page(base_url, page, limit, credentials),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.config.request_timeout_ms)),
            };

            match result {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = policy.backoff(attempt);
                    tracing::warn!(
                        run_id = %run_id,
                        page = page,
                        attempt = attempt,
                        wait_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Page fetch failed, retrying with backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 读取本页单据的已存状态并分类; 返回 None 表示本页无发票
    async fn reconcile_page(
        &self,
        reconciler: &mut Reconciler,
        all: &mut AggregateMap,
        page_map: AggregateMap,
    ) -> SyncResult<Option<crate::service::reconcile::PageOutcome>> {
        let numbers: Vec<i64> = page_map.keys().copied().collect();
        if numbers.is_empty() {
            return Ok(None);
        }

        let unseen: Vec<i64> = numbers.iter().copied().filter(|n| !reconciler.was_seen(*n)).collect();
        if !unseen.is_empty() {
            reconciler.absorb_prior(self.store.load_prior_state(&unseen).await?);
        }

        let repeated = merge_into(all, page_map);
        if !repeated.is_empty() {
            tracing::warn!(documents = ?repeated, "Documents span multiple pages, merged");
        }

        let invoices: Vec<InvoiceAggregate> = numbers.iter().filter_map(|n| all.get(n).cloned()).collect();
        let outcome = reconciler.reconcile_page(invoices);

        for invoice in &outcome.to_write {
            if let Some(stored) = all.get_mut(&invoice.number) {
                stored.fingerprint = invoice.fingerprint.clone();
            }
        }

        Ok(Some(outcome))
    }

    /// 单张发票写入失败只计数, 不影响同批其他发票
    async fn write_invoice(
        &self,
        state: &mut RunState,
        reconciler: &Reconciler,
        invoice: &InvoiceAggregate,
        page: u32,
    ) {
        match self.store.upsert_invoice(invoice).await {
            Ok(()) => {
                state.failed_writes.remove(&invoice.number);
            }
            Err(e) => {
                tracing::error!(
                    run_id = %state.run_id,
                    page = page,
                    invoice = invoice.number,
                    error = %e,
                    "Failed to persist invoice"
                );
                let kind = reconciler.kind_of(invoice.number).unwrap_or(ChangeKind::Updated);
                state.failed_writes.insert(invoice.number, kind);
            }
        }
    }

    async fn detect_cancellations(&self, state: &mut RunState, reconciler: &mut Reconciler) {
        let persisted = match self.store.list_open_unassigned().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(run_id = %state.run_id, error = %e, "Failed to list open invoices for cancellation check");
                state.page_errors += 1;
                return;
            }
        };

        let numbers = reconciler.detect_cancellations(persisted);
        if numbers.is_empty() {
            return;
        }

        match self.store.flag_cancelled(&numbers).await {
            Ok(flagged) => {
                state.cancelled_count = numbers.len();
                tracing::info!(run_id = %state.run_id, flagged = flagged, "Invoices absent from ERP flagged as cancelled");
            }
            Err(e) => {
                tracing::error!(run_id = %state.run_id, count = numbers.len(), error = %e, "Failed to flag cancelled invoices");
                state.page_errors += 1;
            }
        }
    }

    /// 每页续期互斥锁, 长时间运行不会被判定为失效
    async fn keep_lock(&self, owner: &str, run_id: Uuid) {
        match self.lock.refresh(owner).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(run_id = %run_id, owner = %owner, "Sync lock no longer held by this run"),
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Failed to refresh sync lock"),
        }
    }

    fn emit(&self, options: &SyncOptions, progress: SyncProgress) {
        if let Some(callback) = &options.on_progress {
            callback(&progress);
        }
    }

    /// 页间等待; 等待期间被取消时返回 true
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        if delay.is_zero() {
            return cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

fn parse_lines(items: &[Value], run_id: Uuid, page: u32) -> Vec<TransactionLine> {
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<TransactionLine>(item.clone()) {
            Ok(line) => Some(line),
            Err(e) => {
                tracing::warn!(run_id = %run_id, page = page, error = %e, "Unparseable transaction line, skipping");
                None
            }
        })
        .collect()
}
