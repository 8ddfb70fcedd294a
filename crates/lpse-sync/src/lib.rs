//! Per-host harvest pipeline: index pagination, year filter, detail dispatch, merge, finalize.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use futures::stream::{self, Stream, TryStreamExt};
use lpse_adapters::{CatalogClient, ClientError, ClientPool};
use lpse_core::{FlatRecord, RecordKind, YearRange};
use lpse_storage::{
    append_error_line, copy_verified, DetailStore, ErrorLog, ErrorSink, HostLayout,
    HttpClientConfig, IndexReader, IndexWriter, RUN_ERROR_LOG,
};
use serde::Serialize;
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lpse-sync";

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub output_dir: PathBuf,
    pub kind: RecordKind,
    pub years: YearRange,
    pub workers: usize,
    pub pool_size: usize,
    pub fetch_size: u64,
    pub keep_intermediates: bool,
    pub http: HttpClientConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            kind: RecordKind::Tender,
            years: YearRange::single(Utc::now().year()),
            workers: 8,
            pool_size: 4,
            fetch_size: 100,
            keep_intermediates: false,
            http: HttpClientConfig::default(),
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let http = HttpClientConfig {
            timeout: std::env::var("LPSE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.http.timeout),
            user_agent: std::env::var("LPSE_USER_AGENT").ok(),
            accept_invalid_certs: std::env::var("LPSE_ACCEPT_INVALID_CERTS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(defaults.http.accept_invalid_certs),
            backoff: lpse_storage::BackoffPolicy {
                max_retries: std::env::var("LPSE_HTTP_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.http.backoff.max_retries),
                ..defaults.http.backoff
            },
        };
        Self {
            output_dir: std::env::var("LPSE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| defaults.output_dir.clone()),
            http,
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageProgress {
    pub page: u64,
    pub total_pages: u64,
    pub rows: u64,
}

pub fn total_pages(total: u64, fetch_size: u64) -> u64 {
    total.div_ceil(fetch_size)
}

struct PaginatorState {
    pool: ClientPool,
    writer: IndexWriter,
    fetch_size: u64,
    next_page: u64,
    total_pages: Option<u64>,
    rows: u64,
}

/// Lazily pages through the listing, appending rows to `writer`.
///
/// The total is queried once on first poll. Pages run strictly in order and
/// page `p` is requested through pool handle `p mod k`.
pub fn index_pages(
    pool: ClientPool,
    writer: IndexWriter,
    fetch_size: u64,
) -> impl Stream<Item = Result<PageProgress>> {
    let state = PaginatorState {
        pool,
        writer,
        fetch_size,
        next_page: 0,
        total_pages: None,
        rows: 0,
    };
    stream::try_unfold(state, |mut state| async move {
        ensure!(state.fetch_size > 0, "fetch size must be positive");
        let total_pages = match state.total_pages {
            Some(pages) => pages,
            None => {
                let total = state
                    .pool
                    .primary()
                    .record_count()
                    .await
                    .with_context(|| format!("reading record total from {}", state.pool.host()))?;
                let pages = total_pages(total, state.fetch_size);
                info!(total, pages, "listing total");
                state.total_pages = Some(pages);
                pages
            }
        };
        if state.next_page >= total_pages {
            return Ok(None);
        }

        let page = state.next_page;
        let client = state.pool.handle(page as usize);
        let listing = client
            .fetch_listing(page * state.fetch_size, state.fetch_size)
            .await
            .with_context(|| format!("fetching index page {} of {}", page + 1, total_pages))?;
        state.writer.append(&listing.rows)?;
        state.rows += listing.rows.len() as u64;
        state.next_page += 1;

        let progress = PageProgress {
            page: page + 1,
            total_pages,
            rows: state.rows,
        };
        Ok(Some((progress, state)))
    })
}

pub fn admitted_ids(index_path: &Path, kind: RecordKind, years: &YearRange) -> Result<Vec<String>> {
    let mut reader = IndexReader::open(index_path)?;
    let mut admitted = Vec::new();
    for row in reader.rows() {
        let row = row?;
        if years.admits_row(&row, kind) {
            admitted.push(row.id().to_string());
        }
    }
    Ok(admitted)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub submitted: usize,
    pub persisted: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct WorkerTally {
    persisted: usize,
    failed: usize,
}

pub struct DetailDispatcher {
    tx: mpsc::UnboundedSender<String>,
    workers: JoinSet<WorkerTally>,
    submitted: usize,
}

impl DetailDispatcher {
    pub async fn start(
        workers: usize,
        pool: &ClientPool,
        store: DetailStore,
        errors: ErrorSink,
    ) -> Result<Self> {
        ensure!(workers > 0, "worker count must be positive");
        store.ensure_dir().await?;

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(Mutex::new(rx));
        let store = Arc::new(store);
        let completed = Arc::new(AtomicUsize::new(0));

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let client = pool.handle(worker);
            let rx = Arc::clone(&rx);
            let store = Arc::clone(&store);
            let errors = errors.clone();
            let completed = Arc::clone(&completed);
            set.spawn(async move { run_worker(worker, client, rx, store, errors, completed).await });
        }

        Ok(Self {
            tx,
            workers: set,
            submitted: 0,
        })
    }

    pub fn submit(&mut self, id: impl Into<String>) -> Result<()> {
        self.tx
            .send(id.into())
            .map_err(|_| anyhow!("detail queue is closed"))?;
        self.submitted += 1;
        Ok(())
    }

    pub async fn join(mut self) -> Result<DispatchSummary> {
        drop(self.tx);
        let mut summary = DispatchSummary {
            submitted: self.submitted,
            ..Default::default()
        };
        while let Some(joined) = self.workers.join_next().await {
            let tally = joined.context("detail worker stopped unexpectedly")?;
            summary.persisted += tally.persisted;
            summary.failed += tally.failed;
        }
        Ok(summary)
    }
}

async fn run_worker(
    worker: usize,
    client: Arc<dyn CatalogClient>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    store: Arc<DetailStore>,
    errors: ErrorSink,
    completed: Arc<AtomicUsize>,
) -> WorkerTally {
    let mut tally = WorkerTally::default();
    loop {
        let next = rx.lock().await.recv().await;
        let Some(id) = next else {
            break;
        };

        match fetch_and_store(client.as_ref(), &store, &id).await {
            Ok(path) => {
                tally.persisted += 1;
                debug!(worker, id = %id, path = %path.display(), "detail stored");
            }
            Err(err) => {
                tally.failed += 1;
                warn!(worker, id = %id, error = %format!("{err:#}"), "detail fetch failed");
                errors.record(id.as_str(), format!("{err:#}"));
            }
        }

        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
        if done % PROGRESS_EVERY == 0 {
            info!(done, "detail progress");
        }
    }
    tally
}

async fn fetch_and_store(client: &dyn CatalogClient, store: &DetailStore, id: &str) -> Result<PathBuf> {
    let mut document = client
        .fetch_detail(id)
        .await
        .with_context(|| format!("fetching detail {id}"))?;
    document.id_paket = id.to_string();
    store.write(&document).await
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub rows: usize,
    pub skipped: usize,
}

pub async fn merge_details(kind: RecordKind, store: &DetailStore, merged_path: &Path) -> Result<MergeSummary> {
    let mut writer = WriterBuilder::new()
        .delimiter(b',')
        .quote_style(QuoteStyle::Always)
        .terminator(Terminator::CRLF)
        .from_path(merged_path)
        .with_context(|| format!("creating merged dataset {}", merged_path.display()))?;
    writer
        .write_record(kind.columns())
        .context("writing merged dataset header")?;

    let mut summary = MergeSummary::default();
    for path in store.list().await? {
        let document = match DetailStore::read(&path).await {
            Ok(document) => document,
            Err(err) => {
                summary.skipped += 1;
                warn!(path = %path.display(), error = %format!("{err:#}"), "skipping unreadable detail");
                continue;
            }
        };
        let record = FlatRecord::from_document(kind, &document);
        writer
            .write_record(record.to_row())
            .with_context(|| format!("writing merged row for {}", document.id_paket))?;
        summary.rows += 1;
    }
    writer.flush().context("flushing merged dataset")?;
    Ok(summary)
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeSummary {
    pub dataset: PathBuf,
    pub dataset_sha256: String,
    pub error_log: Option<PathBuf>,
    pub removed_intermediates: bool,
}

pub async fn finalize(layout: &HostLayout, keep_intermediates: bool) -> Result<FinalizeSummary> {
    let dataset = layout.final_dataset_path();
    let dataset_sha256 = copy_verified(layout.merged_path(), &dataset).await?;

    let detail_errors = layout.detail_error_log();
    let error_log = if fs::try_exists(&detail_errors).await.unwrap_or(false) {
        let target = layout.final_error_log_path();
        copy_verified(&detail_errors, &target).await?;
        Some(target)
    } else {
        None
    };

    if !keep_intermediates {
        fs::remove_dir_all(layout.host_dir())
            .await
            .with_context(|| format!("removing {}", layout.host_dir().display()))?;
    }

    Ok(FinalizeSummary {
        dataset,
        dataset_sha256,
        error_log,
        removed_intermediates: !keep_intermediates,
    })
}

#[async_trait]
pub trait PoolConnector: Send + Sync {
    async fn connect(&self, host: &str, config: &HarvestConfig) -> Result<ClientPool, ClientError>;
}

#[derive(Debug, Default)]
pub struct SpseConnector;

#[async_trait]
impl PoolConnector for SpseConnector {
    async fn connect(&self, host: &str, config: &HarvestConfig) -> Result<ClientPool, ClientError> {
        ClientPool::connect(host, config.kind, config.pool_size, &config.http).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub host: String,
    pub folder: String,
    pub version: Option<String>,
    pub last_update: Option<String>,
    pub pages: u64,
    pub index_rows: u64,
    pub admitted: usize,
    pub dispatch: DispatchSummary,
    pub merge: MergeSummary,
    pub finalize: FinalizeSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostOutcome {
    Completed(HostSummary),
    Failed { host: String, error: String },
    Cancelled { host: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub kind: RecordKind,
    pub years: String,
    pub hosts: Vec<HostOutcome>,
}

impl HarvestReport {
    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, HostOutcome::Completed(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, HostOutcome::Failed { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, HostOutcome::Cancelled { .. }))
    }

    fn count(&self, pred: impl Fn(&HostOutcome) -> bool) -> usize {
        self.hosts.iter().filter(|o| pred(o)).count()
    }
}

/// Cancels the host currently being harvested; later hosts get a fresh token.
#[derive(Debug, Clone, Default)]
pub struct HostInterrupt {
    current: Arc<StdMutex<CancellationToken>>,
}

impl HostInterrupt {
    pub fn interrupt(&self) {
        self.lock().cancel();
    }

    fn begin_host(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.lock() = token.clone();
        token
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn forward_ctrl_c(interrupt: HostInterrupt) {
    loop {
        match tokio::signal::ctrl_c().await {
            Ok(()) => interrupt.interrupt(),
            Err(err) => {
                warn!(error = %err, "ctrl-c handler unavailable");
                return;
            }
        }
    }
}

pub struct HarvestPipeline {
    config: HarvestConfig,
    connector: Box<dyn PoolConnector>,
    interrupt: HostInterrupt,
}

impl HarvestPipeline {
    pub fn new(config: HarvestConfig) -> Self {
        Self {
            config,
            connector: Box::<SpseConnector>::default(),
            interrupt: HostInterrupt::default(),
        }
    }

    pub fn with_connector(mut self, connector: Box<dyn PoolConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn interrupt_handle(&self) -> HostInterrupt {
        self.interrupt.clone()
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub async fn run(&self, hosts: &[String]) -> Result<HarvestReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        fs::create_dir_all(&self.config.output_dir)
            .await
            .with_context(|| format!("creating output directory {}", self.config.output_dir.display()))?;
        let run_errors = self.config.output_dir.join(RUN_ERROR_LOG);

        let ctrl_c = tokio::spawn(forward_ctrl_c(self.interrupt.clone()));
        let mut outcomes = Vec::with_capacity(hosts.len());
        for host in hosts {
            let span = info_span!("host", host = %host, kind = %self.config.kind);
            let cancel = self.interrupt.begin_host();
            let outcome = tokio::select! {
                result = self.run_host(host).instrument(span) => match result {
                    Ok(summary) => HostOutcome::Completed(summary),
                    Err(err) => {
                        let message = format!("{err:#}");
                        error!(host = %host, error = %message, "host harvest failed");
                        if let Err(log_err) = append_error_line(&run_errors, host, &message).await {
                            error!(host = %host, error = %format!("{log_err:#}"), "could not record host failure");
                        }
                        HostOutcome::Failed { host: host.clone(), error: message }
                    }
                },
                _ = cancel.cancelled() => {
                    warn!(host = %host, "cancelled by user, moving on to the next host");
                    HostOutcome::Cancelled { host: host.clone() }
                }
            };
            outcomes.push(outcome);
        }
        ctrl_c.abort();

        let report = HarvestReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            kind: self.config.kind,
            years: self.config.years.to_string(),
            hosts: outcomes,
        };
        info!(
            %run_id,
            completed = report.completed(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            "harvest finished"
        );
        Ok(report)
    }

    pub async fn run_host(&self, host: &str) -> Result<HostSummary> {
        let config = &self.config;
        let layout = HostLayout::new(&config.output_dir, host, config.kind);
        info!(years = %config.years, folder = layout.folder(), "starting host");

        let pool = self
            .connector
            .connect(host, config)
            .await
            .with_context(|| format!("connecting to {host}"))?;
        info!(
            version = pool.detected_version().unwrap_or("unknown"),
            last_update = pool.last_update().unwrap_or("unknown"),
            handles = pool.len(),
            "connected"
        );

        fs::create_dir_all(layout.host_dir())
            .await
            .with_context(|| format!("creating {}", layout.host_dir().display()))?;

        let writer = IndexWriter::create(layout.index_path())?;
        let pages = index_pages(pool.clone(), writer, config.fetch_size);
        futures::pin_mut!(pages);
        let mut last = PageProgress {
            page: 0,
            total_pages: 0,
            rows: 0,
        };
        while let Some(progress) = pages.try_next().await? {
            info!(page = progress.page, total_pages = progress.total_pages, rows = progress.rows, "index page stored");
            last = progress;
        }
        info!(pages = last.total_pages, rows = last.rows, "index complete");

        let admitted = admitted_ids(&layout.index_path(), config.kind, &config.years)?;
        info!(admitted = admitted.len(), index_rows = last.rows, "year filter applied");

        let store = DetailStore::new(layout.detail_dir());
        let error_log = ErrorLog::spawn(layout.detail_error_log());
        let mut dispatcher =
            DetailDispatcher::start(config.workers, &pool, store.clone(), error_log.sink()).await?;
        for id in &admitted {
            dispatcher.submit(id.as_str())?;
        }
        let dispatch = dispatcher.join().await?;
        let logged = error_log.close().await?;
        if dispatch.failed > 0 {
            warn!(failed = dispatch.failed, logged, "some details failed");
        }
        info!(
            submitted = dispatch.submitted,
            persisted = dispatch.persisted,
            failed = dispatch.failed,
            "details complete"
        );

        let merge = merge_details(config.kind, &store, &layout.merged_path()).await?;
        if merge.skipped > 0 {
            warn!(skipped = merge.skipped, "unreadable details left out of dataset");
        }
        info!(rows = merge.rows, "dataset merged");

        let finalize = finalize(&layout, config.keep_intermediates).await?;
        info!(dataset = %finalize.dataset.display(), sha256 = %finalize.dataset_sha256, "host done");

        Ok(HostSummary {
            host: host.to_string(),
            folder: layout.folder().to_string(),
            version: pool.detected_version().map(str::to_string),
            last_update: pool.last_update().map(str::to_string),
            pages: last.total_pages,
            index_rows: last.rows,
            admitted: admitted.len(),
            dispatch,
            merge,
            finalize,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use lpse_adapters::ListingPage;
    use lpse_core::{DetailDocument, FieldValue, IndexRow, Section};
    use tempfile::tempdir;

    struct FakeCatalog {
        rows: Vec<IndexRow>,
        failing: HashSet<String>,
        listing_calls: StdMutex<Vec<(u64, u64)>>,
    }

    impl FakeCatalog {
        fn new(rows: Vec<IndexRow>) -> Self {
            Self {
                rows,
                failing: HashSet::new(),
                listing_calls: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CatalogClient for FakeCatalog {
        fn host(&self) -> &str {
            "http://lpse.fake.go.id/eproc4"
        }

        fn kind(&self) -> RecordKind {
            RecordKind::Tender
        }

        fn detected_version(&self) -> Option<&str> {
            Some("4.5u1")
        }

        fn last_update(&self) -> Option<&str> {
            None
        }

        async fn fetch_listing(&self, offset: u64, limit: u64) -> Result<ListingPage, ClientError> {
            self.listing_calls.lock().unwrap().push((offset, limit));
            let start = (offset as usize).min(self.rows.len());
            let end = (start + limit as usize).min(self.rows.len());
            Ok(ListingPage {
                records_total: self.rows.len() as u64,
                rows: self.rows[start..end].to_vec(),
            })
        }

        async fn fetch_detail(&self, id: &str) -> Result<DetailDocument, ClientError> {
            if self.failing.contains(id) {
                return Err(ClientError::Anyhow(anyhow!("connection reset")));
            }
            let mut announcement = Section::new();
            announcement.insert("nama_tender".into(), FieldValue::from(format!("Paket {id}")));
            Ok(DetailDocument {
                id_paket: id.to_string(),
                pengumuman: Some(announcement),
                pemenang: None,
            })
        }
    }

    fn tender_row(id: usize, budget: &str) -> IndexRow {
        let mut fields = vec![String::new(); 9];
        fields[0] = id.to_string();
        fields[1] = format!("Paket | {id}");
        fields[8] = budget.to_string();
        IndexRow::new(fields)
    }

    fn pool_of(client: Arc<FakeCatalog>) -> ClientPool {
        ClientPool::from_handles(vec![client as Arc<dyn CatalogClient>]).unwrap()
    }

    #[tokio::test]
    async fn paginates_250_rows_in_three_pages() {
        let dir = tempdir().unwrap();
        let rows = (0..250).map(|i| tender_row(i, "APBD 2023")).collect();
        let client = Arc::new(FakeCatalog::new(rows));
        let index_path = dir.path().join("index");
        let writer = IndexWriter::create(&index_path).unwrap();

        let progress: Vec<PageProgress> = index_pages(pool_of(client.clone()), writer, 100)
            .try_collect()
            .await
            .unwrap();

        let triples: Vec<_> = progress.iter().map(|p| (p.page, p.total_pages, p.rows)).collect();
        assert_eq!(triples, vec![(1, 3, 100), (2, 3, 200), (3, 3, 250)]);

        let calls = client.listing_calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(0, 0), (0, 100), (100, 100), (200, 100)]);

        let mut reader = IndexReader::open(&index_path).unwrap();
        let stored: Vec<IndexRow> = reader.rows().map(|r| r.unwrap()).collect();
        assert_eq!(stored.len(), 250);
        assert_eq!(stored[249].field(1), Some("Paket | 249"));
    }

    #[tokio::test]
    async fn empty_listing_yields_no_pages() {
        let dir = tempdir().unwrap();
        let client = Arc::new(FakeCatalog::new(Vec::new()));
        let writer = IndexWriter::create(dir.path().join("index")).unwrap();
        let progress: Vec<PageProgress> = index_pages(pool_of(client), writer, 100)
            .try_collect()
            .await
            .unwrap();
        assert!(progress.is_empty());
    }

    #[tokio::test]
    async fn zero_fetch_size_is_rejected() {
        let dir = tempdir().unwrap();
        let client = Arc::new(FakeCatalog::new(vec![tender_row(1, "2023")]));
        let writer = IndexWriter::create(dir.path().join("index")).unwrap();
        let result: Result<Vec<PageProgress>> = index_pages(pool_of(client), writer, 0).try_collect().await;
        assert!(result.is_err());
    }

    #[test]
    fn year_filter_reads_budget_field() {
        let dir = tempdir().unwrap();
        let index_path = dir.path().join("index");
        let mut writer = IndexWriter::create(&index_path).unwrap();
        writer
            .append(&[
                tender_row(1, "APBD 2021, APBD 2023"),
                tender_row(2, "APBN 2024"),
                tender_row(3, "tanpa tahun"),
                tender_row(4, "2022"),
            ])
            .unwrap();
        drop(writer);

        let years = YearRange::new(2022, 2023).unwrap();
        let admitted = admitted_ids(&index_path, RecordKind::Tender, &years).unwrap();
        assert_eq!(admitted, vec!["1".to_string(), "4".to_string()]);
    }

    #[tokio::test]
    async fn dispatcher_accounts_for_every_task() {
        let dir = tempdir().unwrap();
        let mut fake = FakeCatalog::new(Vec::new());
        fake.failing = ["3", "7", "9"].into_iter().map(String::from).collect();
        let pool = pool_of(Arc::new(fake));
        let store = DetailStore::new(dir.path().join("detil"));
        let error_path = dir.path().join("detil.err");
        let error_log = ErrorLog::spawn(&error_path);

        let mut dispatcher = DetailDispatcher::start(4, &pool, store.clone(), error_log.sink())
            .await
            .unwrap();
        for id in 0..20 {
            dispatcher.submit(id.to_string()).unwrap();
        }
        let summary = dispatcher.join().await.unwrap();
        let logged = error_log.close().await.unwrap();

        assert_eq!(summary.submitted, 20);
        assert_eq!(summary.persisted + summary.failed, 20);
        assert_eq!(summary.failed, 3);
        assert_eq!(logged, 3);
        assert_eq!(store.list().await.unwrap().len(), 17);

        let errors = std::fs::read_to_string(&error_path).unwrap();
        let mut ids: Vec<&str> = errors.lines().map(|l| l.split('|').next().unwrap()).collect();
        ids.sort();
        assert_eq!(ids, vec!["3", "7", "9"]);
    }

    #[tokio::test]
    async fn merge_flattens_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let store = DetailStore::new(dir.path().join("detil"));
        store.ensure_dir().await.unwrap();

        let mut announcement = Section::new();
        announcement.insert("nama_tender".into(), FieldValue::from("Jalan"));
        announcement.insert(
            "lokasi_pekerjaan".into(),
            FieldValue::List(vec!["A".into(), "B".into()]),
        );
        announcement.insert("tahap_tender_saat_ini".into(), FieldValue::from("Selesai [...]"));
        store
            .write(&DetailDocument {
                id_paket: "10".into(),
                pengumuman: Some(announcement),
                pemenang: None,
            })
            .await
            .unwrap();
        store.write(&DetailDocument::new("11")).await.unwrap();
        std::fs::write(store.dir().join("12"), b"{not json").unwrap();

        let merged = dir.path().join("detil.dat");
        let summary = merge_details(RecordKind::Tender, &store, &merged).await.unwrap();
        assert_eq!(summary, MergeSummary { rows: 2, skipped: 1 });

        let text = std::fs::read_to_string(&merged).unwrap();
        let lines: Vec<&str> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("\"id_paket\",\"kode_tender\",\"nama_tender\""));
        assert!(lines[1].starts_with("\"10\",\"\",\"Jalan\""));
        assert!(lines[1].contains("\"Selesai\""));
        assert!(lines[1].contains("\"A || B\""));
        assert_eq!(lines[2], format!("\"11\"{}", ",\"\"".repeat(19)));
    }

    #[tokio::test]
    async fn finalize_copies_then_removes_intermediates() {
        let dir = tempdir().unwrap();
        let layout = HostLayout::new(dir.path(), "lpse.fake.go.id", RecordKind::Tender);
        std::fs::create_dir_all(layout.host_dir()).unwrap();
        std::fs::write(layout.merged_path(), b"\"id_paket\"\r\n").unwrap();
        std::fs::write(layout.detail_error_log(), b"5|boom\n").unwrap();

        let summary = finalize(&layout, false).await.unwrap();
        assert!(summary.removed_intermediates);
        assert!(!layout.host_dir().exists());
        assert_eq!(std::fs::read(layout.final_dataset_path()).unwrap(), b"\"id_paket\"\r\n");
        assert_eq!(
            std::fs::read_to_string(layout.final_error_log_path()).unwrap(),
            "5|boom\n"
        );
    }

    #[tokio::test]
    async fn finalize_keeps_intermediates_on_request() {
        let dir = tempdir().unwrap();
        let layout = HostLayout::new(dir.path(), "lpse.fake.go.id", RecordKind::NonTender);
        std::fs::create_dir_all(layout.host_dir()).unwrap();
        std::fs::write(layout.merged_path(), b"x").unwrap();

        let summary = finalize(&layout, true).await.unwrap();
        assert!(layout.host_dir().exists());
        assert!(summary.error_log.is_none());
        assert!(!layout.final_error_log_path().exists());
    }

    #[test]
    fn default_config_targets_current_year() {
        let config = HarvestConfig::default();
        let year = Utc::now().year();
        assert_eq!(config.years, YearRange::single(year));
        assert_eq!(config.workers, 8);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.fetch_size, 100);
        assert_eq!(config.kind, RecordKind::Tender);
        assert_eq!(config.http.backoff.max_retries, 0);
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(total_pages(250, 100), 3);
        assert_eq!(total_pages(200, 100), 2);
        assert_eq!(total_pages(0, 100), 0);
    }
}
