//! On-disk stores and HTTP fetch utilities for the harvester.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use csv::{QuoteStyle, ReaderBuilder, Terminator, WriterBuilder};
use lpse_core::{DetailDocument, IndexRow, RecordKind};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lpse-storage";

pub const INDEX_FILE: &str = "index";
pub const DETAIL_DIR: &str = "detil";
pub const DETAIL_ERROR_LOG: &str = "detil.err";
pub const MERGED_FILE: &str = "detil.dat";
pub const RUN_ERROR_LOG: &str = "error.log";

#[derive(Debug, Clone)]
pub struct HostLayout {
    root: PathBuf,
    folder: String,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>, host: &str, kind: RecordKind) -> Self {
        Self {
            root: root.into(),
            folder: Self::folder_name(host, kind),
        }
    }

    pub fn folder_name(host: &str, kind: RecordKind) -> String {
        let trimmed = host.trim();
        let netloc = match url::Url::parse(trimmed) {
            Ok(url) if url.host_str().is_some() => {
                let host = url.host_str().unwrap_or_default();
                match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                }
            }
            _ => trimmed.split('/').next().unwrap_or_default().to_string(),
        };
        format!("{}_{}", netloc.to_lowercase().replace('.', "_"), kind.as_str())
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn host_dir(&self) -> PathBuf {
        self.root.join(&self.folder)
    }

    pub fn index_path(&self) -> PathBuf {
        self.host_dir().join(INDEX_FILE)
    }

    pub fn detail_dir(&self) -> PathBuf {
        self.host_dir().join(DETAIL_DIR)
    }

    pub fn detail_error_log(&self) -> PathBuf {
        self.host_dir().join(DETAIL_ERROR_LOG)
    }

    pub fn merged_path(&self) -> PathBuf {
        self.host_dir().join(MERGED_FILE)
    }

    pub fn final_dataset_path(&self) -> PathBuf {
        self.root.join(format!("{}.csv", self.folder))
    }

    pub fn final_error_log_path(&self) -> PathBuf {
        self.root.join(format!("{}_error.log", self.folder))
    }

    pub fn run_error_log(&self) -> PathBuf {
        self.root.join(RUN_ERROR_LOG)
    }
}

pub struct IndexWriter {
    inner: csv::Writer<File>,
    rows: usize,
}

impl IndexWriter {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating index directory {}", parent.display()))?;
        }
        let inner = WriterBuilder::new()
            .delimiter(b'|')
            .quote_style(QuoteStyle::Always)
            .terminator(Terminator::CRLF)
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("creating index file {}", path.display()))?;
        Ok(Self { inner, rows: 0 })
    }

    pub fn append(&mut self, rows: &[IndexRow]) -> anyhow::Result<()> {
        for row in rows {
            self.inner
                .write_record(row.fields())
                .context("writing index row")?;
            self.rows += 1;
        }
        self.inner.flush().context("flushing index file")?;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows
    }
}

pub struct IndexReader {
    inner: csv::Reader<File>,
}

impl IndexReader {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let inner = ReaderBuilder::new()
            .delimiter(b'|')
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("opening index file {}", path.display()))?;
        Ok(Self { inner })
    }

    pub fn rows(&mut self) -> impl Iterator<Item = anyhow::Result<IndexRow>> + '_ {
        self.inner.records().map(|record| {
            let record = record.context("reading index row")?;
            Ok(IndexRow::new(record.iter().map(ToString::to_string).collect()))
        })
    }
}

#[derive(Debug, Clone)]
pub struct DetailStore {
    dir: PathBuf,
}

impl DetailStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating detail directory {}", self.dir.display()))
    }

    pub fn path_for(&self, id: &str) -> anyhow::Result<PathBuf> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            bail!("record identifier {id:?} is not a valid file name");
        }
        Ok(self.dir.join(id))
    }

    /// Persist a document via temp file + rename; an existing document is replaced.
    pub async fn write(&self, document: &DetailDocument) -> anyhow::Result<PathBuf> {
        let path = self.path_for(&document.id_paket)?;
        let bytes = serde_json::to_vec(document).context("serializing detail document")?;

        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp detail file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp detail file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp detail file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp detail {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(path)
    }

    pub async fn read(path: impl AsRef<Path>) -> anyhow::Result<DetailDocument> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }

    pub async fn list(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("reading {}", self.dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }
}

pub fn format_error_line(key: &str, message: &str) -> String {
    let message = message.replace(['\r', '\n'], " ");
    format!("{key}|{message}\n")
}

pub async fn append_error_line(path: impl AsRef<Path>, key: &str, message: &str) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening error log {}", path.display()))?;
    file.write_all(format_error_line(key, message).as_bytes())
        .await
        .with_context(|| format!("appending to error log {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

#[derive(Debug)]
struct ErrorLine {
    key: String,
    message: String,
}

/// Single-writer error log: producers send lines, one task appends them.
///
/// The file is only created once the first line arrives.
pub struct ErrorLog {
    tx: mpsc::UnboundedSender<ErrorLine>,
    task: JoinHandle<anyhow::Result<usize>>,
}

#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::UnboundedSender<ErrorLine>,
}

impl ErrorLog {
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<ErrorLine>();
        let task = tokio::spawn(async move {
            let mut file: Option<fs::File> = None;
            let mut written = 0usize;
            while let Some(line) = rx.recv().await {
                if file.is_none() {
                    let opened = fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                        .with_context(|| format!("opening error log {}", path.display()))?;
                    file = Some(opened);
                }
                if let Some(f) = file.as_mut() {
                    f.write_all(format_error_line(&line.key, &line.message).as_bytes())
                        .await
                        .with_context(|| format!("appending to error log {}", path.display()))?;
                    written += 1;
                }
            }
            if let Some(mut f) = file {
                f.flush().await?;
            }
            Ok::<usize, anyhow::Error>(written)
        });
        Self { tx, task }
    }

    pub fn sink(&self) -> ErrorSink {
        ErrorSink {
            tx: self.tx.clone(),
        }
    }

    pub async fn close(self) -> anyhow::Result<usize> {
        drop(self.tx);
        self.task.await.context("error log writer task failed")?
    }
}

impl ErrorSink {
    pub fn record(&self, key: impl Into<String>, message: impl Into<String>) {
        let _ = self.tx.send(ErrorLine {
            key: key.into(),
            message: message.into(),
        });
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn copy_verified(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> anyhow::Result<String> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    fs::copy(src, dst)
        .await
        .with_context(|| format!("copying {} -> {}", src.display(), dst.display()))?;
    let expected = sha256_hex(
        &fs::read(src)
            .await
            .with_context(|| format!("reading {}", src.display()))?,
    );
    let actual = sha256_hex(
        &fs::read(dst)
            .await
            .with_context(|| format!("reading {}", dst.display()))?,
    );
    if expected != actual {
        bail!(
            "copy of {} to {} does not match (sha256 {} != {})",
            src.display(),
            dst.display(),
            expected,
            actual
        );
    }
    Ok(actual)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule for transient failures. `max_retries == 0` means one attempt.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_invalid_certs: bool,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            accept_invalid_certs: true,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

impl HttpFetcher {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send(url, || self.client.get(url))
            .instrument(info_span!("http_get", url))
            .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send(url, || self.client.post(url).form(form))
            .instrument(info_span!("http_post", url))
            .await
    }

    async fn send<F>(&self, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(url, attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpse_core::FieldValue;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn folder_names_follow_netloc() {
        assert_eq!(
            HostLayout::folder_name("https://LPSE.Example.go.id/eproc4", RecordKind::Tender),
            "lpse_example_go_id_tender"
        );
        assert_eq!(
            HostLayout::folder_name("lpse.example.go.id", RecordKind::NonTender),
            "lpse_example_go_id_non_tender"
        );
        assert_eq!(
            HostLayout::folder_name("lpse.example.go.id/eproc4", RecordKind::Tender),
            "lpse_example_go_id_tender"
        );
        assert_eq!(
            HostLayout::folder_name("http://127.0.0.1:8080", RecordKind::Tender),
            "127_0_0_1:8080_tender"
        );
    }

    #[test]
    fn layout_paths() {
        let layout = HostLayout::new("/out", "lpse.a.go.id", RecordKind::Tender);
        assert_eq!(layout.index_path(), PathBuf::from("/out/lpse_a_go_id_tender/index"));
        assert_eq!(layout.detail_dir(), PathBuf::from("/out/lpse_a_go_id_tender/detil"));
        assert_eq!(
            layout.detail_error_log(),
            PathBuf::from("/out/lpse_a_go_id_tender/detil.err")
        );
        assert_eq!(layout.final_dataset_path(), PathBuf::from("/out/lpse_a_go_id_tender.csv"));
        assert_eq!(
            layout.final_error_log_path(),
            PathBuf::from("/out/lpse_a_go_id_tender_error.log")
        );
        assert_eq!(layout.run_error_log(), PathBuf::from("/out/error.log"));
    }

    #[test]
    fn index_round_trip_preserves_delimiters_and_quotes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("host").join(INDEX_FILE);
        let rows = vec![
            IndexRow::new(vec!["1".into(), "Jalan | Jembatan".into(), "say \"hi\"".into()]),
            IndexRow::new(vec!["2".into(), String::new(), "line\nbreak".into()]),
        ];

        let mut writer = IndexWriter::create(&path).expect("writer");
        writer.append(&rows).expect("append");
        assert_eq!(writer.rows_written(), 2);
        drop(writer);

        let raw = std::fs::read_to_string(&path).expect("raw");
        assert!(raw.starts_with("\"1\"|\"Jalan | Jembatan\"|\"say \"\"hi\"\"\"\r\n"));

        let mut reader = IndexReader::open(&path).expect("reader");
        let back = reader.rows().collect::<anyhow::Result<Vec<_>>>().expect("rows");
        assert_eq!(back, rows);
    }

    #[tokio::test]
    async fn detail_store_writes_atomically_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = DetailStore::new(dir.path().join(DETAIL_DIR));
        store.ensure_dir().await.expect("dir");

        let mut doc = DetailDocument::new("123");
        store.write(&doc).await.expect("first write");
        doc.pemenang = Some([("npwp".to_string(), FieldValue::from("01"))].into());
        let path = store.write(&doc).await.expect("second write");

        assert_eq!(DetailStore::read(&path).await.expect("read"), doc);
        assert_eq!(store.list().await.expect("list"), vec![path]);
    }

    #[tokio::test]
    async fn detail_store_rejects_path_like_ids() {
        let store = DetailStore::new("/tmp/unused");
        assert!(store.write(&DetailDocument::new("../x")).await.is_err());
        assert!(store.path_for("").is_err());
    }

    #[tokio::test]
    async fn error_log_serializes_concurrent_lines() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(DETAIL_ERROR_LOG);
        let log = ErrorLog::spawn(&path);

        let mut handles = Vec::new();
        for i in 0..16 {
            let sink = log.sink();
            handles.push(tokio::spawn(async move {
                sink.record(i.to_string(), format!("failure\nnumber {i}"));
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        assert_eq!(log.close().await.expect("close"), 16);
        let text = std::fs::read_to_string(&path).expect("read");
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 16);
        assert!(lines.iter().all(|l| l.contains("|failure number ")));
    }

    #[tokio::test]
    async fn error_log_without_lines_creates_no_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(DETAIL_ERROR_LOG);
        let log = ErrorLog::spawn(&path);
        assert_eq!(log.close().await.expect("close"), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn copy_verified_returns_digest() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        std::fs::write(&src, b"hello world").expect("write");
        let digest = copy_verified(&src, &dst).await.expect("copy");
        assert_eq!(digest, sha256_hex(b"hello world"));
        assert_eq!(std::fs::read(&dst).expect("read"), b"hello world");
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::default().max_retries, 0);
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    async fn hits(server: &wiremock::MockServer, route: &str) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == route)
            .count()
    }

    #[tokio::test]
    async fn default_fetcher_makes_a_single_attempt() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/detail"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&HttpClientConfig::default()).unwrap();
        let err = fetcher
            .get(&format!("{}/detail", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
        assert_eq!(hits(&server, "/detail").await, 1);
    }

    #[tokio::test]
    async fn opt_in_retries_recover_from_server_errors() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/detail"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/detail"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let config = HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
            },
            ..Default::default()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();
        let response = fetcher.get(&format!("{}/detail", server.uri())).await.unwrap();
        assert_eq!(response.text(), "ok");
        assert_eq!(hits(&server, "/detail").await, 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
            },
            ..Default::default()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();
        assert!(fetcher.get(&format!("{}/missing", server.uri())).await.is_err());
        assert_eq!(hits(&server, "/missing").await, 1);
    }
}
