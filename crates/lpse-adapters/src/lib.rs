//! Catalog client contract, the SPSE v4 client, and the rotating client pool.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use lpse_core::{DetailDocument, FieldValue, IndexRow, RecordKind, Section, LOCATION_COLUMN};
use lpse_storage::{FetchError, HttpClientConfig, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "lpse-adapters";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed listing response from {url}: {reason}")]
    MalformedListing { url: String, reason: String },
    #[error("html parse error: {0}")]
    Html(String),
    #[error("client pool for {host} is empty")]
    EmptyPool { host: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub host: String,
    pub version: Option<String>,
    pub last_update: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListingPage {
    pub records_total: u64,
    pub rows: Vec<IndexRow>,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    fn host(&self) -> &str;
    fn kind(&self) -> RecordKind;
    fn detected_version(&self) -> Option<&str>;
    fn last_update(&self) -> Option<&str>;

    async fn fetch_listing(&self, offset: u64, limit: u64) -> Result<ListingPage, ClientError>;

    async fn fetch_detail(&self, id: &str) -> Result<DetailDocument, ClientError>;

    async fn record_count(&self) -> Result<u64, ClientError> {
        Ok(self.fetch_listing(0, 0).await?.records_total)
    }
}

pub fn normalize_host(host: &str) -> String {
    let mut normalized = host.trim().trim_end_matches('/').to_string();
    if !normalized.contains("://") {
        normalized = format!("http://{normalized}");
    }
    if !normalized.ends_with("/eproc4") {
        normalized.push_str("/eproc4");
    }
    normalized
}

fn listing_path(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Tender => "dt/lelang",
        RecordKind::NonTender => "dt/pl",
    }
}

fn token_path(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Tender => "lelang",
        RecordKind::NonTender => "nontender",
    }
}

fn announcement_path(kind: RecordKind, id: &str) -> String {
    match kind {
        RecordKind::Tender => format!("lelang/{id}/pengumumanlelang"),
        RecordKind::NonTender => format!("nontender/{id}/pengumumanpl"),
    }
}

fn winner_path(kind: RecordKind, id: &str) -> String {
    match kind {
        RecordKind::Tender => format!("evaluasi/{id}/pemenang"),
        RecordKind::NonTender => format!("nontender/{id}/pemenang"),
    }
}

#[derive(Debug)]
pub struct SpseClient {
    http: HttpFetcher,
    kind: RecordKind,
    info: HostInfo,
    auth_token: Option<String>,
}

impl SpseClient {
    pub async fn connect(
        host: &str,
        kind: RecordKind,
        config: &HttpClientConfig,
    ) -> Result<Self, ClientError> {
        let host = normalize_host(host);
        let http = HttpFetcher::new(config)?;
        let landing = http.get(&host).await?.text();
        let (version, last_update) = detect_host_info(&landing);
        let info = HostInfo {
            host,
            version,
            last_update,
        };
        Self::open_session(http, kind, info).await
    }

    pub async fn with_info(
        info: HostInfo,
        kind: RecordKind,
        config: &HttpClientConfig,
    ) -> Result<Self, ClientError> {
        let http = HttpFetcher::new(config)?;
        Self::open_session(http, kind, info).await
    }

    async fn open_session(
        http: HttpFetcher,
        kind: RecordKind,
        info: HostInfo,
    ) -> Result<Self, ClientError> {
        let token_url = format!("{}/{}", info.host, token_path(kind));
        let auth_token = extract_auth_token(&http.get(&token_url).await?.text());
        debug!(host = %info.host, has_token = auth_token.is_some(), "opened SPSE session");
        Ok(Self {
            http,
            kind,
            info,
            auth_token,
        })
    }

    pub fn info(&self) -> &HostInfo {
        &self.info
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.info.host, path)
    }
}

#[async_trait]
impl CatalogClient for SpseClient {
    fn host(&self) -> &str {
        &self.info.host
    }

    fn kind(&self) -> RecordKind {
        self.kind
    }

    fn detected_version(&self) -> Option<&str> {
        self.info.version.as_deref()
    }

    fn last_update(&self) -> Option<&str> {
        self.info.last_update.as_deref()
    }

    async fn fetch_listing(&self, offset: u64, limit: u64) -> Result<ListingPage, ClientError> {
        let url = self.url(listing_path(self.kind));
        let mut form = vec![
            ("draw", "1".to_string()),
            ("start", offset.to_string()),
            ("length", limit.to_string()),
        ];
        if let Some(token) = &self.auth_token {
            form.push(("authenticityToken", token.clone()));
        }
        let response = self.http.post_form(&url, &form).await?;
        parse_listing(&response.body).map_err(|reason| ClientError::MalformedListing { url, reason })
    }

    async fn fetch_detail(&self, id: &str) -> Result<DetailDocument, ClientError> {
        let announcement = self.http.get(&self.url(&announcement_path(self.kind, id))).await?;
        let pengumuman = parse_announcement(&announcement.text())?;
        let winner = self.http.get(&self.url(&winner_path(self.kind, id))).await?;
        let pemenang = parse_winner(&winner.text())?;
        Ok(DetailDocument {
            id_paket: id.to_string(),
            pengumuman,
            pemenang,
        })
    }
}

#[derive(Clone)]
pub struct ClientPool {
    handles: Vec<Arc<dyn CatalogClient>>,
}

impl ClientPool {
    pub fn from_handles(handles: Vec<Arc<dyn CatalogClient>>) -> Result<Self, ClientError> {
        if handles.is_empty() {
            return Err(ClientError::EmptyPool {
                host: "<none>".to_string(),
            });
        }
        Ok(Self { handles })
    }

    pub async fn connect(
        host: &str,
        kind: RecordKind,
        size: usize,
        config: &HttpClientConfig,
    ) -> Result<Self, ClientError> {
        if size == 0 {
            return Err(ClientError::EmptyPool {
                host: host.to_string(),
            });
        }
        let first = SpseClient::connect(host, kind, config).await?;
        let info = first.info().clone();
        let mut handles: Vec<Arc<dyn CatalogClient>> = Vec::with_capacity(size);
        handles.push(Arc::new(first));
        for _ in 1..size {
            handles.push(Arc::new(SpseClient::with_info(info.clone(), kind, config).await?));
        }
        info!(host = %info.host, size, "client pool ready");
        Ok(Self { handles })
    }

    pub fn handle(&self, page: usize) -> Arc<dyn CatalogClient> {
        Arc::clone(&self.handles[page % self.handles.len()])
    }

    pub fn primary(&self) -> Arc<dyn CatalogClient> {
        self.handle(0)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn host(&self) -> &str {
        self.handles[0].host()
    }

    pub fn kind(&self) -> RecordKind {
        self.handles[0].kind()
    }

    pub fn detected_version(&self) -> Option<&str> {
        self.handles[0].detected_version()
    }

    pub fn last_update(&self) -> Option<&str> {
        self.handles[0].last_update()
    }
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)SPSE\s*v?(\d+(?:\.\d+)*[a-z0-9]*)").expect("static version pattern")
    })
}

fn last_update_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)last\s*update\s*:?\s*([^<\r\n]+)").expect("static last update pattern")
    })
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"authenticityToken\s*=\s*'([A-Za-z0-9]+)'").expect("static token pattern")
    })
}

pub fn detect_host_info(html: &str) -> (Option<String>, Option<String>) {
    let version = version_pattern()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let last_update = last_update_pattern()
        .captures(html)
        .and_then(|c| c.get(1))
        .and_then(|m| text_or_none(m.as_str()));
    (version, last_update)
}

pub fn extract_auth_token(html: &str) -> Option<String> {
    token_pattern()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataTablesResponse {
    records_total: JsonValue,
    #[serde(default)]
    data: Vec<Vec<JsonValue>>,
}

fn json_cell(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn parse_listing(body: &[u8]) -> Result<ListingPage, String> {
    let response: DataTablesResponse = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let records_total = match &response.records_total {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| format!("recordsTotal is not a count: {}", response.records_total))?;
    let rows = response
        .data
        .iter()
        .map(|row| IndexRow::new(row.iter().map(json_cell).collect()))
        .collect();
    Ok(ListingPage {
        records_total,
        rows,
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    text_or_none(&element.text().collect::<String>()).unwrap_or_default()
}

fn selector(css: &str) -> Result<Selector, ClientError> {
    Selector::parse(css).map_err(|e| ClientError::Html(e.to_string()))
}

pub fn normalize_key(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Rows of `table` itself, skipping rows of tables nested inside it.
fn own_rows<'a>(table: ElementRef<'a>, tr: &Selector) -> Vec<ElementRef<'a>> {
    table
        .select(tr)
        .filter(|row| {
            row.ancestors()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "table")
                .map(|owner| owner.id() == table.id())
                .unwrap_or(false)
        })
        .collect()
}

fn cells(row: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| matches!(el.value().name(), "th" | "td"))
        .collect()
}

fn location_value(cell: ElementRef<'_>, li: &Selector) -> FieldValue {
    let items = cell
        .select(li)
        .filter_map(|item| text_or_none(&item.text().collect::<String>()))
        .collect::<Vec<_>>();
    if items.is_empty() {
        FieldValue::List(text_or_none(&element_text(cell)).into_iter().collect())
    } else {
        FieldValue::List(items)
    }
}

pub fn parse_announcement(html: &str) -> Result<Option<Section>, ClientError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let tr_sel = selector("tr")?;
    let li_sel = selector("li")?;

    for table in document.select(&table_sel) {
        let mut section = Section::new();
        for row in own_rows(table, &tr_sel) {
            let row_cells = cells(row);
            for pair in row_cells.windows(2) {
                let (label, value) = (pair[0], pair[1]);
                if label.value().name() != "th" || value.value().name() != "td" {
                    continue;
                }
                let key = normalize_key(&element_text(label));
                if key.is_empty() {
                    continue;
                }
                let field = if key == LOCATION_COLUMN {
                    location_value(value, &li_sel)
                } else {
                    FieldValue::Text(element_text(value))
                };
                section.entry(key).or_insert(field);
            }
        }
        if !section.is_empty() {
            return Ok(Some(section));
        }
    }
    Ok(None)
}

/// Parses a winner page: a header row naming `Nama Pemenang` and the first data row.
pub fn parse_winner(html: &str) -> Result<Option<Section>, ClientError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let tr_sel = selector("tr")?;

    for table in document.select(&table_sel) {
        let rows = own_rows(table, &tr_sel);
        let header_at = rows.iter().position(|row| {
            let row_cells = cells(*row);
            !row_cells.is_empty()
                && row_cells.iter().all(|c| c.value().name() == "th")
                && row_cells
                    .iter()
                    .any(|c| normalize_key(&element_text(*c)) == "nama_pemenang")
        });
        let Some(header_at) = header_at else {
            continue;
        };
        let keys = cells(rows[header_at])
            .into_iter()
            .map(|c| normalize_key(&element_text(c)))
            .collect::<Vec<_>>();
        let data_row = rows[header_at + 1..]
            .iter()
            .map(|row| cells(*row))
            .find(|row_cells| row_cells.iter().any(|c| c.value().name() == "td"));
        let Some(values) = data_row else {
            return Ok(None);
        };

        let section = keys
            .into_iter()
            .zip(values)
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, cell)| (key, FieldValue::Text(element_text(cell))))
            .collect::<Section>();
        return Ok(Some(section));
    }
    Ok(None)
}
