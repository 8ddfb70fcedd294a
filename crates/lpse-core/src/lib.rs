//! Core domain model for the SPSE procurement harvester: record kinds, flat
//! schemas, index rows, detail documents and the budget-year filter.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lpse-core";

pub const ID_COLUMN: &str = "id_paket";
pub const LOCATION_COLUMN: &str = "lokasi_pekerjaan";
pub const LIST_SEPARATOR: &str = " || ";

pub const TENDER_COLUMNS: [&str; 20] = [
    "id_paket",
    "kode_tender",
    "nama_tender",
    "tanggal_pembuatan",
    "keterangan",
    "tahap_tender_saat_ini",
    "instansi",
    "satuan_kerja",
    "kategori",
    "sistem_pengadaan",
    "tahun_anggaran",
    "nilai_pagu_paket",
    "nilai_hps_paket",
    "lokasi_pekerjaan",
    "npwp",
    "nama_pemenang",
    "alamat",
    "harga_penawaran",
    "harga_terkoreksi",
    "hasil_negosiasi",
];

pub const NON_TENDER_COLUMNS: [&str; 18] = [
    "id_paket",
    "kode_paket",
    "nama_paket",
    "tanggal_pembuatan",
    "keterangan",
    "tahap_paket_saat_ini",
    "instansi",
    "satuan_kerja",
    "kategori",
    "metode_pengadaan",
    "tahun_anggaran",
    "nilai_pagu_paket",
    "nilai_hps_paket",
    "lokasi_pekerjaan",
    "npwp",
    "nama_pemenang",
    "alamat",
    "hasil_negosiasi",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    #[default]
    Tender,
    NonTender,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Tender => "tender",
            RecordKind::NonTender => "non_tender",
        }
    }

    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Tender => &TENDER_COLUMNS,
            RecordKind::NonTender => &NON_TENDER_COLUMNS,
        }
    }

    pub fn stage_column(&self) -> &'static str {
        match self {
            RecordKind::Tender => "tahap_tender_saat_ini",
            RecordKind::NonTender => "tahap_paket_saat_ini",
        }
    }

    pub fn budget_year_field(&self) -> usize {
        match self {
            RecordKind::Tender => 8,
            RecordKind::NonTender => 6,
        }
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns().iter().position(|c| *c == column)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexRow {
    fields: Vec<String>,
}

impl IndexRow {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn id(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or_default()
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_fields(self) -> Vec<String> {
        self.fields
    }

    pub fn budget_years(&self, kind: RecordKind) -> Vec<i32> {
        self.field(kind.budget_year_field())
            .map(extract_years)
            .unwrap_or_default()
    }
}

impl From<Vec<String>> for IndexRow {
    fn from(fields: Vec<String>) -> Self {
        Self::new(fields)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn render(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(true) => Some("True".to_string()),
            FieldValue::Bool(false) => Some("False".to_string()),
            FieldValue::Number(n) => Some(n.to_string()),
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::List(items) => Some(items.join(LIST_SEPARATOR)),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

pub type Section = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailDocument {
    #[serde(deserialize_with = "scalar_as_string")]
    pub id_paket: String,
    #[serde(default)]
    pub pengumuman: Option<Section>,
    #[serde(default)]
    pub pemenang: Option<Section>,
}

impl DetailDocument {
    pub fn new(id_paket: impl Into<String>) -> Self {
        Self {
            id_paket: id_paket.into(),
            pengumuman: None,
            pemenang: None,
        }
    }
}

fn scalar_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Number(n) => n.to_string(),
    })
}

/// Strips the trailing ` [...]` link markup from a stage description.
///
/// Removes any trailing run of characters drawn from `{' ', '[', '.', ']'}`. Only
/// the right edge is trimmed: a leading `[...]` stays in place.
pub fn strip_stage_suffix(value: &str) -> &str {
    value.trim_end_matches([' ', '[', '.', ']'])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatRecord {
    kind: RecordKind,
    values: Vec<Option<String>>,
}

impl FlatRecord {
    pub fn empty(kind: RecordKind) -> Self {
        Self {
            kind,
            values: vec![None; kind.columns().len()],
        }
    }

    /// Normalizes a detail document onto the flat schema of `kind`.
    ///
    /// The announcement is merged first, then the winner, so winner values take
    /// precedence on overlapping columns.
    pub fn from_document(kind: RecordKind, document: &DetailDocument) -> Self {
        let mut record = Self::empty(kind);
        record.set(ID_COLUMN, Some(document.id_paket.clone()));

        if let Some(announcement) = document.pengumuman.as_ref().filter(|s| !s.is_empty()) {
            record.merge_section(announcement);
            let stage = kind.stage_column();
            if let Some(value) = record.get(stage).filter(|v| !v.is_empty()) {
                let stripped = strip_stage_suffix(value).to_string();
                record.set(stage, Some(stripped));
            }
        }

        if let Some(winner) = document.pemenang.as_ref().filter(|s| !s.is_empty()) {
            record.merge_section(winner);
        }

        record
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn merge_section(&mut self, section: &Section) {
        for (idx, column) in self.kind.columns().iter().enumerate() {
            if let Some(value) = section.get(*column) {
                self.values[idx] = value.render();
            }
        }
    }

    pub fn set(&mut self, column: &str, value: Option<String>) -> bool {
        match self.kind.column_index(column) {
            Some(idx) => {
                self.values[idx] = value;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.kind
            .column_index(column)
            .and_then(|idx| self.values[idx].as_deref())
    }

    pub fn to_row(&self) -> Vec<&str> {
        self.values
            .iter()
            .map(|v| v.as_deref().unwrap_or_default())
            .collect()
    }
}

fn year_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(20\d{2})").expect("static year pattern"))
}

pub fn extract_years(text: &str) -> Vec<i32> {
    year_pattern()
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum YearRangeError {
    #[error("empty fiscal year range")]
    Empty,
    #[error("fiscal year range '{0}' has more than two parts")]
    TooManyParts(String),
    #[error("invalid fiscal year '{0}'")]
    InvalidYear(String),
    #[error("fiscal year range {low},{high} is inverted")]
    Inverted { low: i32, high: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    low: i32,
    high: i32,
}

impl YearRange {
    pub fn new(low: i32, high: i32) -> Result<Self, YearRangeError> {
        if low > high {
            return Err(YearRangeError::Inverted { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn single(year: i32) -> Self {
        Self {
            low: year,
            high: year,
        }
    }

    pub fn low(&self) -> i32 {
        self.low
    }

    pub fn high(&self) -> i32 {
        self.high
    }

    pub fn contains(&self, year: i32) -> bool {
        self.low <= year && year <= self.high
    }

    pub fn admits(&self, years: &[i32]) -> bool {
        years.iter().any(|y| self.contains(*y))
    }

    pub fn admits_row(&self, row: &IndexRow, kind: RecordKind) -> bool {
        self.admits(&row.budget_years(kind))
    }
}

impl FromStr for YearRange {
    type Err = YearRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(YearRangeError::Empty);
        }
        let parts = trimmed.split(',').map(str::trim).collect::<Vec<_>>();
        let parse = |part: &str| {
            part.parse::<i32>()
                .map_err(|_| YearRangeError::InvalidYear(part.to_string()))
        };
        match parts.as_slice() {
            [year] => Ok(Self::single(parse(year)?)),
            [low, high] => Self::new(parse(low)?, parse(high)?),
            _ => Err(YearRangeError::TooManyParts(trimmed.to_string())),
        }
    }
}

impl fmt::Display for YearRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{},{}", self.low, self.high)
        }
    }
}
