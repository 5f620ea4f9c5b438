//! CSV tables produced by the crawling actor and written by pipeline stages.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::Serialize;

const UTF8_BOM: char = '\u{feff}';

/// Row of the image download table: either field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRow {
    /// Row identifier used to name the downloaded file.
    pub id: Option<String>,
    /// Image URL.
    pub url: Option<String>,
}

impl ImageRow {
    /// Convenience constructor for fully populated rows.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            url: Some(url.into()),
        }
    }
}

/// Header-addressed CSV table held in memory.
#[derive(Debug, Clone)]
pub struct MetadataTable {
    headers: Vec<String>,
    rows: Vec<StringRecord>,
}

impl MetadataTable {
    /// Parses CSV text, tolerating a leading UTF-8 byte-order mark.
    pub fn parse_str(text: &str) -> Result<Self> {
        Self::from_reader(text.trim_start_matches(UTF8_BOM).as_bytes())
    }

    /// Reads a CSV file from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut text = String::new();
        File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?
            .read_to_string(&mut text)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse_str(&text).with_context(|| format!("invalid CSV in {}", path.display()))
    }

    /// Parses CSV from any reader. Rows may be shorter than the header.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = reader
            .headers()
            .context("failed to read CSV header")?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let rows = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read CSV rows")?;
        Ok(Self { headers, rows })
    }

    /// Number of data rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no data rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in file order.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Index of a column by name.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Trimmed cell value; blank cells and unknown columns read as `None`.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column(column)?;
        self.rows
            .get(row)?
            .get(idx)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Cell value or an empty string.
    pub fn get_or_empty(&self, row: usize, column: &str) -> String {
        self.get(row, column).unwrap_or_default().to_string()
    }

    /// Projects the table onto `(id, url)` rows for the image fetcher.
    pub fn image_rows(&self, id_column: &str, url_column: &str) -> Vec<ImageRow> {
        (0..self.rows.len())
            .map(|row| ImageRow {
                id: self.get(row, id_column).map(normalize_id),
                url: self.get(row, url_column).map(str::to_string),
            })
            .collect()
    }

    /// First row whose `column` holds the numeric id `id`.
    ///
    /// Ids are compared numerically so `"42"` and `"42.0"` match.
    pub fn find_by_id(&self, column: &str, id: u64) -> Option<usize> {
        (0..self.rows.len()).find(|&row| {
            self.get(row, column)
                .and_then(parse_numeric_id)
                .is_some_and(|value| value == id)
        })
    }
}

/// Drops a trailing `.0` that spreadsheet exports add to integer ids.
fn normalize_id(raw: &str) -> String {
    match raw.strip_suffix(".0") {
        Some(stripped) if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) => {
            stripped.to_string()
        }
        _ => raw.to_string(),
    }
}

fn parse_numeric_id(raw: &str) -> Option<u64> {
    raw.parse::<u64>()
        .ok()
        .or_else(|| normalize_id(raw).parse::<u64>().ok())
}

/// Writes `records` as CSV with an explicit header so empty files still carry
/// column names.
pub fn write_csv<T: Serialize>(path: &Path, headers: &[&str], records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
    writer.write_record(headers)?;
    for record in records {
        writer
            .serialize(record)
            .with_context(|| format!("failed to write row to {}", path.display()))?;
    }
    writer.flush()?;
    Ok(())
}
