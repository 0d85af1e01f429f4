//! Record sources feeding the loader
//!
//! Extraction from the filing service itself is outside this crate; sources
//! here read records that were already extracted to local files. The set of
//! source kinds is closed and resolved from configuration:
//!
//! ```yaml
//! source:
//!   kind: csv
//!   path: ./extract/holdings.csv
//!   delimiter: ","
//! ```

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{Batch, HoldingRecord, PartitionKey};

/// Produces record batches for a set of reporting periods
pub trait RecordSource: Send {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Read records belonging to `periods`, or every record when `periods`
    /// is empty.
    ///
    /// Records without a usable period are passed through so the router can
    /// reject them with their row index.
    fn extract(&mut self, periods: &[PartitionKey]) -> Result<Batch>;
}

/// Source selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Delimited text file with a header row named after the record fields
    Csv {
        /// File to read
        path: PathBuf,
        /// Field delimiter, a single ASCII character
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
    /// One JSON record per line
    Jsonl {
        /// File to read
        path: PathBuf,
    },
}

fn default_delimiter() -> char {
    ','
}

impl SourceConfig {
    /// CSV source with the default delimiter
    pub fn csv(path: impl Into<PathBuf>) -> Self {
        Self::Csv {
            path: path.into(),
            delimiter: default_delimiter(),
        }
    }

    /// Pick a source from the file extension (`.jsonl`/`.ndjson`, otherwise CSV)
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match path.extension().and_then(|e| e.to_str()) {
            Some("jsonl") | Some("ndjson") => Self::Jsonl { path },
            _ => Self::csv(path),
        }
    }

    /// Input file
    pub fn path(&self) -> &Path {
        match self {
            Self::Csv { path, .. } | Self::Jsonl { path } => path,
        }
    }

    /// Instantiate the configured source
    pub fn open(&self) -> Result<Box<dyn RecordSource>> {
        match self {
            Self::Csv { path, delimiter } => {
                if !delimiter.is_ascii() {
                    return Err(Error::config(format!(
                        "CSV delimiter '{}' must be a single ASCII character",
                        delimiter
                    )));
                }
                Ok(Box::new(CsvSource::new(path.clone(), *delimiter as u8)))
            }
            Self::Jsonl { path } => Ok(Box::new(JsonlSource::new(path.clone()))),
        }
    }
}

fn wanted(record: &HoldingRecord, periods: &[PartitionKey]) -> bool {
    if periods.is_empty() {
        return true;
    }
    match record.partition_key() {
        Ok(key) => periods.contains(&key),
        Err(_) => true,
    }
}

/// Raw CSV row; every column is optional text and parsed explicitly so
/// decimals keep their exact scale.
#[derive(Debug, Default, Deserialize)]
struct CsvRow {
    #[serde(default)]
    accessionnumber: Option<String>,
    #[serde(default)]
    infotablesk: Option<String>,
    #[serde(default)]
    nameofissuer: Option<String>,
    #[serde(default)]
    cusip: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    sshprnamt: Option<String>,
    #[serde(default)]
    filingdate: Option<String>,
    #[serde(default)]
    cik: Option<String>,
    #[serde(default)]
    value_per_share: Option<String>,
    #[serde(default)]
    year: Option<String>,
    #[serde(default)]
    quarter: Option<String>,
}

impl CsvRow {
    fn into_record(self, line: u64) -> Result<HoldingRecord> {
        Ok(HoldingRecord {
            accessionnumber: text(self.accessionnumber),
            infotablesk: text(self.infotablesk),
            nameofissuer: text(self.nameofissuer),
            cusip: text(self.cusip),
            value: parse(self.value, "value", line)?,
            sshprnamt: parse(self.sshprnamt, "sshprnamt", line)?,
            filingdate: parse::<NaiveDate>(self.filingdate, "filingdate", line)?,
            cik: text(self.cik),
            value_per_share: parse::<Decimal>(self.value_per_share, "value_per_share", line)?,
            year: parse(self.year, "year", line)?,
            quarter: parse(self.quarter, "quarter", line)?,
        })
    }
}

fn text(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

fn parse<T>(field: Option<String>, column: &str, line: u64) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match field.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
            Error::validation(None, format!("line {line}: invalid {column} '{raw}': {e}"))
        }),
    }
}

/// Reads records from a CSV file with a header row
#[derive(Debug)]
pub struct CsvSource {
    path: PathBuf,
    delimiter: u8,
}

impl CsvSource {
    /// CSV source over `path`
    pub fn new(path: impl Into<PathBuf>, delimiter: u8) -> Self {
        Self {
            path: path.into(),
            delimiter,
        }
    }
}

impl RecordSource for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn extract(&mut self, periods: &[PartitionKey]) -> Result<Batch> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::Headers)
            .from_path(&self.path)
            .map_err(|e| Error::config(format!("cannot open {}: {}", self.path.display(), e)))?;

        let mut batch = Batch::new();
        let mut read = 0usize;
        for row in reader.deserialize::<CsvRow>() {
            let row = row.map_err(|e| Error::config(format!("{}: {}", self.path.display(), e)))?;
            // Header is line 1
            let record = row.into_record(read as u64 + 2)?;
            read += 1;
            if wanted(&record, periods) {
                batch.push(record);
            }
        }

        info!(
            source = self.name(),
            path = %self.path.display(),
            read,
            kept = batch.len(),
            "extracted records"
        );
        Ok(batch)
    }
}

/// Reads one JSON record per line; blank lines are ignored
#[derive(Debug)]
pub struct JsonlSource {
    path: PathBuf,
}

impl JsonlSource {
    /// JSON-lines source over `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSource for JsonlSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn extract(&mut self, periods: &[PartitionKey]) -> Result<Batch> {
        let reader = BufReader::new(File::open(&self.path)?);

        let mut batch = Batch::new();
        let mut read = 0usize;
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: HoldingRecord = serde_json::from_str(&line).map_err(|e| {
                Error::config(format!(
                    "{} line {}: {}",
                    self.path.display(),
                    index + 1,
                    e
                ))
            })?;
            read += 1;
            if wanted(&record, periods) {
                batch.push(record);
            }
        }

        debug!(source = self.name(), read, kept = batch.len(), "extracted records");
        Ok(batch)
    }
}
