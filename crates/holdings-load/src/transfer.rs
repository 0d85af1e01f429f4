//! Bulk transfer of one partition group via `COPY ... FROM STDIN`
//!
//! # Wire format
//!
//! CSV, comma delimited, no header row, one line per record, columns in
//! [`HOLDING_COLUMNS`] order. SQL NULL is the unquoted token `\N`. A field is
//! quoted (RFC 4180, `"` doubled) when it contains the delimiter, a quote,
//! CR/LF, is empty, or is literally `\N`, so text values never collide with
//! NULL.
//!
//! # Atomicity
//!
//! A group is encoded completely before the store is touched, then copied in a
//! single transaction. Any failure rolls that transaction back: a group is
//! either fully committed or not at all.

use bytes::Bytes;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::connection::{Connection, Transaction};
use crate::dialect::{PostgresDialect, SqlDialect, COPY_NULL};
use crate::error::{Error, Result, TransferError};
use crate::loader::millis;
use crate::types::{HoldingRecord, PartitionKey, PartitionedTable, HOLDING_COLUMNS};

const DELIMITER: char = ',';
const QUOTE: char = '"';
const LINE_ENDING: &str = "\n";

/// Serialises records into the COPY CSV stream
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyEncoder;

impl CopyEncoder {
    /// Create an encoder
    pub fn new() -> Self {
        Self
    }

    /// Encode a whole group.
    ///
    /// Every record must belong to `key`; `period_start` is taken from the
    /// record's own period.
    pub fn encode(&self, key: PartitionKey, rows: &[HoldingRecord]) -> Result<Bytes> {
        // Rough per-row size keeps reallocations rare on large groups
        let mut out = String::with_capacity(rows.len() * 160);
        for (row, record) in rows.iter().enumerate() {
            let record_key = record
                .partition_key()
                .map_err(|e| Error::validation(Some(row), e.to_string()))?;
            if record_key != key {
                return Err(Error::validation(
                    Some(row),
                    format!("record for {record_key} in group {key}"),
                ));
            }
            self.encode_row(&mut out, record_key, record);
        }
        Ok(Bytes::from(out))
    }

    /// Append one CSV line for `record`
    pub fn encode_row(&self, out: &mut String, key: PartitionKey, record: &HoldingRecord) {
        let fields: [Option<String>; 12] = [
            record.accessionnumber.clone(),
            record.infotablesk.clone(),
            record.nameofissuer.clone(),
            record.cusip.clone(),
            record.value.as_ref().map(Decimal::to_string),
            record.sshprnamt.map(|v| v.to_string()),
            record.filingdate.map(format_date),
            record.cik.clone(),
            record.value_per_share.as_ref().map(Decimal::to_string),
            record.year.map(|v| v.to_string()),
            record.quarter.map(|v| v.to_string()),
            Some(format_date(key.period_start())),
        ];
        debug_assert_eq!(fields.len(), HOLDING_COLUMNS.len());

        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(DELIMITER);
            }
            match field {
                Some(value) => push_field(out, value),
                None => out.push_str(COPY_NULL),
            }
        }
        out.push_str(LINE_ENDING);
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Write a value, quoting according to RFC 4180 where needed
fn push_field(out: &mut String, field: &str) {
    let needs_quoting = field.is_empty()
        || field == COPY_NULL
        || field.contains(DELIMITER)
        || field.contains(QUOTE)
        || field.contains('\n')
        || field.contains('\r');

    if needs_quoting {
        out.push(QUOTE);
        for c in field.chars() {
            if c == QUOTE {
                out.push(QUOTE);
            }
            out.push(c);
        }
        out.push(QUOTE);
    } else {
        out.push_str(field);
    }
}

/// Copies partition groups into the parent table.
///
/// The COPY targets the parent; the store routes every row into the child
/// partition matching its `period_start`.
#[derive(Clone)]
pub struct BulkTransfer {
    dialect: Arc<dyn SqlDialect>,
    encoder: CopyEncoder,
}

impl Default for BulkTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BulkTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkTransfer")
            .field("dialect", &self.dialect.name())
            .finish()
    }
}

impl BulkTransfer {
    /// Transfer engine using the PostgreSQL dialect
    pub fn new() -> Self {
        Self::with_dialect(Arc::new(PostgresDialect))
    }

    /// Transfer engine with a custom dialect
    pub fn with_dialect(dialect: Arc<dyn SqlDialect>) -> Self {
        Self {
            dialect,
            encoder: CopyEncoder,
        }
    }

    /// Copy `rows` (all belonging to `key`) in one transaction.
    ///
    /// Returns the number of rows committed. An empty group returns `0`
    /// without touching `conn`.
    pub async fn transfer(
        &self,
        conn: &dyn Connection,
        table: &PartitionedTable,
        key: PartitionKey,
        rows: &[HoldingRecord],
    ) -> std::result::Result<u64, TransferError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let fail = |e: Error| TransferError::new(table.qualified_name(), key, rows.len(), e);
        let start = Instant::now();

        let data = self.encoder.encode(key, rows).map_err(fail)?;
        let sql = self.dialect.copy_in_sql(table, &HOLDING_COLUMNS);
        debug!(
            table = %table,
            partition = %key,
            rows = rows.len(),
            bytes = data.len(),
            "starting COPY"
        );

        let tx = conn.begin().await.map_err(fail)?;
        let copied = match tx.copy_in(&sql, data).await {
            Ok(n) => n,
            Err(e) => {
                abandon(tx).await;
                return Err(fail(e));
            }
        };
        tx.commit().await.map_err(fail)?;

        debug!(
            table = %table,
            partition = %key,
            rows = copied,
            elapsed_ms = millis(start.elapsed()),
            "COPY committed"
        );
        Ok(copied)
    }
}

async fn abandon(tx: Box<dyn Transaction>) {
    if let Err(e) = tx.rollback().await {
        debug!(error = %e, "rollback after failed COPY also failed");
    }
}
