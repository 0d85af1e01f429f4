//! Load orchestration: route, ensure schema, transfer
//!
//! [`LoadOrchestrator::load`] is the single entry point callers use:
//!
//! 1. route the batch by period (validation failures abort before any I/O)
//! 2. open a connection (failure aborts the call, nothing is written)
//! 3. ensure the parent table and the needed partitions, committed up front
//! 4. copy every group in its own transaction, sequentially or bounded-parallel
//!
//! Failures past step 3 stay local to their partition and are reported as
//! [`PartitionOutcome`] entries in the returned [`LoadReport`].

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Result, TransferError};
use crate::router::PartitionRouter;
use crate::schema::{EnsureReport, SchemaManager};
use crate::transfer::BulkTransfer;
use crate::types::{Batch, HoldingRecord, PartitionKey, PartitionedTable};

/// Upper bound on concurrent transfers (and therefore open connections)
pub const MAX_CONCURRENCY: usize = 64;

/// What happened to one partition group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PartitionOutcome {
    /// All rows committed
    Loaded {
        /// Rows committed
        rows: u64,
        /// Child partition that received them
        partition: String,
    },
    /// The transfer failed and was rolled back
    Failed {
        /// Rows in the group, none committed
        rows: usize,
        /// Failure description
        error: String,
        /// Whether re-running the load may succeed
        retriable: bool,
    },
    /// The group was never attempted
    Skipped {
        /// Rows in the group
        rows: usize,
        /// Why it was skipped
        reason: String,
    },
}

impl PartitionOutcome {
    /// Rows committed for this group
    pub fn rows_committed(&self) -> u64 {
        match self {
            Self::Loaded { rows, .. } => *rows,
            _ => 0,
        }
    }

    /// Whether the group was fully committed
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }
}

/// Result of one [`LoadOrchestrator::load`] call
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    /// Qualified parent table
    pub table: String,
    /// Per-partition outcome, ascending by key
    pub outcomes: BTreeMap<PartitionKey, PartitionOutcome>,
    /// Partitions created during this call
    pub partitions_created: Vec<PartitionKey>,
    /// Whether the parent table was created during this call
    pub parent_created: bool,
    /// Wall time of the call
    pub duration: Duration,
}

impl LoadReport {
    fn new(table: &PartitionedTable) -> Self {
        Self {
            table: table.qualified_name(),
            outcomes: BTreeMap::new(),
            partitions_created: Vec::new(),
            parent_created: false,
            duration: Duration::ZERO,
        }
    }

    /// Total rows committed across all partitions
    pub fn total_rows(&self) -> u64 {
        self.outcomes
            .values()
            .map(PartitionOutcome::rows_committed)
            .sum()
    }

    /// Keys whose rows were not committed
    pub fn failed_keys(&self) -> Vec<PartitionKey> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_loaded())
            .map(|(key, _)| *key)
            .collect()
    }

    /// Whether every group was committed
    pub fn is_complete(&self) -> bool {
        self.outcomes.values().all(PartitionOutcome::is_loaded)
    }
}

/// Load statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    /// Rows committed
    pub rows_committed: u64,
    /// Rows in failed or skipped groups
    pub rows_failed: u64,
    /// Partitions created
    pub partitions_created: u64,
    /// Successful transfers
    pub transfers_succeeded: u64,
    /// Failed transfers
    pub transfers_failed: u64,
    /// Total time spent copying (ms)
    pub total_copy_time_ms: u64,
    /// Rows per second while copying
    pub rows_per_second: f64,
}

/// Atomic counters for load statistics
#[derive(Debug, Default)]
pub struct AtomicLoadStats {
    rows_committed: AtomicU64,
    rows_failed: AtomicU64,
    partitions_created: AtomicU64,
    transfers_succeeded: AtomicU64,
    transfers_failed: AtomicU64,
    total_copy_time_ms: AtomicU64,
}

impl AtomicLoadStats {
    /// Record a committed transfer
    pub fn record_transfer(&self, rows: u64, duration: Duration) {
        self.rows_committed.fetch_add(rows, Ordering::Relaxed);
        self.transfers_succeeded.fetch_add(1, Ordering::Relaxed);
        self.total_copy_time_ms
            .fetch_add(millis(duration), Ordering::Relaxed);
    }

    /// Record a failed transfer
    pub fn record_transfer_failure(&self, rows: u64) {
        self.rows_failed.fetch_add(rows, Ordering::Relaxed);
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record rows that were never attempted
    pub fn record_skipped(&self, rows: u64) {
        self.rows_failed.fetch_add(rows, Ordering::Relaxed);
    }

    /// Record newly created partitions
    pub fn record_partitions_created(&self, count: u64) {
        self.partitions_created.fetch_add(count, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> LoadStats {
        let rows = self.rows_committed.load(Ordering::Relaxed);
        let time_ms = self.total_copy_time_ms.load(Ordering::Relaxed);
        let rps = if time_ms > 0 {
            (rows as f64 * 1000.0) / time_ms as f64
        } else {
            0.0
        };

        LoadStats {
            rows_committed: rows,
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            partitions_created: self.partitions_created.load(Ordering::Relaxed),
            transfers_succeeded: self.transfers_succeeded.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            total_copy_time_ms: time_ms,
            rows_per_second: rps,
        }
    }
}

/// Drives a batch from routing to committed rows
pub struct LoadOrchestrator {
    factory: Arc<dyn ConnectionFactory>,
    connection: ConnectionConfig,
    table: PartitionedTable,
    router: PartitionRouter,
    schema: SchemaManager,
    transfer: BulkTransfer,
    max_concurrency: usize,
    stats: AtomicLoadStats,
}

impl std::fmt::Debug for LoadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadOrchestrator")
            .field("connection", &self.connection)
            .field("table", &self.table)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl LoadOrchestrator {
    /// Create an orchestrator that loads sequentially over one connection
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        connection: ConnectionConfig,
        table: PartitionedTable,
    ) -> Self {
        Self {
            factory,
            connection,
            table,
            router: PartitionRouter,
            schema: SchemaManager::new(),
            transfer: BulkTransfer::new(),
            max_concurrency: 1,
            stats: AtomicLoadStats::default(),
        }
    }

    /// Allow up to `n` concurrent transfers, each on its own connection.
    ///
    /// Clamped to `1..=MAX_CONCURRENCY`.
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.clamp(1, MAX_CONCURRENCY);
        self
    }

    /// Target table
    pub fn table(&self) -> &PartitionedTable {
        &self.table
    }

    /// Concurrency limit in effect
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Cumulative statistics over every call on this orchestrator
    pub fn stats(&self) -> LoadStats {
        self.stats.snapshot()
    }

    /// Load a batch and return the number of rows committed
    pub async fn load_rows(&self, batch: Batch) -> Result<u64> {
        Ok(self.load(batch).await?.total_rows())
    }

    /// Create the parent table and the partitions for `keys` without loading
    pub async fn ensure_schema(&self, keys: &BTreeSet<PartitionKey>) -> Result<EnsureReport> {
        let conn = self.factory.connect(&self.connection).await?;
        let result = async {
            self.schema
                .ensure_parent_table(conn.as_ref(), &self.table)
                .await?;
            self.schema
                .ensure_partitions(conn.as_ref(), &self.table, keys)
                .await
        }
        .await;
        close(conn).await;

        if let Ok(report) = &result {
            self.stats
                .record_partitions_created(report.created.len() as u64);
        }
        result
    }

    /// Load a batch.
    ///
    /// Returns `Err` only for validation and connection failures that happen
    /// before any group is transferred. Everything later is reported per
    /// partition.
    #[instrument(skip_all, fields(table = %self.table, rows = batch.len()))]
    pub async fn load(&self, batch: Batch) -> Result<LoadReport> {
        let start = Instant::now();
        let mut report = LoadReport::new(&self.table);

        let groups = self.router.route(batch)?;
        if groups.is_empty() {
            debug!("empty batch, nothing to load");
            report.duration = start.elapsed();
            return Ok(report);
        }
        let keys: BTreeSet<PartitionKey> = groups.keys().copied().collect();

        let conn = self.factory.connect(&self.connection).await?;

        let available = match self.prepare(conn.as_ref(), &keys, &mut report).await {
            Ok(available) => available,
            Err(e) => {
                close(conn).await;
                return Err(e);
            }
        };

        let mut pending = Vec::with_capacity(groups.len());
        for (key, rows) in groups {
            match available.get(&key) {
                Some(None) => pending.push((key, rows)),
                Some(Some(reason)) => {
                    self.skip(&mut report, key, rows.len(), reason.clone());
                }
                None => self.skip(&mut report, key, rows.len(), "partition not ensured".into()),
            }
        }

        if self.max_concurrency == 1 || pending.len() <= 1 {
            self.transfer_sequential(conn.as_ref(), pending, &mut report)
                .await;
        } else {
            self.transfer_concurrent(pending, &mut report).await;
        }
        close(conn).await;

        report.duration = start.elapsed();
        if report.is_complete() {
            info!(
                rows = report.total_rows(),
                partitions = report.outcomes.len(),
                elapsed_ms = millis(report.duration),
                "load complete"
            );
        } else {
            warn!(
                rows = report.total_rows(),
                failed = ?report.failed_keys(),
                elapsed_ms = millis(report.duration),
                "load finished with failed partitions"
            );
        }
        Ok(report)
    }

    /// Ensure parent and partitions. Maps every key to `None` when usable or
    /// `Some(reason)` when its group must be skipped.
    async fn prepare(
        &self,
        conn: &dyn Connection,
        keys: &BTreeSet<PartitionKey>,
        report: &mut LoadReport,
    ) -> Result<BTreeMap<PartitionKey, Option<String>>> {
        match self.schema.ensure_parent_table(conn, &self.table).await {
            Ok(created) => report.parent_created = created,
            Err(e) if e.category().is_fatal() => return Err(e),
            Err(e) => {
                error!(error = %e, "parent table unavailable");
                let reason = format!("parent table unavailable: {e}");
                return Ok(keys.iter().map(|k| (*k, Some(reason.clone()))).collect());
            }
        }

        let ensured = match self.schema.ensure_partitions(conn, &self.table, keys).await {
            Ok(ensured) => ensured,
            Err(e) if e.category().is_fatal() => return Err(e),
            Err(e) => {
                error!(error = %e, "partitions unavailable");
                let reason = format!("partition unavailable: {e}");
                return Ok(keys.iter().map(|k| (*k, Some(reason.clone()))).collect());
            }
        };
        self.stats
            .record_partitions_created(ensured.created.len() as u64);
        report.partitions_created = ensured.created.clone();

        Ok(keys
            .iter()
            .map(|key| {
                let reason = ensured
                    .failed
                    .get(key)
                    .map(|e| format!("partition unavailable: {e}"));
                (*key, reason)
            })
            .collect())
    }

    async fn transfer_sequential(
        &self,
        conn: &dyn Connection,
        pending: Vec<(PartitionKey, Vec<HoldingRecord>)>,
        report: &mut LoadReport,
    ) {
        let mut lost: Option<String> = None;
        for (key, rows) in pending {
            if let Some(reason) = &lost {
                self.skip(report, key, rows.len(), reason.clone());
                continue;
            }

            let started = Instant::now();
            let result = self.transfer.transfer(conn, &self.table, key, &rows).await;
            if let Err(e) = &result {
                if e.is_connection_lost() {
                    lost = Some(format!("connection lost during {key}: {}", e.source));
                }
            }
            self.record(report, key, rows.len(), result, started.elapsed());
        }
    }

    async fn transfer_concurrent(
        &self,
        pending: Vec<(PartitionKey, Vec<HoldingRecord>)>,
        report: &mut LoadReport,
    ) {
        use futures::stream::{self, StreamExt};

        debug!(
            groups = pending.len(),
            concurrency = self.max_concurrency,
            "transferring concurrently"
        );

        let results: Vec<_> = stream::iter(pending)
            .map(|(key, rows)| async move {
                let started = Instant::now();
                let result = self.transfer_on_new_connection(key, &rows).await;
                (key, rows.len(), result, started.elapsed())
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (key, rows, result, elapsed) in results {
            self.record(report, key, rows, result, elapsed);
        }
    }

    async fn transfer_on_new_connection(
        &self,
        key: PartitionKey,
        rows: &[HoldingRecord],
    ) -> std::result::Result<u64, TransferError> {
        let conn = self
            .factory
            .connect(&self.connection)
            .await
            .map_err(|e| TransferError::new(self.table.qualified_name(), key, rows.len(), e))?;
        let result = self.transfer.transfer(conn.as_ref(), &self.table, key, rows).await;
        close(conn).await;
        result
    }

    fn record(
        &self,
        report: &mut LoadReport,
        key: PartitionKey,
        rows: usize,
        result: std::result::Result<u64, TransferError>,
        elapsed: Duration,
    ) {
        let outcome = match result {
            Ok(copied) => {
                self.stats.record_transfer(copied, elapsed);
                info!(
                    table = %self.table,
                    partition = %key,
                    rows = copied,
                    elapsed_ms = millis(elapsed),
                    "partition loaded"
                );
                PartitionOutcome::Loaded {
                    rows: copied,
                    partition: key.partition_name(&self.table.name),
                }
            }
            Err(e) => {
                self.stats.record_transfer_failure(rows as u64);
                error!(
                    table = %self.table,
                    partition = %key,
                    rows,
                    error = %e.source,
                    "partition transfer failed, rolled back"
                );
                PartitionOutcome::Failed {
                    rows,
                    error: e.source.to_string(),
                    retriable: e.source.is_retriable(),
                }
            }
        };
        report.outcomes.insert(key, outcome);
    }

    fn skip(&self, report: &mut LoadReport, key: PartitionKey, rows: usize, reason: String) {
        self.stats.record_skipped(rows as u64);
        warn!(
            table = %self.table,
            partition = %key,
            rows,
            reason = %reason,
            "partition skipped"
        );
        report
            .outcomes
            .insert(key, PartitionOutcome::Skipped { rows, reason });
    }
}

/// Whole milliseconds, saturating
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn close(conn: Box<dyn Connection>) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "error closing connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(year: i32, quarter: u8) -> PartitionKey {
        PartitionKey::new(year, quarter).unwrap()
    }

    #[test]
    fn test_load_stats() {
        let stats = AtomicLoadStats::default();

        stats.record_transfer(100, Duration::from_millis(200));
        stats.record_transfer(50, Duration::from_millis(100));
        stats.record_transfer_failure(5);
        stats.record_skipped(7);
        stats.record_partitions_created(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rows_committed, 150);
        assert_eq!(snapshot.rows_failed, 12);
        assert_eq!(snapshot.transfers_succeeded, 2);
        assert_eq!(snapshot.transfers_failed, 1);
        assert_eq!(snapshot.partitions_created, 2);
        assert_eq!(snapshot.total_copy_time_ms, 300);
        assert!((snapshot.rows_per_second - 500.0).abs() < 0.01);
    }

    #[test]
    fn test_report_totals() {
        let table = PartitionedTable::public("t").unwrap();
        let mut report = LoadReport::new(&table);
        assert!(report.is_complete());
        assert_eq!(report.total_rows(), 0);

        report.outcomes.insert(
            key(2024, 1),
            PartitionOutcome::Loaded {
                rows: 3,
                partition: "t_2024_q1".into(),
            },
        );
        report.outcomes.insert(
            key(2024, 2),
            PartitionOutcome::Failed {
                rows: 4,
                error: "boom".into(),
                retriable: false,
            },
        );
        report.outcomes.insert(
            key(2023, 4),
            PartitionOutcome::Skipped {
                rows: 1,
                reason: "partition unavailable".into(),
            },
        );

        assert_eq!(report.total_rows(), 3);
        assert!(!report.is_complete());
        assert_eq!(report.failed_keys(), vec![key(2023, 4), key(2024, 2)]);
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_outcome_serializes_with_status() {
        let outcome = PartitionOutcome::Skipped {
            rows: 2,
            reason: "x".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["rows"], 2);
    }
}
