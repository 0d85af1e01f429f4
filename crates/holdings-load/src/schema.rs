//! Schema management for the partitioned holdings table
//!
//! Provides:
//! - Parent table creation (`PARTITION BY RANGE (period_start)`)
//! - Per-period child partition creation, serialised by an advisory lock
//! - Offline planning of partition names and bounds

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, Transaction};
use crate::dialect::{PostgresDialect, SqlDialect};
use crate::error::{Error, ErrorCategory, Result};
use crate::types::{PartitionKey, PartitionSpec, PartitionedTable, HOLDING_COLUMNS};

const PARTITION_SAVEPOINT: &str = "partition_ddl";

/// Outcome of [`SchemaManager::ensure_partitions`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsureReport {
    /// Partitions created by this call
    pub created: Vec<PartitionKey>,
    /// Partitions that were already present
    pub existing: Vec<PartitionKey>,
    /// Partitions that could not be created, with the reason
    pub failed: BTreeMap<PartitionKey, String>,
}

impl EnsureReport {
    /// Whether every requested partition is now present
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Whether `key` is usable for a transfer
    pub fn is_available(&self, key: &PartitionKey) -> bool {
        !self.failed.contains_key(key)
    }

    /// Number of partitions created by this call
    pub fn created_count(&self) -> usize {
        self.created.len()
    }
}

/// Creates the parent table and its quarterly partitions on demand.
///
/// Every operation is idempotent. Tables are never dropped.
#[derive(Clone)]
pub struct SchemaManager {
    dialect: Arc<dyn SqlDialect>,
}

impl Default for SchemaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SchemaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaManager")
            .field("dialect", &self.dialect.name())
            .finish()
    }
}

impl SchemaManager {
    /// Schema manager using the PostgreSQL dialect
    pub fn new() -> Self {
        Self::with_dialect(Arc::new(PostgresDialect))
    }

    /// Schema manager with a custom dialect
    pub fn with_dialect(dialect: Arc<dyn SqlDialect>) -> Self {
        Self { dialect }
    }

    /// Planned partitions for `keys`, ascending, without touching the store
    pub fn partition_specs(
        &self,
        table: &PartitionedTable,
        keys: &BTreeSet<PartitionKey>,
    ) -> Vec<PartitionSpec> {
        keys.iter().map(|key| table.partition_for(*key)).collect()
    }

    /// Create the parent table if it is missing.
    ///
    /// Returns `true` when this call created it. A concurrent creator winning
    /// the race is not an error.
    pub async fn ensure_parent_table(
        &self,
        conn: &dyn Connection,
        table: &PartitionedTable,
    ) -> Result<bool> {
        let params = [table.schema.as_str(), table.name.as_str()];
        let exists = conn
            .query_flag(self.dialect.table_exists_sql(), &params)
            .await?;
        if exists {
            debug!(table = %table, "parent table present");
            return Ok(false);
        }

        let sql = self
            .dialect
            .create_partitioned_table_sql(table, &HOLDING_COLUMNS);
        let tx = conn.begin().await?;

        if let Err(e) = tx.execute(&sql, &[]).await {
            abandon(tx).await;
            if e.category() == ErrorCategory::Connection {
                return Err(e);
            }
            if e.is_already_exists() {
                debug!(table = %table, "parent table created concurrently");
                return Ok(false);
            }
            return Err(Error::schema_with_source(table.qualified_name(), e));
        }

        match tx.commit().await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => return Ok(false),
            Err(e) => return Err(e),
        }

        info!(table = %table, "created partitioned parent table");
        Ok(true)
    }

    /// Create every missing partition in `keys`.
    ///
    /// Runs in one transaction holding an advisory lock on the parent table
    /// name. Each partition's existence check and creation run under their
    /// own savepoint, so one bad partition does not poison the rest. Only
    /// connection failures are returned as errors; anything else that breaks
    /// the whole transaction marks every key not already present as failed.
    pub async fn ensure_partitions(
        &self,
        conn: &dyn Connection,
        table: &PartitionedTable,
        keys: &BTreeSet<PartitionKey>,
    ) -> Result<EnsureReport> {
        let mut report = EnsureReport::default();
        if keys.is_empty() {
            return Ok(report);
        }

        let lock_name = table.qualified_name();
        let tx = conn.begin().await?;
        if let Err(e) = tx
            .execute(self.dialect.advisory_lock_sql(), &[lock_name.as_str()])
            .await
        {
            abandon(tx).await;
            return give_up(report, table, keys, "partition lock not acquired", e);
        }

        for spec in self.partition_specs(table, keys) {
            if let Err(e) = tx.savepoint(PARTITION_SAVEPOINT).await {
                abandon(tx).await;
                return give_up(report, table, keys, "partition transaction unusable", e);
            }

            let result = self.ensure_partition(tx.as_ref(), table, &spec).await;
            let settled = match &result {
                Ok(_) => tx.release_savepoint(PARTITION_SAVEPOINT).await,
                Err(e) if e.category() == ErrorCategory::Connection => Ok(()),
                Err(_) => tx.rollback_to_savepoint(PARTITION_SAVEPOINT).await,
            };
            if let Err(e) = settled {
                abandon(tx).await;
                return give_up(report, table, keys, "partition transaction unusable", e);
            }

            match result {
                Ok(true) => {
                    info!(
                        table = %table,
                        partition = %spec.name,
                        start = %spec.start,
                        end = %spec.end,
                        "created partition"
                    );
                    report.created.push(spec.key);
                }
                Ok(false) => report.existing.push(spec.key),
                Err(e) if e.category() == ErrorCategory::Connection => {
                    abandon(tx).await;
                    return Err(e);
                }
                Err(e) if e.is_already_exists() => {
                    debug!(partition = %spec.name, "partition created concurrently");
                    report.existing.push(spec.key);
                }
                Err(e) => {
                    warn!(
                        table = %table,
                        partition = %spec.name,
                        start = %spec.start,
                        end = %spec.end,
                        error = %e,
                        "failed to create partition"
                    );
                    report.failed.insert(spec.key, e.to_string());
                }
            }
        }

        match tx.commit().await {
            Ok(()) => Ok(report),
            Err(e) => give_up(report, table, keys, "partition DDL not committed", e),
        }
    }

    /// One partition, inside the caller's savepoint. `Ok(false)` means it
    /// was already there.
    async fn ensure_partition(
        &self,
        tx: &dyn Transaction,
        table: &PartitionedTable,
        spec: &PartitionSpec,
    ) -> Result<bool> {
        let qualified = format!("{}.{}", table.schema, spec.name);
        let params = [table.schema.as_str(), spec.name.as_str()];
        let exists = tx
            .query_flag(self.dialect.table_exists_sql(), &params)
            .await
            .map_err(|e| schema_error(&qualified, e))?;
        if exists {
            debug!(partition = %spec.name, "partition present");
            return Ok(false);
        }

        let sql = self.dialect.create_partition_sql(table, spec);
        tx.execute(&sql, &[])
            .await
            .map_err(|e| schema_error(&qualified, e))?;
        Ok(true)
    }
}

/// Keep connection errors as they are so callers can tell a lost session
fn schema_error(table: &str, e: Error) -> Error {
    if e.category() == ErrorCategory::Connection {
        e
    } else {
        Error::schema_with_source(table, e)
    }
}

/// The partition transaction is gone. Partitions it created went with it;
/// only those already committed by someone else remain usable.
fn give_up(
    mut report: EnsureReport,
    table: &PartitionedTable,
    keys: &BTreeSet<PartitionKey>,
    what: &str,
    e: Error,
) -> Result<EnsureReport> {
    if e.category() == ErrorCategory::Connection {
        return Err(e);
    }
    error!(table = %table, error = %e, "{}", what);

    let reason = format!("{what}: {e}");
    report.created.clear();
    for key in keys {
        if !report.existing.contains(key) {
            report.failed.entry(*key).or_insert_with(|| reason.clone());
        }
    }
    Ok(report)
}

/// Roll back a transaction whose failure is already being reported
async fn abandon(tx: Box<dyn Transaction>) {
    if let Err(e) = tx.rollback().await {
        debug!(error = %e, "rollback after failure also failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_specs_are_ordered() {
        let table = PartitionedTable::public("t").unwrap();
        let keys: BTreeSet<_> = [(2024, 2), (2023, 4), (2024, 1)]
            .into_iter()
            .map(|(y, q)| PartitionKey::new(y, q).unwrap())
            .collect();

        let specs = SchemaManager::new().partition_specs(&table, &keys);
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["t_2023_q4", "t_2024_q1", "t_2024_q2"]);

        for pair in specs.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_ensure_report() {
        let q1 = PartitionKey::new(2024, 1).unwrap();
        let q2 = PartitionKey::new(2024, 2).unwrap();
        let mut report = EnsureReport {
            created: vec![q1],
            ..Default::default()
        };
        assert!(report.is_complete());
        assert_eq!(report.created_count(), 1);

        report.failed.insert(q2, "overlap".into());
        assert!(!report.is_complete());
        assert!(report.is_available(&q1));
        assert!(!report.is_available(&q2));
    }

    #[test]
    fn test_debug_shows_dialect() {
        let debug = format!("{:?}", SchemaManager::default());
        assert!(debug.contains("PostgreSQL"));
    }
}
