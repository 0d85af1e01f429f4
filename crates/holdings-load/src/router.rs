//! Grouping of record batches by reporting period

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::types::{HoldingRecord, PartitionKey};

/// Splits a batch into per-partition sub-batches.
///
/// Routing is all-or-nothing: the first record without a valid period fails
/// the whole batch with [`Error::Validation`] carrying its row index.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionRouter;

impl PartitionRouter {
    /// Create a router
    pub fn new() -> Self {
        Self
    }

    /// Group `batch` by partition key.
    ///
    /// Each group keeps the records in input order; groups iterate by
    /// ascending key.
    pub fn route(
        &self,
        batch: Vec<HoldingRecord>,
    ) -> Result<BTreeMap<PartitionKey, Vec<HoldingRecord>>> {
        let keys = batch
            .iter()
            .enumerate()
            .map(|(row, record)| key_at(row, record))
            .collect::<Result<Vec<_>>>()?;

        let mut groups: BTreeMap<PartitionKey, Vec<HoldingRecord>> = BTreeMap::new();
        for (key, record) in keys.into_iter().zip(batch) {
            groups.entry(key).or_default().push(record);
        }
        Ok(groups)
    }

    /// Distinct partition keys of `batch`
    pub fn keys(&self, batch: &[HoldingRecord]) -> Result<BTreeSet<PartitionKey>> {
        batch
            .iter()
            .enumerate()
            .map(|(row, record)| key_at(row, record))
            .collect()
    }
}

fn key_at(row: usize, record: &HoldingRecord) -> Result<PartitionKey> {
    record.partition_key().map_err(|e| match e {
        Error::Validation { message, .. } => Error::validation(Some(row), message),
        other => other,
    })
}
