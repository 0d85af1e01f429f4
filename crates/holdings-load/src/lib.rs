//! # holdings-load
//!
//! Partitioned bulk loading of quarterly holdings filings into PostgreSQL.
//!
//! Records are grouped by reporting period, the range-partitioned parent
//! table and one child partition per quarter are created on demand, and each
//! group is streamed in with `COPY ... FROM STDIN` inside its own transaction.
//!
//! ## Features
//!
//! - **Idempotent schema**: parent and partitions are created only when missing,
//!   concurrent loaders are serialised by an advisory lock
//! - **Exact period bounds**: quarter `[start, next_start)` ranges never overlap
//! - **Isolated failures**: one partition's DDL or COPY failure never aborts the others
//! - **Bounded concurrency**: optional parallel transfers, one connection each
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use holdings_load::prelude::*;
//! use std::sync::Arc;
//!
//! let config = LoaderConfig::from_file("holdings.yaml")?;
//! let loader = config.orchestrator(Arc::new(PgConnectionFactory))?;
//!
//! let batch = vec![
//!     HoldingRecord::for_period(2024, 1),
//!     HoldingRecord::for_period(2024, 2),
//! ];
//! let report = loader.load(batch).await?;
//! assert_eq!(report.total_rows(), 2);
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` (default) - PostgreSQL backend via tokio-postgres

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod loader;
pub mod router;
pub mod schema;
pub mod security;
pub mod source;
pub mod telemetry;
pub mod transfer;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result, TransferError};

    pub use crate::types::{
        Batch, ColumnDef, HoldingRecord, PartitionKey, PartitionSpec, PartitionedTable,
        HOLDING_COLUMNS, PARTITION_COLUMN,
    };

    pub use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};

    pub use crate::dialect::{PostgresDialect, SqlDialect};

    pub use crate::schema::{EnsureReport, SchemaManager};

    pub use crate::router::PartitionRouter;

    pub use crate::transfer::{BulkTransfer, CopyEncoder};

    pub use crate::loader::{
        AtomicLoadStats, LoadOrchestrator, LoadReport, LoadStats, PartitionOutcome,
    };

    pub use crate::config::{
        DatabaseConfig, LoadSettings, LoaderConfig, SensitiveString, TargetConfig,
    };

    pub use crate::source::{CsvSource, JsonlSource, RecordSource, SourceConfig};

    pub use crate::telemetry::{init_logging, LogFormat, LoggingConfig, LoggingGuard};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::{PgConnection, PgConnectionFactory};
}

pub use error::{Error, Result};
pub use loader::{LoadOrchestrator, LoadReport};
pub use types::{HoldingRecord, PartitionKey};
