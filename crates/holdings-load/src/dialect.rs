//! SQL generation for range-partitioned tables
//!
//! Every identifier that reaches these functions has been checked with
//! [`validate_sql_identifier`](crate::security::validate_sql_identifier) and
//! is additionally double-quoted.

use crate::security::escape_string_literal;
use crate::types::{ColumnDef, PartitionSpec, PartitionedTable, PARTITION_COLUMN};

/// Token that stands for SQL NULL in the COPY stream
pub const COPY_NULL: &str = "\\N";

/// Statement generation for the partitioned load path
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// `"schema"."table"`
    fn qualified(&self, schema: &str, table: &str) -> String {
        format!(
            "{}.{}",
            self.quote_identifier(schema),
            self.quote_identifier(table)
        )
    }

    /// Existence check, parameters are `$1 = schema`, `$2 = table`
    fn table_exists_sql(&self) -> &'static str;

    /// `CREATE TABLE ... PARTITION BY RANGE (period_start)`
    fn create_partitioned_table_sql(&self, table: &PartitionedTable, columns: &[ColumnDef])
        -> String;

    /// `CREATE TABLE child PARTITION OF parent FOR VALUES FROM (..) TO (..)`
    fn create_partition_sql(&self, table: &PartitionedTable, spec: &PartitionSpec) -> String;

    /// Transaction-scoped advisory lock, parameter `$1` is the lock name
    fn advisory_lock_sql(&self) -> &'static str;

    /// `COPY table (cols) FROM STDIN` in CSV with the `\N` NULL token
    fn copy_in_sql(&self, table: &PartitionedTable, columns: &[ColumnDef]) -> String;
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn table_exists_sql(&self) -> &'static str {
        "SELECT EXISTS(SELECT 1 FROM pg_catalog.pg_class c \
         JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
         WHERE n.nspname = $1 AND c.relname = $2)"
    }

    fn create_partitioned_table_sql(
        &self,
        table: &PartitionedTable,
        columns: &[ColumnDef],
    ) -> String {
        let column_defs: Vec<String> = columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", self.quote_identifier(c.name), c.sql_type);
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();

        format!(
            "CREATE TABLE {} ({}) PARTITION BY RANGE ({})",
            self.qualified(&table.schema, &table.name),
            column_defs.join(", "),
            self.quote_identifier(PARTITION_COLUMN)
        )
    }

    fn create_partition_sql(&self, table: &PartitionedTable, spec: &PartitionSpec) -> String {
        format!(
            "CREATE TABLE {} PARTITION OF {} FOR VALUES FROM ('{}') TO ('{}')",
            self.qualified(&table.schema, &spec.name),
            self.qualified(&table.schema, &table.name),
            escape_string_literal(&spec.start.format("%Y-%m-%d").to_string()),
            escape_string_literal(&spec.end.format("%Y-%m-%d").to_string()),
        )
    }

    fn advisory_lock_sql(&self) -> &'static str {
        "SELECT pg_advisory_xact_lock(hashtext($1))"
    }

    fn copy_in_sql(&self, table: &PartitionedTable, columns: &[ColumnDef]) -> String {
        let cols: Vec<String> = columns
            .iter()
            .map(|c| self.quote_identifier(c.name))
            .collect();

        format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT CSV, NULL '{}')",
            self.qualified(&table.schema, &table.name),
            cols.join(", "),
            COPY_NULL
        )
    }
}
