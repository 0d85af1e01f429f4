//! Record and partition types for holdings-load
//!
//! - [`HoldingRecord`]: one filing-holding observation
//! - [`PartitionKey`]: the (year, quarter) reporting period a record belongs to
//! - [`PartitionedTable`] / [`PartitionSpec`]: the parent table and one child range
//! - [`HOLDING_COLUMNS`]: the fixed column catalogue of the parent table

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::security::{validate_parent_table_name, validate_sql_identifier};

/// Name of the range-partitioning column
pub const PARTITION_COLUMN: &str = "period_start";

/// Smallest accepted reporting year
pub const MIN_YEAR: i32 = 1;
/// Largest accepted reporting year
pub const MAX_YEAR: i32 = 9999;

/// A column of the parent table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name
    pub name: &'static str,
    /// Native PostgreSQL type
    pub sql_type: &'static str,
    /// Whether NULLs are allowed
    pub nullable: bool,
}

impl ColumnDef {
    const fn nullable(name: &'static str, sql_type: &'static str) -> Self {
        Self {
            name,
            sql_type,
            nullable: true,
        }
    }
}

/// Parent table columns, in wire order. `period_start` is last and derived.
pub const HOLDING_COLUMNS: [ColumnDef; 12] = [
    ColumnDef::nullable("accessionnumber", "TEXT"),
    ColumnDef::nullable("infotablesk", "TEXT"),
    ColumnDef::nullable("nameofissuer", "TEXT"),
    ColumnDef::nullable("cusip", "TEXT"),
    ColumnDef::nullable("value", "NUMERIC"),
    ColumnDef::nullable("sshprnamt", "BIGINT"),
    ColumnDef::nullable("filingdate", "DATE"),
    ColumnDef::nullable("cik", "TEXT"),
    ColumnDef::nullable("value_per_share", "NUMERIC"),
    ColumnDef::nullable("year", "INT"),
    ColumnDef::nullable("quarter", "INT"),
    ColumnDef {
        name: PARTITION_COLUMN,
        sql_type: "DATE",
        nullable: false,
    },
];

/// One filing-holding observation.
///
/// Every field is optional on input; only `year` and `quarter` are required,
/// and that is enforced when the record is routed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HoldingRecord {
    /// Filing accession number
    #[serde(default)]
    pub accessionnumber: Option<String>,
    /// Information table row identifier
    #[serde(default)]
    pub infotablesk: Option<String>,
    /// Issuer name
    #[serde(default)]
    pub nameofissuer: Option<String>,
    /// Security identifier
    #[serde(default)]
    pub cusip: Option<String>,
    /// Market value of the position
    #[serde(default)]
    pub value: Option<Decimal>,
    /// Share or principal amount
    #[serde(default)]
    pub sshprnamt: Option<i64>,
    /// Date the filing was made
    #[serde(default)]
    pub filingdate: Option<NaiveDate>,
    /// Filer CIK
    #[serde(default)]
    pub cik: Option<String>,
    /// `value / sshprnamt`
    #[serde(default)]
    pub value_per_share: Option<Decimal>,
    /// Reporting year
    #[serde(default)]
    pub year: Option<i32>,
    /// Reporting quarter (1-4)
    #[serde(default)]
    pub quarter: Option<i32>,
}

impl HoldingRecord {
    /// Create an empty record for the given reporting period
    pub fn for_period(year: i32, quarter: i32) -> Self {
        Self {
            year: Some(year),
            quarter: Some(quarter),
            ..Default::default()
        }
    }

    /// Derive the partition key, failing on a missing or invalid period
    pub fn partition_key(&self) -> Result<PartitionKey> {
        let year = self
            .year
            .ok_or_else(|| Error::validation(None, "record is missing 'year'"))?;
        let quarter = self
            .quarter
            .ok_or_else(|| Error::validation(None, "record is missing 'quarter'"))?;
        let quarter = u8::try_from(quarter)
            .map_err(|_| Error::validation(None, format!("quarter {quarter} out of range 1-4")))?;
        PartitionKey::new(year, quarter)
    }

    /// Fill `value_per_share` from `value / sshprnamt` when it is missing.
    ///
    /// Leaves the field untouched if either input is missing or the share
    /// amount is zero.
    pub fn derive_value_per_share(&mut self) {
        if self.value_per_share.is_some() {
            return;
        }
        if let (Some(value), Some(shares)) = (self.value, self.sshprnamt) {
            if shares != 0 {
                self.value_per_share = value.checked_div(Decimal::from(shares));
            }
        }
    }
}

/// An ordered collection of records submitted together
pub type Batch = Vec<HoldingRecord>;

/// A reporting period: (year, quarter).
///
/// Maps to the half-open date range `[period_start, period_end)`, where
/// `period_end` is the next quarter's `period_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionKey {
    year: i32,
    quarter: u8,
    start: NaiveDate,
    end: NaiveDate,
}

impl PartitionKey {
    /// Create a key, validating the year range and `quarter ∈ {1,2,3,4}`
    pub fn new(year: i32, quarter: u8) -> Result<Self> {
        if !(1..=4).contains(&quarter) {
            return Err(Error::validation(
                None,
                format!("quarter {quarter} out of range 1-4"),
            ));
        }
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(Error::validation(
                None,
                format!("year {year} out of range {MIN_YEAR}-{MAX_YEAR}"),
            ));
        }

        let start = first_day(year, quarter)?;
        let end = if quarter == 4 {
            first_day(year + 1, 1)?
        } else {
            first_day(year, quarter + 1)?
        };

        Ok(Self {
            year,
            quarter,
            start,
            end,
        })
    }

    /// Key whose period contains `date`
    pub fn containing(date: NaiveDate) -> Result<Self> {
        let quarter = (date.month0() / 3 + 1) as u8;
        Self::new(date.year(), quarter)
    }

    /// Reporting year
    #[inline]
    pub fn year(&self) -> i32 {
        self.year
    }

    /// Reporting quarter (1-4)
    #[inline]
    pub fn quarter(&self) -> u8 {
        self.quarter
    }

    /// First day of the quarter (inclusive lower bound)
    #[inline]
    pub fn period_start(&self) -> NaiveDate {
        self.start
    }

    /// First day of the following quarter (exclusive upper bound)
    #[inline]
    pub fn period_end(&self) -> NaiveDate {
        self.end
    }

    /// The following quarter
    pub fn next(&self) -> Result<Self> {
        if self.quarter == 4 {
            Self::new(self.year + 1, 1)
        } else {
            Self::new(self.year, self.quarter + 1)
        }
    }

    /// Child partition name: `{table}_{year}_q{quarter}`
    pub fn partition_name(&self, table: &str) -> String {
        format!("{}_{}_q{}", table, self.year, self.quarter)
    }
}

fn first_day(year: i32, quarter: u8) -> Result<NaiveDate> {
    let month = u32::from(quarter - 1) * 3 + 1;
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| Error::validation(None, format!("no calendar date for {year}Q{quarter}")))
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Q{}", self.year, self.quarter)
    }
}

/// Parses `2024Q1`, `2024-q1`, `2024_Q1` and `2024 Q1`
impl FromStr for PartitionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::validation(None, format!("invalid reporting period '{s}'"));
        let upper = s.trim().to_ascii_uppercase();
        let (year, quarter) = upper.split_once('Q').ok_or_else(invalid)?;
        let year = year.trim_end_matches(['-', '_', ' ']);
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let quarter: u8 = quarter.parse().map_err(|_| invalid())?;
        Self::new(year, quarter)
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PartitionKey> for String {
    fn from(key: PartitionKey) -> Self {
        key.to_string()
    }
}

/// The partitioned parent table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionedTable {
    /// Schema (namespace) name
    pub schema: String,
    /// Table name
    pub name: String,
}

impl PartitionedTable {
    /// Create a table reference, validating both identifiers. The name must
    /// leave room for the partition suffix.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        let name = name.into();
        validate_sql_identifier(&schema)?;
        validate_parent_table_name(&name)?;
        Ok(Self { schema, name })
    }

    /// Table in the `public` schema
    pub fn public(name: impl Into<String>) -> Result<Self> {
        Self::new("public", name)
    }

    /// `schema.name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Child partition covering `key`
    pub fn partition_for(&self, key: PartitionKey) -> PartitionSpec {
        PartitionSpec {
            key,
            name: key.partition_name(&self.name),
            start: key.period_start(),
            end: key.period_end(),
        }
    }
}

impl fmt::Display for PartitionedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One child partition: a single `[start, end)` reporting-period range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Period covered
    pub key: PartitionKey,
    /// Child table name
    pub name: String,
    /// Inclusive lower bound
    pub start: NaiveDate,
    /// Exclusive upper bound
    pub end: NaiveDate,
}
