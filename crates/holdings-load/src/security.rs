//! SQL injection guards for generated DDL and COPY statements.
//!
//! Table, schema and partition names are interpolated into `CREATE TABLE` and
//! `COPY` statements, which cannot take bind parameters. Every such name goes
//! through [`validate_sql_identifier`] first; partition bounds are dates
//! rendered by chrono and escaped with [`escape_string_literal`].

use crate::error::Error;

/// PostgreSQL truncates identifiers longer than `NAMEDATALEN - 1` bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Longest suffix a child partition adds to its parent's name
const PARTITION_SUFFIX_MAX: &str = "_9999_q4";

/// Longest parent table name whose partition names still fit
pub const MAX_PARENT_TABLE_LEN: usize = MAX_IDENTIFIER_LEN - PARTITION_SUFFIX_MAX.len();

/// Validate a SQL identifier (schema, table or partition name).
///
/// Rules:
/// - Must not be empty
/// - At most 63 bytes, so PostgreSQL never silently truncates it
/// - Must start with an ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// # Examples
///
/// ```
/// use holdings_load::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("holdings").is_ok());
/// assert!(validate_sql_identifier("holdings_2024_q1").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE holdings--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("2024_q1").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "SQL identifier '{}' too long: {} chars (max {})",
            name,
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': contains invalid character '{}'",
                name, c
            )));
        }
    }

    Ok(())
}

/// Validate a partitioned parent table name.
///
/// Same rules as [`validate_sql_identifier`], but short enough that every
/// `{name}_{year}_q{quarter}` child name is a distinct, untruncated identifier.
///
/// ```
/// use holdings_load::security::validate_parent_table_name;
///
/// assert!(validate_parent_table_name("holdings").is_ok());
/// assert!(validate_parent_table_name(&"h".repeat(60)).is_err());
/// ```
pub fn validate_parent_table_name(name: &str) -> crate::Result<()> {
    validate_sql_identifier(name)?;
    if name.len() > MAX_PARENT_TABLE_LEN {
        return Err(Error::config(format!(
            "table name '{}' too long: {} chars (max {} so partition names fit in {})",
            name,
            name.len(),
            MAX_PARENT_TABLE_LEN,
            MAX_IDENTIFIER_LEN
        )));
    }
    Ok(())
}

/// Escape a value for a single-quoted SQL string literal (`'` becomes `''`).
///
/// ```
/// use holdings_load::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("2024-01-01"), "2024-01-01");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_sql_identifier("holdings").is_ok());
        assert!(validate_sql_identifier("_staging").is_ok());
        assert!(validate_sql_identifier("Holdings13F").is_ok());
        assert!(validate_sql_identifier("holdings_9999_q4").is_ok());
    }

    #[test]
    fn test_identifier_length_limit() {
        assert!(validate_sql_identifier(&"a".repeat(63)).is_ok());
        assert!(validate_sql_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_parent_table_leaves_room_for_partition_suffix() {
        let longest = "h".repeat(MAX_PARENT_TABLE_LEN);
        assert!(validate_parent_table_name(&longest).is_ok());
        assert!(validate_sql_identifier(&format!("{longest}_9999_q4")).is_ok());

        let err = validate_parent_table_name(&"h".repeat(MAX_PARENT_TABLE_LEN + 1)).unwrap_err();
        assert!(err.to_string().contains("too long"), "{err}");
        assert!(validate_parent_table_name("bad name").is_err());
    }

    #[test]
    fn test_injection_attempts() {
        assert!(validate_sql_identifier("x; DROP TABLE holdings--").is_err());
        assert!(validate_sql_identifier("x' OR '1'='1").is_err());
        assert!(validate_sql_identifier("public.holdings").is_err());
        assert!(validate_sql_identifier("holding\u{0455}").is_err());
        assert!(validate_sql_identifier("a b").is_err());
        assert!(validate_sql_identifier("x\0").is_err());
        assert!(validate_sql_identifier("\"quoted\"").is_err());
    }

    #[test]
    fn test_escape_string_literal() {
        assert_eq!(escape_string_literal(""), "");
        assert_eq!(escape_string_literal("'"), "''");
        assert_eq!(
            escape_string_literal("2024-01-01'); DROP TABLE x--"),
            "2024-01-01''); DROP TABLE x--"
        );
    }
}
