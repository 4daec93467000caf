//! # Validation
//!
//! Table and column names end up inside dynamically built SQL, so every name
//! that crosses the wire is validated here before any statement is formed.

use crate::error::ValidationError;
use crate::{RESERVED_TABLES, SHADOW_SUFFIX};

/// Maximum identifier length accepted for mirrored tables and columns.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Maximum endpoint path length.
pub const MAX_ENDPOINT_LEN: usize = 2048;

/// Validates a table or column identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_IDENTIFIER_LEN,
        });
    }

    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);

    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("'{name}' must match [A-Za-z_][A-Za-z0-9_]*"),
        });
    }

    Ok(())
}

/// Validates a mirrored table name.
///
/// On top of identifier rules, rejects store-owned tables, `sqlite_*` and
/// names ending in the shadow suffix.
pub fn validate_table_name(name: &str) -> Result<(), ValidationError> {
    validate_identifier("table", name)?;

    let lowered = name.to_ascii_lowercase();
    if RESERVED_TABLES.contains(&lowered.as_str())
        || lowered.starts_with("sqlite_")
        || lowered.ends_with(SHADOW_SUFFIX)
    {
        return Err(ValidationError::Reserved {
            field: "table".to_string(),
            value: name.to_string(),
        });
    }

    Ok(())
}

/// Validates a list of table names, rejecting duplicates.
pub fn validate_table_set(names: &[String]) -> Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        validate_table_name(name)?;
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(ValidationError::Duplicate {
                field: "table".to_string(),
                value: name.clone(),
            });
        }
    }
    Ok(())
}

/// Validates an endpoint path such as `/api/parts/7`.
pub fn validate_endpoint(endpoint: &str) -> Result<(), ValidationError> {
    if endpoint.is_empty() {
        return Err(ValidationError::Required {
            field: "endpoint".to_string(),
        });
    }
    if endpoint.len() > MAX_ENDPOINT_LEN {
        return Err(ValidationError::TooLong {
            field: "endpoint".to_string(),
            max: MAX_ENDPOINT_LEN,
        });
    }
    if !endpoint.starts_with('/') {
        return Err(ValidationError::InvalidFormat {
            field: "endpoint".to_string(),
            reason: "must start with '/'".to_string(),
        });
    }
    if endpoint.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidFormat {
            field: "endpoint".to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }
    Ok(())
}

/// Double-quotes an identifier for SQLite. Callers validate first.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Shadow table name for a mirrored table.
pub fn shadow_name(table: &str) -> String {
    format!("{table}{SHADOW_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert!(validate_identifier("column", "serial_no").is_ok());
        assert!(validate_identifier("column", "_x1").is_ok());
        assert!(validate_identifier("column", "").is_err());
        assert!(validate_identifier("column", "1abc").is_err());
        assert!(validate_identifier("column", "name; DROP TABLE x").is_err());
        assert!(validate_identifier("column", "a\"b").is_err());
        assert!(validate_identifier("column", &"a".repeat(65)).is_err());
    }

    #[test]
    fn test_reserved_tables() {
        assert!(validate_table_name("parts").is_ok());
        assert!(matches!(
            validate_table_name("pending_operations"),
            Err(ValidationError::Reserved { .. })
        ));
        assert!(validate_table_name("AUTH_TOKENS").is_err());
        assert!(validate_table_name("sqlite_sequence").is_err());
        assert!(validate_table_name("parts_temp").is_err());
    }

    #[test]
    fn test_table_set_duplicates() {
        let names = vec!["sites".to_string(), "Sites".to_string()];
        assert!(matches!(
            validate_table_set(&names),
            Err(ValidationError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_endpoints() {
        assert!(validate_endpoint("/api/parts/7").is_ok());
        assert!(validate_endpoint("api/parts").is_err());
        assert!(validate_endpoint("/api/parts 7").is_err());
        assert!(validate_endpoint("").is_err());
    }

    #[test]
    fn test_quote_and_shadow() {
        assert_eq!(quote_ident("parts"), "\"parts\"");
        assert_eq!(shadow_name("parts"), "parts_temp");
    }
}
