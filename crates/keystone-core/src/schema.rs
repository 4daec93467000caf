//! # Cross-Engine Schema Translation
//!
//! The remote store speaks a Postgres-like type vocabulary; the Local Store is
//! SQLite with four storage classes. [`classify`] and [`translate_type`] are
//! pure and total: every input string maps to something, unknown types land
//! on TEXT.
//!
//! ## Mapping
//! ```text
//! ┌──────────────────────────────────────┬──────────────┬──────────────┐
//! │ remote type (case-insensitive base)  │ RemoteKind   │ LocalType    │
//! ├──────────────────────────────────────┼──────────────┼──────────────┤
//! │ int, integer, bigint, smallint,      │ Integer      │ INTEGER      │
//! │ serial, bigserial, int2/4/8, oid     │              │              │
//! │ boolean, bool                        │ Boolean      │ INTEGER 0/1  │
//! │ real, float4/8, double precision,    │ Float        │ REAL         │
//! │ numeric, decimal, money              │              │              │
//! │ char, varchar, character varying,    │ Text         │ TEXT         │
//! │ text, uuid, citext, name, inet, enum │              │              │
//! │ date                                 │ Temporal     │ TEXT         │
//! │ time [with/without time zone]        │ Temporal     │ TEXT         │
//! │ timestamp[tz], datetime              │ Temporal     │ TEXT         │
//! │ json, jsonb, ARRAY, _xxx             │ Json         │ TEXT         │
//! │ bytea, blob, binary                  │ Bytes        │ BLOB         │
//! │ anything else                        │ Unknown      │ TEXT         │
//! └──────────────────────────────────────┴──────────────┴──────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Remote Side
// =============================================================================

/// Granularity of a temporal column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalKind {
    Date,
    Time,
    DateTime,
}

/// Semantic family of a remote column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    Integer,
    Text,
    Boolean,
    Float,
    Temporal(TemporalKind),
    Json,
    Bytes,
    Unknown,
}

impl RemoteKind {
    /// Local storage class for this kind.
    pub const fn local_type(&self) -> LocalType {
        match self {
            RemoteKind::Integer | RemoteKind::Boolean => LocalType::Integer,
            RemoteKind::Float => LocalType::Real,
            RemoteKind::Bytes => LocalType::Blob,
            RemoteKind::Text | RemoteKind::Temporal(_) | RemoteKind::Json | RemoteKind::Unknown => {
                LocalType::Text
            }
        }
    }
}

/// Column metadata as reported by the remote schema endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteColumn {
    pub name: String,
    pub data_type: String,
}

impl RemoteColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    pub fn kind(&self) -> RemoteKind {
        classify(&self.data_type)
    }

    /// Translated local column.
    pub fn to_local(&self) -> LocalColumn {
        let kind = self.kind();
        LocalColumn {
            name: self.name.clone(),
            local_type: kind.local_type(),
            kind,
        }
    }
}

// =============================================================================
// Local Side
// =============================================================================

/// SQLite storage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LocalType {
    Integer,
    Text,
    Real,
    Blob,
}

impl LocalType {
    /// Type name used in DDL.
    pub const fn as_sql(&self) -> &'static str {
        match self {
            LocalType::Integer => "INTEGER",
            LocalType::Text => "TEXT",
            LocalType::Real => "REAL",
            LocalType::Blob => "BLOB",
        }
    }

    /// Maps a declared SQLite column type back to its storage class using
    /// SQLite's affinity rules.
    pub fn from_declared(declared: &str) -> LocalType {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            LocalType::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            LocalType::Text
        } else if upper.contains("BLOB") || upper.is_empty() {
            LocalType::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            LocalType::Real
        } else {
            // NUMERIC affinity; values keep their numeric form.
            LocalType::Real
        }
    }
}

impl fmt::Display for LocalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A translated column of a mirrored table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalColumn {
    pub name: String,
    pub local_type: LocalType,
    /// Remote kind the column came from; drives value conversion.
    pub kind: RemoteKind,
}

// =============================================================================
// Translation
// =============================================================================

/// Classifies a remote type string. Total: unrecognized input is `Unknown`.
pub fn classify(data_type: &str) -> RemoteKind {
    let lowered = data_type.trim().to_ascii_lowercase();

    // Postgres array spellings: `integer[]`, `ARRAY`, `_int4`.
    if lowered.ends_with("[]") || lowered == "array" || lowered.starts_with('_') {
        return RemoteKind::Json;
    }

    // Drop modifiers: `varchar(255)` -> `varchar`, `numeric(10,2)` -> `numeric`.
    let base = match lowered.find('(') {
        Some(idx) => {
            let mut head = lowered[..idx].trim_end().to_string();
            // `timestamp(3) with time zone`
            if let Some(close) = lowered[idx..].find(')') {
                let tail = lowered[idx + close + 1..].trim();
                if !tail.is_empty() {
                    head.push(' ');
                    head.push_str(tail);
                }
            }
            head
        }
        None => lowered,
    };

    match base.as_str() {
        "int" | "integer" | "int2" | "int4" | "int8" | "smallint" | "bigint" | "tinyint"
        | "mediumint" | "serial" | "smallserial" | "bigserial" | "serial4" | "serial8" | "oid" => {
            RemoteKind::Integer
        }

        "bool" | "boolean" => RemoteKind::Boolean,

        "real" | "float" | "float4" | "float8" | "double" | "double precision" | "numeric"
        | "decimal" | "money" => RemoteKind::Float,

        "text" | "char" | "character" | "varchar" | "character varying" | "bpchar" | "uuid"
        | "citext" | "name" | "inet" | "cidr" | "macaddr" | "enum" | "string" | "clob" => {
            RemoteKind::Text
        }

        "date" => RemoteKind::Temporal(TemporalKind::Date),

        "time" | "timetz" | "time with time zone" | "time without time zone" => {
            RemoteKind::Temporal(TemporalKind::Time)
        }

        "timestamp" | "timestamptz" | "timestamp with time zone"
        | "timestamp without time zone" | "datetime" => RemoteKind::Temporal(TemporalKind::DateTime),

        "json" | "jsonb" | "array" => RemoteKind::Json,

        "bytea" | "blob" | "binary" | "varbinary" => RemoteKind::Bytes,

        _ => RemoteKind::Unknown,
    }
}

/// Translates a remote type string straight to its local storage class.
pub fn translate_type(data_type: &str) -> LocalType {
    classify(data_type).local_type()
}

/// Translates a full remote column list.
pub fn translate_columns(columns: &[RemoteColumn]) -> Vec<LocalColumn> {
    columns.iter().map(RemoteColumn::to_local).collect()
}

// =============================================================================
// Expected Schema (Schema Migrator input)
// =============================================================================

/// One expected column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,

    /// Full SQLite column definition after the name, e.g.
    /// `TEXT NOT NULL DEFAULT 'pending'`.
    pub definition: String,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: definition.into(),
        }
    }

    /// Definition usable in `ALTER TABLE .. ADD COLUMN`.
    ///
    /// SQLite refuses to add PRIMARY KEY or UNIQUE columns to an existing
    /// table, so those constraints are stripped here. The column is still
    /// created; only the constraint is lost on old files.
    pub fn additive_definition(&self) -> String {
        let upper = self.definition.to_ascii_uppercase();
        let mut out = self.definition.clone();
        for constraint in ["PRIMARY KEY AUTOINCREMENT", "PRIMARY KEY", "UNIQUE"] {
            if let Some(pos) = upper.find(constraint) {
                out.replace_range(pos..pos + constraint.len(), "");
                break;
            }
        }
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// One expected table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,

    /// Extra table constraints appended to CREATE TABLE (e.g. composite keys).
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Builder-style column append.
    pub fn column(mut self, name: impl Into<String>, definition: impl Into<String>) -> Self {
        self.columns.push(ColumnSpec::new(name, definition));
        self
    }

    pub fn constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }
}

/// The schema the Local Store is expected to have.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedSchema {
    pub tables: Vec<TableSpec>,
}

impl ExpectedSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableSpec) -> Self {
        self.tables.push(table);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_family() {
        for t in ["integer", "INT", "bigint", "serial", "BIGSERIAL", "int8", "smallint"] {
            assert_eq!(classify(t), RemoteKind::Integer, "{t}");
            assert_eq!(translate_type(t), LocalType::Integer);
        }
    }

    #[test]
    fn test_text_family_with_modifiers() {
        assert_eq!(classify("character varying(255)"), RemoteKind::Text);
        assert_eq!(classify("VARCHAR(32)"), RemoteKind::Text);
        assert_eq!(classify("char(1)"), RemoteKind::Text);
        assert_eq!(classify("uuid"), RemoteKind::Text);
        assert_eq!(translate_type("text"), LocalType::Text);
    }

    #[test]
    fn test_boolean_maps_to_integer() {
        assert_eq!(classify("boolean"), RemoteKind::Boolean);
        assert_eq!(translate_type("BOOL"), LocalType::Integer);
    }

    #[test]
    fn test_float_family() {
        assert_eq!(translate_type("numeric(10,2)"), LocalType::Real);
        assert_eq!(translate_type("double precision"), LocalType::Real);
        assert_eq!(translate_type("money"), LocalType::Real);
        assert_eq!(translate_type("real"), LocalType::Real);
    }

    #[test]
    fn test_temporal_family() {
        assert_eq!(
            classify("timestamp with time zone"),
            RemoteKind::Temporal(TemporalKind::DateTime)
        );
        assert_eq!(
            classify("timestamp(3) without time zone"),
            RemoteKind::Temporal(TemporalKind::DateTime)
        );
        assert_eq!(classify("date"), RemoteKind::Temporal(TemporalKind::Date));
        assert_eq!(classify("time"), RemoteKind::Temporal(TemporalKind::Time));
        assert_eq!(translate_type("timestamptz"), LocalType::Text);
    }

    #[test]
    fn test_json_and_arrays() {
        assert_eq!(classify("jsonb"), RemoteKind::Json);
        assert_eq!(classify("ARRAY"), RemoteKind::Json);
        assert_eq!(classify("_int4"), RemoteKind::Json);
        assert_eq!(classify("integer[]"), RemoteKind::Json);
        assert_eq!(translate_type("json"), LocalType::Text);
    }

    #[test]
    fn test_bytes_and_unknown() {
        assert_eq!(translate_type("bytea"), LocalType::Blob);
        assert_eq!(classify("tsvector"), RemoteKind::Unknown);
        assert_eq!(translate_type("geometry(Point,4326)"), LocalType::Text);
        assert_eq!(translate_type(""), LocalType::Text);
    }

    #[test]
    fn test_declared_affinity() {
        assert_eq!(LocalType::from_declared("INTEGER"), LocalType::Integer);
        assert_eq!(LocalType::from_declared("varchar(10)"), LocalType::Text);
        assert_eq!(LocalType::from_declared("REAL"), LocalType::Real);
        assert_eq!(LocalType::from_declared("BLOB"), LocalType::Blob);
    }

    #[test]
    fn test_additive_definition_strips_key_constraints() {
        let col = ColumnSpec::new("seq", "INTEGER PRIMARY KEY AUTOINCREMENT");
        assert_eq!(col.additive_definition(), "INTEGER");

        let col = ColumnSpec::new("id", "TEXT NOT NULL UNIQUE");
        assert_eq!(col.additive_definition(), "TEXT NOT NULL");

        let col = ColumnSpec::new("state", "TEXT NOT NULL DEFAULT 'pending'");
        assert_eq!(col.additive_definition(), "TEXT NOT NULL DEFAULT 'pending'");
    }

    #[test]
    fn test_remote_column_to_local() {
        let col = RemoteColumn::new("active", "boolean").to_local();
        assert_eq!(col.local_type, LocalType::Integer);
        assert_eq!(col.kind, RemoteKind::Boolean);
    }
}
