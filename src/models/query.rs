//! Query-related data models.
//!
//! This module defines the statement passed through the decorated pool and the
//! result returned by it.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Leading keywords of statements that produce a result set.
const ROW_RETURNING_KEYWORDS: &[&str] = &[
    "select", "show", "describe", "desc", "explain", "with", "values", "table",
];

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A SQL statement with its bound arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
}

impl Query {
    /// Create a query without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter to this query.
    pub fn bind(mut self, param: QueryParam) -> Self {
        self.params.push(param);
        self
    }

    /// Administrative statement terminating the server session `thread_id`.
    pub fn kill(thread_id: u64) -> Self {
        Self::new(format!("KILL {}", thread_id))
    }

    /// JSON rendering of the bound parameters, used in timeout diagnostics.
    pub fn arguments_json(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_else(|_| "[]".to_string())
    }

    /// Whether the statement produces a result set rather than an affected-row count.
    pub fn returns_rows(&self) -> bool {
        let first = self
            .sql
            .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        ROW_RETURNING_KEYWORDS.contains(&first.as_str())
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

/// Result of a statement executed through the pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

impl QueryOutput {
    /// Create a result set.
    pub fn rows(columns: Vec<String>, rows: Vec<serde_json::Map<String, JsonValue>>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
        }
    }

    /// Create a result for write operations (INSERT/UPDATE/DELETE/KILL).
    pub fn write_result(rows_affected: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: Some(rows_affected),
        }
    }
}
