//! Universal data types for the QoreDB dispatch core
//!
//! These types describe one sub-request of a federated query and the rows
//! it produces, independent of the connector that serves it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a top-level (federated) query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable identifier of one sub-request: session, top-level query and the
/// index of the piece within that query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub session: SessionId,
    pub query: QueryId,
    pub part: u32,
}

impl RequestId {
    pub fn new(session: SessionId, query: QueryId, part: u32) -> Self {
        Self {
            session,
            query,
            part,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.session.0, self.query.0, self.part)
    }
}

/// Query cancellation support level for an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSupport {
    None,
    BestEffort,
    Driver,
}

/// How a work item is driven once admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// The caller awaits `run()` and every batch is produced inline.
    Synchronous,
    /// Each step is scheduled on the runtime; the caller pulls with `request_more()`.
    #[default]
    Asynchronous,
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: CompactString,
    pub data_type: CompactString,
    pub nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<CompactString>, data_type: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }
}

/// Output-parameter values reported by a procedure call, keyed by name.
pub type OutputParameters = HashMap<String, Value>;

/// Adapter family a command executes through. The batch assembler branches
/// on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    RowSet,
    Procedure,
    Update,
}

/// Translated command sent to a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// SELECT-like command returning one row set.
    Query {
        sql: String,
        columns: Vec<ColumnInfo>,
    },
    /// Procedure call returning at most one row set plus output parameters.
    Procedure {
        call: String,
        columns: Vec<ColumnInfo>,
        out_parameters: Vec<ColumnInfo>,
    },
    /// INSERT/UPDATE/DELETE; yields a single update-count row.
    Update { sql: String },
}

impl Command {
    pub fn kind(&self) -> ExecutionKind {
        match self {
            Self::Query { .. } => ExecutionKind::RowSet,
            Self::Procedure { .. } => ExecutionKind::Procedure,
            Self::Update { .. } => ExecutionKind::Update,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Query { sql, .. } | Self::Update { sql } => sql,
            Self::Procedure { call, .. } => call,
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Update { .. })
    }

    /// Width of the rows delivered to the caller.
    pub fn result_width(&self) -> usize {
        match self {
            Self::Query { columns, .. } => columns.len(),
            Self::Procedure {
                columns,
                out_parameters,
                ..
            } => columns.len() + out_parameters.len(),
            Self::Update { .. } => 1,
        }
    }
}

/// Transaction the request participates in, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContext {
    pub transaction_id: String,
}

impl TransactionContext {
    pub fn new(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
        }
    }
}

/// One atomic unit of work dispatched to a single connector.
///
/// Immutable once submitted.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub connector: String,
    pub command: Command,
    /// Rows per batch; `None` uses the connector default.
    pub fetch_size: Option<usize>,
    pub transaction: Option<TransactionContext>,
    pub timeout: Option<Duration>,
    pub strategy: ExecutionStrategy,
}

impl Request {
    pub fn new(id: RequestId, connector: impl Into<String>, command: Command) -> Self {
        Self {
            id,
            connector: connector.into(),
            command,
            fetch_size: None,
            transaction: None,
            timeout: None,
            strategy: ExecutionStrategy::default(),
        }
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = Some(fetch_size);
        self
    }

    pub fn with_transaction(mut self, transaction: TransactionContext) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// A bounded chunk of result rows delivered together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBatch {
    pub request_id: RequestId,
    pub sequence: u64,
    pub rows: Vec<Row>,
    /// The source has no more rows for this request.
    pub last: bool,
    /// The request is closed; no further delivery follows.
    pub closed: bool,
    /// Non-fatal warnings accumulated since the previous batch.
    pub warnings: Vec<String>,
}

impl ResultBatch {
    pub fn is_terminal(&self) -> bool {
        self.closed
    }
}
