//! Connector-facing trait definitions
//!
//! These are the seams the dispatch core consumes. Connection pooling and
//! the source-specific I/O live behind them; the dispatcher only leases a
//! connection, opens a cursor against it, pulls rows and releases both.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::types::{
    CancelSupport, OutputParameters, Request, RequestId, Row, TransactionContext,
};

/// A physical connection handed out by a [`ConnectionSource`].
///
/// The dispatcher never looks inside; adapters downcast through `as_any`.
pub trait SourceConnection: Send + Sync {
    fn connection_id(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Pool (or factory) of source connections for one connector.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Leases a connection, enlisted in `transaction` when one is given.
    async fn acquire(
        &self,
        request: &Request,
        transaction: Option<&TransactionContext>,
    ) -> EngineResult<Arc<dyn SourceConnection>>;

    /// Returns a connection previously obtained from `acquire`.
    async fn release(&self, connection: Arc<dyn SourceConnection>) -> EngineResult<()>;
}

/// Outcome of one row pull.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    Row(Row),
    EndOfData,
    /// Transient: nothing available yet, retry the step later.
    NotAvailable { retry_after: Option<Duration> },
}

/// Core trait that all connector adapters must implement
///
/// One adapter instance serves every request of its connector; each
/// request gets its own cursor from `open`.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Returns the unique identifier for this adapter (e.g., "postgres", "soap")
    fn adapter_id(&self) -> &'static str;

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::None
    }

    /// Starts executing `request` on the leased connection.
    async fn open(
        &self,
        connection: Arc<dyn SourceConnection>,
        request: &Request,
    ) -> EngineResult<Box<dyn ExecutionCursor>>;

    /// Asks the source to stop work for `request_id`. Advisory: the cursor
    /// call in flight is expected to return soon after.
    async fn cancel(&self, _request_id: RequestId) -> EngineResult<()> {
        Ok(())
    }
}

/// Per-request execution yielding rows lazily.
#[async_trait]
pub trait ExecutionCursor: Send {
    async fn next_row(&mut self) -> EngineResult<Fetch>;

    /// Output-parameter values; read once after the row set is exhausted.
    async fn output_parameters(&mut self) -> EngineResult<OutputParameters> {
        Ok(OutputParameters::new())
    }

    /// Keep the cursor and its connection open after the last row until the
    /// caller closes explicitly.
    fn keep_alive(&self) -> bool {
        false
    }

    fn take_warnings(&mut self) -> Vec<String> {
        Vec::new()
    }

    async fn close(&mut self) -> EngineResult<()>;
}
