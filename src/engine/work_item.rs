//! Work item: the execution state machine of one request.
//!
//! ```text
//! New → Started → (BatchReady ⇄ Resuming) → Closing → Closed
//!          └──────── Cancelling ─────────────┘
//! ```
//!
//! Execution state (lease, cursor, buffered rows) lives behind an async
//! mutex held by exactly one driving step. Lifecycle state lives behind a
//! plain mutex so `request_more`, `cancel` and `close` can be called from
//! any thread, including from inside a receiver callback. Those calls only
//! flip flags and schedule a step; nothing is delivered inline.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qore_core::{
    ConnectionSource, EngineError, EngineResult, ExecutionAdapter, ExecutionCursor,
    ExecutionKind, ExecutionStrategy, Fetch, Request, RequestId, ResultBatch, Row,
    SourceConnection,
};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::ConnectorConfig;
use crate::engine::admission::AdmissionController;
use crate::engine::assembler::BatchAssembler;
use crate::engine::channel::{ResultReceiver, ResultsChannel};
use crate::metrics;

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    New,
    Started,
    BatchReady,
    Resuming,
    Cancelling,
    Closing,
    Closed,
}

impl WorkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Why the caller (or a timer) stopped the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Closed,
    Cancelled,
    TimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

/// Result of one driving step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Delivered,
    Retry(Duration),
    Finished,
}

/// Ways a fill can stop short of a batch.
#[derive(Debug)]
enum StepError {
    /// Cancellation observed; the source stopped within the grace period.
    Stopped,
    /// The source ignored cancellation past the grace period.
    Abandoned,
    Failed(EngineError),
}

impl From<EngineError> for StepError {
    fn from(err: EngineError) -> Self {
        Self::Failed(err)
    }
}

enum Fill {
    Ready,
    NotAvailable(Duration),
}

struct Lifecycle {
    state: WorkState,
    stop: Option<StopReason>,
    admitted: bool,
    started_at: Option<Instant>,
}

/// Resources owned by the driving step.
struct Execution {
    lease: Option<Arc<dyn SourceConnection>>,
    released: bool,
    cursor: Option<Box<dyn ExecutionCursor>>,
    assembler: BatchAssembler,
    pending: VecDeque<Row>,
    source_done: bool,
    keep_alive: bool,
    warnings: Vec<String>,
    next_sequence: u64,
    finished: bool,
}

/// Admin-facing view of one work item.
#[derive(Debug, Clone, Serialize)]
pub struct WorkSummary {
    pub request_id: RequestId,
    pub connector: String,
    pub state: WorkState,
    pub kind: ExecutionKind,
    pub strategy: ExecutionStrategy,
    pub batches_delivered: u64,
    pub submitted_at: DateTime<Utc>,
}

/// Stateful execution of one request.
pub struct WorkItem {
    request: Request,
    fetch_size: usize,
    config: Arc<ConnectorConfig>,
    adapter: Arc<dyn ExecutionAdapter>,
    connections: Arc<dyn ConnectionSource>,
    channel: ResultsChannel,
    lifecycle: Mutex<Lifecycle>,
    execution: tokio::sync::Mutex<Execution>,
    /// Tripped by cancel, close and timeout; raced against every source call.
    cancel: CancellationToken,
    /// Tripped once the terminal delivery happened.
    done: CancellationToken,
    admitted: watch::Sender<bool>,
    slot_released: AtomicBool,
    batches_delivered: AtomicU64,
    controller: Weak<AdmissionController>,
    runtime: Handle,
    submitted_at: DateTime<Utc>,
}

impl WorkItem {
    pub(crate) fn new(
        request: Request,
        config: Arc<ConnectorConfig>,
        adapter: Arc<dyn ExecutionAdapter>,
        connections: Arc<dyn ConnectionSource>,
        receiver: Arc<dyn ResultReceiver>,
        controller: Weak<AdmissionController>,
        runtime: Handle,
    ) -> Arc<Self> {
        let fetch_size = config.fetch_size_for(&request);
        let assembler = BatchAssembler::for_request(&request);
        let channel = ResultsChannel::new(request.id, receiver);
        let (admitted, _) = watch::channel(false);

        Arc::new(Self {
            fetch_size,
            config,
            adapter,
            connections,
            channel,
            lifecycle: Mutex::new(Lifecycle {
                state: WorkState::New,
                stop: None,
                admitted: false,
                started_at: None,
            }),
            execution: tokio::sync::Mutex::new(Execution {
                lease: None,
                released: false,
                cursor: None,
                assembler,
                pending: VecDeque::new(),
                source_done: false,
                keep_alive: false,
                warnings: Vec::new(),
                next_sequence: 0,
                finished: false,
            }),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            admitted,
            slot_released: AtomicBool::new(false),
            batches_delivered: AtomicU64::new(0),
            controller,
            runtime,
            submitted_at: Utc::now(),
            request,
        })
    }

    pub fn id(&self) -> RequestId {
        self.request.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn state(&self) -> WorkState {
        self.lifecycle.lock().state
    }

    pub fn is_admitted(&self) -> bool {
        self.lifecycle.lock().admitted
    }

    pub fn summary(&self) -> WorkSummary {
        WorkSummary {
            request_id: self.request.id,
            connector: self.request.connector.clone(),
            state: self.state(),
            kind: self.request.command.kind(),
            strategy: self.request.strategy,
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            submitted_at: self.submitted_at,
        }
    }

    /// Resolves once the terminal delivery has been made.
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    // ==================== Externally triggered transitions ====================

    /// Called by the admission controller when the item takes a slot.
    pub(crate) fn admit(self: &Arc<Self>) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.admitted || lifecycle.state.is_terminal() {
                return;
            }
            lifecycle.admitted = true;
            lifecycle.started_at = Some(Instant::now());
        }
        self.admitted.send_replace(true);
        tracing::debug!(request_id = %self.request.id, connector = %self.request.connector, "Work item admitted");

        if let Some(limit) = self.request.timeout {
            self.arm_timer(limit);
        }
        if self.request.strategy == ExecutionStrategy::Asynchronous {
            self.schedule(None);
        }
    }

    /// Asks for the next batch.
    pub fn request_more(self: &Arc<Self>) -> EngineResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.stop.is_some() || lifecycle.state.is_terminal() {
            return Err(EngineError::already_closed(self.request.id));
        }
        if !lifecycle.admitted {
            return Err(EngineError::not_yet_started(self.request.id));
        }

        match (lifecycle.state, self.request.strategy) {
            (WorkState::BatchReady, ExecutionStrategy::Asynchronous) => {
                lifecycle.state = WorkState::Resuming;
                drop(lifecycle);
                self.schedule(None);
            }
            // A step is already producing the next batch, or the synchronous
            // driver continues on its own.
            _ => {}
        }
        Ok(())
    }

    /// Cancels the item. Always ends in exactly one closed delivery.
    pub fn cancel(self: &Arc<Self>) {
        if self.stop(StopReason::Cancelled) {
            metrics::record_cancel();
        }
    }

    /// Closes the item; a no-op once closing has begun.
    pub fn close(self: &Arc<Self>) {
        self.stop(StopReason::Closed);
    }

    fn stop(self: &Arc<Self>, reason: StopReason) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.stop.is_some() || lifecycle.state.is_terminal() {
                return false;
            }
            lifecycle.stop = Some(reason);
            if reason != StopReason::Closed {
                lifecycle.state = WorkState::Cancelling;
            }
        }
        tracing::debug!(request_id = %self.request.id, reason = ?reason, "Stop requested");

        self.cancel.cancel();
        // Whoever holds the execution lock finishes; otherwise this step does.
        self.schedule(None);
        true
    }

    fn arm_timer(self: &Arc<Self>, limit: Duration) {
        let item = Arc::downgrade(self);
        let done = self.done.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    if let Some(item) = item.upgrade() {
                        if item.stop(StopReason::TimedOut(limit)) {
                            metrics::record_timeout();
                        }
                    }
                }
                _ = done.cancelled() => {}
            }
        });
    }

    fn schedule(self: &Arc<Self>, delay: Option<Duration>) {
        let item = Arc::clone(self);
        self.runtime.spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = item.cancel.cancelled() => {}
                }
            }
            item.run_step().await;
        });
    }

    // ==================== Drivers ====================

    /// Drives the item.
    ///
    /// Synchronous items wait for admission, then produce every batch before
    /// returning. Asynchronous items perform a single step.
    #[instrument(skip(self), fields(request_id = %self.request.id, connector = %self.request.connector))]
    pub async fn run(self: &Arc<Self>) -> EngineResult<()> {
        match self.request.strategy {
            ExecutionStrategy::Synchronous => {
                let mut admitted = self.admitted.subscribe();
                tokio::select! {
                    ok = async { admitted.wait_for(|ready| *ready).await.is_ok() } => {
                        if !ok {
                            return Err(EngineError::internal("admission signal dropped"));
                        }
                    }
                    _ = self.cancel.cancelled() => {}
                }

                let mut exec = self.execution.lock().await;
                loop {
                    match self.step(&mut exec).await {
                        StepOutcome::Delivered => continue,
                        StepOutcome::Retry(delay) => {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = self.cancel.cancelled() => {}
                            }
                        }
                        StepOutcome::Finished => break,
                    }
                }
                Ok(())
            }
            ExecutionStrategy::Asynchronous => {
                if !self.is_admitted() && !self.cancel.is_cancelled() {
                    return Err(EngineError::not_yet_started(self.request.id));
                }
                self.run_step().await;
                Ok(())
            }
        }
    }

    async fn run_step(self: &Arc<Self>) {
        let mut exec = self.execution.lock().await;
        if let StepOutcome::Retry(delay) = self.step(&mut exec).await {
            drop(exec);
            self.schedule(Some(delay));
        }
    }

    async fn step(&self, exec: &mut Execution) -> StepOutcome {
        if exec.finished {
            return StepOutcome::Finished;
        }
        if let Some(reason) = self.stop_reason() {
            self.finish_stopped(exec, reason).await;
            return StepOutcome::Finished;
        }

        match self.fill(exec).await {
            Ok(Fill::Ready) => self.deliver_next(exec).await,
            Ok(Fill::NotAvailable(delay)) => {
                tracing::trace!(request_id = %self.request.id, delay_ms = delay.as_millis() as u64, "Source not ready; rescheduling");
                StepOutcome::Retry(delay)
            }
            Err(StepError::Stopped) => {
                let reason = self.stop_reason().unwrap_or(StopReason::Cancelled);
                self.finish_stopped(exec, reason).await;
                StepOutcome::Finished
            }
            Err(StepError::Abandoned) => {
                self.finish_abandoned(exec).await;
                StepOutcome::Finished
            }
            Err(StepError::Failed(err)) => {
                self.finish_failed(exec, err).await;
                StepOutcome::Finished
            }
        }
    }

    /// Buffers rows until a full batch is available or the source is done.
    async fn fill(&self, exec: &mut Execution) -> Result<Fill, StepError> {
        if exec.cursor.is_none() {
            self.open(exec).await?;
        } else {
            if exec.keep_alive && exec.source_done && exec.pending.is_empty() {
                // continuation on a kept-alive cursor
                exec.source_done = false;
            }
            self.transition(WorkState::Resuming);
        }

        while exec.pending.len() < self.fetch_size && !exec.source_done {
            if self.cancel.is_cancelled() {
                return Err(StepError::Stopped);
            }
            let cursor = exec
                .cursor
                .as_mut()
                .ok_or_else(|| EngineError::internal("cursor missing after open"))?;

            match self.guarded(cursor.next_row()).await? {
                Fetch::Row(row) => {
                    let row = exec.assembler.assemble_row(row)?;
                    exec.pending.push_back(row);
                }
                Fetch::EndOfData => {
                    if exec.assembler.wants_output_parameters() {
                        let values = self.guarded(cursor.output_parameters()).await?;
                        if let Some(row) = exec.assembler.parameter_row(&values) {
                            exec.pending.push_back(row);
                        }
                    }
                    exec.source_done = true;
                }
                Fetch::NotAvailable { retry_after } => {
                    exec.warnings.extend(cursor.take_warnings());
                    return Ok(Fill::NotAvailable(
                        retry_after.unwrap_or_else(|| self.config.retry_delay()),
                    ));
                }
            }
        }

        if let Some(cursor) = exec.cursor.as_mut() {
            exec.warnings.extend(cursor.take_warnings());
        }
        Ok(Fill::Ready)
    }

    /// Leases the connection and opens the cursor.
    async fn open(&self, exec: &mut Execution) -> Result<(), StepError> {
        if self.request.command.is_mutation() && self.config.immutable {
            return Err(EngineError::read_only(&self.request.connector).into());
        }
        if exec.released {
            return Err(EngineError::internal(format!(
                "connection for {} already released",
                self.request.id
            ))
            .into());
        }

        // Immutable sources never enlist in the caller's transaction.
        let transaction = if self.config.immutable {
            None
        } else {
            self.request.transaction.as_ref()
        };

        let connection = self
            .guarded(self.connections.acquire(&self.request, transaction))
            .await?;
        exec.lease = Some(Arc::clone(&connection));
        self.transition(WorkState::Started);
        tracing::debug!(
            request_id = %self.request.id,
            connection = connection.connection_id(),
            "Connection leased"
        );

        if self.cancel.is_cancelled() {
            return Err(StepError::Stopped);
        }

        let cursor = self
            .guarded(self.adapter.open(connection, &self.request))
            .await?;
        exec.keep_alive = cursor.keep_alive()
            && self.config.keep_alive
            && self.request.strategy == ExecutionStrategy::Asynchronous;
        exec.cursor = Some(cursor);
        Ok(())
    }

    /// Races a source call against cancellation.
    ///
    /// Once cancellation is observed the adapter is asked to stop and the
    /// call gets the connector's grace period to return. A call that
    /// completes in time hands its value back so nothing it produced (a
    /// leased connection, say) is lost; the next checkpoint stops the step.
    async fn guarded<T, F>(&self, call: F) -> Result<T, StepError>
    where
        F: Future<Output = EngineResult<T>>,
    {
        tokio::pin!(call);
        tokio::select! {
            biased;
            result = &mut call => return result.map_err(StepError::Failed),
            _ = self.cancel.cancelled() => {}
        }

        if let Err(err) = self.adapter.cancel(self.request.id).await {
            tracing::warn!(request_id = %self.request.id, error = %err, "Adapter cancel failed");
        }

        match timeout(self.config.cancel_grace(), &mut call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(StepError::Stopped),
            Err(_) => Err(StepError::Abandoned),
        }
    }

    // ==================== Delivery & teardown ====================

    async fn deliver_next(&self, exec: &mut Execution) -> StepOutcome {
        let take = exec.pending.len().min(self.fetch_size);
        let rows: Vec<Row> = exec.pending.drain(..take).collect();
        let last = exec.source_done && exec.pending.is_empty();
        let closed = last && !exec.keep_alive;
        let mut warnings = std::mem::take(&mut exec.warnings);

        if closed {
            self.transition(WorkState::Closing);
            warnings.extend(self.release_resources(exec, true).await);
        } else {
            self.transition(WorkState::BatchReady);
        }

        let batch = self.next_batch(exec, rows, last, closed, warnings);
        self.push(batch);

        if closed {
            self.conclude(exec, Outcome::Completed);
            StepOutcome::Finished
        } else {
            StepOutcome::Delivered
        }
    }

    async fn finish_stopped(&self, exec: &mut Execution, reason: StopReason) {
        self.transition(WorkState::Closing);
        let mut warnings = std::mem::take(&mut exec.warnings);
        warnings.extend(self.release_resources(exec, true).await);

        let outcome = match reason {
            StopReason::Closed => Outcome::Completed,
            StopReason::Cancelled => {
                warnings.push(format!("Request {} was cancelled", self.request.id));
                Outcome::Cancelled
            }
            StopReason::TimedOut(limit) => {
                warnings.push(format!(
                    "Request {} timed out after {}ms",
                    self.request.id,
                    limit.as_millis()
                ));
                Outcome::TimedOut
            }
        };

        // Buffered rows are discarded; the caller asked to stop.
        exec.pending.clear();
        let batch = self.next_batch(exec, Vec::new(), true, true, warnings);
        self.push(batch);
        self.conclude(exec, outcome);
    }

    async fn finish_abandoned(&self, exec: &mut Execution) {
        self.transition(WorkState::Closing);
        tracing::warn!(
            request_id = %self.request.id,
            grace_ms = self.config.cancel_grace_ms,
            "Source ignored cancellation; forcing release"
        );
        // The cursor is stuck in a call; drop it without closing.
        exec.cursor = None;
        for problem in self.release_resources(exec, false).await {
            tracing::warn!(request_id = %self.request.id, "{problem}");
        }

        if let Err(err) = self.channel.deliver_error(EngineError::CancelTimeout {
            grace_ms: self.config.cancel_grace_ms,
        }) {
            tracing::debug!(request_id = %self.request.id, error = %err, "Terminal error not delivered");
        }
        let outcome = match self.stop_reason() {
            Some(StopReason::TimedOut(_)) => Outcome::TimedOut,
            _ => Outcome::Cancelled,
        };
        self.conclude(exec, outcome);
    }

    async fn finish_failed(&self, exec: &mut Execution, err: EngineError) {
        self.transition(WorkState::Closing);
        tracing::warn!(request_id = %self.request.id, error = %err, "Request failed");
        for problem in self.release_resources(exec, true).await {
            tracing::warn!(request_id = %self.request.id, "{problem}");
        }

        if let Err(err) = self.channel.deliver_error(err) {
            tracing::debug!(request_id = %self.request.id, error = %err, "Terminal error not delivered");
        }
        self.conclude(exec, Outcome::Failed);
    }

    /// Releases cursor and connection, each at most once. Failures come back
    /// as warnings so they never suppress the terminal delivery.
    async fn release_resources(&self, exec: &mut Execution, close_cursor: bool) -> Vec<String> {
        let mut problems = Vec::new();

        if let Some(mut cursor) = exec.cursor.take() {
            if close_cursor {
                match timeout(self.config.cancel_grace(), cursor.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        problems.push(format!("Failed to close source execution: {err}"));
                    }
                    Err(_) => {
                        problems.push(format!(
                            "Source execution did not close within {}ms",
                            self.config.cancel_grace_ms
                        ));
                    }
                }
            }
        }

        if let Some(connection) = exec.lease.take() {
            debug_assert!(!exec.released, "connection released twice");
            exec.released = true;
            match timeout(self.config.cancel_grace(), self.connections.release(connection)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    problems.push(format!("Failed to release connection: {err}"));
                }
                Err(_) => {
                    problems.push(format!(
                        "Connection release did not complete within {}ms",
                        self.config.cancel_grace_ms
                    ));
                }
            }
        }

        for problem in &problems {
            tracing::warn!(request_id = %self.request.id, "{problem}");
        }
        problems
    }

    fn next_batch(
        &self,
        exec: &mut Execution,
        rows: Vec<Row>,
        last: bool,
        closed: bool,
        warnings: Vec<String>,
    ) -> ResultBatch {
        let sequence = exec.next_sequence;
        exec.next_sequence += 1;
        ResultBatch {
            request_id: self.request.id,
            sequence,
            rows,
            last,
            closed,
            warnings,
        }
    }

    fn push(&self, batch: ResultBatch) {
        let sequence = batch.sequence;
        match self.channel.deliver(batch) {
            Ok(()) => {
                self.batches_delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::debug!(request_id = %self.request.id, sequence, error = %err, "Batch not delivered");
            }
        }
    }

    fn conclude(&self, exec: &mut Execution, outcome: Outcome) {
        exec.finished = true;
        let started_at = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = WorkState::Closed;
            lifecycle.started_at
        };
        self.done.cancel();

        let elapsed_ms = started_at
            .map(|at| at.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        if started_at.is_some() {
            metrics::record_request(elapsed_ms, outcome != Outcome::Failed);
        }
        tracing::debug!(
            request_id = %self.request.id,
            outcome = ?outcome,
            elapsed_ms,
            "Work item closed"
        );

        self.release_slot();
    }

    fn release_slot(&self) {
        if self.slot_released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(controller) = self.controller.upgrade() {
            if let Err(err) = controller.release(&self.request.id) {
                tracing::debug!(request_id = %self.request.id, error = %err, "Slot already released");
            }
        }
    }

    fn stop_reason(&self) -> Option<StopReason> {
        self.lifecycle.lock().stop
    }

    /// Moves the lifecycle forward. Cancelling only yields to closing, and
    /// nothing leaves Closed.
    fn transition(&self, to: WorkState) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let allowed = match lifecycle.state {
            WorkState::Closed => false,
            WorkState::Cancelling | WorkState::Closing => to.is_terminal(),
            _ => true,
        };
        if allowed {
            lifecycle.state = to;
        }
        allowed
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("request_id", &self.request.id)
            .field("connector", &self.request.connector)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(WorkState::Closing.is_terminal());
        assert!(WorkState::Closed.is_terminal());
        assert!(!WorkState::Cancelling.is_terminal());
        assert!(!WorkState::BatchReady.is_terminal());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&WorkState::BatchReady).unwrap();
        assert_eq!(json, "\"batch_ready\"");
    }
}
