//! Admission Controller
//!
//! Per-connector concurrency limiter. At most `max_connections` work items
//! are active at once; the rest wait in a FIFO queue and are started, in
//! submission order, as active items reach a terminal state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use qore_core::{
    ConnectionSource, EngineError, EngineResult, ExecutionAdapter, Request, RequestId, SessionId,
};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::instrument;

use crate::config::ConnectorConfig;
use crate::engine::channel::ResultReceiver;
use crate::engine::work_item::{WorkItem, WorkState, WorkSummary};
use crate::metrics;

/// Caller's handle on a submitted request.
#[derive(Clone, Debug)]
pub struct WorkHandle {
    item: Arc<WorkItem>,
}

impl WorkHandle {
    pub fn id(&self) -> RequestId {
        self.item.id()
    }

    pub fn state(&self) -> WorkState {
        self.item.state()
    }

    pub fn summary(&self) -> WorkSummary {
        self.item.summary()
    }

    /// Fails with `NotYetStarted` while queued and `AlreadyClosed` once closed.
    pub fn request_more(&self) -> EngineResult<()> {
        self.item.request_more()
    }

    pub fn cancel(&self) {
        self.item.cancel()
    }

    pub fn close(&self) {
        self.item.close()
    }

    /// Drives a synchronous request to completion, or runs one step of an
    /// asynchronous one.
    pub async fn run(&self) -> EngineResult<()> {
        self.item.run().await
    }

    /// Resolves once the terminal delivery has been made.
    pub async fn closed(&self) {
        self.item.closed().await
    }
}

/// Point-in-time view of one connector's admission state.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub connector: String,
    pub max_connections: usize,
    pub active: Vec<WorkSummary>,
    pub queued: Vec<WorkSummary>,
}

/// Terminated ids remembered so late `close`/`request_more` calls by id
/// still see a closed request.
const CLOSED_HISTORY: usize = 4096;

#[derive(Default)]
struct AdmissionState {
    active: HashMap<RequestId, Arc<WorkItem>>,
    /// Submission order. May hold ids already removed from `queued`; those
    /// are skipped on promotion.
    order: VecDeque<RequestId>,
    queued: HashMap<RequestId, Arc<WorkItem>>,
    closed: HashSet<RequestId>,
    closed_order: VecDeque<RequestId>,
    shutting_down: bool,
}

impl AdmissionState {
    fn contains(&self, id: &RequestId) -> bool {
        self.active.contains_key(id) || self.queued.contains_key(id)
    }

    fn is_idle(&self) -> bool {
        self.active.is_empty() && self.queued.is_empty()
    }

    fn enqueue(&mut self, item: Arc<WorkItem>) {
        self.order.push_back(item.id());
        self.queued.insert(item.id(), item);
    }

    /// Next live queued item in submission order.
    fn pop_queued(&mut self) -> Option<Arc<WorkItem>> {
        while let Some(id) = self.order.pop_front() {
            if let Some(item) = self.queued.remove(&id) {
                return Some(item);
            }
        }
        None
    }

    fn remove_queued(&mut self, id: &RequestId) -> bool {
        let removed = self.queued.remove(id).is_some();
        if self.queued.is_empty() {
            self.order.clear();
        }
        removed
    }

    fn queued_in_order(&self) -> Vec<Arc<WorkItem>> {
        self.order
            .iter()
            .filter_map(|id| self.queued.get(id).cloned())
            .collect()
    }

    fn remember_closed(&mut self, id: RequestId) {
        if self.closed.insert(id) {
            self.closed_order.push_back(id);
        }
        while self.closed_order.len() > CLOSED_HISTORY {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }
}

enum Lookup {
    Live(Arc<WorkItem>),
    Closed,
}

/// Bounded pool of executing work items for one connector.
pub struct AdmissionController {
    connector: String,
    config: Arc<ConnectorConfig>,
    adapter: Arc<dyn ExecutionAdapter>,
    connections: Arc<dyn ConnectionSource>,
    runtime: Handle,
    state: Mutex<AdmissionState>,
    idle: Notify,
}

impl AdmissionController {
    /// Creates a controller that schedules work on the current tokio runtime.
    pub fn new(
        connector: impl Into<String>,
        config: ConnectorConfig,
        adapter: Arc<dyn ExecutionAdapter>,
        connections: Arc<dyn ConnectionSource>,
    ) -> EngineResult<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| {
            EngineError::internal("admission controller must be created inside a tokio runtime")
        })?;
        Self::with_runtime(connector, config, adapter, connections, runtime)
    }

    pub fn with_runtime(
        connector: impl Into<String>,
        config: ConnectorConfig,
        adapter: Arc<dyn ExecutionAdapter>,
        connections: Arc<dyn ConnectionSource>,
        runtime: Handle,
    ) -> EngineResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            connector: connector.into(),
            config: Arc::new(config),
            adapter,
            connections,
            runtime,
            state: Mutex::new(AdmissionState::default()),
            idle: Notify::new(),
        }))
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Registers `request` and starts it if a slot is free, queueing it otherwise.
    ///
    /// Never blocks on capacity. A second registration under a live
    /// identifier is a caller defect and fails with `AlreadyExists`.
    #[instrument(
        skip(self, request, receiver),
        fields(
            connector = %self.connector,
            request_id = %request.id,
            kind = ?request.command.kind(),
            strategy = ?request.strategy
        )
    )]
    pub fn submit(
        self: &Arc<Self>,
        request: Request,
        receiver: Arc<dyn ResultReceiver>,
    ) -> EngineResult<WorkHandle> {
        if request.connector != self.connector {
            return Err(EngineError::validation(format!(
                "Request for connector '{}' submitted to '{}'",
                request.connector, self.connector
            )));
        }

        let (item, start) = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return Err(EngineError::shutting_down(&self.connector));
            }
            if state.contains(&request.id) {
                tracing::error!("Duplicate request identifier submitted");
                return Err(EngineError::already_exists(request.id));
            }
            // A reused id starts a fresh request.
            if state.closed.remove(&request.id) {
                state.closed_order.retain(|id| *id != request.id);
            }

            let item = WorkItem::new(
                request,
                Arc::clone(&self.config),
                Arc::clone(&self.adapter),
                Arc::clone(&self.connections),
                receiver,
                Arc::downgrade(self),
                self.runtime.clone(),
            );

            let start = state.active.len() < self.config.max_connections;
            if start {
                state.active.insert(item.id(), Arc::clone(&item));
            } else {
                state.enqueue(Arc::clone(&item));
                tracing::debug!(position = state.queued.len(), "Connector saturated; request queued");
            }
            (item, start)
        };

        metrics::record_submit(!start);
        if start {
            item.admit();
        }
        Ok(WorkHandle { item })
    }

    /// Frees the slot of a terminated item and starts queued items in FIFO
    /// order while capacity allows. A queued item that terminated before
    /// starting is just removed from the queue.
    pub fn release(&self, id: &RequestId) -> EngineResult<()> {
        let to_start = {
            let mut state = self.state.lock();
            let to_start = if state.active.remove(id).is_some() {
                let mut to_start = Vec::new();
                while !state.shutting_down && state.active.len() < self.config.max_connections {
                    let Some(next) = state.pop_queued() else {
                        break;
                    };
                    if next.state().is_terminal() {
                        state.remember_closed(next.id());
                        continue;
                    }
                    state.active.insert(next.id(), Arc::clone(&next));
                    to_start.push(next);
                }
                to_start
            } else if state.remove_queued(id) {
                Vec::new()
            } else {
                return Err(EngineError::request_not_found(id));
            };
            state.remember_closed(*id);
            to_start
        };

        if self.is_idle() {
            self.idle.notify_waiters();
        }

        for item in to_start {
            tracing::debug!(connector = %self.connector, request_id = %item.id(), "Starting queued request");
            item.admit();
        }
        Ok(())
    }

    /// Fails with `AlreadyClosed` once the request has terminated.
    pub fn request_more(&self, id: &RequestId) -> EngineResult<()> {
        match self.lookup(id)? {
            Lookup::Live(item) => item.request_more(),
            Lookup::Closed => Err(EngineError::already_closed(id)),
        }
    }

    /// No-op once the request has terminated.
    pub fn cancel(&self, id: &RequestId) -> EngineResult<()> {
        if let Lookup::Live(item) = self.lookup(id)? {
            item.cancel();
        }
        Ok(())
    }

    /// No-op once the request has terminated.
    pub fn close(&self, id: &RequestId) -> EngineResult<()> {
        if let Lookup::Live(item) = self.lookup(id)? {
            item.close();
        }
        Ok(())
    }

    /// Cancels every item, active or queued, belonging to `session`.
    pub fn cancel_session(&self, session: SessionId) -> usize {
        let items: Vec<Arc<WorkItem>> = {
            let state = self.state.lock();
            state
                .active
                .values()
                .chain(state.queued.values())
                .filter(|item| item.id().session == session)
                .cloned()
                .collect()
        };
        for item in &items {
            item.cancel();
        }
        items.len()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle()
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let (active, queued): (Vec<Arc<WorkItem>>, Vec<Arc<WorkItem>>) = {
            let state = self.state.lock();
            (state.active.values().cloned().collect(), state.queued_in_order())
        };
        let mut active: Vec<WorkSummary> = active.iter().map(|item| item.summary()).collect();
        active.sort_by_key(|summary| summary.submitted_at);

        AdmissionSnapshot {
            connector: self.connector.clone(),
            max_connections: self.config.max_connections,
            active,
            queued: queued.iter().map(|item| item.summary()).collect(),
        }
    }

    /// Stops admitting, cancels everything, and waits (bounded by the
    /// connector's shutdown grace) for all items to terminate.
    #[instrument(skip(self), fields(connector = %self.connector))]
    pub async fn shutdown(&self) -> EngineResult<()> {
        let (active, queued) = {
            let mut state = self.state.lock();
            state.shutting_down = true;
            (
                state.active.values().cloned().collect::<Vec<_>>(),
                state.queued_in_order(),
            )
        };
        tracing::info!(
            active = active.len(),
            queued = queued.len(),
            "Shutting down connector"
        );

        for item in queued.iter().chain(active.iter()) {
            item.cancel();
        }

        let grace = self.config.shutdown_grace();
        let drained = timeout(grace, async {
            loop {
                let notified = self.idle.notified();
                if self.is_idle() {
                    break;
                }
                notified.await;
            }
        })
        .await;

        match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                tracing::warn!(
                    remaining = self.active_count() + self.queued_count(),
                    "Shutdown grace period elapsed with work still in flight"
                );
                Err(EngineError::Timeout {
                    timeout_ms: grace.as_millis() as u64,
                })
            }
        }
    }

    fn lookup(&self, id: &RequestId) -> EngineResult<Lookup> {
        let state = self.state.lock();
        if let Some(item) = state.active.get(id).or_else(|| state.queued.get(id)) {
            return Ok(Lookup::Live(Arc::clone(item)));
        }
        if state.closed.contains(id) {
            return Ok(Lookup::Closed);
        }
        Err(EngineError::request_not_found(id))
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("connector", &self.connector)
            .field("max_connections", &self.config.max_connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qore_core::QueryId;

    fn id() -> RequestId {
        RequestId::new(SessionId::new(), QueryId::new(), 0)
    }

    #[test]
    fn test_closed_history_is_bounded() {
        let mut state = AdmissionState::default();
        let first = id();
        state.remember_closed(first);
        state.remember_closed(first);
        assert_eq!(state.closed_order.len(), 1);

        for _ in 0..CLOSED_HISTORY {
            state.remember_closed(id());
        }
        assert_eq!(state.closed.len(), CLOSED_HISTORY);
        assert_eq!(state.closed_order.len(), CLOSED_HISTORY);
        assert!(!state.closed.contains(&first));
    }

    #[test]
    fn test_empty_queue_drops_stale_order() {
        let mut state = AdmissionState::default();
        state.order.extend([id(), id()]);

        assert!(!state.remove_queued(&id()));
        assert!(state.order.is_empty());
        assert!(state.pop_queued().is_none());
        assert!(state.is_idle());
    }
}
