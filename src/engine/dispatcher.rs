//! Dispatcher
//!
//! Central registry of connectors. Routes each submitted request to the
//! admission controller of its connector, and fans session-wide and
//! shutdown operations out to every controller.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use qore_core::{
    ConnectionSource, EngineError, EngineResult, ExecutionAdapter, Request, RequestId, SessionId,
};
use tracing::instrument;

use crate::config::ConnectorConfig;
use crate::engine::admission::{AdmissionController, AdmissionSnapshot, WorkHandle};
use crate::engine::channel::ResultReceiver;

/// Registry of per-connector admission controllers.
pub struct Dispatcher {
    controllers: RwLock<HashMap<String, Arc<AdmissionController>>>,
}

impl Dispatcher {
    /// Creates a new empty dispatcher
    pub fn new() -> Self {
        Self {
            controllers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a connector with its adapter and connection source.
    ///
    /// Must be called from inside a tokio runtime.
    #[instrument(
        skip(self, config, adapter, connections),
        fields(adapter = adapter.adapter_id(), cancel_support = ?adapter.cancel_support())
    )]
    pub fn register_connector(
        &self,
        name: &str,
        config: ConnectorConfig,
        adapter: Arc<dyn ExecutionAdapter>,
        connections: Arc<dyn ConnectionSource>,
    ) -> EngineResult<Arc<AdmissionController>> {
        let mut controllers = self.controllers.write();
        if controllers.contains_key(name) {
            return Err(EngineError::validation(format!(
                "Connector '{name}' is already registered"
            )));
        }

        let controller = AdmissionController::new(name, config, adapter, connections)?;
        controllers.insert(name.to_string(), Arc::clone(&controller));
        tracing::info!(
            max_connections = controller.config().max_connections,
            immutable = controller.config().immutable,
            "Connector registered"
        );
        Ok(controller)
    }

    /// Gets the controller of a connector
    pub fn controller(&self, connector: &str) -> EngineResult<Arc<AdmissionController>> {
        self.controllers
            .read()
            .get(connector)
            .cloned()
            .ok_or_else(|| EngineError::connector_not_found(connector))
    }

    /// Lists registered connector names, sorted
    pub fn connectors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.controllers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Submits a request to the connector it names.
    pub fn submit(
        &self,
        request: Request,
        receiver: Arc<dyn ResultReceiver>,
    ) -> EngineResult<WorkHandle> {
        self.controller(&request.connector)?.submit(request, receiver)
    }

    pub fn request_more(&self, connector: &str, id: &RequestId) -> EngineResult<()> {
        self.controller(connector)?.request_more(id)
    }

    pub fn cancel(&self, connector: &str, id: &RequestId) -> EngineResult<()> {
        self.controller(connector)?.cancel(id)
    }

    pub fn close(&self, connector: &str, id: &RequestId) -> EngineResult<()> {
        self.controller(connector)?.close(id)
    }

    /// Cancels every request of `session` on every connector.
    #[instrument(skip(self), fields(session_id = %session.0))]
    pub fn cancel_session(&self, session: SessionId) -> usize {
        let cancelled: usize = self
            .all_controllers()
            .iter()
            .map(|controller| controller.cancel_session(session))
            .sum();
        tracing::debug!(cancelled, "Session cancelled");
        cancelled
    }

    /// Admission state of every connector, sorted by name
    pub fn list_active(&self) -> Vec<AdmissionSnapshot> {
        let mut snapshots: Vec<AdmissionSnapshot> = self
            .all_controllers()
            .iter()
            .map(|controller| controller.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.connector.cmp(&b.connector));
        snapshots
    }

    /// Shuts down every connector. All connectors are drained even when one
    /// fails; the first failure is returned.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> EngineResult<()> {
        let mut first_error = None;
        for controller in self.all_controllers() {
            if let Err(err) = controller.shutdown().await {
                tracing::warn!(connector = controller.connector(), error = %err, "Connector shutdown incomplete");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn all_controllers(&self) -> Vec<Arc<AdmissionController>> {
        self.controllers.read().values().cloned().collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::channel::{ChannelReceiver, DeliveryEvent};
    use async_trait::async_trait;
    use qore_core::{
        ColumnInfo, Command, ExecutionCursor, Fetch, QueryId, Row, SourceConnection,
        TransactionContext, Value,
    };
    use std::any::Any;

    struct MockConnection;

    impl SourceConnection for MockConnection {
        fn connection_id(&self) -> &str {
            "mock"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct MockSource;

    #[async_trait]
    impl ConnectionSource for MockSource {
        async fn acquire(
            &self,
            _request: &Request,
            _transaction: Option<&TransactionContext>,
        ) -> EngineResult<Arc<dyn SourceConnection>> {
            Ok(Arc::new(MockConnection))
        }

        async fn release(&self, _connection: Arc<dyn SourceConnection>) -> EngineResult<()> {
            Ok(())
        }
    }

    struct OneRowCursor {
        sent: bool,
    }

    #[async_trait]
    impl ExecutionCursor for OneRowCursor {
        async fn next_row(&mut self) -> EngineResult<Fetch> {
            if self.sent {
                return Ok(Fetch::EndOfData);
            }
            self.sent = true;
            Ok(Fetch::Row(Row::new(vec![Value::Int(1)])))
        }

        async fn close(&mut self) -> EngineResult<()> {
            Ok(())
        }
    }

    struct MockAdapter;

    #[async_trait]
    impl ExecutionAdapter for MockAdapter {
        fn adapter_id(&self) -> &'static str {
            "mock"
        }

        async fn open(
            &self,
            _connection: Arc<dyn SourceConnection>,
            _request: &Request,
        ) -> EngineResult<Box<dyn ExecutionCursor>> {
            Ok(Box::new(OneRowCursor { sent: false }))
        }
    }

    fn register(dispatcher: &Dispatcher, name: &str) {
        dispatcher
            .register_connector(
                name,
                ConnectorConfig::default(),
                Arc::new(MockAdapter),
                Arc::new(MockSource),
            )
            .expect("register connector");
    }

    fn query(connector: &str) -> Request {
        Request::new(
            RequestId::new(SessionId::new(), QueryId::new(), 0),
            connector,
            Command::Query {
                sql: "SELECT 1".to_string(),
                columns: vec![ColumnInfo::new("one", "integer")],
            },
        )
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let dispatcher = Dispatcher::new();
        register(&dispatcher, "b");
        register(&dispatcher, "a");

        assert_eq!(dispatcher.connectors(), vec!["a".to_string(), "b".to_string()]);
        assert!(dispatcher.controller("a").is_ok());

        let err = dispatcher
            .register_connector(
                "a",
                ConnectorConfig::default(),
                Arc::new(MockAdapter),
                Arc::new(MockSource),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .register_connector(
                "zero",
                ConnectorConfig::default().with_max_connections(0),
                Arc::new(MockAdapter),
                Arc::new(MockSource),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationError { .. }));
        assert!(dispatcher.connectors().is_empty());
    }

    #[tokio::test]
    async fn test_submit_unknown_connector() {
        let dispatcher = Dispatcher::new();
        let (receiver, _events) = ChannelReceiver::new();
        let err = dispatcher.submit(query("missing"), receiver).unwrap_err();
        assert!(matches!(err, EngineError::ConnectorNotFound { .. }));
    }

    #[tokio::test]
    async fn test_submit_routes_to_connector() {
        let dispatcher = Dispatcher::new();
        register(&dispatcher, "pg");

        let (receiver, mut events) = ChannelReceiver::new();
        let handle = dispatcher.submit(query("pg"), receiver).unwrap();
        handle.closed().await;

        match events.recv().await {
            Some(DeliveryEvent::Batch(batch)) => {
                assert_eq!(batch.rows.len(), 1);
                assert!(batch.closed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(dispatcher
            .request_more("pg", &handle.id())
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let dispatcher = Dispatcher::new();
        register(&dispatcher, "pg");
        dispatcher.shutdown().await.unwrap();

        let (receiver, _events) = ChannelReceiver::new();
        let err = dispatcher.submit(query("pg"), receiver).unwrap_err();
        assert!(matches!(err, EngineError::ShuttingDown { .. }));
    }
}
