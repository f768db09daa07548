//! Results channel
//!
//! Wraps the caller's receiver callback and enforces the delivery contract:
//! sequence numbers never go backwards, exactly one terminal delivery (a
//! closed batch or an error) happens per request, and nothing follows it.

use std::sync::Arc;

use parking_lot::Mutex;
use qore_core::{EngineError, EngineResult, RequestId, ResultBatch};
use tokio::sync::mpsc;

/// Callback interface implemented by the request dispatcher.
///
/// Callbacks may run on any runtime worker. They may call back into the
/// work handle (`request_more`, `close`, `cancel`); those calls are
/// scheduled, never delivered inline.
pub trait ResultReceiver: Send + Sync {
    fn on_batch(&self, batch: ResultBatch);

    fn on_error(&self, request_id: RequestId, error: EngineError);
}

/// Events emitted by [`ChannelReceiver`]
#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    Batch(ResultBatch),
    Error {
        request_id: RequestId,
        error: EngineError,
    },
}

impl DeliveryEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Batch(batch) => batch.request_id,
            Self::Error { request_id, .. } => *request_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Batch(batch) => batch.closed,
            Self::Error { .. } => true,
        }
    }
}

pub type DeliverySender = mpsc::UnboundedSender<DeliveryEvent>;
pub type DeliveryStream = mpsc::UnboundedReceiver<DeliveryEvent>;

/// Receiver that forwards every delivery into an unbounded channel.
pub struct ChannelReceiver {
    sender: DeliverySender,
}

impl ChannelReceiver {
    pub fn new() -> (Arc<Self>, DeliveryStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl ResultReceiver for ChannelReceiver {
    fn on_batch(&self, batch: ResultBatch) {
        // Receiver dropped: the caller stopped listening
        let _ = self.sender.send(DeliveryEvent::Batch(batch));
    }

    fn on_error(&self, request_id: RequestId, error: EngineError) {
        let _ = self.sender.send(DeliveryEvent::Error { request_id, error });
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    last_sequence: Option<u64>,
    terminal: bool,
}

/// Per-request delivery endpoint.
pub struct ResultsChannel {
    request_id: RequestId,
    receiver: Arc<dyn ResultReceiver>,
    state: Mutex<ChannelState>,
}

impl ResultsChannel {
    pub fn new(request_id: RequestId, receiver: Arc<dyn ResultReceiver>) -> Self {
        Self {
            request_id,
            receiver,
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Pushes one batch. The state lock is released before the callback runs.
    pub fn deliver(&self, batch: ResultBatch) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            if state.terminal {
                tracing::warn!(
                    request_id = %self.request_id,
                    sequence = batch.sequence,
                    "Dropping batch delivered after the terminal one"
                );
                return Err(EngineError::already_closed(self.request_id));
            }
            if let Some(last) = state.last_sequence {
                if batch.sequence < last {
                    return Err(EngineError::internal(format!(
                        "Batch {} for {} delivered after batch {}",
                        batch.sequence, self.request_id, last
                    )));
                }
            }
            state.last_sequence = Some(batch.sequence);
            state.terminal = batch.closed;
        }

        tracing::trace!(
            request_id = %self.request_id,
            sequence = batch.sequence,
            rows = batch.rows.len(),
            closed = batch.closed,
            "Delivering batch"
        );
        self.receiver.on_batch(batch);
        Ok(())
    }

    /// Pushes the terminal error.
    pub fn deliver_error(&self, error: EngineError) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            if state.terminal {
                tracing::warn!(
                    request_id = %self.request_id,
                    error = %error,
                    "Dropping error delivered after the terminal delivery"
                );
                return Err(EngineError::already_closed(self.request_id));
            }
            state.terminal = true;
        }

        self.receiver.on_error(self.request_id, error);
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qore_core::{QueryId, SessionId};

    fn batch(id: RequestId, sequence: u64, closed: bool) -> ResultBatch {
        ResultBatch {
            request_id: id,
            sequence,
            rows: vec![],
            last: closed,
            closed,
            warnings: vec![],
        }
    }

    fn id() -> RequestId {
        RequestId::new(SessionId::new(), QueryId::new(), 0)
    }

    #[test]
    fn test_delivers_in_order_and_stops_after_terminal() {
        let id = id();
        let (receiver, mut events) = ChannelReceiver::new();
        let channel = ResultsChannel::new(id, receiver);

        channel.deliver(batch(id, 0, false)).unwrap();
        channel.deliver(batch(id, 1, true)).unwrap();
        assert!(channel.is_terminated());

        let err = channel.deliver(batch(id, 2, false)).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyClosed { .. }));
        assert!(channel.deliver_error(EngineError::Cancelled).is_err());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].is_terminal());
        assert!(seen[1].is_terminal());
    }

    #[test]
    fn test_rejects_sequence_regression() {
        let id = id();
        let (receiver, _events) = ChannelReceiver::new();
        let channel = ResultsChannel::new(id, receiver);

        channel.deliver(batch(id, 3, false)).unwrap();
        let err = channel.deliver(batch(id, 2, false)).unwrap_err();
        assert!(matches!(err, EngineError::Internal { .. }));
        assert!(!channel.is_terminated());
    }

    #[test]
    fn test_error_is_terminal() {
        let id = id();
        let (receiver, mut events) = ChannelReceiver::new();
        let channel = ResultsChannel::new(id, receiver);

        channel
            .deliver_error(EngineError::execution_error("source went away"))
            .unwrap();
        assert!(channel.deliver(batch(id, 0, true)).is_err());

        let event = events.try_recv().expect("error event");
        assert_eq!(event.request_id(), id);
        assert!(event.is_terminal());
        assert!(events.try_recv().is_err());
    }
}
