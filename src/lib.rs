// QoreDB dispatch core
// Executes connector sub-requests of a federated query

pub mod config;
pub mod engine;
pub mod metrics;
pub mod observability;

pub use config::ConnectorConfig;
pub use engine::{
    AdmissionController, AdmissionSnapshot, ChannelReceiver, DeliveryEvent, DeliveryStream,
    Dispatcher, ResultReceiver, WorkHandle, WorkState, WorkSummary,
};
pub use qore_core::{EngineError, EngineResult};
