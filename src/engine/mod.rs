// Dispatch Engine Module
// Admission, execution and delivery of connector sub-requests

pub mod admission;
pub mod assembler;
pub mod channel;
pub mod dispatcher;
pub mod work_item;

pub use admission::{AdmissionController, AdmissionSnapshot, WorkHandle};
pub use assembler::BatchAssembler;
pub use channel::{ChannelReceiver, DeliveryEvent, DeliveryStream, ResultReceiver, ResultsChannel};
pub use dispatcher::Dispatcher;
pub use work_item::{WorkState, WorkSummary};
