//! QoreCore dispatch model
//!
//! Request and row types, the connector-facing adapter traits, and the
//! unified error type shared by the dispatch core and connector crates.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use traits::{ConnectionSource, ExecutionAdapter, ExecutionCursor, Fetch, SourceConnection};
pub use types::*;
