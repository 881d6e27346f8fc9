//! Portico protocol types
//!
//! Request/response pair, per-request call context, handler rules and the
//! dispatch error taxonomy. Every other Portico crate builds on these.

pub mod context;
pub mod error;
pub mod message;
pub mod rules;

pub use context::{CallContext, ChainPosition, ContextKey, Phase};
pub use error::{BoxError, DispatchError, DispatchResult};
pub use message::{DispatchRequest, DispatchResponse};
pub use rules::{HandlerRules, LOAD_KEY};

pub use bytes::Bytes;
pub use http;
