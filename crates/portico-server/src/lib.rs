//! Portico Server: the request-dispatch core.
//!
//! Owns the interceptor chain, the serving-context registry and the mount
//! table, and provides the `RequestHandler` implementation for the transport
//! layer.

pub mod chain;
pub mod interceptor;
pub mod mount;
pub mod pipeline;
pub mod registry;
pub mod rules_watch;
pub mod serving;
pub mod session;

pub use chain::{HandlerRegistry, InterceptorCatalog, InterceptorSnapshot, ServiceId};
pub use interceptor::{Configurable, InterceptResult, Interceptor, SharedInterceptor, shared};
pub use mount::{ContextFactory, MountTable};
pub use pipeline::DispatchPipeline;
pub use registry::{ContextLease, ContextRegistry};
pub use rules_watch::{RulesWatcher, load_rules_file};
pub use serving::{
    ErrorHandler, PlainErrorHandler, RequestDispatcher, SecurityHandler, ServingContext,
};
pub use session::{SessionConfig, SessionHandler};
