//! Built-in Portico services.
//!
//! Interceptors here are registered in [`builtin_catalog`] and can be loaded
//! by name through the `load` rule. The listener and security handler are
//! used by the binary to assemble serving contexts from its config file.

pub mod access_log;
pub mod maintenance;
pub mod request_id;
pub mod security;
pub mod static_files;
pub mod token_auth;

use portico_server::{InterceptorCatalog, shared};

pub use access_log::AccessLogInterceptor;
pub use maintenance::MaintenanceInterceptor;
pub use request_id::{RequestIdInterceptor, RequestIdValue};
pub use security::{BasicAuth, authenticator_for};
pub use static_files::StaticFiles;
pub use token_auth::TokenAuthInterceptor;

/// Catalog holding every built-in interceptor under its rule name.
pub fn builtin_catalog() -> InterceptorCatalog {
    InterceptorCatalog::new()
        .with(access_log::NAME, || Ok(shared(AccessLogInterceptor::new())))
        .with(request_id::NAME, || Ok(shared(RequestIdInterceptor::new())))
        .with(token_auth::NAME, || Ok(shared(TokenAuthInterceptor::new())))
        .with(maintenance::NAME, || Ok(shared(MaintenanceInterceptor::new())))
}
