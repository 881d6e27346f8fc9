//! Portico Transport Layer
//!
//! Provides the HTTP front for the dispatch core. The transport layer handles:
//! - Listener lifecycle (bind, graceful stop)
//! - Body buffering and in-flight limits
//! - Mapping dispatch errors onto HTTP statuses
//! - Health and admin endpoints
//!
//! The transport is decoupled from the dispatch core via the `RequestHandler` trait.

pub mod server;

pub use server::{ADMIN_PREFIX, RequestHandler, TransportConfig, TransportServer, router};
