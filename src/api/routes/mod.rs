//! Route handlers for the REST API
//!
//! Handlers are organized by domain:
//! - [`tasks`] - Download submission and task reads
//! - [`proxy`] - Proxy pool management
//! - [`system`] - Health, server info, OpenAPI
//! - [`connect`] - Websocket protocol sessions

mod connect;
mod proxy;
mod system;
mod tasks;

// Re-export all handlers so `routes::function_name` works
pub use connect::*;
pub use proxy::*;
pub use system::*;
pub use tasks::*;
