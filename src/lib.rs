//! Switchyard - event-driven HTTP connection manager
//!
//! Accepts connections, runs each one through a read/route/write state
//! machine, and writes responses through an ordered per-response queue.

pub mod config;
pub mod http;
pub mod server;

pub use http::connection::{CloseReason, Connection, ConnectionSettings, Service};
pub use http::queue::{Completion, ResponseHandle, WriteError};
pub use http::router::{Handler, Params, RequestContext, Router};
pub use server::listener::Listener;
pub use server::stats::{Counter, StatsSnapshot};
