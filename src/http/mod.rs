//! HTTP connection handling.
//!
//! # Architecture
//!
//! - **`connection`**: the per-connection state machine
//! - **`queue`**: the ordered response write queue and the handle handlers write through
//! - **`parser`**: turns inbound bytes into requests
//! - **`router`**: maps request paths to handlers
//! - **`request`** / **`response`**: request and response representations
//! - **`writer`**: response serialization and partial-write bookkeeping
//! - **`timer`**: the idle timer
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for request bytes (idle timer armed while buffer is empty)
//!        └──────┬──────┘
//!               │ Complete request parsed
//!               ▼
//!        ┌──────────────────┐
//!        │     Routing      │ ← Resolve handler, hand it a ResponseHandle
//!        └──────┬───────────┘
//!               │
//!               ▼
//!        ┌──────────────────┐
//!        │     Writing      │ ← Drain queued writes until the end-of-response entry
//!        └──────┬───────────┘
//!               │ Response flushed
//!               ├─ More responses queued → Writing
//!               ├─ Keep-Alive → Reading (buffered pipelined request parsed at once)
//!               └─ Close → Closed
//! ```
//!
//! While writing, a buffered pipelined request is routed as soon as the
//! newest response has queued its end-of-response entry. Its writes wait in
//! their own queue behind the earlier responses, so bytes never interleave.
//!
//! Any I/O error, malformed request or idle timeout moves the connection to
//! `Closed` directly; queued writes then fail in order.
//!
//! # Example
//!
//! ```ignore
//! use switchyard::{Listener, Router, Service};
//! use switchyard::http::response::Response;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let router = Router::new().route("/", |_ctx, res: switchyard::ResponseHandle| {
//!         res.send(Response::ok("hello"));
//!     });
//!     Listener::bind("127.0.0.1:8080", Service::new(router)).await?.run().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod parser;
pub mod queue;
pub mod request;
pub mod response;
pub mod router;
pub mod timer;
pub mod writer;
