//! Connection and request accounting.
//!
//! A [`Counter`] is shared by a listener and all its connections through an
//! `Arc`. Increments hand back a token whose drop performs the matching
//! decrement, so every open is balanced by exactly one close.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counter {
    open_connections: AtomicUsize,
    open_requests: AtomicUsize,
    total_connections: AtomicU64,
    total_requests: AtomicU64,
}

/// Point-in-time copy of a [`Counter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub open_connections: usize,
    pub open_requests: usize,
    pub total_connections: u64,
    pub total_requests: u64,
}

/// Held for as long as a connection is open.
#[derive(Debug)]
pub struct ConnectionToken {
    counter: Arc<Counter>,
}

/// Held from the moment a request is routed until its response completes
/// or its connection closes.
#[derive(Debug)]
pub struct RequestToken {
    counter: Arc<Counter>,
}

impl Counter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_opened(self: &Arc<Self>) -> ConnectionToken {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionToken {
            counter: Arc::clone(self),
        }
    }

    pub fn request_started(self: &Arc<Self>) -> RequestToken {
        self.open_requests.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        RequestToken {
            counter: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            open_connections: self.open_connections.load(Ordering::Relaxed),
            open_requests: self.open_requests.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
        }
    }
}

fn saturating_dec(value: &AtomicUsize) {
    let _ = value.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

impl Drop for ConnectionToken {
    fn drop(&mut self) {
        saturating_dec(&self.counter.open_connections);
    }
}

impl Drop for RequestToken {
    fn drop(&mut self) {
        saturating_dec(&self.counter.open_requests);
    }
}
