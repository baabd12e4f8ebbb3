use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info, warn};

use crate::http::connection::{Connection, Service};
use crate::server::stats::Counter;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Source of accepted client streams.
///
/// Implemented for [`TcpListener`]; tests plug in scripted acceptors.
pub trait Accept: Send {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(&*self)
    }
}

/// Accept loop: one [`Connection`] task per accepted stream.
pub struct Listener<A = TcpListener> {
    acceptor: A,
    service: Arc<Service>,
    next_id: u64,
}

impl Listener<TcpListener> {
    /// Binds `addr`. A bind failure is fatal for the caller.
    pub async fn bind(addr: impl ToSocketAddrs, service: Service) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("Failed to bind listening socket")?;
        Ok(Self::new(listener, service))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }
}

impl<A: Accept> Listener<A> {
    /// Wraps an already prepared listening socket.
    pub fn new(acceptor: A, service: Service) -> Self {
        Self {
            acceptor,
            service: Arc::new(service),
            next_id: 0,
        }
    }

    pub fn counter(&self) -> &Arc<Counter> {
        &self.service.counter
    }

    /// Accepts connections forever. Individual accept failures are logged
    /// and skipped.
    pub async fn run(mut self) {
        loop {
            self.accept_one().await;
        }
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// running are left to finish on their own.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Listener shutting down");
                    return;
                }
                _ = self.accept_one() => {}
            }
        }
    }

    async fn accept_one(&mut self) {
        match self.acceptor.accept().await {
            Ok((stream, peer)) => self.spawn_connection(stream, peer),
            Err(e) if is_transient_accept_error(&e) => {
                warn!(error = %e, "Transient accept failure, continuing");
            }
            Err(e) => {
                // Typically descriptor exhaustion; back off instead of spinning.
                error!(error = %e, "Accept failed, continuing");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    fn spawn_connection(&mut self, stream: A::Stream, peer: SocketAddr) {
        self.next_id += 1;
        let id = self.next_id;
        info!(conn_id = id, peer = %peer, "Accepted connection");

        let mut conn = Connection::new(stream, peer, id, Arc::clone(&self.service));
        tokio::spawn(async move {
            let reason = conn.run().await;
            debug!(conn_id = id, peer = %peer, reason = %reason, "Connection task finished");
        });
    }
}

/// Errors where the peer gave up before accept completed.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
