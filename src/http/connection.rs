use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace, warn};

use crate::http::parser::{
    DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEADER_BYTES, Feed, Http1Processor, ParseError,
    RequestProcessor,
};
use crate::http::queue::{self, QueueItem, QueuedWrite, ResponseQueue, WriteError};
use crate::http::request::Request;
use crate::http::router::{RequestContext, Router};
use crate::http::timer::IdleTimer;
use crate::server::stats::{ConnectionToken, Counter, RequestToken};

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    /// A response finished on a connection that may not be reused.
    #[error("response completed, connection not reusable")]
    Completed,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("protocol error: {0}")]
    Protocol(ParseError),
    #[error("idle timeout")]
    IdleTimeout,
    #[error("I/O error: {0}")]
    Io(io::ErrorKind),
    /// The handler called `close` before finishing its response.
    #[error("closed by handler")]
    Handler,
    /// Every handle for the response was dropped before it was finished.
    #[error("response abandoned by handler")]
    Abandoned,
}

/// Observable lifecycle phase of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Reading,
    Routing,
    Writing,
    Closed,
}

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// How long a connection may sit with no request bytes buffered.
    /// Zero disables the timer.
    pub idle_timeout: Duration,
    /// Bytes reserved in the inbound buffer before each read.
    pub read_buffer_size: usize,
    /// Requests served before the connection is closed; 0 means no cap.
    pub max_requests: usize,
    /// Upper bound on inbound bytes buffered while a handler keeps reading
    /// during a response.
    pub max_buffered_bytes: usize,
    /// Responses that may be queued at once on one connection. Buffered
    /// pipelined requests are routed while an earlier response is still
    /// being written, up to this many.
    pub max_pipelined: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            read_buffer_size: 4096,
            max_requests: 1000,
            max_buffered_bytes: DEFAULT_MAX_HEADER_BYTES + DEFAULT_MAX_BODY_BYTES,
            max_pipelined: 16,
        }
    }
}

/// State shared by every connection of one listener.
#[derive(Clone)]
pub struct Service {
    pub router: Arc<Router>,
    pub processor: Arc<dyn RequestProcessor>,
    pub counter: Arc<Counter>,
    pub settings: ConnectionSettings,
}

impl Service {
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
            processor: Arc::new(Http1Processor::default()),
            counter: Counter::new(),
            settings: ConnectionSettings::default(),
        }
    }

    pub fn with_processor(mut self, processor: impl RequestProcessor) -> Self {
        self.processor = Arc::new(processor);
        self
    }

    pub fn with_counter(mut self, counter: Arc<Counter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }
}

enum State {
    Reading,
    Routing(Request),
    Writing(Writing),
    Closed(CloseReason),
}

/// One routed request whose response is not fully written yet.
struct InFlight {
    queue: ResponseQueue,
    keep_alive: bool,
    _request: RequestToken,
}

impl InFlight {
    /// Whether the next request may be routed behind this response.
    fn admits_successor(&mut self) -> bool {
        self.queue.stage();
        self.keep_alive && self.queue.is_complete()
    }
}

/// Responses being written, oldest first. Only the front one touches the
/// socket; the rest wait with their entries queued.
struct Writing {
    responses: VecDeque<InFlight>,
    current: Option<QueuedWrite>,
    keep_reading: bool,
    peer_eof: bool,
    /// Set when the buffer held no routable request; cleared by new bytes.
    parse_blocked: bool,
}

impl Writing {
    fn new(first: InFlight) -> Self {
        Self {
            responses: VecDeque::from([first]),
            current: None,
            keep_reading: false,
            peer_eof: false,
            parse_blocked: false,
        }
    }

    fn wants_read(&self, buffered: usize, limit: usize) -> bool {
        self.keep_reading && !self.peer_eof && buffered < limit
    }
}

async fn next_item(responses: &mut VecDeque<InFlight>) -> Option<QueueItem> {
    match responses.front_mut() {
        Some(front) => front.queue.next().await,
        None => None,
    }
}

enum Readiness {
    Read(io::Result<usize>),
    Idle,
}

enum WriteStep {
    Item(Option<QueueItem>),
    Wrote(io::Result<usize>),
    Read(io::Result<usize>),
}

/// One client connection and its request/response state machine.
pub struct Connection<S> {
    id: u64,
    peer: SocketAddr,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    socket_closed: bool,
    inbound: BytesMut,
    /// Size of the request at the front of `inbound` once its headers are
    /// known, so the body can arrive without re-parsing them.
    awaiting: Option<usize>,
    timer: IdleTimer,
    state: State,
    service: Arc<Service>,
    requests_served: usize,
    _open: ConnectionToken,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S, peer: SocketAddr, id: u64, service: Arc<Service>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let settings = &service.settings;
        Self {
            id,
            peer,
            reader,
            writer,
            socket_closed: false,
            inbound: BytesMut::with_capacity(settings.read_buffer_size),
            awaiting: None,
            timer: IdleTimer::new(settings.idle_timeout),
            state: State::Reading,
            _open: service.counter.connection_opened(),
            service,
            requests_served: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        match self.state {
            State::Reading => ConnectionState::Reading,
            State::Routing(_) => ConnectionState::Routing,
            State::Writing(_) => ConnectionState::Writing,
            State::Closed(_) => ConnectionState::Closed,
        }
    }

    /// Drives the connection until it closes and returns why it closed.
    ///
    /// Calling it again on a closed connection returns the same reason
    /// without touching the socket.
    pub async fn run(&mut self) -> CloseReason {
        loop {
            // Every arm below installs the real next state.
            let state = mem::replace(&mut self.state, State::Reading);
            self.state = match state {
                State::Reading => self.read_request().await,
                State::Routing(request) => State::Writing(Writing::new(self.route(request))),
                State::Writing(writing) => self.write_response(writing).await,
                State::Closed(reason) => {
                    self.state = State::Closed(reason.clone());
                    return reason;
                }
            };
        }
    }

    /// READING: parse what is buffered, read more when it is not enough.
    async fn read_request(&mut self) -> State {
        loop {
            match self.parse_buffered() {
                Ok(Some(request)) => {
                    self.timer.cancel();
                    return State::Routing(request);
                }
                Ok(None) => {}
                Err(e) => {
                    return self.close(CloseReason::Protocol(e), None).await;
                }
            }

            // Idle only while waiting for the first byte of a request.
            if self.inbound.is_empty() {
                if !self.timer.is_armed() {
                    self.timer.arm();
                }
            } else {
                self.timer.cancel();
            }

            self.inbound.reserve(self.service.settings.read_buffer_size);
            let readiness = tokio::select! {
                res = self.reader.read_buf(&mut self.inbound) => Readiness::Read(res),
                _ = self.timer.expired() => Readiness::Idle,
            };

            match readiness {
                Readiness::Idle => {
                    return self.close(CloseReason::IdleTimeout, None).await;
                }
                Readiness::Read(Ok(0)) => {
                    if !self.inbound.is_empty() {
                        debug!(
                            conn_id = self.id,
                            buffered = self.inbound.len(),
                            "Peer closed mid-request"
                        );
                    }
                    return self.close(CloseReason::PeerClosed, None).await;
                }
                Readiness::Read(Ok(n)) => {
                    trace!(conn_id = self.id, bytes = n, "Read request bytes");
                    self.timer.cancel();
                }
                Readiness::Read(Err(e)) if is_transient(&e) => {}
                Readiness::Read(Err(e)) => {
                    return self.close(CloseReason::Io(e.kind()), None).await;
                }
            }
        }
    }

    /// Takes the next complete request off the inbound buffer, if there is
    /// one.
    fn parse_buffered(&mut self) -> Result<Option<Request>, ParseError> {
        if self.inbound.is_empty() {
            return Ok(None);
        }
        if self.awaiting.is_some_and(|total| self.inbound.len() < total) {
            return Ok(None);
        }

        match self.service.processor.feed(&self.inbound)? {
            Feed::Complete { request, consumed } => {
                self.inbound.advance(consumed);
                self.awaiting = None;
                Ok(Some(request))
            }
            Feed::AwaitingBody { total } => {
                if self.awaiting.is_none() {
                    trace!(conn_id = self.id, total, "Waiting for request body");
                }
                self.awaiting = Some(total);
                Ok(None)
            }
            Feed::Incomplete => Ok(None),
        }
    }

    /// ROUTING: hand the request to its handler and queue its response.
    fn route(&mut self, request: Request) -> InFlight {
        self.requests_served += 1;
        let cap = self.service.settings.max_requests;
        let keep_alive = request.keep_alive() && (cap == 0 || self.requests_served < cap);

        let (handler, params) = self.service.router.resolve(&request.target);
        let token = self.service.counter.request_started();
        let (handle, queue) = queue::channel(keep_alive);

        debug!(
            conn_id = self.id,
            peer = %self.peer,
            method = request.method.as_str(),
            target = %request.target,
            keep_alive,
            "Routing request"
        );

        handler.call(
            RequestContext {
                request,
                params,
                conn_id: self.id,
                peer: self.peer,
            },
            handle,
        );

        InFlight {
            queue,
            keep_alive,
            _request: token,
        }
    }

    /// Routes buffered requests for as long as the newest response is fully
    /// queued and leaves the connection reusable.
    ///
    /// A malformed request stops routing here; READING meets the same error
    /// once the responses ahead of it are written.
    fn route_pipelined(&mut self, w: &mut Writing) {
        while !w.parse_blocked && w.responses.len() < self.service.settings.max_pipelined {
            let admits = w
                .responses
                .back_mut()
                .is_some_and(|newest| newest.admits_successor());
            if !admits {
                return;
            }
            match self.parse_buffered() {
                Ok(Some(request)) => {
                    let in_flight = self.route(request);
                    w.responses.push_back(in_flight);
                }
                Ok(None) => w.parse_blocked = true,
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "Malformed pipelined request");
                    w.parse_blocked = true;
                }
            }
        }
    }

    /// WRITING: drain the front response's queue to the socket in order.
    async fn write_response(&mut self, mut w: Writing) -> State {
        let limit = self.service.settings.max_buffered_bytes;
        loop {
            self.route_pipelined(&mut w);

            let reading = w.wants_read(self.inbound.len(), limit);
            if reading {
                self.inbound.reserve(self.service.settings.read_buffer_size);
            }

            let step = match w.current.as_mut() {
                Some(entry) if entry.pending.is_done() => {
                    let end = entry.pending.is_end_of_response();
                    if end {
                        if let Err(e) = self.writer.flush().await {
                            return self.close(CloseReason::Io(e.kind()), Some(w)).await;
                        }
                    }
                    if let Some(entry) = w.current.take() {
                        entry.succeed();
                    }
                    if end {
                        return self.finish_response(w).await;
                    }
                    continue;
                }
                Some(entry) if reading => tokio::select! {
                    res = entry.pending.write_some(&mut self.writer) => WriteStep::Wrote(res),
                    res = self.reader.read_buf(&mut self.inbound) => WriteStep::Read(res),
                },
                Some(entry) => WriteStep::Wrote(entry.pending.write_some(&mut self.writer).await),
                None if reading => tokio::select! {
                    item = next_item(&mut w.responses) => WriteStep::Item(item),
                    res = self.reader.read_buf(&mut self.inbound) => WriteStep::Read(res),
                },
                None => WriteStep::Item(next_item(&mut w.responses).await),
            };

            match step {
                WriteStep::Item(Some(QueueItem::Write(entry))) => w.current = Some(entry),
                WriteStep::Item(Some(QueueItem::KeepReading)) => {
                    trace!(conn_id = self.id, "Handler keeps reading during response");
                    w.keep_reading = true;
                }
                WriteStep::Item(Some(QueueItem::Close)) => {
                    return self.close(CloseReason::Handler, Some(w)).await;
                }
                WriteStep::Item(None) => {
                    return self.close(CloseReason::Abandoned, Some(w)).await;
                }
                WriteStep::Wrote(Ok(n)) => {
                    trace!(conn_id = self.id, bytes = n, "Wrote response bytes");
                }
                WriteStep::Read(Ok(0)) => {
                    debug!(conn_id = self.id, "Peer finished sending during response");
                    w.peer_eof = true;
                }
                WriteStep::Read(Ok(n)) => {
                    trace!(conn_id = self.id, bytes = n, "Buffered bytes during response");
                    w.parse_blocked = false;
                }
                WriteStep::Wrote(Err(e)) | WriteStep::Read(Err(e)) if is_transient(&e) => {
                    tokio::task::yield_now().await;
                }
                WriteStep::Wrote(Err(e)) | WriteStep::Read(Err(e)) => {
                    return self.close(CloseReason::Io(e.kind()), Some(w)).await;
                }
            }
        }
    }

    /// The front response's end-of-response entry has been flushed: move on
    /// to the next queued response, read the next request, or close.
    async fn finish_response(&mut self, mut w: Writing) -> State {
        let Some(mut done) = w.responses.pop_front() else {
            return State::Reading;
        };
        let close_requested = done.queue.close_requested();
        debug!(
            conn_id = self.id,
            keep_alive = done.keep_alive,
            close_requested,
            queued = w.responses.len(),
            "Response complete"
        );

        if !done.keep_alive || close_requested {
            return self.close(CloseReason::Completed, Some(w)).await;
        }

        // Releases the request token; reading on behalf of a handler ends
        // with its response.
        drop(done);
        w.keep_reading = false;
        if w.responses.is_empty() {
            // The next request, possibly already buffered, is parsed straight
            // away.
            State::Reading
        } else {
            State::Writing(w)
        }
    }

    /// CLOSED: fail what is still queued and release the socket.
    async fn close(&mut self, reason: CloseReason, writing: Option<Writing>) -> State {
        self.timer.cancel();

        if let Some(mut w) = writing {
            if let Some(entry) = w.current.take() {
                entry.fail(WriteError::Closed(reason.clone()));
            }
            let failed: usize = w
                .responses
                .iter_mut()
                .map(|r| r.queue.fail_all(&reason))
                .sum();
            if failed > 0 {
                debug!(conn_id = self.id, failed, "Failed queued writes on close");
            }
        }

        self.shutdown_socket().await;

        match &reason {
            CloseReason::Protocol(_) | CloseReason::Io(_) | CloseReason::Abandoned => {
                warn!(conn_id = self.id, peer = %self.peer, reason = %reason, "Connection closed");
            }
            _ => {
                debug!(conn_id = self.id, peer = %self.peer, reason = %reason, "Connection closed");
            }
        }

        State::Closed(reason)
    }

    async fn shutdown_socket(&mut self) {
        if self.socket_closed {
            return;
        }
        self.socket_closed = true;
        if let Err(e) = self.writer.shutdown().await {
            trace!(conn_id = self.id, error = %e, "Socket shutdown failed");
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
