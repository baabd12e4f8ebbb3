//! Per-response write queue.
//!
//! A handler gets a [`ResponseHandle`]; every `write` appends an entry to the
//! connection's [`ResponseQueue`] and returns a [`Completion`] that resolves
//! once that entry has been flushed to the socket, or fails if the connection
//! closes first. The connection drains entries strictly in the order they
//! were written.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::http::connection::CloseReason;
use crate::http::response::Response;
use crate::http::writer::{PendingWrite, serialize_response};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The connection closed before the entry reached the socket.
    #[error("connection closed before the write was flushed: {0}")]
    Closed(CloseReason),
    /// The response this handle belongs to is already complete, or the
    /// connection is gone.
    #[error("response is no longer accepting writes")]
    Detached,
}

pub(crate) enum QueueItem {
    Write(QueuedWrite),
    KeepReading,
    Close,
}

pub(crate) struct QueuedWrite {
    pub(crate) pending: PendingWrite,
    notify: oneshot::Sender<Result<(), WriteError>>,
}

impl QueuedWrite {
    pub(crate) fn succeed(self) {
        let _ = self.notify.send(Ok(()));
    }

    pub(crate) fn fail(self, err: WriteError) {
        let _ = self.notify.send(Err(err));
    }
}

/// Resolves when the corresponding write has been flushed or has failed.
///
/// Dropping it is fine; the write still happens.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), WriteError>>,
}

impl Future for Completion {
    type Output = Result<(), WriteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(WriteError::Detached)))
    }
}

/// Write capability handed to a handler for one response.
///
/// Cheap to clone; a handler that answers later keeps a clone and moves it
/// into a task. The response ends with [`finish`](Self::finish) (the empty
/// write). Once every clone is dropped without finishing, the connection
/// gives up on the response and closes.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    tx: mpsc::UnboundedSender<QueueItem>,
    keep_alive: bool,
}

impl ResponseHandle {
    /// Queues `payload` behind everything written so far.
    ///
    /// An empty payload marks the end of the response.
    pub fn write(&self, payload: impl Into<Bytes>) -> Completion {
        let (notify, rx) = oneshot::channel();
        let item = QueueItem::Write(QueuedWrite {
            pending: PendingWrite::new(payload.into()),
            notify,
        });
        // A closed queue drops the item, which fails the completion.
        let _ = self.tx.send(item);
        Completion { rx }
    }

    /// Ends the response.
    pub fn finish(&self) -> Completion {
        self.write(Bytes::new())
    }

    /// Serializes `response`, writes it and ends the response.
    ///
    /// Adds `Connection: close` when the connection will not be reused, and
    /// closes the connection afterwards when the response carries that
    /// header. The returned completion is the end-of-response one.
    pub fn send(&self, mut response: Response) -> Completion {
        if !self.keep_alive && !response.closes_connection() {
            response.set_header("Connection", "close");
        }
        let close = response.closes_connection();

        let _ = self.write(serialize_response(&response));
        let done = self.finish();
        if close {
            self.close();
        }
        done
    }

    /// Lets the connection keep reading the socket while this response is
    /// being written. Bytes read are buffered for the next request.
    pub fn keep_reading(&self) {
        let _ = self.tx.send(QueueItem::KeepReading);
    }

    /// Closes the connection once everything queued before this call has
    /// been flushed. Writes queued after it fail.
    pub fn close(&self) {
        let _ = self.tx.send(QueueItem::Close);
    }

    /// Whether the connection intends to serve another request after this
    /// response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// True once the response no longer accepts writes.
    pub fn is_detached(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side of one response's writes, owned by the connection.
///
/// Items already sent by the handler can be staged ahead of the socket, so
/// the connection learns that a response is fully queued before its bytes
/// have been written.
pub struct ResponseQueue {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    staged: VecDeque<QueueItem>,
    ended: bool,
    closing: bool,
    close_after_end: bool,
}

/// Creates the handle/queue pair for one response.
pub fn channel(keep_alive: bool) -> (ResponseHandle, ResponseQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = ResponseQueue {
        rx,
        staged: VecDeque::new(),
        ended: false,
        closing: false,
        close_after_end: false,
    };
    (ResponseHandle { tx, keep_alive }, queue)
}

impl ResponseQueue {
    /// Next item in write order; `None` once every handle is gone and the
    /// queue is empty.
    pub(crate) async fn next(&mut self) -> Option<QueueItem> {
        if let Some(item) = self.staged.pop_front() {
            return Some(item);
        }
        let item = self.rx.recv().await?;
        if let Some(item) = self.admit(item) {
            return Some(item);
        }
        // Only reachable after the end-of-response entry was handed out,
        // at which point the connection stops asking.
        None
    }

    /// Moves everything the handler has sent so far into the staging area.
    pub(crate) fn stage(&mut self) {
        while let Ok(item) = self.rx.try_recv() {
            if let Some(item) = self.admit(item) {
                self.staged.push_back(item);
            }
        }
    }

    /// True once the end-of-response entry is queued and nothing queued
    /// before it asks to close the connection.
    pub(crate) fn is_complete(&self) -> bool {
        self.ended && !self.closing && !self.close_after_end
    }

    /// Inspects what was queued after the end of the response.
    ///
    /// Returns true if the handler asked to close. Stray writes fail.
    pub(crate) fn close_requested(&mut self) -> bool {
        self.stage();
        self.close_after_end
    }

    /// Stops accepting writes and fails every queued entry in FIFO order.
    ///
    /// Returns how many entries were failed.
    pub(crate) fn fail_all(&mut self, reason: &CloseReason) -> usize {
        self.rx.close();
        let mut failed = 0;
        let rest = std::iter::from_fn(|| self.rx.try_recv().ok());
        for item in self.staged.drain(..).chain(rest) {
            if let QueueItem::Write(w) = item {
                w.fail(WriteError::Closed(reason.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Tracks the end-of-response entry. Items after it are not part of
    /// the response and are consumed here.
    fn admit(&mut self, item: QueueItem) -> Option<QueueItem> {
        if self.ended {
            match item {
                QueueItem::Close => self.close_after_end = true,
                QueueItem::Write(w) => w.fail(WriteError::Detached),
                QueueItem::KeepReading => {}
            }
            return None;
        }
        match &item {
            QueueItem::Write(w) if w.pending.is_end_of_response() => self.ended = true,
            QueueItem::Close => self.closing = true,
            _ => {}
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::{ResponseBuilder, StatusCode};

    #[tokio::test]
    async fn write_after_queue_dropped_is_detached() {
        let (handle, queue) = channel(true);
        drop(queue);

        assert!(handle.is_detached());
        assert_eq!(handle.write("late").await, Err(WriteError::Detached));
    }

    #[tokio::test]
    async fn fail_all_notifies_in_order() {
        let (handle, mut queue) = channel(true);
        let first = handle.write("a");
        let second = handle.finish();

        assert_eq!(queue.fail_all(&CloseReason::IdleTimeout), 2);
        assert_eq!(
            first.await,
            Err(WriteError::Closed(CloseReason::IdleTimeout))
        );
        assert_eq!(
            second.await,
            Err(WriteError::Closed(CloseReason::IdleTimeout))
        );
        assert!(handle.is_detached());
    }

    #[tokio::test]
    async fn close_after_finish_is_seen_after_end_of_response() {
        let (handle, mut queue) = channel(true);
        handle.finish();
        handle.close();

        match queue.next().await {
            Some(QueueItem::Write(w)) => assert!(w.pending.is_end_of_response()),
            _ => panic!("expected the end-of-response entry first"),
        }
        assert!(queue.close_requested());
    }

    #[tokio::test]
    async fn staging_marks_complete_response() {
        let (handle, mut queue) = channel(true);
        let body = handle.write("body");
        queue.stage();
        assert!(!queue.is_complete());

        handle.finish();
        let stray = handle.write("late");
        queue.stage();
        assert!(queue.is_complete());
        assert_eq!(stray.await, Err(WriteError::Detached));

        // Staged entries still come out in order.
        match queue.next().await {
            Some(QueueItem::Write(w)) => {
                assert_eq!(w.pending.remaining(), b"body");
                w.succeed();
            }
            _ => panic!("expected the body entry first"),
        }
        assert_eq!(body.await, Ok(()));
        match queue.next().await {
            Some(QueueItem::Write(w)) => assert!(w.pending.is_end_of_response()),
            _ => panic!("expected the end-of-response entry"),
        }
    }

    #[tokio::test]
    async fn close_before_end_is_not_complete() {
        let (handle, mut queue) = channel(true);
        handle.close();
        handle.finish();
        queue.stage();
        assert!(!queue.is_complete());

        let (handle, mut queue) = channel(true);
        handle.finish();
        handle.close();
        queue.stage();
        assert!(!queue.is_complete());
        assert!(queue.close_requested());
    }

    #[tokio::test]
    async fn fail_all_covers_staged_and_unstaged() {
        let (handle, mut queue) = channel(true);
        let staged = handle.write("a");
        queue.stage();
        let unstaged = handle.write("b");

        assert_eq!(queue.fail_all(&CloseReason::PeerClosed), 2);
        assert_eq!(staged.await, Err(WriteError::Closed(CloseReason::PeerClosed)));
        assert_eq!(
            unstaged.await,
            Err(WriteError::Closed(CloseReason::PeerClosed))
        );
    }

    #[tokio::test]
    async fn send_replaces_connection_header_of_any_case() {
        let (handle, mut queue) = channel(false);
        let response = ResponseBuilder::new(StatusCode::Ok)
            .header("connection", "keep-alive")
            .build();
        handle.send(response);

        let head = match queue.next().await {
            Some(QueueItem::Write(w)) => String::from_utf8(w.pending.remaining().to_vec()).unwrap(),
            _ => panic!("expected the serialized response"),
        };
        assert_eq!(head.to_ascii_lowercase().matches("connection:").count(), 1);
        assert!(head.contains("Connection: close\r\n"));

        queue.stage();
        assert!(queue.close_requested());
    }
}
