use std::io;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::response::Response;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Serializes a full response: status line, headers (sorted by name so the
/// output is stable), blank line, body.
pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + resp.body.len());

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    let mut headers: Vec<_> = resp.headers.iter().collect();
    headers.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    buf.extend_from_slice(&resp.body);

    buf
}

/// One payload being flushed to the socket, with its send offset.
///
/// An empty payload is the end-of-response marker: it counts as fully sent
/// without touching the socket.
#[derive(Debug)]
pub struct PendingWrite {
    payload: Bytes,
    written: usize,
}

impl PendingWrite {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            written: 0,
        }
    }

    pub fn is_end_of_response(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.written >= self.payload.len()
    }

    pub fn remaining(&self) -> &[u8] {
        &self.payload[self.written..]
    }

    /// Performs one write of the unsent remainder and advances the offset.
    ///
    /// Returns the number of bytes the stream took. A stream that accepts
    /// zero bytes of a non-empty remainder is reported as `WriteZero`.
    pub async fn write_some<W>(&mut self, stream: &mut W) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.is_done() {
            return Ok(0);
        }

        let n = stream.write(self.remaining()).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "connection closed while writing",
            ));
        }

        self.written += n;
        Ok(n)
    }
}
