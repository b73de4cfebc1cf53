//! Line-oriented reader over a chunked byte stream.
//!
//! HTTP bodies arrive in chunks whose boundaries have nothing to do with the
//! event-stream framing, so a single `data:` line may be spread over several
//! reads, and a multi-byte character may be cut in half. [`FrameReader`]
//! buffers raw bytes and only hands out complete lines.

use bytes::BytesMut;
use futures_util::{Stream, StreamExt};

use crate::Error;

/// Longest line the reader will buffer before giving up on the stream.
pub const MAX_LINE_BYTES: usize = 1_000_000;

/// Presents a byte stream as a sequence of lines.
///
/// The reader is cancel-safe: all state lives in the struct, so a pending
/// [`next_line`](Self::next_line) future can be dropped without losing data.
pub struct FrameReader<S> {
    /// The underlying byte stream
    inner: S,
    /// Bytes received but not yet returned as a line
    buffer: BytesMut,
    /// Prefix of `buffer` already known to contain no newline
    scanned: usize,
    /// Set once `inner` has returned `None`; it is never polled again
    exhausted: bool,
}

impl<S> FrameReader<S> {
    /// Create a new line reader over a byte stream.
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: BytesMut::new(),
            scanned: 0,
            exhausted: false,
        }
    }

    /// Number of buffered bytes not yet returned as a line.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Split one complete line off the front of the buffer, if there is one.
    fn take_line(&mut self) -> Result<Option<String>, Error> {
        match memchr::memchr(b'\n', &self.buffer[self.scanned..]) {
            Some(offset) => {
                let end = self.scanned + offset;
                let mut line = self.buffer.split_to(end + 1);
                self.scanned = 0;

                let mut len = end;
                if len > 0 && line[len - 1] == b'\r' {
                    len -= 1;
                }
                line.truncate(len);
                decode_line(&line).map(Some)
            }
            None => {
                self.scanned = self.buffer.len();
                if self.buffer.len() > MAX_LINE_BYTES {
                    self.buffer.clear();
                    self.scanned = 0;
                    return Err(Error::streaming(format!(
                        "line exceeded maximum size of {MAX_LINE_BYTES} bytes"
                    )));
                }
                Ok(None)
            }
        }
    }

    /// Return whatever is left once the stream is exhausted as a final line.
    fn take_remainder(&mut self) -> Result<Option<String>, Error> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let mut rest = self.buffer.split();
        self.scanned = 0;
        if rest.ends_with(b"\r") {
            rest.truncate(rest.len() - 1);
        }
        decode_line(&rest).map(Some)
    }
}

impl<S, E> FrameReader<S>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: Into<Error>,
{
    /// Read the next line, without its terminator.
    ///
    /// Returns `Ok(None)` at end of stream once every buffered byte has been
    /// handed out. A read failure from the underlying stream is returned as
    /// an error; the reader should not be used after that.
    pub async fn next_line(&mut self) -> Result<Option<String>, Error> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(Some(line));
            }

            if self.exhausted {
                return self.take_remainder();
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e.into()),
                None => self.exhausted = true,
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> Result<String, Error> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| Error::streaming(format!("Invalid UTF-8 in stream frame: {e}")))
}
