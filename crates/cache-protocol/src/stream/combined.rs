use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tracing::trace;

use super::BoxReader;

/// Sequential view over a head stream followed by a tail stream.
///
/// The head is dropped as soon as it reports end of stream, releasing the
/// cache entry it reads from before any tail byte is returned.
pub struct CombinedReader {
    head: Option<BoxReader>,
    tail: BoxReader,
    head_read: u64,
    tail_read: u64,
    head_len: Option<u64>,
    tail_len: Option<u64>,
}

impl CombinedReader {
    pub fn new(head: BoxReader, tail: BoxReader) -> Self {
        Self {
            head: Some(head),
            tail,
            head_read: 0,
            tail_read: 0,
            head_len: None,
            tail_len: None,
        }
    }

    /// Declared sizes of the two streams, when known
    pub fn with_lengths(mut self, head: Option<u64>, tail: Option<u64>) -> Self {
        self.head_len = head;
        self.tail_len = tail;
        self
    }

    /// Total size of the combined body, known only when both parts are
    pub fn len(&self) -> Option<u64> {
        self.head_len?.checked_add(self.tail_len?)
    }

    /// Bytes returned so far from both streams
    pub fn position(&self) -> u64 {
        self.head_read + self.tail_read
    }

    pub fn head_done(&self) -> bool {
        self.head.is_none()
    }
}

impl AsyncRead for CombinedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let this = &mut *self;

        if let Some(head) = this.head.as_mut() {
            let before = buf.filled().len();
            match Pin::new(head).poll_read(cx, buf) {
                Poll::Ready(Ok(())) => {
                    let read = buf.filled().len() - before;
                    if read > 0 {
                        this.head_read += read as u64;
                        return Poll::Ready(Ok(()));
                    }
                    trace!(head_bytes = this.head_read, "Head stream finished");
                    this.head = None;
                }
                other => return other,
            }
        }

        let before = buf.filled().len();
        let result = Pin::new(&mut this.tail).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            this.tail_read += (buf.filled().len() - before) as u64;
        }
        result
    }
}
