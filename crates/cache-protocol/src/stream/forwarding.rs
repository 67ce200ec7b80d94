use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

use super::BoxReader;
use crate::cache::CacheWriter;

const SKIP_CHUNK: usize = 8 * 1024;

/// Read-only view of a source stream mirroring every byte into a shadow
/// writer, typically the write stream of a new cache entry.
///
/// The shadow is shut down (committing the entry) when the source ends and
/// dropped (discarding it) when the reader is dropped early. Shadow failures
/// only kill the shadow unless [`ForwardingReader::propagate_errors`] is set.
pub struct ForwardingReader {
    source: BoxReader,
    shadow: Option<CacheWriter>,
    /// Bytes read but not yet written to the shadow
    pending: BytesMut,
    /// Leading bytes forwarded to the shadow but hidden from the caller
    skip: u64,
    propagate_errors: bool,
    shadow_closed: bool,
    forwarded: u64,
}

impl ForwardingReader {
    pub fn new(source: BoxReader, shadow: CacheWriter) -> Self {
        Self {
            source,
            shadow: Some(shadow),
            pending: BytesMut::new(),
            skip: 0,
            propagate_errors: false,
            shadow_closed: false,
            forwarded: 0,
        }
    }

    /// A reader that only drops the first `skip` bytes of `source`
    pub fn skipping(source: BoxReader, skip: u64) -> Self {
        Self {
            source,
            shadow: None,
            pending: BytesMut::new(),
            skip,
            propagate_errors: false,
            shadow_closed: true,
            forwarded: 0,
        }
    }

    /// Hide the first `skip` bytes from the caller
    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    /// Fail reads when the shadow fails instead of dropping the shadow
    pub fn propagate_errors(mut self, propagate: bool) -> Self {
        self.propagate_errors = propagate;
        self
    }

    /// Whether the shadow is still receiving bytes
    pub fn is_forwarding(&self) -> bool {
        self.shadow.is_some()
    }

    /// Bytes accepted by the shadow so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    fn shadow_failed(&mut self, err: io::Error) -> io::Result<()> {
        self.shadow = None;
        self.pending.clear();
        if self.propagate_errors {
            return Err(err);
        }
        warn!(error = %err, forwarded = self.forwarded, "Cache write failed, serving without caching");
        Ok(())
    }

    /// Drain pending bytes into the shadow
    fn poll_forward(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let Some(shadow) = self.shadow.as_mut() else {
                self.pending.clear();
                break;
            };
            match ready!(Pin::new(shadow).poll_write(cx, &self.pending)) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "cache writer accepted no bytes");
                    return Poll::Ready(self.shadow_failed(err));
                }
                Ok(written) => {
                    self.pending.advance(written);
                    self.forwarded += written as u64;
                }
                Err(err) => return Poll::Ready(self.shadow_failed(err)),
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Commit the shadow after the source ended
    fn poll_close_shadow(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shadow_closed {
            return Poll::Ready(Ok(()));
        }
        if let Some(shadow) = self.shadow.as_mut() {
            if let Err(err) = ready!(Pin::new(shadow).poll_shutdown(cx)) {
                return Poll::Ready(self.shadow_failed(err));
            }
            debug!(forwarded = self.forwarded, "Cache entry written");
        }
        self.shadow_closed = true;
        self.shadow = None;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ForwardingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            ready!(this.poll_forward(cx))?;

            if this.skip > 0 {
                let mut scratch = [0u8; SKIP_CHUNK];
                let limit = usize::try_from(this.skip).map_or(SKIP_CHUNK, |skip| skip.min(SKIP_CHUNK));
                let mut skipped = ReadBuf::new(&mut scratch[..limit]);
                ready!(Pin::new(&mut this.source).poll_read(cx, &mut skipped))?;
                let read = skipped.filled();
                if read.is_empty() {
                    // source ended inside the hidden prefix
                    this.skip = 0;
                    continue;
                }
                this.skip -= read.len() as u64;
                if this.shadow.is_some() {
                    this.pending.extend_from_slice(read);
                }
                continue;
            }

            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.source).poll_read(cx, buf))?;
            let read = &buf.filled()[before..];
            if read.is_empty() {
                ready!(this.poll_close_shadow(cx))?;
                return Poll::Ready(Ok(()));
            }
            if this.shadow.is_some() {
                this.pending.extend_from_slice(read);
            }
            return Poll::Ready(Ok(()));
        }
    }
}
