use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

/// Seekable window `[offset, offset + size)` over a seekable source.
///
/// Positions reported and accepted by the window are relative to `offset`.
/// Reads stop at the end of the window and writes past it fail. A `size` of
/// `None` extends the window to the end of the source.
pub struct RangeStream<S> {
    inner: S,
    offset: u64,
    size: Option<u64>,
    /// Position inside the window
    position: u64,
    /// Absolute source position still to be reached before the next I/O
    pending_seek: Option<u64>,
    seeking: bool,
}

impl<S> RangeStream<S> {
    pub fn new(inner: S, offset: u64, size: Option<u64>) -> Self {
        Self {
            inner,
            offset,
            size,
            position: 0,
            pending_seek: Some(offset),
            seeking: false,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn remaining(&self) -> Option<u64> {
        self.size.map(|size| size.saturating_sub(self.position))
    }
}

impl<S: AsyncSeek + Unpin> RangeStream<S> {
    /// Move the source to the window position before reading or writing
    fn poll_position(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(target) = self.pending_seek {
            if !self.seeking {
                Pin::new(&mut self.inner).start_seek(SeekFrom::Start(target))?;
                self.seeking = true;
            }
            ready!(Pin::new(&mut self.inner).poll_complete(cx))?;
            self.seeking = false;
            self.pending_seek = None;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncSeek + Unpin> AsyncRead for RangeStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_position(cx))?;

        let limit = match this.remaining() {
            Some(0) => return Poll::Ready(Ok(())),
            Some(remaining) => usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.remaining()),
            None => buf.remaining(),
        };
        let mut window = buf.take(limit);
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut window))?;
        let read = window.filled().len();
        // SAFETY: `window` wrote `read` initialized bytes into `buf`'s unfilled part
        unsafe {
            buf.assume_init(read);
        }
        buf.advance(read);
        this.position += read as u64;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncSeek + Unpin> AsyncSeek for RangeStream<S> {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let target = match position {
            SeekFrom::Start(pos) => i128::from(pos),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            SeekFrom::End(delta) => {
                let Some(size) = self.size else {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "seek from end of an open-ended range",
                    ));
                };
                i128::from(size) + i128::from(delta)
            }
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the range",
            ));
        }
        let mut relative = u64::try_from(target).unwrap_or(u64::MAX);
        if let Some(size) = self.size {
            relative = relative.min(size);
        }
        self.position = relative;
        self.pending_seek = Some(self.offset.saturating_add(relative));
        self.seeking = false;
        Ok(())
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        ready!(self.poll_position(cx))?;
        Poll::Ready(Ok(self.position))
    }
}

impl<S: AsyncWrite + AsyncSeek + Unpin> AsyncWrite for RangeStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        ready!(this.poll_position(cx))?;

        let limit = match this.remaining() {
            Some(0) if !buf.is_empty() => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write past the end of the range",
                )));
            }
            Some(remaining) => usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len()),
            None => buf.len(),
        };
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..limit]))?;
        this.position += written as u64;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
