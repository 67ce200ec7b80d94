use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use super::BoxReader;

/// Body stream that stops with `ConnectionAborted` once its request is aborted.
///
/// The wrapped stream is dropped at cancellation so cache locks and shadow
/// writers it owns are released right away.
pub struct CancelReader {
    inner: Option<BoxReader>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl CancelReader {
    pub fn new(inner: BoxReader, token: CancellationToken) -> Self {
        Self {
            inner: Some(inner),
            cancelled: Box::pin(token.cancelled_owned()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_none()
    }
}

impl AsyncRead for CancelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.inner.is_some() && this.cancelled.as_mut().poll(cx).is_ready() {
            debug!("Request aborted, dropping body stream");
            this.inner = None;
        }
        match this.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "request aborted",
            ))),
        }
    }
}
