use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures::Stream;
use tokio::io::{AsyncRead, ReadBuf};

type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// A reader adapter that wraps a stream of byte chunks, such as a response
/// body, for AsyncRead compatibility
pub struct BytesStreamReader {
    stream: ChunkStream,
    current_chunk: Bytes,
    done: bool,
}

impl BytesStreamReader {
    pub fn new<E>(stream: impl Stream<Item = Result<Bytes, E>> + Send + 'static) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        use futures::TryStreamExt;

        Self {
            stream: Box::pin(stream.map_err(io::Error::other)),
            current_chunk: Bytes::new(),
            done: false,
        }
    }

    /// Reader over the body of a reqwest response
    pub fn from_response(response: reqwest::Response) -> Self {
        Self::new(response.bytes_stream())
    }
}

impl AsyncRead for BytesStreamReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.current_chunk.is_empty() {
                let len = buf.remaining().min(self.current_chunk.len());
                buf.put_slice(&self.current_chunk[..len]);
                self.current_chunk.advance(len);
                return Poll::Ready(Ok(()));
            }
            if self.done {
                return Poll::Ready(Ok(()));
            }

            match self.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.current_chunk = chunk,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
