//! # Stream Combinators
//!
//! Small `AsyncRead` adapters the protocol engine uses to assemble the body
//! handed to the caller from cached and live pieces:
//!
//! - [`CombinedReader`]: cached head followed by the live tail
//! - [`ForwardingReader`]: mirrors everything read into a cache writer
//! - [`RangeStream`]: a seekable window over a cached entry
//! - [`MetadataUpdateReader`]: refreshes entry metadata once fully read
//! - [`CancelReader`]: stops a handed-out stream when the request is aborted

use tokio::io::AsyncRead;

mod cancel;
mod combined;
mod forwarding;
mod metadata_update;
mod range;

pub use cancel::CancelReader;
pub use combined::CombinedReader;
pub use forwarding::ForwardingReader;
pub use metadata_update::MetadataUpdateReader;
pub use range::RangeStream;

/// Owned body stream handed between the engine and its callers
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

#[cfg(test)]
pub(crate) mod test_util {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};

    /// Shadow writer recording what it received and whether it was shut down
    #[derive(Debug, Default, Clone)]
    pub struct RecordingWriter {
        pub written: std::sync::Arc<parking_lot::Mutex<Vec<u8>>>,
        pub shut_down: std::sync::Arc<std::sync::atomic::AtomicBool>,
        pub fail: bool,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fail {
                return Poll::Ready(Err(io::Error::other("disk full")));
            }
            self.written.lock().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shut_down
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    /// A reader yielding `data` in chunks of `chunk` bytes
    pub async fn chunked(data: &[u8], chunk: usize) -> DuplexStream {
        let (mut tx, rx) = tokio::io::duplex(data.len().max(1));
        for part in data.chunks(chunk.max(1)) {
            tx.write_all(part).await.unwrap();
        }
        drop(tx);
        rx
    }
}
