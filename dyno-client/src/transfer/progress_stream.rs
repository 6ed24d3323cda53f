//! Byte-counting stream wrapper for upload bodies.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Stream wrapper that adds every chunk's length to a shared counter.
pub struct ProgressStream<S> {
    inner: S,
    bytes_transferred: u64,
    counter: Arc<AtomicU64>,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, counter: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
            counter,
        }
    }

    /// Bytes that passed through this stream
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let chunk_size = bytes.len() as u64;
                self.bytes_transferred += chunk_size;
                self.counter.fetch_add(chunk_size, Ordering::Relaxed);
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}
