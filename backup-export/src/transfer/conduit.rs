//! Bounded byte conduit from a blocking `std::io::Write` producer to an async
//! byte stream consumer.
//!
//! The producer side buffers writes into chunks and hands them over a bounded
//! channel, so it blocks whenever the consumer (usually an upload) falls
//! behind. The stream only ends cleanly if the producer called
//! [`Completion::commit`] after its final flush; a producer that goes away for
//! any other reason makes the stream yield an error instead of EOF, so a
//! half-written object is never mistaken for a finished one.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::utils::errors::Result;

/// Async side of a conduit, also the body type accepted by object stores.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const OPEN: u8 = 0;
const COMMITTED: u8 = 1;
const ABORTED: u8 = 2;

/// Create a conduit holding at most `capacity` in-flight chunks.
pub fn conduit(capacity: usize) -> (ConduitWriter, ByteStream) {
    conduit_with_chunk_size(capacity, DEFAULT_CHUNK_SIZE)
}

pub fn conduit_with_chunk_size(capacity: usize, chunk_size: usize) -> (ConduitWriter, ByteStream) {
    let (tx, rx) = mpsc::channel::<Bytes>(capacity.max(1));
    let state = Arc::new(AtomicU8::new(OPEN));

    let writer = ConduitWriter {
        tx,
        buf: BytesMut::with_capacity(chunk_size),
        chunk_size: chunk_size.max(1),
        state: state.clone(),
    };

    let reader = stream::unfold(Some((rx, state)), |pending| async move {
        let (mut rx, state) = pending?;
        match rx.recv().await {
            Some(chunk) => Some((Ok(chunk), Some((rx, state)))),
            None if state.load(Ordering::Acquire) == COMMITTED => None,
            None => Some((
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "producer stopped before completing the stream",
                )),
                None,
            )),
        }
    })
    .boxed();

    (writer, reader)
}

/// Blocking producer half. Writes must happen on a blocking thread
/// (`spawn_blocking` or a plain thread) unless the conduit was aborted.
pub struct ConduitWriter {
    tx: mpsc::Sender<Bytes>,
    buf: BytesMut,
    chunk_size: usize,
    state: Arc<AtomicU8>,
}

impl ConduitWriter {
    /// Handle used to settle the stream once the writer has been wrapped by
    /// something that owns it (a zip writer, for instance).
    pub fn completion(&self) -> Completion {
        Completion(self.state.clone())
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.state.load(Ordering::Acquire) == ABORTED {
            self.buf.clear();
            return Ok(());
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.tx.blocking_send(chunk).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "conduit reader was dropped")
        })
    }
}

impl Write for ConduitWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        // Aborted: the reader already failed, so bytes written during the
        // owner's teardown (a zip trailer, say) are dropped without blocking.
        if self.state.load(Ordering::Acquire) == ABORTED {
            return Ok(data.len());
        }
        let room = self.chunk_size - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= self.chunk_size {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

impl Drop for ConduitWriter {
    fn drop(&mut self) {
        // Unflushed bytes can't be delivered from here; the stream must not end cleanly.
        if !self.buf.is_empty() {
            self.state.store(ABORTED, Ordering::Release);
        }
    }
}

/// Settles a conduit as completed or aborted.
#[derive(Clone)]
pub struct Completion(Arc<AtomicU8>);

impl Completion {
    /// Call after the producer's final flush and before the writer is dropped.
    pub fn commit(&self) {
        let _ = self
            .0
            .compare_exchange(OPEN, COMMITTED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Fail the stream. Further writes are discarded without blocking.
    pub fn abort(&self) {
        let _ = self
            .0
            .compare_exchange(OPEN, ABORTED, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_committed(&self) -> bool {
        self.0.load(Ordering::Acquire) == COMMITTED
    }

    /// Guard that aborts the conduit when dropped before a commit.
    pub fn abort_on_drop(&self) -> AbortGuard {
        AbortGuard(self.clone())
    }
}

pub struct AbortGuard(Completion);

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Combine the results of a conduit producer and the upload draining it.
///
/// A producer that failed only because the upload stopped reading carries no
/// cause of its own, so the upload's error is reported instead.
pub fn settle<P, U>(produced: Result<P>, uploaded: Result<U>) -> Result<(P, U)> {
    match (produced, uploaded) {
        (Ok(p), Ok(u)) => Ok((p, u)),
        (Err(p), Err(u)) if p.is_broken_pipe() => Err(u),
        (Err(p), _) => Err(p),
        (Ok(_), Err(u)) => Err(u),
    }
}
