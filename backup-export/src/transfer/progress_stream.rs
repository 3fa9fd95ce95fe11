//! Byte-counting stream wrapper used to report upload progress.

use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Called with the running byte total, and once more with `done = true` at EOF.
pub type ProgressCallback = Arc<dyn Fn(u64, bool) + Send + Sync>;

pub struct ProgressStream<S> {
    inner: S,
    bytes_seen: u64,
    last_report: Instant,
    interval: Duration,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    pub fn new(inner: S, interval: Duration, callback: ProgressCallback) -> Self {
        Self {
            inner,
            bytes_seen: 0,
            last_report: Instant::now(),
            interval,
            callback,
        }
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_seen += chunk.len() as u64;
                let now = Instant::now();
                if now.duration_since(self.last_report) >= self.interval {
                    (self.callback)(self.bytes_seen, false);
                    self.last_report = now;
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                (self.callback)(self.bytes_seen, true);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_reports_final_total() {
        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defgh")),
        ];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut stream = ProgressStream::new(
            futures_util::stream::iter(chunks),
            Duration::from_secs(3600),
            Arc::new(move |n, done| sink.lock().unwrap().push((n, done))),
        );
        while stream.next().await.is_some() {}

        assert_eq!(stream.bytes_seen(), 8);
        assert_eq!(seen.lock().unwrap().last(), Some(&(8, true)));
    }
}
