//! Stream-key → output sink mapping shared by RTMP sessions (producers) and
//! whatever relays the container byte-stream into a pipeline (consumers).

use crate::codec::flv::writer::TagSink;
use crate::fuse::Fuse;
use crate::StreamKey;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub const DEFAULT_SINK_CAPACITY: usize = 256;

/// Producer end of a session's container byte-stream.
///
/// Writes block while the consumer is behind; that is the only backpressure
/// between a publisher and its pipeline.
#[derive(Debug)]
pub struct StreamSink {
    stream_key: StreamKey,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    closed: Fuse,
}

/// Consumer end of a session's container byte-stream. Dropping it closes the sink.
pub struct StreamSource {
    stream_key: StreamKey,
    rx: mpsc::Receiver<Bytes>,
    closed: Fuse,
}

impl StreamSink {
    pub fn pair(stream_key: impl Into<String>, capacity: usize) -> (Arc<StreamSink>, StreamSource) {
        let stream_key = stream_key.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = Fuse::new();
        let sink = Arc::new(StreamSink {
            stream_key: stream_key.clone(),
            tx: Mutex::new(Some(tx)),
            closed: closed.clone(),
        });
        let source = StreamSource {
            stream_key,
            rx,
            closed,
        };
        (sink, source)
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub async fn write(&self, chunk: Bytes) -> io::Result<()> {
        let tx = match self.tx.lock().clone() {
            Some(tx) if !self.closed.is_broken() => tx,
            _ => return Err(sink_closed(&self.stream_key)),
        };
        tokio::select! {
            res = tx.send(chunk) => res.map_err(|_| sink_closed(&self.stream_key)),
            _ = self.closed.wait() => Err(sink_closed(&self.stream_key)),
        }
    }

    /// Forcibly closes the sink. The consumer sees end-of-stream once
    /// in-flight chunks drain; the producer's next write fails.
    pub fn close(&self) {
        self.tx.lock().take();
        if self.closed.break_fuse() {
            log::debug!("stream sink {} closed", self.stream_key);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_broken()
    }

    pub async fn closed(&self) {
        self.closed.wait().await
    }
}

fn sink_closed(stream_key: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("stream sink {} closed", stream_key),
    )
}

#[async_trait]
impl TagSink for Arc<StreamSink> {
    async fn write_chunk(&self, chunk: Bytes) -> io::Result<()> {
        self.write(chunk).await
    }
}

impl StreamSource {
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Next chunk, or `None` once the producer is gone and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Stops accepting new chunks and closes the sink. Chunks already
    /// buffered can still be received.
    pub fn close(&mut self) {
        self.rx.close();
        self.closed.break_fuse();
    }
}

impl Stream for StreamSource {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.closed.break_fuse();
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sinks: DashMap<StreamKey, Arc<StreamSink>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional store; returns whatever it replaced.
    pub fn store(&self, stream_key: impl Into<String>, sink: Arc<StreamSink>) -> Option<Arc<StreamSink>> {
        self.sinks.insert(stream_key.into(), sink)
    }

    /// Stores `sink` unless a live sink already owns the key, in which case
    /// that sink is returned and nothing changes. Closed sinks are replaced.
    pub fn try_store(
        &self,
        stream_key: impl Into<String>,
        sink: Arc<StreamSink>,
    ) -> Result<(), Arc<StreamSink>> {
        match self.sinks.entry(stream_key.into()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    entry.insert(sink);
                    Ok(())
                } else {
                    Err(entry.get().clone())
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(sink);
                Ok(())
            }
        }
    }

    /// `try_store` that hands back a guard owning the entry.
    pub fn register(
        self: &Arc<Self>,
        stream_key: impl Into<String>,
        sink: Arc<StreamSink>,
    ) -> Result<Registration, Arc<StreamSink>> {
        let stream_key = stream_key.into();
        self.try_store(stream_key.clone(), sink.clone())?;
        Ok(Registration {
            registry: self.clone(),
            stream_key,
            sink,
        })
    }

    pub fn load(&self, stream_key: &str) -> Option<Arc<StreamSink>> {
        self.sinks.get(stream_key).map(|s| s.value().clone())
    }

    pub fn delete(&self, stream_key: &str) -> Option<Arc<StreamSink>> {
        self.sinks.remove(stream_key).map(|(_, sink)| sink)
    }

    /// Removes the entry only if it still points at `sink`.
    pub fn delete_if_same(&self, stream_key: &str, sink: &Arc<StreamSink>) -> bool {
        self.sinks
            .remove_if(stream_key, |_, current| Arc::ptr_eq(current, sink))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// A registered sink. Dropping it closes the sink and unregisters it, on
/// every exit path of the owning session including a panic.
pub struct Registration {
    registry: Arc<SessionRegistry>,
    stream_key: StreamKey,
    sink: Arc<StreamSink>,
}

impl Registration {
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn sink(&self) -> &Arc<StreamSink> {
        &self.sink
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.sink.close();
        if self.registry.delete_if_same(&self.stream_key, &self.sink) {
            log::debug!("stream key {} unregistered", self.stream_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_store_load_delete() {
        let registry = SessionRegistry::new();
        let (sink, _source) = StreamSink::pair("key", 4);
        assert!(registry.store("key", sink.clone()).is_none());
        assert!(Arc::ptr_eq(&registry.load("key").unwrap(), &sink));
        assert!(registry.delete("key").is_some());
        assert!(registry.load("key").is_none());
    }

    #[tokio::test]
    async fn test_second_live_publisher_is_rejected() {
        let registry = SessionRegistry::new();
        let (first, _first_source) = StreamSink::pair("key", 4);
        let (second, _second_source) = StreamSink::pair("key", 4);
        registry.try_store("key", first.clone()).unwrap();

        let existing = registry.try_store("key", second.clone()).unwrap_err();
        assert!(Arc::ptr_eq(&existing, &first));

        first.close();
        registry.try_store("key", second.clone()).unwrap();
        // the superseded session must not unregister its successor
        assert!(!registry.delete_if_same("key", &first));
        assert!(registry.delete_if_same("key", &second));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registration_drop_releases_key() {
        let registry = Arc::new(SessionRegistry::new());
        let (sink, mut source) = StreamSink::pair("key", 4);
        let registration = registry.register("key", sink.clone()).unwrap();
        assert!(registry.load("key").is_some());

        drop(registration);
        assert!(registry.is_empty());
        assert!(sink.is_closed());
        assert!(source.recv().await.is_none());
    }

    #[test]
    fn test_registration_released_when_owner_panics() {
        let registry = Arc::new(SessionRegistry::new());
        let (sink, _source) = StreamSink::pair("key", 4);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _registration = registry.register("key", sink.clone()).unwrap();
            panic!("session task died");
        }));
        assert!(result.is_err());
        assert!(registry.is_empty());
        assert!(sink.is_closed());

        let (next, _next_source) = StreamSink::pair("key", 4);
        assert!(registry.register("key", next).is_ok());
    }

    #[tokio::test]
    async fn test_stale_registration_keeps_successor() {
        let registry = Arc::new(SessionRegistry::new());
        let (first, _first_source) = StreamSink::pair("key", 4);
        let stale = registry.register("key", first.clone()).unwrap();
        first.close();

        let (second, _second_source) = StreamSink::pair("key", 4);
        let current = registry.register("key", second.clone()).unwrap();
        drop(stale);
        assert!(Arc::ptr_eq(&registry.load("key").unwrap(), &second));
        assert!(!second.is_closed());
        drop(current);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_bytes_flow_in_order_and_end_on_close() {
        let (sink, mut source) = StreamSink::pair("key", 4);
        sink.write(Bytes::from_static(b"a")).await.unwrap();
        sink.write(Bytes::from_static(b"b")).await.unwrap();
        sink.close();
        assert_eq!(source.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(source.recv().await.unwrap(), Bytes::from_static(b"b"));
        assert!(source.recv().await.is_none());
        assert!(sink.write(Bytes::from_static(b"c")).await.is_err());
    }

    #[tokio::test]
    async fn test_source_close_keeps_buffered_chunks() {
        let (sink, mut source) = StreamSink::pair("key", 4);
        sink.write(Bytes::from_static(b"a")).await.unwrap();
        source.close();
        assert!(sink.is_closed());
        assert!(sink.write(Bytes::from_static(b"b")).await.is_err());
        assert_eq!(source.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert!(source.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_sink_blocks_until_consumer_drops() {
        let (sink, source) = StreamSink::pair("key", 1);
        sink.write(Bytes::from_static(b"a")).await.unwrap();

        let blocked = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.write(Bytes::from_static(b"b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        drop(source);
        let res = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert!(sink.is_closed());
    }
}
