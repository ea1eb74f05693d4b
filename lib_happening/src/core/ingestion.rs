//! # Event Ingestion
//!
//! Connection handler of the events service. Each connection gets its own
//! [`RecordFramer`]; complete records are parsed into [`Event`]s, appended to
//! the service-wide queue and fanned out on a broadcast channel.
//!
//! Per-connection loop:
//! - reads are raced against cancellation and bounded by `read_timeout`; a
//!   timeout just re-checks the signal
//! - end-of-stream or a read error closes the connection (a pending partial
//!   record is dropped with a warning)
//! - malformed records are logged and skipped, the connection stays open
//!
//! Subscribers that fall more than `broadcast_capacity` events behind lose the
//! oldest ones (`RecvError::Lagged`); having no subscriber at all is normal.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::Event;
use super::framing::{RecordFramer, MAX_RECORD_BYTES};
use super::listener::{Connection, ConnectionHandler};
use super::queue::{EventQueue, EVENTS_QUEUE_SIZE};

/// Default per-read deadline.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Default size of the per-connection read buffer.
pub const READ_BUFFER_SIZE: usize = 4096;
/// Default per-subscriber broadcast backlog.
pub const BROADCAST_CAPACITY: usize = 1024;

/// Tunables of the events service.
#[derive(Debug, Clone)]
pub struct IngestionSettings {
    /// Deadline of a single read; on expiry the loop re-checks cancellation.
    pub read_timeout: Duration,
    /// Size of the per-connection read buffer.
    pub read_buffer_size: usize,
    /// Longest incomplete record carried between reads.
    pub max_record_bytes: usize,
    /// Initial capacity, and growth step, of the event queue.
    pub queue_capacity: usize,
    /// Events a subscriber may fall behind before losing the oldest.
    pub broadcast_capacity: usize,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            read_buffer_size: READ_BUFFER_SIZE,
            max_record_bytes: MAX_RECORD_BYTES,
            queue_capacity: EVENTS_QUEUE_SIZE,
            broadcast_capacity: BROADCAST_CAPACITY,
        }
    }
}

/// Running counters of the events service.
#[derive(Debug, Default)]
pub struct IngestionStats {
    connections: AtomicU64,
    bytes_read: AtomicU64,
    events_ingested: AtomicU64,
    records_rejected: AtomicU64,
    oversize_dropped: AtomicU64,
}

/// Point-in-time copy of [`IngestionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections accepted.
    pub connections: u64,
    /// Bytes read across all connections.
    pub bytes_read: u64,
    /// Records parsed into events and queued.
    pub events_ingested: u64,
    /// Records that failed to parse.
    pub records_rejected: u64,
    /// Incomplete records dropped for exceeding `max_record_bytes`.
    pub oversize_dropped: u64,
}

impl IngestionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            oversize_dropped: self.oversize_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Handler shared by every connection of the events service.
pub struct EventsHandler {
    name: String,
    settings: IngestionSettings,
    queue: Arc<Mutex<EventQueue>>,
    events_tx: broadcast::Sender<Arc<Event>>,
    stats: IngestionStats,
}

impl EventsHandler {
    pub fn new(name: impl Into<String>, settings: IngestionSettings) -> Self {
        let (events_tx, _) = broadcast::channel(settings.broadcast_capacity.max(1));
        Self {
            name: name.into(),
            queue: Arc::new(Mutex::new(EventQueue::new(settings.queue_capacity))),
            settings,
            events_tx,
            stats: IngestionStats::default(),
        }
    }

    /// The service-wide event queue. Lock it for every access, including
    /// check-then-pop sequences.
    pub fn queue(&self) -> Arc<Mutex<EventQueue>> {
        Arc::clone(&self.queue)
    }

    /// New receiver for every event parsed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.events_tx.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn settings(&self) -> &IngestionSettings {
        &self.settings
    }

    /// Parses, enqueues and broadcasts a batch of framed records. Returns how
    /// many became events.
    pub fn push_records(&self, records: Vec<Bytes>) -> usize {
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            match Event::from_record(&record) {
                Ok(event) => events.push(Arc::new(event)),
                Err(e) => {
                    self.stats.records_rejected.fetch_add(1, Ordering::Relaxed);
                    error!("{}: {}", self.name, e);
                }
            }
        }

        if events.is_empty() {
            return 0;
        }

        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            for event in &events {
                queue.push(Event::clone(event));
            }
        }

        let accepted = events.len();
        for event in events {
            // Err only means nobody is subscribed right now.
            let _ = self.events_tx.send(event);
        }
        self.stats
            .events_ingested
            .fetch_add(accepted as u64, Ordering::Relaxed);
        accepted
    }

    async fn serve(&self, conn: Connection, token: CancellationToken) {
        let Connection { id, mut stream, peer } = conn;
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        info!("{}: connection {} from {}", self.name, id, peer);

        let mut framer = RecordFramer::new(self.settings.max_record_bytes);
        let mut buf = vec![0u8; self.settings.read_buffer_size.max(1)];

        while !token.is_cancelled() {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = time::timeout(self.settings.read_timeout, stream.read(&mut buf)) => read,
            };

            let n = match read {
                Err(_elapsed) => continue,
                Ok(Ok(0)) => {
                    info!("{}: connection {} closed by {}", self.name, id, peer);
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    error!("{}: read from {} failed: {}", self.name, peer, e);
                    break;
                }
            };
            self.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);

            let batch = framer.feed(&buf[..n]);
            if batch.oversize > 0 {
                self.stats
                    .oversize_dropped
                    .fetch_add(batch.oversize as u64, Ordering::Relaxed);
                warn!(
                    "{}: dropped a record from {} longer than {} bytes",
                    self.name, peer, self.settings.max_record_bytes
                );
            }
            if !batch.records.is_empty() {
                let accepted = self.push_records(batch.records);
                debug!("{}: {} event(s) from {}", self.name, accepted, peer);
            }
        }

        if let Some(partial) = framer.take_pending() {
            warn!(
                "{}: discarding {} byte(s) of incomplete record from {}",
                self.name,
                partial.len(),
                peer
            );
        }
        if let Err(e) = stream.shutdown().await {
            debug!("{}: shutdown of {} failed: {}", self.name, peer, e);
        }
    }
}

impl ConnectionHandler for EventsHandler {
    fn handle(
        self: Arc<Self>,
        conn: Connection,
        token: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move { self.serve(conn, token).await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> EventsHandler {
        EventsHandler::new("EventsTest", IngestionSettings::default())
    }

    #[test]
    fn valid_records_are_queued_in_order() {
        let handler = handler();
        let accepted = handler.push_records(vec![
            Bytes::from_static(b"a|1|x"),
            Bytes::from_static(b"b|2|y"),
        ]);

        assert_eq!(accepted, 2);
        let queue = handler.queue();
        let mut queue = queue.lock().unwrap();
        assert_eq!(queue.pop().map(|e| e.from().to_string()), Some("a".into()));
        assert_eq!(queue.pop().map(|e| e.from().to_string()), Some("b".into()));
        assert!(queue.is_empty());
    }

    #[test]
    fn malformed_records_are_counted_not_queued() {
        let handler = handler();
        let accepted = handler.push_records(vec![
            Bytes::from_static(b"node1|heartbeat"),
            Bytes::from_static(b"node1|abc|heartbeat"),
            Bytes::from_static(b""),
        ]);

        assert_eq!(accepted, 0);
        assert!(handler.queue().lock().unwrap().is_empty());
        let stats = handler.stats();
        assert_eq!(stats.records_rejected, 3);
        assert_eq!(stats.events_ingested, 0);
    }

    #[tokio::test]
    async fn subscribers_see_each_event() {
        let handler = handler();
        let mut first = handler.subscribe();
        let mut second = handler.subscribe();

        handler.push_records(vec![Bytes::from_static(b"node1|1000|heartbeat")]);

        assert_eq!(first.recv().await.unwrap().event_type(), "heartbeat");
        assert_eq!(second.recv().await.unwrap().from(), "node1");
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest_events() {
        let settings = IngestionSettings {
            broadcast_capacity: 2,
            ..IngestionSettings::default()
        };
        let handler = EventsHandler::new("Lagging", settings);
        let mut rx = handler.subscribe();

        handler.push_records(vec![
            Bytes::from_static(b"a|1|x"),
            Bytes::from_static(b"b|2|x"),
            Bytes::from_static(b"c|3|x"),
        ]);

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap().from(), "b");
        assert_eq!(rx.recv().await.unwrap().from(), "c");
        // The queue itself never drops.
        assert_eq!(handler.queue().lock().unwrap().len(), 3);
    }
}
