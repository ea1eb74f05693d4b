//! # Archiver
//!
//! The consumer side of the event queue. On every tick it pops everything
//! queued (one lock acquisition) and writes the batch to storage with a single
//! `mput`. A last flush runs after cancellation so events accepted before
//! `stop` are not left behind.
//!
//! Keys are `event/<received_on:020>/<seq:020>`, which sort in arrival order;
//! values are the JSON form of the event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::event::Event;
use super::queue::EventQueue;
use crate::storage::{KvPair, StorageBackend, StorageError};

/// Default flush period.
pub const ARCHIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Key prefix of archived events.
pub const EVENT_KEY_PREFIX: &str = "event/";

pub struct Archiver {
    queue: Arc<Mutex<EventQueue>>,
    storage: Arc<dyn StorageBackend>,
    interval: Duration,
    sequence: AtomicU64,
    archived: AtomicU64,
    failed: AtomicU64,
}

impl Archiver {
    pub fn new(
        queue: Arc<Mutex<EventQueue>>,
        storage: Arc<dyn StorageBackend>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            storage,
            interval,
            sequence: AtomicU64::new(0),
            archived: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Events written so far.
    pub fn archived(&self) -> u64 {
        self.archived.load(Ordering::Relaxed)
    }

    /// Events lost to storage failures.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Storage key of `event` at position `seq`.
    pub fn event_key(event: &Event, seq: u64) -> String {
        format!("{EVENT_KEY_PREFIX}{:020}/{:020}", event.received_on(), seq)
    }

    /// Moves every queued event to storage. Returns how many were written.
    pub async fn flush(&self) -> Result<usize, StorageError> {
        let events = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.drain_all()
        };
        if events.is_empty() {
            return Ok(0);
        }

        let count = events.len();
        let result = self.store(events).await;
        match &result {
            Ok(()) => {
                self.archived.fetch_add(count as u64, Ordering::Relaxed);
                debug!("archiver: wrote {} event(s)", count);
            }
            Err(_) => {
                self.failed.fetch_add(count as u64, Ordering::Relaxed);
            }
        }
        result.map(|()| count)
    }

    async fn store(&self, events: Vec<Event>) -> Result<(), StorageError> {
        let first = self.sequence.fetch_add(events.len() as u64, Ordering::Relaxed);
        let pairs = events
            .iter()
            .enumerate()
            .map(|(i, event)| -> Result<KvPair, StorageError> {
                let value = serde_json::to_vec(event)?;
                Ok(KvPair::new(Self::event_key(event, first + i as u64), value))
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || storage.mput(&pairs)).await?
    }

    /// Flushes every `interval` until `token` fires, then once more.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!("archiver: flush failed: {}", e);
                    }
                }
            }
        }

        if let Err(e) = self.flush().await {
            error!("archiver: final flush failed: {}", e);
        }
        info!(
            "archiver: stopped, {} archived, {} failed",
            self.archived(),
            self.failed()
        );
    }
}
