//! In-memory command log.
//!
//! [`CommandLog`] subscribes to the [`EventBus`], pairs each incoming command
//! with its response and keeps the most recent exchanges in a bounded ring,
//! together with running statistics.

use crate::events::{CommandEvent, Direction, EventBus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// Exchanges retained by default.
pub const MAX_LOG_ENTRIES: usize = 1000;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// One command and the response it produced.
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    /// When the command arrived.
    pub timestamp: DateTime<Utc>,
    /// Instrument id.
    pub instrument: String,
    /// Instrument display name.
    pub instrument_name: String,
    /// Client address or `shell`.
    pub source: String,
    /// Command line as received.
    pub command: String,
    /// Empty when the instrument sent nothing back.
    pub response: String,
    /// SCPI error raised by the command, if any.
    pub error_code: Option<i32>,
}

/// Aggregate counters over everything the log has seen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogStats {
    /// Completed exchanges, including evicted ones.
    pub total_commands: u64,
    /// Exchanges whose command raised a SCPI error.
    pub errors: u64,
    /// Exchanges completed during the last minute.
    pub commands_per_minute: usize,
    /// Time since the log was created.
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<Exchange>,
    capacity: usize,
    pending: HashMap<(String, String), CommandEvent>,
    recent: VecDeque<Instant>,
    total_commands: u64,
    errors: u64,
}

/// Thread-safe, fixed-capacity exchange log.
#[derive(Debug, Clone)]
pub struct CommandLog {
    inner: Arc<Mutex<Inner>>,
    started_at: Instant,
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new(MAX_LOG_ENTRIES)
    }
}

impl CommandLog {
    /// A log keeping at most `capacity` exchanges.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                pending: HashMap::new(),
                recent: VecDeque::new(),
                total_commands: 0,
                errors: 0,
            })),
            started_at: Instant::now(),
        }
    }

    /// Starts a task that feeds every event from `bus` into this log.
    ///
    /// The task ends when the bus is dropped.
    pub fn attach(&self, bus: &EventBus) -> JoinHandle<()> {
        let log = self.clone();
        let mut stream = BroadcastStream::new(bus.subscribe());
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => log.record(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        // The lost events may include responses to pending commands.
                        let discarded = log.discard_pending();
                        warn!(skipped, discarded, "Command log fell behind; events dropped");
                    }
                }
            }
            debug!("Command log detached");
        })
    }

    /// Records one event. An `Out` completes the pending `In` from the same
    /// instrument and source.
    pub fn record(&self, event: CommandEvent) {
        let mut inner = self.lock();
        let key = (event.instrument.clone(), event.source.clone());
        match event.direction {
            Direction::In => {
                inner.pending.insert(key, event);
            }
            Direction::Out => {
                let Some(request) = inner.pending.remove(&key) else {
                    return;
                };
                let exchange = Exchange {
                    timestamp: request.timestamp,
                    instrument: request.instrument,
                    instrument_name: request.instrument_name,
                    source: request.source,
                    command: request.payload,
                    response: event.payload,
                    error_code: event.error_code,
                };
                inner.push(exchange);
            }
        }
    }

    /// Drops every command still waiting for its response. Returns how many
    /// were dropped.
    pub fn discard_pending(&self) -> usize {
        let mut inner = self.lock();
        let discarded = inner.pending.len();
        inner.pending.clear();
        discarded
    }

    /// Commands seen whose response has not arrived yet.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.lock().pending.len()
    }

    /// Most recent `limit` exchanges, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Exchange> {
        let inner = self.lock();
        let skip = inner.entries.len().saturating_sub(limit);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    /// Exchanges currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when no exchange is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Empties the ring. Statistics are kept.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Running counters, with the rate window pruned to the last minute.
    #[must_use]
    pub fn stats(&self) -> LogStats {
        let mut inner = self.lock();
        inner.prune_rate_window();
        LogStats {
            total_commands: inner.total_commands,
            errors: inner.errors,
            commands_per_minute: inner.recent.len(),
            uptime: self.started_at.elapsed(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Inner {
    fn push(&mut self, exchange: Exchange) {
        self.total_commands += 1;
        if exchange.error_code.is_some() {
            self.errors += 1;
        }
        self.recent.push_back(Instant::now());
        self.prune_rate_window();

        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(exchange);
    }

    fn prune_rate_window(&mut self) {
        while let Some(oldest) = self.recent.front() {
            if oldest.elapsed() <= RATE_WINDOW {
                break;
            }
            self.recent.pop_front();
        }
    }
}
