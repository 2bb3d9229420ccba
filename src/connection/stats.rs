//! Per-connection statistics and lifecycle history.
//!
//! Counters are atomics mutated by the connection's reader task; the
//! lifecycle history is a bounded ring with typed detail payloads per event
//! kind, so consumers never dig values out of a string map.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Counters for one connection.
#[derive(Debug)]
pub struct ConnectionStats {
    /// Connection identifier.
    pub id: String,
    /// When the connection manager was created.
    pub started_at: DateTime<Utc>,
    /// Remote endpoint, when known.
    pub remote_addr: Option<String>,
    /// Peer user agent, when known.
    pub user_agent: Option<String>,
    last_activity_ms: AtomicI64,
    events_in: AtomicU64,
    events_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Plain-value copy of [`ConnectionStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub events_in: u64,
    pub events_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
    pub reconnects: u64,
}

impl ConnectionStats {
    /// Create stats for a fresh connection with a generated id.
    pub fn new(remote_addr: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            remote_addr,
            user_agent: None,
            last_activity_ms: AtomicI64::new(0),
            events_in: AtomicU64::new(0),
            events_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Record bytes read from the peer.
    pub fn record_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    /// Record bytes written to the peer.
    pub fn record_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    /// Record events delivered to the consumer.
    pub fn record_events_in(&self, n: u64) {
        self.events_in.fetch_add(n, Ordering::Relaxed);
    }

    /// Record events sent to the peer.
    pub fn record_events_out(&self, n: u64) {
        self.events_out.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one error.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one reconnect.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark activity now.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Last observed activity.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        (ms != 0).then(|| Utc.timestamp_millis_opt(ms).single())?
    }

    /// Copy out the counters.
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            id: self.id.clone(),
            started_at: self.started_at,
            last_activity: self.last_activity(),
            events_in: self.events_in.load(Ordering::Relaxed),
            events_out: self.events_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Established,
    Reconnected,
    Disconnected,
    Failed,
    Timeout,
}

/// Typed detail for a lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEventDetail {
    /// Nothing beyond the kind.
    None,
    /// A connection attempt and how it went.
    Attempt {
        /// 1-based attempt number since the last established connection.
        attempt: u32,
        /// Time the attempt took.
        latency: Duration,
        /// Whether it produced a connection.
        success: bool,
    },
    /// An error message.
    Error(String),
    /// How long the connection sat silent before the watchdog fired.
    Idle(Duration),
}

/// One lifecycle history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    /// The connection this entry belongs to.
    pub connection_id: String,
    /// What happened.
    pub kind: ConnectionEventKind,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Typed payload.
    pub detail: ConnectionEventDetail,
}

/// Bounded lifecycle history ring.
#[derive(Debug)]
pub struct ConnectionHistory {
    ring: RwLock<VecDeque<ConnectionEvent>>,
    capacity: usize,
}

impl ConnectionHistory {
    /// Create a ring remembering at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(
        &self,
        connection_id: &str,
        kind: ConnectionEventKind,
        detail: ConnectionEventDetail,
    ) {
        let mut ring = self
            .ring
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(ConnectionEvent {
            connection_id: connection_id.to_owned(),
            kind,
            timestamp: Utc::now(),
            detail,
        });
    }

    /// Copy out the history, oldest first.
    pub fn recent(&self) -> Vec<ConnectionEvent> {
        self.ring
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
