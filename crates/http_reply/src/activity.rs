use core::fmt;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Local};

use crate::sniffer::{RequestSummary, Termination};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The case said close, and we did.
    Completed,
    /// A kept-open connection saw no traffic within the read timeout.
    Idle,
    /// The client hung up on a kept-open connection.
    PeerClosed,
    /// Nothing was left to dispatch.
    Exhausted,
    /// An I/O error ended the connection.
    Aborted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Completed => "completed",
            Self::Idle => "idle timeout",
            Self::PeerClosed => "closed by client",
            Self::Exhausted => "test cases exhausted",
            Self::Aborted => "aborted",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    ConnectionAccepted {
        connection: u64,
        peer: SocketAddr,
    },
    RequestBytes {
        connection: u64,
        peer: SocketAddr,
        summary: RequestSummary,
    },
    ResponseDispatched {
        connection: u64,
        peer: SocketAddr,
        sequence: u64,
        position: usize,
        name: String,
        bytes: usize,
    },
    ConnectionClosed {
        connection: u64,
        peer: SocketAddr,
        reason: CloseReason,
    },
    Error {
        connection: Option<u64>,
        peer: Option<SocketAddr>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub at: DateTime<Local>,
    pub event: ActivityEvent,
}

/// Destination for activity records. Implementations must return quickly
/// and swallow their own failures.
pub trait ActivitySink: Send + Sync {
    fn record(&self, record: &ActivityRecord);
}

/// `ActivityLog` stamps events and hands them to every sink.
#[derive(Clone, Default)]
pub struct ActivityLog {
    sinks: Vec<Arc<dyn ActivitySink>>,
}

impl fmt::Debug for ActivityLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityLog")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

// -- Constructors

impl ActivityLog {
    /// Logs to the global tracing subscriber.
    #[must_use]
    pub fn tracing() -> Self {
        Self::default().with_sink(Arc::new(TracingActivity))
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ActivityLog {
    pub fn record(&self, event: ActivityEvent) {
        let record = ActivityRecord {
            at: Local::now(),
            event,
        };

        for sink in &self.sinks {
            sink.record(&record);
        }
    }
}

/// Writes one human readable line per event through `reply_trace`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivity;

impl ActivitySink for TracingActivity {
    fn record(&self, record: &ActivityRecord) {
        match &record.event {
            ActivityEvent::ConnectionAccepted { connection, peer } => {
                reply_trace::info!("Connection #{} from [{}]", connection, peer);
            }
            ActivityEvent::RequestBytes {
                connection,
                summary,
                ..
            } => match (&summary.first_line, summary.termination) {
                (Some(line), _) => reply_trace::info!(
                    "Connection #{}: received request: {} ({} bytes)",
                    connection,
                    line,
                    summary.bytes
                ),
                (None, Termination::TimedOut) => reply_trace::info!(
                    "Connection #{}: no request within read timeout",
                    connection
                ),
                (None, _) => reply_trace::info!(
                    "Connection #{}: no request received ({} bytes)",
                    connection,
                    summary.bytes
                ),
            },
            ActivityEvent::ResponseDispatched {
                connection,
                sequence,
                position,
                name,
                bytes,
                ..
            } => {
                reply_trace::info!(
                    "Connection #{}: injecting testcase #{} ({}), data {} bytes [dispatch {}]",
                    connection,
                    position,
                    name,
                    bytes,
                    sequence
                );
            }
            ActivityEvent::ConnectionClosed {
                connection, reason, ..
            } => {
                reply_trace::info!("Connection #{} closed: {}", connection, reason);
            }
            ActivityEvent::Error {
                connection,
                peer,
                message,
            } => match (connection, peer) {
                (Some(connection), Some(peer)) => {
                    reply_trace::error!("Connection #{} [{}]: {}", connection, peer, message);
                }
                _ => reply_trace::error!("Error: {}", message),
            },
        }
    }
}

/// Keeps every record in memory, for harnesses that want to correlate
/// connections with the cases they were served.
#[derive(Debug, Default)]
pub struct MemoryActivity {
    records: Mutex<Vec<ActivityRecord>>,
}

impl MemoryActivity {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ActivityRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(connection, sequence, position)` of every dispatch, in record order.
    #[must_use]
    pub fn dispatches(&self) -> Vec<(u64, u64, usize)> {
        self.snapshot()
            .into_iter()
            .filter_map(|record| match record.event {
                ActivityEvent::ResponseDispatched {
                    connection,
                    sequence,
                    position,
                    ..
                } => Some((connection, sequence, position)),
                _ => None,
            })
            .collect()
    }
}

impl ActivitySink for MemoryActivity {
    fn record(&self, record: &ActivityRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}
