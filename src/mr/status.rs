//! Observability surfaces exposed through the monitor HTTP interface.
//!
//! `ApplicationState` mirrors `examples/original_source/status.py:
//! ApplicationStatus` (Coordinator-side counters and per-master rows);
//! `MasterStatusSnapshot` mirrors `MasterStatus` (what a Master reports back
//! on each keep-alive).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Map,
    Reduce,
    Merge,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Map => "Map",
            Phase::Reduce => "Reduce",
            Phase::Merge => "Merge",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MasterStatusSnapshot {
    pub nproc: u32,
    pub map_finished: u64,
    pub map_ongoing: u64,
    pub reduce_finished: u64,
    pub reduce_ongoing: u64,
    pub map_file: u64,
    pub map_file_size: u64,
    pub reduce_file: u64,
    pub reduce_file_size: u64,
    pub bandwidth: u64,
    #[serde(with = "duration_secs")]
    pub time: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

impl MasterStatusSnapshot {
    pub fn average_bandwidth(&self) -> f64 {
        if self.time.as_secs_f64() > 0.0 {
            self.bandwidth as f64 / self.time.as_secs_f64()
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterRow {
    pub nick: String,
    pub status: String,
    pub rtt_ms: u128,
    pub snapshot: MasterStatusSnapshot,
}

/// Coordinator-side counters and per-master observability, serialized
/// verbatim by the `/status` monitor endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationState {
    pub phase: Phase,

    pub map_assigned: u64,
    pub map_completed: u64,
    pub map_faulted: u64,

    pub reduce_assigned: u64,
    pub reduce_completed: u64,
    pub reduce_faulted: u64,

    pub map_file: u64,
    pub map_file_size: u64,
    pub reduce_file: u64,
    pub reduce_file_size: u64,

    pub faults: u64,

    #[serde(skip)]
    pub start: Instant,

    pub masters: BTreeMap<String, MasterRow>,
}

impl Default for ApplicationState {
    fn default() -> Self {
        Self {
            phase: Phase::Map,
            map_assigned: 0,
            map_completed: 0,
            map_faulted: 0,
            reduce_assigned: 0,
            reduce_completed: 0,
            reduce_faulted: 0,
            map_file: 0,
            map_file_size: 0,
            reduce_file: 0,
            reduce_file_size: 0,
            faults: 0,
            start: Instant::now(),
            masters: BTreeMap::new(),
        }
    }
}

impl ApplicationState {
    pub fn update_master(&mut self, nick: &str, status: &str, rtt_ms: u128, snapshot: MasterStatusSnapshot) {
        self.masters.insert(
            nick.to_string(),
            MasterRow { nick: nick.to_string(), status: status.to_string(), rtt_ms, snapshot },
        );
    }

    pub fn mark_master_dead(&mut self, nick: &str) {
        if let Some(row) = self.masters.get_mut(nick) {
            row.status = "dead".to_string();
        }
        self.faults += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn total_bytes(&self) -> u64 {
        self.map_file_size + self.reduce_file_size
    }

    pub fn average_mb_per_sec(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 1.0 {
            (self.total_bytes() as f64 / (1024.0 * 1024.0)) / secs
        } else {
            0.0
        }
    }

    /// Serialized form returned by `GET /status`. Kept as a small explicit
    /// struct (rather than serializing `self` directly) so the wire shape
    /// is stable even as internal bookkeeping fields change. `last_log`
    /// comes from the Coordinator's `LogRing`, not from this struct, since
    /// the ring is fed by the tracing layer independently of the state lock.
    pub fn serialize(&self, last_log: Vec<String>) -> serde_json::Value {
        serde_json::json!({
            "phase": self.phase.as_str(),
            "elapsed_secs": self.elapsed().as_secs(),
            "map": {
                "assigned": self.map_assigned,
                "completed": self.map_completed,
                "faulted": self.map_faulted,
                "files": self.map_file,
                "bytes": self.map_file_size,
            },
            "reduce": {
                "assigned": self.reduce_assigned,
                "completed": self.reduce_completed,
                "faulted": self.reduce_faulted,
                "files": self.reduce_file,
                "bytes": self.reduce_file_size,
            },
            "faults": self.faults,
            "average_mb_per_sec": self.average_mb_per_sec(),
            "masters": self.masters,
            "last_log": last_log,
        })
    }
}

const LOG_RING_CAPACITY: usize = 200;

/// Ring buffer of formatted log lines, independent of `ApplicationState`'s
/// own (async-guarded) lock, so a synchronous `tracing_subscriber::Layer`
/// can feed it from inside the tracing dispatch without ever touching the
/// Coordinator's `tokio::sync::Mutex`. The Rust reading of
/// `examples/original_source/src/status.py: push_log`/`get_last_messages`.
pub struct LogRing {
    lines: StdMutex<VecDeque<String>>,
}

impl LogRing {
    pub fn new() -> Self {
        Self { lines: StdMutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)) }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= LOG_RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

struct LogLineVisitor(String);

impl Visit for LogLineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{value:?}");
        } else {
            let _ = write!(self.0, " {}={:?}", field.name(), value);
        }
    }
}

/// Mirrors every `INFO`-and-above event into a `LogRing`. Installed
/// alongside the usual `fmt` layer so the monitor's `/status` endpoint can
/// surface the last N log lines without a Master ever having to ask for
/// them over RPC.
pub struct LogRingLayer {
    ring: Arc<LogRing>,
}

impl LogRingLayer {
    pub fn new(ring: Arc<LogRing>) -> Self {
        Self { ring }
    }
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > tracing::Level::INFO {
            return;
        }
        let mut visitor = LogLineVisitor(String::new());
        event.record(&mut visitor);
        self.ring.push(format!("[{}] {}{}", event.metadata().level(), event.metadata().target(), {
            if visitor.0.is_empty() { String::new() } else { format!(": {}", visitor.0) }
        }));
    }
}
