//! Structured connection-event stream.
//!
//! The tarpit emits a machine-readable record of connection activity,
//! separate from the operational log: one JSON object per line on stdout.
//! The sink is a trait so tests can capture events instead of printing them.

use serde::Serialize;
use std::io::Write;
use tracing::warn;

/// A single entry in the connection-event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "msg")]
pub enum Event {
    #[serde(rename = "new connection")]
    NewConnection { addr: String, nb_connections: u64 },
    #[serde(rename = "connection closed")]
    ConnectionClosed { addr: String },
    #[serde(rename = "number of distinct remote addresses")]
    DistinctAddrs { nb_addrs: usize },
}

/// Destination for the event stream.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: Event);
}

/// Production sink: serializes each event as a JSON line on stdout.
#[derive(Debug, Default)]
pub struct JsonStdoutSink;

impl EventSink for JsonStdoutSink {
    fn emit(&self, event: Event) {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                // A broken stdout pipe must not take down the tarpit.
                let _ = writeln!(out, "{line}");
            }
            Err(e) => warn!(error = %e, "failed to serialize event"),
        }
    }
}

/// Test sink that records events in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<Event>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
