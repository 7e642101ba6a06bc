//! Run-state flag and event emission for a measurement process.
//!
//! The engine and its external controller interact through exactly two
//! primitives: a shared atomic "keep running" flag (written by the
//! controller, polled by the engine at every loop boundary) and an unbounded
//! event channel the engine emits progress, readings and status into.
//! Consumers are passive; the engine never blocks on them, and a dropped
//! receiver silently discards further events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::measurement::MeasurementPhase;

/// Events emitted by a running measurement.
///
/// These carry everything the out-of-scope panels and file writers need:
/// progress for the progress bar, readings for live plots, state snapshots
/// for instrument widgets and analysis results for overlays.
#[derive(Clone, Debug)]
pub enum Event {
    /// Step progress: `(completed, total)`.
    Progress(usize, usize),
    /// Operator-facing status line.
    Message(String),
    /// Partial instrument/environment state snapshot.
    State(BTreeMap<String, Value>),
    /// One `(x, y)` point appended to a named plot series.
    Reading {
        series: String,
        x: f64,
        y: f64,
    },
    /// Request a redraw of live views.
    Update,
    /// Analysis result keyed by fit type.
    AppendAnalysis {
        key: String,
        values: Vec<(String, f64)>,
    },
    /// Lifecycle phase transition.
    Phase(MeasurementPhase),
}

struct Shared {
    running: AtomicBool,
    events: mpsc::UnboundedSender<Event>,
}

/// Cloneable handle to the run state and event sink of one measurement.
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<Shared>,
}

impl ProcessHandle {
    /// Create a handle plus the receiving end of its event stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(true),
                events: tx,
            }),
        };
        (handle, rx)
    }

    /// True while no stop has been requested.
    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Request a cooperative stop. The engine observes this within at most
    /// one ramp iteration; no in-flight instrument operation is interrupted.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Emit an event. Send failures (receiver dropped) are ignored.
    pub fn emit(&self, event: Event) {
        let _ = self.shared.events.send(event);
    }

    /// Emit a `(completed, total)` progress event.
    pub fn emit_progress(&self, completed: usize, total: usize) {
        self.emit(Event::Progress(completed, total));
    }

    /// Emit an operator status message.
    pub fn emit_message(&self, text: impl Into<String>) {
        self.emit(Event::Message(text.into()));
    }

    /// Emit a partial state snapshot from `(key, value)` pairs.
    pub fn emit_state<I, K>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<BTreeMap<_, _>>();
        self.emit(Event::State(map));
    }

    /// Emit one reading for a named series.
    pub fn emit_reading(&self, series: impl Into<String>, x: f64, y: f64) {
        self.emit(Event::Reading {
            series: series.into(),
            x,
            y,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_flag_round_trip() {
        let (handle, _rx) = ProcessHandle::new();
        assert!(handle.running());
        let controller = handle.clone();
        controller.stop();
        assert!(!handle.running());
    }

    #[tokio::test]
    async fn test_events_are_delivered_in_order() {
        let (handle, mut rx) = ProcessHandle::new();
        handle.emit_progress(1, 5);
        handle.emit_message("Ramp to start...");
        handle.emit_reading("series", 1.0, 2.5e-9);

        assert!(matches!(rx.recv().await, Some(Event::Progress(1, 5))));
        assert!(matches!(rx.recv().await, Some(Event::Message(m)) if m == "Ramp to start..."));
        match rx.recv().await {
            Some(Event::Reading { series, x, y }) => {
                assert_eq!(series, "series");
                assert_eq!(x, 1.0);
                assert_eq!(y, 2.5e-9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped_is_silent() {
        let (handle, rx) = ProcessHandle::new();
        drop(rx);
        handle.emit_message("nobody listening");
        handle.emit_progress(1, 1);
    }
}
