//! Typed pipeline events and the bounded channel that carries them.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

/// One event in flight at a time: the producer blocks until the consumer has
/// taken the previous one.
pub const EVENT_CHANNEL_CAPACITY: usize = 1;

/// Progress below this ratio is too early to extrapolate an ETA from.
const ETA_MIN_RATIO: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Status {
        message: String,
    },
    Progress {
        stage: String,
        stage_index: usize,
        stage_count: usize,
        /// Completed fraction of the current stage, in `(0, 1]`.
        ratio: f64,
        row: usize,
        col: usize,
        eta_seconds: Option<f64>,
    },
    /// Blended pixels of one tile, interleaved RGB8, clipped to the stage output.
    TileResult {
        stage_index: usize,
        #[serde(skip)]
        pixels: Vec<u8>,
        width: usize,
        height: usize,
        x_offset: usize,
        y_offset: usize,
    },
    StageDone {
        stage: String,
        stage_index: usize,
        width: usize,
        height: usize,
    },
    FatalError {
        message: String,
    },
}

/// Producer half handed to schedulers.
///
/// Sending never fails from the producer's point of view: once the receiver is
/// gone, events are dropped and work continues.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards every event.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Blocks until the consumer has room. Must be called from a blocking
    /// context, never from inside an async task.
    pub fn emit(&self, event: PipelineEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.blocking_send(event).is_err() {
            trace!("event receiver dropped; discarding event");
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(PipelineEvent::Status {
            message: message.into(),
        });
    }
}

/// Creates a bounded event channel of [`EVENT_CHANNEL_CAPACITY`].
pub fn event_channel() -> (EventSink, mpsc::Receiver<PipelineEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSink::new(tx), rx)
}

/// Remaining time extrapolated linearly from the completed fraction.
pub fn estimate_eta(elapsed: Duration, ratio: f64) -> Option<f64> {
    if ratio <= ETA_MIN_RATIO || ratio > 1.0 {
        return None;
    }
    let elapsed = elapsed.as_secs_f64();
    Some(elapsed / ratio * (1.0 - ratio))
}
