//! Event sink capability
//!
//! Detections and fatal errors leave the engine through this trait. Sink
//! methods run on the processing thread and must return promptly.

use std::fmt;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Wake-word detection result
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    /// Detected label
    pub label: String,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,

    /// Timestamp when the wake-word was detected (microseconds since epoch)
    pub timestamp: i64,

    /// Sequence number of the window that triggered the detection
    pub window_sequence: u64,
}

/// Fatal conditions reported on the error channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Capture reads kept failing past the retry budget
    CaptureFailure,

    /// The audio source has no more data
    EndOfStream,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::CaptureFailure => write!(f, "capture failure"),
            ErrorKind::EndOfStream => write!(f, "end of stream"),
        }
    }
}

/// Receives detection events and fatal errors from the engine
pub trait EventSink: Send + Sync {
    fn on_detection(&self, event: &DetectionEvent);

    fn on_error(&self, kind: ErrorKind, message: &str);
}

/// Events delivered by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Detection(DetectionEvent),
    Error { kind: ErrorKind, message: String },
}

/// Forwards engine events into an unbounded tokio channel
///
/// Sending never blocks the processing thread.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver for its events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: EngineEvent) {
        if let Err(e) = self.tx.send(event) {
            error!("Failed to send engine event, receiver dropped: {:?}", e.0);
        }
    }
}

impl EventSink for ChannelSink {
    fn on_detection(&self, event: &DetectionEvent) {
        self.send(EngineEvent::Detection(event.clone()));
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.send(EngineEvent::Error {
            kind,
            message: message.to_string(),
        });
    }
}

/// Logs every event
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_detection(&self, event: &DetectionEvent) {
        info!(
            "Wake-word detected: {} (confidence={:.2}, timestamp={})",
            event.label, event.confidence, event.timestamp
        );
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        error!("Wake-word engine stopped ({}): {}", kind, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(label: &str) -> DetectionEvent {
        DetectionEvent {
            label: label.to_string(),
            confidence: 0.9,
            timestamp: 1_700_000_000_000_000,
            window_sequence: 3,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();

        sink.on_detection(&event("alexa"));
        sink.on_error(ErrorKind::CaptureFailure, "device unplugged");

        assert_eq!(rx.recv().await, Some(EngineEvent::Detection(event("alexa"))));
        assert_eq!(
            rx.recv().await,
            Some(EngineEvent::Error {
                kind: ErrorKind::CaptureFailure,
                message: "device unplugged".to_string(),
            })
        );
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_detection(&event("alexa"));
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::CaptureFailure.to_string(), "capture failure");
        assert_eq!(ErrorKind::EndOfStream.to_string(), "end of stream");
    }
}
