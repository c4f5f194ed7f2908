//! Operator-facing status notifications
//!
//! Every event is logged through `tracing` and also pushed onto a bounded
//! channel that a front-end may drain. Nothing in the pipeline waits on
//! that channel: when it is full the oldest notification is discarded.

use crate::source::config::SourceKind;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::fmt;

/// Capacity of the status channel
pub const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Notification about pipeline or source health
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// A source began producing blocks
    SourceStarted {
        kind: SourceKind,
        fs_hz: f64,
        n_samples: usize,
    },
    /// A source was requested but could not be opened
    SourceUnavailable { kind: SourceKind, reason: String },
    /// A running source failed and stopped producing
    SourceFailed { kind: SourceKind, reason: String },
    /// A source finished on its own (block limit reached)
    SourceExhausted { kind: SourceKind, blocks: u64 },
    /// The analyzer rejected a block
    MalformedBlock { sequence: u64, reason: String },
    /// Blocks were discarded because the analyzer fell behind
    Backpressure { dropped_total: u64 },
    /// The run ended
    PipelineStopped {
        kind: SourceKind,
        blocks: u64,
        clean: bool,
    },
}

impl StatusEvent {
    /// Whether this event reports a fault
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            StatusEvent::SourceUnavailable { .. }
                | StatusEvent::SourceFailed { .. }
                | StatusEvent::MalformedBlock { .. }
        )
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::SourceStarted {
                kind,
                fs_hz,
                n_samples,
            } => write!(
                f,
                "Running {} source at {:.3} MHz, {} samples/block",
                kind,
                fs_hz / 1e6,
                n_samples
            ),
            StatusEvent::SourceUnavailable { kind, reason } => {
                write!(f, "{} source unavailable: {}", kind, reason)
            }
            StatusEvent::SourceFailed { kind, reason } => {
                write!(f, "{} source failed: {}", kind, reason)
            }
            StatusEvent::SourceExhausted { kind, blocks } => {
                write!(f, "{} source finished after {} blocks", kind, blocks)
            }
            StatusEvent::MalformedBlock { sequence, reason } => {
                write!(f, "Skipped block #{}: {}", sequence, reason)
            }
            StatusEvent::Backpressure { dropped_total } => {
                write!(f, "Analyzer behind, {} blocks dropped", dropped_total)
            }
            StatusEvent::PipelineStopped {
                kind,
                blocks,
                clean,
            } => {
                if *clean {
                    write!(f, "Stopped {} source after {} blocks", kind, blocks)
                } else {
                    write!(
                        f,
                        "Stopped {} source after {} blocks (worker did not exit in time)",
                        kind, blocks
                    )
                }
            }
        }
    }
}

/// Producer side of the status channel
#[derive(Clone)]
pub struct StatusSink {
    tx: Sender<StatusEvent>,
    overflow: Receiver<StatusEvent>,
}

impl StatusSink {
    /// Create a sink and the receiver a front-end drains
    pub fn channel() -> (StatusSink, Receiver<StatusEvent>) {
        let (tx, rx) = bounded(STATUS_CHANNEL_CAPACITY);
        (
            StatusSink {
                tx,
                overflow: rx.clone(),
            },
            rx,
        )
    }

    /// Log and publish an event; never blocks
    pub fn emit(&self, event: StatusEvent) {
        if event.is_error() {
            tracing::warn!("{}", event);
        } else {
            tracing::info!("{}", event);
        }

        let mut event = event;
        // One retry after evicting the oldest notification
        for _ in 0..2 {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(e)) => {
                    let _ = self.overflow.try_recv();
                    event = e;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_receiver() {
        let (sink, rx) = StatusSink::channel();
        sink.emit(StatusEvent::Backpressure { dropped_total: 1 });
        assert_eq!(
            rx.try_recv().unwrap(),
            StatusEvent::Backpressure { dropped_total: 1 }
        );
    }

    #[test]
    fn test_full_channel_drops_oldest() {
        let (sink, rx) = StatusSink::channel();
        for i in 0..(STATUS_CHANNEL_CAPACITY as u64 + 10) {
            sink.emit(StatusEvent::Backpressure { dropped_total: i });
        }
        let first = rx.try_recv().unwrap();
        assert_eq!(first, StatusEvent::Backpressure { dropped_total: 10 });
        assert_eq!(rx.len(), STATUS_CHANNEL_CAPACITY - 1);
    }

    #[test]
    fn test_error_classification() {
        assert!(StatusEvent::SourceFailed {
            kind: SourceKind::PhysicalRapidBlock,
            reason: "x".into()
        }
        .is_error());
        assert!(!StatusEvent::PipelineStopped {
            kind: SourceKind::Synthetic,
            blocks: 3,
            clean: true
        }
        .is_error());
    }

    #[test]
    fn test_display_messages() {
        let event = StatusEvent::SourceUnavailable {
            kind: SourceKind::PhysicalRapidBlock,
            reason: "no device".into(),
        };
        assert_eq!(
            event.to_string(),
            "scope (rapid block) source unavailable: no device"
        );
    }
}
