//! Flow-controlled byte sinks.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the sink wants after accepting a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Accepted, but hold further writes until [`SinkSignal::Resume`].
    Pause,
}

/// Out-of-band notifications from a sink to its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSignal {
    Resume,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sink closed")]
pub struct SinkClosed;

/// Destination of delivered bytes. Writes arrive in order from a single
/// dispatch loop.
pub trait ByteSink: Send {
    fn write(&mut self, bytes: Vec<u8>) -> Result<Flow, SinkClosed>;
}

/// Sink over a bounded channel, typically feeding an HTTP response body.
///
/// A full channel pauses the pipeline; the block is handed to a task that
/// waits for room and then signals [`SinkSignal::Resume`]. A dropped
/// receiver signals [`SinkSignal::Disconnect`].
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<u8>>,
    signals: mpsc::UnboundedSender<SinkSignal>,
    watcher: JoinHandle<()>,
}

impl ChannelSink {
    /// Must be called within a tokio runtime.
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> (Self, mpsc::UnboundedReceiver<SinkSignal>) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let watcher = {
            let tx = tx.clone();
            let signals = signals.clone();
            tokio::spawn(async move {
                tx.closed().await;
                let _ = signals.send(SinkSignal::Disconnect);
            })
        };
        (
            Self {
                tx,
                signals,
                watcher,
            },
            signal_rx,
        )
    }
}

impl ByteSink for ChannelSink {
    fn write(&mut self, bytes: Vec<u8>) -> Result<Flow, SinkClosed> {
        match self.tx.try_send(bytes) {
            Ok(()) => Ok(Flow::Continue),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkClosed),
            Err(mpsc::error::TrySendError::Full(bytes)) => {
                let tx = self.tx.clone();
                let signals = self.signals.clone();
                tokio::spawn(async move {
                    let signal = match tx.send(bytes).await {
                        Ok(()) => SinkSignal::Resume,
                        Err(_) => SinkSignal::Disconnect,
                    };
                    let _ = signals.send(signal);
                });
                Ok(Flow::Pause)
            }
        }
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        // The watcher holds a sender; the body only ends once it is gone.
        self.watcher.abort();
    }
}
