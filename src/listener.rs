//! Transmission lifecycle observers.
//!
//! Callbacks run in-line on the connection's task; they observe progress and
//! must not block. [`ListenerGuard`] sits between the coordinator and the
//! caller's listener and enforces the ordering contract: `started` at most
//! once, then any number of progress callbacks, then exactly one of
//! `finished` / `aborted`, after which nothing else is delivered.

use crate::error::SyncError;
use tokio::sync::mpsc;

pub trait TransmissionListener: Send {
    fn started(&mut self) {}

    /// One more object completed out of `total` announced.
    fn progress(&mut self, _current: u64, _total: u64) {}

    /// Bytes of one file container moved so far.
    fn chunk_progress(&mut self, _container_id: &str, _bytes: u64, _total: u64) {}

    fn finished(&mut self) {}

    fn aborted(&mut self, _error: &SyncError) {}
}

/// Listener that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl TransmissionListener for NoopListener {}

/// Logs lifecycle events through `tracing`; progress every 10 objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl TransmissionListener for LoggingListener {
    fn started(&mut self) {
        tracing::info!("Transmission started");
    }

    fn progress(&mut self, current: u64, total: u64) {
        if current % 10 == 0 || current == total {
            tracing::info!("Transmission progress {}/{}", current, total);
        }
    }

    fn finished(&mut self) {
        tracing::info!("Transmission finished");
    }

    fn aborted(&mut self, error: &SyncError) {
        tracing::warn!("Transmission aborted: {}", error);
    }
}

/// Lifecycle event, as delivered by [`ChannelListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransmissionEvent {
    Started,
    Progress { current: u64, total: u64 },
    ChunkProgress { container_id: String, bytes: u64, total: u64 },
    Finished,
    Aborted(String),
}

impl TransmissionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransmissionEvent::Finished | TransmissionEvent::Aborted(_))
    }
}

/// Forwards events into a channel so the caller can consume them as a stream.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<TransmissionEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransmissionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: TransmissionEvent) {
        // Receiver gone means nobody is watching
        let _ = self.tx.send(event);
    }
}

impl TransmissionListener for ChannelListener {
    fn started(&mut self) {
        self.emit(TransmissionEvent::Started);
    }

    fn progress(&mut self, current: u64, total: u64) {
        self.emit(TransmissionEvent::Progress { current, total });
    }

    fn chunk_progress(&mut self, container_id: &str, bytes: u64, total: u64) {
        self.emit(TransmissionEvent::ChunkProgress {
            container_id: container_id.to_string(),
            bytes,
            total,
        });
    }

    fn finished(&mut self) {
        self.emit(TransmissionEvent::Finished);
    }

    fn aborted(&mut self, error: &SyncError) {
        self.emit(TransmissionEvent::Aborted(error.to_string()));
    }
}

// =============================================================================
// Guard
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    Idle,
    Started,
    Terminated,
}

/// Enforces the callback ordering for one transmission.
///
/// If the guard is dropped after `started` without a terminal callback
/// (the coordinator's future was cancelled), it reports `aborted`.
pub struct ListenerGuard {
    inner: Box<dyn TransmissionListener>,
    state: GuardState,
}

impl ListenerGuard {
    pub fn new(inner: Box<dyn TransmissionListener>) -> Self {
        Self {
            inner,
            state: GuardState::Idle,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == GuardState::Terminated
    }

    pub fn started(&mut self) {
        if self.state == GuardState::Idle {
            self.state = GuardState::Started;
            self.inner.started();
        }
    }

    pub fn progress(&mut self, current: u64, total: u64) {
        if self.state != GuardState::Terminated {
            self.inner.progress(current, total);
        }
    }

    pub fn chunk_progress(&mut self, container_id: &str, bytes: u64, total: u64) {
        if self.state != GuardState::Terminated {
            self.inner.chunk_progress(container_id, bytes, total);
        }
    }

    /// Returns false if a terminal callback already fired.
    pub fn finished(&mut self) -> bool {
        if self.state == GuardState::Terminated {
            return false;
        }
        self.state = GuardState::Terminated;
        self.inner.finished();
        true
    }

    /// Returns false if a terminal callback already fired.
    pub fn aborted(&mut self, error: &SyncError) -> bool {
        if self.state == GuardState::Terminated {
            return false;
        }
        self.state = GuardState::Terminated;
        self.inner.aborted(error);
        true
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if self.state == GuardState::Started {
            self.aborted(&SyncError::Transport("Transmission cancelled".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransmissionEvent>) -> Vec<TransmissionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_guard_single_terminal() {
        let (listener, mut rx) = ChannelListener::new();
        let mut guard = ListenerGuard::new(Box::new(listener));

        guard.started();
        guard.started();
        guard.progress(1, 2);
        assert!(guard.finished());
        assert!(!guard.aborted(&SyncError::protocol("late")));
        assert!(!guard.finished());
        guard.progress(2, 2);
        drop(guard);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                TransmissionEvent::Started,
                TransmissionEvent::Progress { current: 1, total: 2 },
                TransmissionEvent::Finished,
            ]
        );
    }

    #[test]
    fn test_guard_aborts_on_drop_after_start() {
        let (listener, mut rx) = ChannelListener::new();
        let mut guard = ListenerGuard::new(Box::new(listener));
        guard.started();
        drop(guard);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TransmissionEvent::Aborted(_)));
    }

    #[test]
    fn test_guard_silent_when_never_started() {
        let (listener, mut rx) = ChannelListener::new();
        drop(ListenerGuard::new(Box::new(listener)));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_terminal_events() {
        assert!(TransmissionEvent::Finished.is_terminal());
        assert!(TransmissionEvent::Aborted("x".into()).is_terminal());
        assert!(!TransmissionEvent::Started.is_terminal());
    }
}
