//! Session outbox
//!
//! A bounded queue of outbound messages per session. Replies must never be
//! dropped: when the queue is full for one, the session is killed instead.
//! Subscription-stream traffic is droppable; the caller decides what lapses.

use tokio::sync::mpsc;

use bleproxy_core::message::ServerMessage;

/// Reason a session is being torn down from the outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The outbox overflowed while holding a non-droppable message
    Backpressure,
    /// Daemon shutdown
    Shutdown,
}

/// Result of a stream-class enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSend {
    Sent,
    /// Queue full; the subscription should lapse
    Full,
    /// Session already gone
    Closed,
}

/// Sender half of a session outbox, held by the coordinator and the reader
#[derive(Debug, Clone)]
pub struct OutboxSender {
    tx: mpsc::Sender<ServerMessage>,
    kill: mpsc::Sender<CloseReason>,
}

/// Receiver half, owned by the session writer task
pub struct OutboxReceiver {
    pub rx: mpsc::Receiver<ServerMessage>,
    pub kill_rx: mpsc::Receiver<CloseReason>,
}

pub fn outbox(capacity: usize) -> (OutboxSender, OutboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (kill, kill_rx) = mpsc::channel(1);
    (OutboxSender { tx, kill }, OutboxReceiver { rx, kill_rx })
}

impl OutboxSender {
    /// Enqueue a request/response message. Overflow is fatal for the
    /// session; the kill signal always fits or is already pending.
    pub fn send_reply(&self, msg: ServerMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.kill.try_send(CloseReason::Backpressure);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Enqueue subscription-stream traffic; never kills the session
    pub fn send_stream(&self, msg: ServerMessage) -> StreamSend {
        match self.tx.try_send(msg) {
            Ok(()) => StreamSend::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => StreamSend::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => StreamSend::Closed,
        }
    }

    /// Ask the session to close after draining what is already queued
    pub fn request_close(&self, reason: CloseReason) {
        let _ = self.kill.try_send(reason);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
