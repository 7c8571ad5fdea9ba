use crate::error::BridgeError;
use crate::gate::PendingCalls;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use toolbridge_common::OutboundMessage;

/// Process-unique connection identifier.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Transport state of a connection, mirroring the WebSocket ready states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    /// Handshake still in progress.
    Connecting = 0,
    /// Frames can flow in both directions.
    Open = 1,
    /// A close has been requested but the socket is not gone yet.
    Closing = 2,
    /// The socket is gone.
    Closed = 3,
}

impl ReadyState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Upper-case state name used in health-check reasons.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A close requested through a [`ConnHandle`], delivered to the socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    /// WebSocket close code.
    pub code: u16,
    /// Close reason text.
    pub reason: String,
}

/// Handle held in the registry, used to send frames to and close a connection.
#[derive(Clone)]
pub struct ConnHandle {
    id: ConnId,
    tx: mpsc::Sender<String>,
    state: Arc<AtomicU8>,
    close_tx: Arc<watch::Sender<Option<CloseRequest>>>,
    pending: Arc<PendingCalls>,
}

/// The socket-task side of a [`ConnHandle`].
#[derive(Debug)]
pub struct ConnReceiver {
    /// Serialized text frames queued for the socket.
    pub frames: mpsc::Receiver<String>,
    /// Close requests; the latest value wins.
    pub close: watch::Receiver<Option<CloseRequest>>,
}

impl ConnHandle {
    /// Create a handle in the `CONNECTING` state with an outbound queue of
    /// `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, ConnReceiver) {
        let (tx, frames) = mpsc::channel(capacity);
        let (close_tx, close) = watch::channel(None);
        let handle = Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            state: Arc::new(AtomicU8::new(ReadyState::Connecting as u8)),
            close_tx: Arc::new(close_tx),
            pending: Arc::new(PendingCalls::default()),
        };
        (handle, ConnReceiver { frames, close })
    }

    /// Connection identifier.
    #[must_use]
    pub const fn id(&self) -> ConnId {
        self.id
    }

    /// Current transport state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Record a transport state change observed by the socket task.
    pub fn set_ready_state(&self, state: ReadyState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns `true` if the transport is `OPEN`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// In-flight tool calls awaiting a result on this connection.
    #[must_use]
    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Queue a protocol message for the socket.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConnectionClosed`] if the connection is closing
    /// or gone, and [`BridgeError::QueueFull`] if the outbound queue is full.
    pub fn send(&self, msg: &OutboundMessage) -> Result<(), BridgeError> {
        self.send_text(msg.to_json()?)
    }

    /// Queue a pre-serialized text frame for the socket.
    ///
    /// # Errors
    ///
    /// See [`ConnHandle::send`].
    pub fn send_text(&self, text: String) -> Result<(), BridgeError> {
        if matches!(self.ready_state(), ReadyState::Closing | ReadyState::Closed) {
            return Err(BridgeError::ConnectionClosed);
        }
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BridgeError::ConnectionClosed,
        })
    }

    /// Ask the socket task to close with the given code and reason.
    ///
    /// Moves the handle to `CLOSING`. Closing a handle that is already
    /// closing or closed is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConnectionClosed`] if the socket task is gone;
    /// the handle is then marked `CLOSED`.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), BridgeError> {
        let transitioned = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                match ReadyState::from_u8(s) {
                    ReadyState::Connecting | ReadyState::Open => Some(ReadyState::Closing as u8),
                    ReadyState::Closing | ReadyState::Closed => None,
                }
            })
            .is_ok();
        if !transitioned {
            return Ok(());
        }
        let request = CloseRequest {
            code,
            reason: reason.to_string(),
        };
        if self.close_tx.send(Some(request)).is_err() {
            self.set_ready_state(ReadyState::Closed);
            return Err(BridgeError::ConnectionClosed);
        }
        Ok(())
    }
}

impl PartialEq for ConnHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnHandle {}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandle")
            .field("id", &self.id)
            .field("state", &self.ready_state())
            .finish_non_exhaustive()
    }
}
