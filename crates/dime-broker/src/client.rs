use std::collections::{HashSet, VecDeque};

use dime_proto::{Frame, Serialization};

use crate::endpoint::Endpoint;

/// A connected socket plus its protocol state. The broker's client table
/// maps `Token -> Client`; [`crate::dispatch`] only ever touches `state`,
/// [`crate::server`] drives `endpoint` directly.
pub struct Client {
    pub endpoint: Endpoint,
    pub state: ClientState,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint, state: ClientState::new() }
    }
}

/// Per-connection protocol state, separate from the raw socket handling in
/// [`crate::endpoint::Endpoint`].
///
/// `outbox` only ever holds frames delivered by `send`/`broadcast` from other
/// clients (or from this client back to itself) — it is what `sync` drains.
/// Command acknowledgements (join/leave/handshake/wait/devices/sync itself)
/// bypass it and are written straight to the connection's write buffer, the
/// same way the reference server writes replies directly rather than queuing
/// them.
pub struct ClientState {
    pub serialization: Serialization,
    pub groups: HashSet<String>,
    pub outbox: VecDeque<Frame>,
    outbox_bytes: usize,
    /// Set while a `wait` is parked: the connection is not drained further
    /// until `outbox` gains a frame, at which point the parked response is
    /// released and this is cleared.
    pub waiting: bool,
    /// True once this connection has seen its first `handshake` frame.
    pub handshaked: bool,
    pub closed: bool,
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            serialization: Serialization::default(),
            groups: HashSet::new(),
            outbox: VecDeque::new(),
            outbox_bytes: 0,
            waiting: false,
            handshaked: false,
            closed: false,
        }
    }

    fn approx_len(frame: &Frame) -> usize {
        frame.body.len() + 64
    }

    pub fn outbox_bytes(&self) -> usize {
        self.outbox_bytes
    }

    pub fn push_outbox(&mut self, frame: Frame) {
        self.outbox_bytes += Self::approx_len(&frame);
        self.outbox.push_back(frame);
    }

    pub fn pop_outbox(&mut self) -> Option<Frame> {
        let frame = self.outbox.pop_front()?;
        self.outbox_bytes = self.outbox_bytes.saturating_sub(Self::approx_len(&frame));
        Some(frame)
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}
