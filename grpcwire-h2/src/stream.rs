//! Per-stream state tracking for HTTP/2 (RFC 9113 Section 5.1).
//!
//! Every frame sent or received on a stream is an input to a small state
//! table. The table is strict; callers that need to tolerate specific
//! peer behavior install a [`TransitionOverride`] on the connection, which
//! is consulted before the table.

use crate::error::ErrorCode;
use crate::flowcontrol::{FlowControl, WindowManager};

/// State of an HTTP/2 stream (RFC 9113 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle,
    Open,
    /// We sent END_STREAM (no more outgoing data).
    HalfClosedLocal,
    /// Peer sent END_STREAM (no more incoming data).
    HalfClosedRemote,
    /// Both sides done, or RST_STREAM sent/received.
    Closed,
}

/// Something that happened on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamInput {
    SendHeaders,
    SendData,
    SendEndStream,
    SendRstStream,
    SendWindowUpdate,
    RecvHeaders,
    RecvData,
    RecvEndStream,
    RecvRstStream,
    RecvWindowUpdate,
    RecvPriority,
}

/// Outcome of applying a [`StreamInput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state and process the frame.
    To(StreamState),
    /// Drop the frame silently: no state change, no event.
    Ignore,
    /// The frame is illegal in this state.
    Error(ErrorCode),
}

/// Hook consulted before the default state table.
///
/// Returning `Some` replaces the table's verdict for that
/// `(state, input)` pair; `None` defers to the table.
pub trait TransitionOverride: Send {
    fn intercept(&self, state: StreamState, input: StreamInput) -> Option<Transition>;
}

/// The default (strict) transition table.
pub fn transition(state: StreamState, input: StreamInput) -> Transition {
    use StreamInput::*;
    use StreamState::*;

    match (state, input) {
        (_, RecvPriority) => Transition::To(state),

        (Idle, SendHeaders | RecvHeaders) => Transition::To(Open),
        (Idle, _) => Transition::Error(ErrorCode::ProtocolError),

        (Open, SendEndStream) => Transition::To(HalfClosedLocal),
        (Open, RecvEndStream) => Transition::To(HalfClosedRemote),
        (Open, SendRstStream | RecvRstStream) => Transition::To(Closed),
        (Open, _) => Transition::To(Open),

        (HalfClosedLocal, RecvEndStream | SendRstStream | RecvRstStream) => {
            Transition::To(Closed)
        }
        (HalfClosedLocal, SendHeaders | SendData | SendEndStream) => {
            Transition::Error(ErrorCode::StreamClosed)
        }
        (HalfClosedLocal, _) => Transition::To(HalfClosedLocal),

        (HalfClosedRemote, SendEndStream | SendRstStream | RecvRstStream) => {
            Transition::To(Closed)
        }
        (HalfClosedRemote, RecvHeaders | RecvData | RecvEndStream) => {
            Transition::Error(ErrorCode::StreamClosed)
        }
        (HalfClosedRemote, _) => Transition::To(HalfClosedRemote),

        (Closed, SendRstStream) => Transition::To(Closed),
        (Closed, _) => Transition::Error(ErrorCode::StreamClosed),
    }
}

/// Tracks the state and flow control for a single HTTP/2 stream.
pub(crate) struct H2Stream {
    pub state: StreamState,
    pub recv_window: WindowManager,
    pub send_window: FlowControl,
    /// Whether a complete header block has been received (so the next
    /// one is trailers).
    pub headers_received: bool,
    /// Client only: an informational (1xx) response was the last block.
    pub informational_pending: bool,
}

impl H2Stream {
    pub fn new(initial_recv_window: u32, initial_send_window: i64) -> Self {
        Self {
            state: StreamState::Idle,
            recv_window: WindowManager::new(initial_recv_window),
            send_window: FlowControl::new(initial_send_window),
            headers_received: false,
            informational_pending: false,
        }
    }
}
