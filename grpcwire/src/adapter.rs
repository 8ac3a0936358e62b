//! Stream state overrides installed on the HTTP/2 engine.

use grpcwire_h2::{StreamInput, StreamState, Transition, TransitionOverride};

/// Absorbs RST_STREAM and WINDOW_UPDATE arriving on a fully closed stream.
///
/// gRPC peers routinely reset a unary stream after both sides have ended
/// it. The strict table treats that as a connection error; with this
/// override the frame is dropped with no state change and no event.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClosedStreamTolerance;

impl TransitionOverride for ClosedStreamTolerance {
    fn intercept(&self, state: StreamState, input: StreamInput) -> Option<Transition> {
        match (state, input) {
            (StreamState::Closed, StreamInput::RecvRstStream | StreamInput::RecvWindowUpdate) => {
                Some(Transition::Ignore)
            }
            _ => None,
        }
    }
}
