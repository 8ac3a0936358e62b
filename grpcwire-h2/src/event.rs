//! Events reported by [`H2Connection::receive_data`](crate::H2Connection::receive_data).

use bytes::Bytes;

use crate::error::ErrorCode;
use crate::frame::Priority;
use crate::hpack::HeaderField;
use crate::settings::Setting;

/// A semantic HTTP/2 event, in the order the frames arrived.
///
/// Header and data events that carry END_STREAM are followed by a
/// separate [`H2Event::StreamEnded`] for the same stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H2Event {
    /// Server: a new stream opened with a request header block.
    RequestReceived {
        stream_id: u32,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Client: the final (non-1xx) response header block.
    ResponseReceived {
        stream_id: u32,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Client: a 1xx response header block.
    InformationalResponseReceived {
        stream_id: u32,
        headers: Vec<HeaderField>,
    },
    /// A trailing header block; always ends the stream.
    TrailersReceived {
        stream_id: u32,
        headers: Vec<HeaderField>,
    },
    /// A DATA frame. `flow_controlled_length` includes padding and is the
    /// amount to hand back through `acknowledge_received_data`.
    DataReceived {
        stream_id: u32,
        data: Bytes,
        flow_controlled_length: u32,
        end_stream: bool,
    },
    /// The peer granted send credit (stream 0 = connection window).
    WindowUpdated { stream_id: u32, delta: u32 },
    /// The peer's SETTINGS were applied and acknowledged.
    RemoteSettingsChanged { changed: Vec<Setting> },
    /// The peer will send nothing more on this stream.
    StreamEnded { stream_id: u32 },
    /// The stream was reset. `remote_reset` is false when the engine reset
    /// it on our behalf after a stream-level protocol violation.
    StreamReset {
        stream_id: u32,
        error_code: ErrorCode,
        remote_reset: bool,
    },
    /// Client with push enabled: the server promised a stream.
    PushedStreamReceived {
        pushed_stream_id: u32,
        parent_stream_id: u32,
        headers: Vec<HeaderField>,
    },
    /// The peer acknowledged our SETTINGS.
    SettingsAcknowledged,
    /// PRIORITY frame or HEADERS priority block.
    PriorityUpdated { stream_id: u32, priority: Priority },
    /// The peer sent GOAWAY.
    ConnectionTerminated {
        error_code: ErrorCode,
        last_stream_id: u32,
        debug_data: Bytes,
    },
    /// ALTSVC frame (client only).
    AlternativeServiceAvailable { origin: Bytes, field_value: Bytes },
    /// A frame of a type this engine does not know.
    UnknownFrameReceived { frame_type: u8, stream_id: u32 },
    /// The peer pinged us; the ACK is already queued.
    PingReceived { data: [u8; 8] },
    /// The peer answered one of our pings.
    PingAckReceived { data: [u8; 8] },
}
