//! Events returned by [`GrpcConnection::receive_data`](crate::GrpcConnection::receive_data).

use std::time::Duration;

use bytes::Bytes;

use crate::error::GrpcStatus;
use crate::metadata::{ContentType, Metadata};

/// A gRPC-level event, in wire order.
///
/// For any one stream, every `MessageReceived` precedes the
/// `RequestEnded`/`ResponseEnded` that closes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrpcEvent {
    /// Server: a call was opened.
    RequestReceived {
        stream_id: u32,
        /// `:method` (always `POST` for a valid call).
        method: String,
        scheme: String,
        /// `:path` is `/{service}/{method_name}`.
        service: String,
        method_name: String,
        authority: Option<String>,
        timeout: Option<Duration>,
        content_type: ContentType,
        message_encoding: Option<String>,
        message_accept_encoding: Option<String>,
        message_type: Option<String>,
        user_agent: Option<String>,
        metadata: Metadata,
    },
    /// Client: response headers.
    ResponseReceived {
        stream_id: u32,
        /// `:status`.
        http_status: u16,
        content_type: Option<ContentType>,
        message_encoding: Option<String>,
        message_accept_encoding: Option<String>,
        metadata: Metadata,
    },
    /// One decoded message. `flow_controlled_length` is the credit to hand
    /// back through `acknowledge_received_data` once it is processed.
    MessageReceived {
        stream_id: u32,
        data: Bytes,
        flow_controlled_length: usize,
    },
    /// Server: the client finished sending.
    RequestEnded { stream_id: u32 },
    /// Client: the call is over.
    ResponseEnded {
        stream_id: u32,
        status: GrpcStatus,
        message: Option<String>,
        trailers: Metadata,
    },
}

impl GrpcEvent {
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::RequestReceived { stream_id, .. }
            | Self::ResponseReceived { stream_id, .. }
            | Self::MessageReceived { stream_id, .. }
            | Self::RequestEnded { stream_id }
            | Self::ResponseEnded { stream_id, .. } => *stream_id,
        }
    }
}
