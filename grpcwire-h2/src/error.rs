/// HTTP/2 error codes (RFC 9113 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Map a wire value to a known code. Unknown codes are treated as
    /// `InternalError` (RFC 9113 Section 7: unknown codes MUST NOT trigger
    /// special behavior).
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Errors produced by the HTTP/2 engine.
#[derive(Debug, thiserror::Error)]
pub enum H2Error {
    /// Frame decoding error (truncated or malformed payload).
    #[error("frame error")]
    Frame,

    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// HPACK header block could not be decoded.
    #[error("HPACK error: {0}")]
    Compression(String),

    /// Flow control window would be exceeded.
    #[error("flow control error")]
    FlowControl,

    /// Frame size exceeds the negotiated maximum.
    #[error("frame size error")]
    FrameSize,

    /// A frame arrived for a stream that is already closed.
    #[error("stream {0} is closed")]
    StreamClosed(u32),

    /// The operation named a stream this connection never opened.
    #[error("unknown stream {0}")]
    UnknownStream(u32),

    /// Connection-level error with an error code.
    #[error("connection error: {0:?}")]
    Connection(ErrorCode),

    /// Stream-level error with an error code.
    #[error("stream {0} error: {1:?}")]
    Stream(u32, ErrorCode),

    /// The connection has been shut down (GOAWAY sent or received).
    #[error("connection closed")]
    Closed,
}

impl H2Error {
    /// The code sent in GOAWAY when this error terminates the connection.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Frame | Self::Protocol(_) | Self::UnknownStream(_) => ErrorCode::ProtocolError,
            Self::Compression(_) => ErrorCode::CompressionError,
            Self::FlowControl => ErrorCode::FlowControlError,
            Self::FrameSize => ErrorCode::FrameSizeError,
            Self::StreamClosed(_) => ErrorCode::StreamClosed,
            Self::Connection(code) | Self::Stream(_, code) => *code,
            Self::Closed => ErrorCode::NoError,
        }
    }
}
