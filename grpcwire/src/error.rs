use grpcwire_h2::H2Error;

/// gRPC status codes (<https://grpc.github.io/grpc/core/md_doc_statuscodes.html>).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GrpcStatus {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl GrpcStatus {
    /// Map a wire value to a status. Codes outside 0..=16 are `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Status for a response whose `:status` is not 200 and which carries
    /// no `grpc-status` of its own.
    pub fn from_http(status: u16) -> Self {
        match status {
            400 => Self::Internal,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::Unimplemented,
            429 | 502 | 503 | 504 => Self::Unavailable,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for GrpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// Errors produced by the gRPC translation layer.
#[derive(Debug, thiserror::Error)]
pub enum GrpcError {
    /// Underlying HTTP/2 error.
    #[error("h2: {0}")]
    H2(#[from] H2Error),

    /// The peer broke the gRPC-over-HTTP/2 contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A message declared a length above the configured maximum.
    #[error("message of {length} bytes exceeds limit of {limit}")]
    MessageTooLarge { length: usize, limit: usize },

    /// A compressed message could not be decoded.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// An outgoing message could not be compressed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// Custom metadata with a reserved or malformed name or value.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A `grpc-timeout` value that does not parse.
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),

    /// A configuration value out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl GrpcError {
    /// Status reported to the client when this error ends a call.
    pub fn status(&self) -> GrpcStatus {
        match self {
            Self::MessageTooLarge { .. } => GrpcStatus::ResourceExhausted,
            Self::H2(H2Error::Closed) => GrpcStatus::Unavailable,
            _ => GrpcStatus::Internal,
        }
    }
}
