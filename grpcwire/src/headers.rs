//! Construction and parsing of gRPC request, response and trailer blocks.

use std::time::Duration;

use grpcwire_h2::HeaderField;

use crate::config::GrpcConfiguration;
use crate::error::{GrpcError, GrpcStatus};
use crate::event::GrpcEvent;
use crate::metadata::{self, ContentType, Metadata};

const REQUEST_PSEUDO: &[&str] = &[":method", ":scheme", ":path", ":authority"];
const RESPONSE_PSEUDO: &[&str] = &[":status"];

/// Optional parts of an outgoing request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// `:scheme`, `http` by default.
    pub scheme: String,
    pub authority: Option<String>,
    pub timeout: Option<Duration>,
    /// `grpc-message-type`.
    pub message_type: Option<String>,
    pub content_type: ContentType,
    pub metadata: Metadata,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            authority: None,
            timeout: None,
            message_type: None,
            content_type: ContentType::default(),
            metadata: Metadata::new(),
        }
    }
}

pub(crate) fn request(
    config: &GrpcConfiguration,
    service: &str,
    method: &str,
    options: &RequestOptions,
) -> Vec<HeaderField> {
    let mut headers = vec![
        HeaderField::new(":method", "POST"),
        HeaderField::new(":scheme", options.scheme.as_str()),
        HeaderField::new(":path", format!("/{service}/{method}")),
    ];
    if let Some(authority) = &options.authority {
        headers.push(HeaderField::new(":authority", authority.as_str()));
    }
    headers.push(HeaderField::new("te", "trailers"));
    headers.push(HeaderField::new("content-type", options.content_type.to_string()));
    if let Some(timeout) = options.timeout {
        headers.push(HeaderField::new(
            "grpc-timeout",
            metadata::encode_timeout(timeout),
        ));
    }
    if let Some(message_type) = &options.message_type {
        headers.push(HeaderField::new("grpc-message-type", message_type.as_str()));
    }
    push_encodings(config, &mut headers);
    if let Some(user_agent) = &config.user_agent {
        headers.push(HeaderField::new("user-agent", user_agent.as_str()));
    }
    headers.extend(options.metadata.to_headers());
    headers
}

pub(crate) fn response(
    config: &GrpcConfiguration,
    content_type: &ContentType,
    metadata: &Metadata,
) -> Vec<HeaderField> {
    let mut headers = vec![
        HeaderField::new(":status", "200"),
        HeaderField::new("content-type", content_type.to_string()),
    ];
    push_encodings(config, &mut headers);
    headers.extend(metadata.to_headers());
    headers
}

pub(crate) fn trailers(
    status: GrpcStatus,
    message: Option<&str>,
    metadata: &Metadata,
) -> Vec<HeaderField> {
    let mut headers = vec![HeaderField::new("grpc-status", status.code().to_string())];
    if let Some(message) = message {
        headers.push(HeaderField::new(
            "grpc-message",
            metadata::encode_grpc_message(message),
        ));
    }
    headers.extend(metadata.to_headers());
    headers
}

fn push_encodings(config: &GrpcConfiguration, headers: &mut Vec<HeaderField>) {
    if let Some(encoding) = &config.message_encoding {
        headers.push(HeaderField::new("grpc-encoding", encoding.as_str()));
    }
    if let Some(accept) = &config.message_accept_encoding {
        headers.push(HeaderField::new("grpc-accept-encoding", accept.as_str()));
    }
}

fn value(headers: &[HeaderField], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.name == name.as_bytes())
        .map(|h| String::from_utf8_lossy(&h.value).into_owned())
}

/// A parsed request header block.
pub(crate) struct RequestHead {
    method: String,
    scheme: String,
    service: String,
    method_name: String,
    authority: Option<String>,
    timeout: Option<Duration>,
    pub content_type: ContentType,
    pub message_encoding: Option<String>,
    message_accept_encoding: Option<String>,
    message_type: Option<String>,
    user_agent: Option<String>,
    metadata: Metadata,
}

impl RequestHead {
    pub fn parse(headers: &[HeaderField]) -> Result<Self, GrpcError> {
        let missing = |name: &str| GrpcError::Protocol(format!("request without {name}"));

        let method = value(headers, ":method").ok_or_else(|| missing(":method"))?;
        if method != "POST" {
            return Err(GrpcError::Protocol(format!("unsupported :method {method:?}")));
        }
        let scheme = value(headers, ":scheme").ok_or_else(|| missing(":scheme"))?;
        let path = value(headers, ":path").ok_or_else(|| missing(":path"))?;
        let (service, method_name) = path
            .strip_prefix('/')
            .and_then(|p| p.split_once('/'))
            .filter(|(service, method)| !service.is_empty() && !method.is_empty() && !method.contains('/'))
            .ok_or_else(|| GrpcError::Protocol(format!("malformed :path {path:?}")))?;

        let content_type = headers
            .iter()
            .find(|h| h.name == b"content-type")
            .and_then(|h| ContentType::parse(&h.value))
            .ok_or_else(|| GrpcError::Protocol("missing or non-gRPC content-type".into()))?;
        let timeout = value(headers, "grpc-timeout")
            .map(|t| metadata::decode_timeout(&t))
            .transpose()?;

        Ok(Self {
            service: service.to_string(),
            method_name: method_name.to_string(),
            method,
            scheme,
            authority: value(headers, ":authority"),
            timeout,
            content_type,
            message_encoding: value(headers, "grpc-encoding"),
            message_accept_encoding: value(headers, "grpc-accept-encoding"),
            message_type: value(headers, "grpc-message-type"),
            user_agent: value(headers, "user-agent"),
            metadata: Metadata::from_headers(headers, REQUEST_PSEUDO)?,
        })
    }

    pub fn into_event(self, stream_id: u32) -> GrpcEvent {
        GrpcEvent::RequestReceived {
            stream_id,
            method: self.method,
            scheme: self.scheme,
            service: self.service,
            method_name: self.method_name,
            authority: self.authority,
            timeout: self.timeout,
            content_type: self.content_type,
            message_encoding: self.message_encoding,
            message_accept_encoding: self.message_accept_encoding,
            message_type: self.message_type,
            user_agent: self.user_agent,
            metadata: self.metadata,
        }
    }
}

/// A parsed response header block.
pub(crate) struct ResponseHead {
    pub http_status: u16,
    content_type: Option<ContentType>,
    pub message_encoding: Option<String>,
    message_accept_encoding: Option<String>,
    metadata: Metadata,
}

impl ResponseHead {
    pub fn parse(headers: &[HeaderField]) -> Result<Self, GrpcError> {
        let status = value(headers, ":status")
            .ok_or_else(|| GrpcError::Protocol("response without :status".into()))?;
        let http_status = status
            .parse()
            .map_err(|_| GrpcError::Protocol(format!("malformed :status {status:?}")))?;
        Ok(Self {
            http_status,
            content_type: headers
                .iter()
                .find(|h| h.name == b"content-type")
                .and_then(|h| ContentType::parse(&h.value)),
            message_encoding: value(headers, "grpc-encoding"),
            message_accept_encoding: value(headers, "grpc-accept-encoding"),
            metadata: Metadata::from_headers(headers, RESPONSE_PSEUDO)?,
        })
    }

    pub fn into_event(self, stream_id: u32) -> GrpcEvent {
        GrpcEvent::ResponseReceived {
            stream_id,
            http_status: self.http_status,
            content_type: self.content_type,
            message_encoding: self.message_encoding,
            message_accept_encoding: self.message_accept_encoding,
            metadata: self.metadata,
        }
    }
}

/// Build the terminal `ResponseEnded` from a trailer block (or the
/// headers of a trailers-only response, with its `:status`).
pub(crate) fn response_ended(
    stream_id: u32,
    headers: &[HeaderField],
    http_status: Option<u16>,
) -> Result<GrpcEvent, GrpcError> {
    let known_pseudo: &[&str] = if http_status.is_some() {
        RESPONSE_PSEUDO
    } else {
        &[]
    };
    let trailers = Metadata::from_headers(headers, known_pseudo)?;
    let message = headers
        .iter()
        .find(|h| h.name == b"grpc-message")
        .map(|h| metadata::decode_grpc_message(&h.value));

    let status = match value(headers, "grpc-status") {
        Some(code) => code
            .parse()
            .map(GrpcStatus::from_code)
            .map_err(|_| GrpcError::Protocol(format!("malformed grpc-status {code:?}")))?,
        None => match http_status {
            Some(http) if http != 200 => {
                return Ok(GrpcEvent::ResponseEnded {
                    stream_id,
                    status: GrpcStatus::from_http(http),
                    message: message.or_else(|| Some(format!("HTTP status {http}"))),
                    trailers,
                });
            }
            _ => return Err(GrpcError::Protocol("trailers without grpc-status".into())),
        },
    };

    Ok(GrpcEvent::ResponseEnded {
        stream_id,
        status,
        message,
        trailers,
    })
}
