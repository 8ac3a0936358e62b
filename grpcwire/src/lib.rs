//! Sans-IO gRPC over HTTP/2 translation layer.
//!
//! This crate turns HTTP/2 events from `grpcwire-h2` into gRPC events
//! (calls opened, messages decoded, calls ended with a status) and gRPC
//! calls back into HEADERS and DATA frames. It serves both the client and
//! the server role and has no protobuf dependency: message bodies are raw
//! `&[u8]` and serialization is the caller's business.
//!
//! # Architecture
//!
//! ```text
//!   transport bytes
//!        |
//!   +----v-----------+
//!   | grpcwire-h2    |  HTTP/2 framing, HPACK, flow control
//!   +----+-----------+
//!        |  H2Event
//!   +----v-----------+
//!   | grpcwire       |  headers, metadata, message framing, compression
//!   | GrpcConnection |  GrpcEvent: RequestReceived, MessageReceived, ...
//!   +----------------+
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use grpcwire::{GrpcConfiguration, GrpcConnection, GrpcEvent, RequestOptions};
//!
//! let mut grpc = GrpcConnection::new(GrpcConfiguration::client())?;
//! grpc.initiate_connection()?;
//!
//! let stream_id = grpc.get_next_available_stream_id();
//! grpc.start_request(stream_id, "my.Service", "MyMethod", &RequestOptions::default())?;
//! grpc.send_message(stream_id, &request_bytes, false)?;
//! grpc.end_request(stream_id)?;
//! transport_send(&grpc.data_to_send(None));
//!
//! for event in grpc.receive_data(&received)? {
//!     match event {
//!         GrpcEvent::MessageReceived { stream_id, data, flow_controlled_length } => {
//!             handle(&data);
//!             grpc.acknowledge_received_data(stream_id, flow_controlled_length)?;
//!         }
//!         GrpcEvent::ResponseEnded { status, message, .. } => { /* done */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod adapter;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod headers;
pub mod message;
pub mod metadata;

pub use adapter::ClosedStreamTolerance;
pub use codec::{Codec, CodecRegistry};
pub use config::{GrpcConfigBuilder, GrpcConfiguration};
pub use connection::{GrpcConnection, Termination};
pub use error::{GrpcError, GrpcStatus};
pub use event::GrpcEvent;
pub use headers::RequestOptions;
pub use message::{MessageReadBuffer, MessageWriteBuffer};
pub use metadata::{ContentType, Metadata, MetadataValue};
pub use grpcwire_h2::{ErrorCode, HeaderField};
