//! Sans-IO HTTP/2 connection engine.
//!
//! This crate provides an HTTP/2 endpoint for either the client or the
//! server role. It performs no I/O: the caller feeds received bytes in via
//! `receive_data()`, which returns the resulting events, and pulls bytes to
//! transmit out via `data_to_send()`.
//!
//! # Architecture
//!
//! ```text
//!   transport bytes
//!        |
//!   +----v----------+
//!   | grpcwire-h2   |  HTTP/2 framing, HPACK, flow control
//!   | H2Connection  |  H2Event: RequestReceived, DataReceived, ...
//!   +---------------+
//! ```
//!
//! Stream state changes go through a strict transition table. Callers that
//! need to accept specific non-conforming peer behavior install a
//! [`TransitionOverride`] with [`H2Connection::set_transition_override`].
//!
//! # Example
//!
//! ```rust,ignore
//! use grpcwire_h2::{H2Connection, H2Event, HeaderField, Settings};
//!
//! let mut h2 = H2Connection::client(Settings::client_default());
//! h2.initiate_connection();
//! transport_send(&h2.data_to_send(None));
//!
//! let stream_id = h2.get_next_available_stream_id();
//! h2.send_headers(stream_id, &[
//!     HeaderField::new(":method", "GET"),
//!     HeaderField::new(":path", "/"),
//!     HeaderField::new(":scheme", "https"),
//!     HeaderField::new(":authority", "example.com"),
//! ], true)?;
//! transport_send(&h2.data_to_send(None));
//!
//! for event in h2.receive_data(&received)? {
//!     match event {
//!         H2Event::ResponseReceived { stream_id, headers, .. } => { /* ... */ }
//!         H2Event::DataReceived { stream_id, data, flow_controlled_length, .. } => {
//!             h2.acknowledge_received_data(stream_id, flow_controlled_length);
//!         }
//!         _ => {}
//!     }
//! }
//! ```

pub mod connection;
pub mod error;
pub mod event;
pub mod flowcontrol;
pub mod frame;
pub mod hpack;
pub mod settings;
pub mod stream;

pub use connection::{H2Connection, Role};
pub use error::{ErrorCode, H2Error};
pub use event::H2Event;
pub use frame::{Frame, Priority};
pub use hpack::HeaderField;
pub use settings::{Setting, Settings};
pub use stream::{StreamInput, StreamState, Transition, TransitionOverride};
