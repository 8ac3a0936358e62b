//! gRPC connection state machine.
//!
//! `GrpcConnection` wraps an `H2Connection`, translating its events into
//! [`GrpcEvent`]s and gRPC calls into HEADERS and DATA frames.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use grpcwire_h2::settings::MAX_WINDOW_SIZE;
use grpcwire_h2::{ErrorCode, H2Connection, H2Error, H2Event, HeaderField, Role, Settings};
use tracing::{debug, trace, warn};

use crate::adapter::ClosedStreamTolerance;
use crate::codec::Codec;
use crate::config::GrpcConfiguration;
use crate::error::{GrpcError, GrpcStatus};
use crate::event::GrpcEvent;
use crate::headers::{self, RequestHead, RequestOptions, ResponseHead};
use crate::message::{MessageReadBuffer, MessageWriteBuffer, PREFIX_LEN};
use crate::metadata::{ContentType, Metadata};

/// The peer's GOAWAY, as last received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub error_code: ErrorCode,
    pub last_stream_id: u32,
    pub debug_data: Bytes,
}

/// What to send once a stream's queued messages have drained.
enum PendingEnd {
    /// Empty DATA with END_STREAM (client half-close).
    EndStream,
    /// Trailing HEADERS with END_STREAM.
    Trailers(Vec<HeaderField>),
}

/// Outbound side of one call.
struct OutboundStream {
    buffer: MessageWriteBuffer,
    end: Option<PendingEnd>,
    content_type: ContentType,
    /// Server: response HEADERS already sent.
    headers_sent: bool,
}

impl OutboundStream {
    fn new(codec: Option<Arc<dyn Codec>>, content_type: ContentType, headers_sent: bool) -> Self {
        Self {
            buffer: MessageWriteBuffer::new(codec),
            end: None,
            content_type,
            headers_sent,
        }
    }
}

/// Sans-IO gRPC connection for either role.
///
/// Every call in flight has a read buffer from the moment its request
/// (server) or response (client) headers are reported until the stream
/// ends or is reset. Data for any other stream is a protocol error.
pub struct GrpcConnection {
    config: GrpcConfiguration,
    h2: H2Connection,
    read_buffers: HashMap<u32, MessageReadBuffer>,
    outbound: HashMap<u32, OutboundStream>,
    /// Client calls whose response HEADERS have not arrived yet.
    awaiting_headers: HashSet<u32>,
    remote_termination: Option<Termination>,
}

impl GrpcConnection {
    /// Create a connection. The HTTP/2 engine tolerates late RST_STREAM
    /// and WINDOW_UPDATE frames on closed streams.
    pub fn new(config: GrpcConfiguration) -> Result<Self, GrpcError> {
        config.validate()?;

        let (role, mut settings) = if config.client_side {
            (Role::Client, Settings::client_default())
        } else {
            (Role::Server, Settings::server_default())
        };
        settings.initial_window_size = stream_window(&config);

        let mut h2 = H2Connection::new(role, settings);
        h2.set_transition_override(Box::new(ClosedStreamTolerance));

        Ok(Self {
            config,
            h2,
            read_buffers: HashMap::new(),
            outbound: HashMap::new(),
            awaiting_headers: HashSet::new(),
            remote_termination: None,
        })
    }

    pub fn config(&self) -> &GrpcConfiguration {
        &self.config
    }

    /// Queue the connection preface and open the connection receive window
    /// to its maximum.
    pub fn initiate_connection(&mut self) -> Result<(), GrpcError> {
        self.h2.initiate_connection();
        let opened = self.h2.local_settings().initial_window_size.max(65535);
        let increment = MAX_WINDOW_SIZE - opened;
        if increment > 0 {
            self.h2.increment_flow_control_window(increment, None)?;
        }
        Ok(())
    }

    /// Feed received bytes. Returns the gRPC events they produced, in
    /// wire order.
    ///
    /// Stream-level problems reset the stream and never fail the call;
    /// `Err` means the HTTP/2 connection itself failed.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<Vec<GrpcEvent>, GrpcError> {
        let h2_events = self.h2.receive_data(data)?;
        let mut events = Vec::new();
        for event in h2_events {
            self.handle_event(event, &mut events)?;
        }
        Ok(events)
    }

    /// Take up to `limit` bytes to transmit (all pending for `None`).
    pub fn data_to_send(&mut self, limit: Option<usize>) -> Bytes {
        self.h2.data_to_send(limit)
    }

    pub fn has_data_to_send(&self) -> bool {
        self.h2.has_data_to_send()
    }

    // -- Client calls --

    /// Open a call on `stream_id` with a HEADERS frame that leaves the
    /// stream open for request messages.
    pub fn start_request(
        &mut self,
        stream_id: u32,
        service: &str,
        method: &str,
        options: &RequestOptions,
    ) -> Result<(), GrpcError> {
        let block = headers::request(&self.config, service, method, options);
        self.h2.send_headers(stream_id, &block, false)?;
        debug!(stream_id, service, method, "request started");

        let codec = self.local_codec();
        self.outbound.insert(
            stream_id,
            OutboundStream::new(codec, options.content_type.clone(), true),
        );
        self.awaiting_headers.insert(stream_id);
        Ok(())
    }

    /// Half-close the request side. Deferred until queued messages have
    /// been sent.
    pub fn end_request(&mut self, stream_id: u32) -> Result<(), GrpcError> {
        self.finish(stream_id, PendingEnd::EndStream)
    }

    // -- Server calls --

    /// Send the response HEADERS (`:status: 200`) with initial metadata.
    pub fn start_response(&mut self, stream_id: u32, metadata: &Metadata) -> Result<(), GrpcError> {
        let out = self
            .outbound
            .get_mut(&stream_id)
            .ok_or(GrpcError::H2(H2Error::UnknownStream(stream_id)))?;
        if out.headers_sent {
            return Err(GrpcError::Protocol(format!(
                "response on stream {stream_id} already started"
            )));
        }
        out.headers_sent = true;
        let block = headers::response(&self.config, &out.content_type, metadata);
        self.h2.send_headers(stream_id, &block, false)?;
        Ok(())
    }

    /// Answer with a single HEADERS frame that carries the status and
    /// ends the stream (trailers-only response).
    pub fn respond_status(
        &mut self,
        stream_id: u32,
        status: GrpcStatus,
        message: Option<&str>,
        trailers: &Metadata,
    ) -> Result<(), GrpcError> {
        let out = self
            .outbound
            .get(&stream_id)
            .ok_or(GrpcError::H2(H2Error::UnknownStream(stream_id)))?;
        if out.headers_sent {
            return Err(GrpcError::Protocol(format!(
                "response on stream {stream_id} already started"
            )));
        }
        let mut block = headers::response(&self.config, &out.content_type, &Metadata::new());
        block.extend(headers::trailers(status, message, trailers));
        self.outbound.remove(&stream_id);
        self.h2.send_headers(stream_id, &block, true)?;
        debug!(stream_id, %status, "trailers-only response");
        Ok(())
    }

    /// Close the response with trailers. Deferred until queued messages
    /// have been sent; without a prior `start_response` this is a
    /// trailers-only response.
    pub fn end_response(
        &mut self,
        stream_id: u32,
        status: GrpcStatus,
        message: Option<&str>,
        trailers: &Metadata,
    ) -> Result<(), GrpcError> {
        if !self.outbound_mut(stream_id)?.headers_sent {
            return self.respond_status(stream_id, status, message, trailers);
        }
        let block = headers::trailers(status, message, trailers);
        debug!(stream_id, %status, "response ending");
        self.finish(stream_id, PendingEnd::Trailers(block))
    }

    // -- Either side --

    /// Frame `message` onto the stream and send as much as flow control
    /// allows. `compress` applies the configured `message_encoding`.
    pub fn send_message(
        &mut self,
        stream_id: u32,
        message: &[u8],
        compress: bool,
    ) -> Result<(), GrpcError> {
        let out = self.outbound_mut(stream_id)?;
        if out.end.is_some() {
            return Err(GrpcError::Protocol(format!(
                "stream {stream_id} already ended"
            )));
        }
        if !out.headers_sent {
            return Err(GrpcError::Protocol(format!(
                "message on stream {stream_id} before response headers"
            )));
        }
        out.buffer.write_message(message, compress)?;
        trace!(stream_id, length = message.len(), "message queued");
        self.flush_stream(stream_id)
    }

    /// Send whatever queued messages, END_STREAM flags and trailers the
    /// current flow-control windows allow. Stops at the first stream that
    /// fails to send.
    pub fn flush_pending_writes(&mut self) -> Result<(), GrpcError> {
        let mut ids: Vec<u32> = self.outbound.keys().copied().collect();
        ids.sort_unstable();
        for stream_id in ids {
            self.flush_stream(stream_id)?;
        }
        Ok(())
    }

    /// Raw DATA on a stream, bypassing message framing.
    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> Result<(), GrpcError> {
        self.h2.send_data(stream_id, data, end_stream)?;
        Ok(())
    }

    /// Cancel a call: RST_STREAM and drop everything buffered for it.
    pub fn reset_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> Result<(), GrpcError> {
        self.outbound.remove(&stream_id);
        self.awaiting_headers.remove(&stream_id);
        let residue = self
            .read_buffers
            .remove(&stream_id)
            .map_or(0, |mut b| b.release_remaining());
        self.h2.reset_stream(stream_id, error_code)?;
        self.acknowledge_received_data(stream_id, residue)?;
        debug!(stream_id, ?error_code, "stream reset");
        Ok(())
    }

    /// Hand back flow-control credit once a received message has been
    /// processed.
    pub fn acknowledge_received_data(&mut self, stream_id: u32, length: usize) -> Result<(), GrpcError> {
        let length = u32::try_from(length).map_err(|_| H2Error::FlowControl)?;
        self.h2.acknowledge_received_data(stream_id, length);
        Ok(())
    }

    /// Bytes that may be sent on `stream_id` right now.
    pub fn flow_control_window(&self, stream_id: u32) -> Result<usize, GrpcError> {
        Ok(self.h2.local_flow_control_window(stream_id)?)
    }

    pub fn get_next_available_stream_id(&self) -> u32 {
        self.h2.get_next_available_stream_id()
    }

    /// The GOAWAY received from the peer, if any.
    pub fn remote_termination(&self) -> Option<&Termination> {
        self.remote_termination.as_ref()
    }

    // -- Internal: inbound --

    fn handle_event(&mut self, event: H2Event, events: &mut Vec<GrpcEvent>) -> Result<(), GrpcError> {
        match event {
            H2Event::RequestReceived {
                stream_id,
                headers,
                end_stream,
            } => self.request_received(stream_id, &headers, end_stream, events),
            H2Event::ResponseReceived {
                stream_id,
                headers,
                end_stream,
            } => self.response_received(stream_id, &headers, end_stream, events),
            H2Event::TrailersReceived { stream_id, headers } => {
                self.trailers_received(stream_id, &headers, events)
            }
            H2Event::DataReceived {
                stream_id,
                data,
                flow_controlled_length,
                ..
            } => self.data_received(stream_id, &data, flow_controlled_length as usize, events)?,
            H2Event::StreamEnded { stream_id } => self.stream_ended(stream_id, events)?,
            H2Event::WindowUpdated { .. } | H2Event::RemoteSettingsChanged { .. } => {
                self.flush_on_credit(events)
            }
            H2Event::StreamReset {
                stream_id,
                error_code,
                remote_reset,
            } => self.stream_reset(stream_id, error_code, remote_reset, events)?,
            H2Event::ConnectionTerminated {
                error_code,
                last_stream_id,
                debug_data,
            } => {
                debug!(?error_code, last_stream_id, "peer sent GOAWAY");
                self.remote_termination = Some(Termination {
                    error_code,
                    last_stream_id,
                    debug_data,
                });
            }
            H2Event::InformationalResponseReceived { stream_id, .. } => {
                trace!(stream_id, "informational response ignored");
            }
            H2Event::PushedStreamReceived {
                pushed_stream_id, ..
            } => {
                trace!(pushed_stream_id, "pushed stream ignored");
            }
            H2Event::SettingsAcknowledged
            | H2Event::PriorityUpdated { .. }
            | H2Event::AlternativeServiceAvailable { .. }
            | H2Event::UnknownFrameReceived { .. }
            | H2Event::PingReceived { .. }
            | H2Event::PingAckReceived { .. } => {}
        }
        Ok(())
    }

    fn request_received(
        &mut self,
        stream_id: u32,
        headers: &[HeaderField],
        end_stream: bool,
        events: &mut Vec<GrpcEvent>,
    ) {
        if end_stream {
            let err = GrpcError::Protocol("request ended with its headers".into());
            return self.stream_error(stream_id, err, events);
        }
        let head = match RequestHead::parse(headers) {
            Ok(head) => head,
            Err(e) => return self.stream_error(stream_id, e, events),
        };

        let codec = self.peer_codec(head.message_encoding.as_deref());
        self.read_buffers.insert(
            stream_id,
            MessageReadBuffer::new(self.config.max_message_length, codec),
        );
        let codec = self.local_codec();
        self.outbound.insert(
            stream_id,
            OutboundStream::new(codec, head.content_type.clone(), false),
        );
        trace!(stream_id, "request received");
        events.push(head.into_event(stream_id));
    }

    fn response_received(
        &mut self,
        stream_id: u32,
        headers: &[HeaderField],
        end_stream: bool,
        events: &mut Vec<GrpcEvent>,
    ) {
        self.awaiting_headers.remove(&stream_id);
        let head = match ResponseHead::parse(headers) {
            Ok(head) => head,
            Err(e) => return self.stream_error(stream_id, e, events),
        };
        let http_status = head.http_status;

        if end_stream || http_status != 200 {
            let ended = headers::response_ended(stream_id, headers, Some(http_status))
                .unwrap_or_else(|e| failure(stream_id, &e));
            events.push(head.into_event(stream_id));
            events.push(ended);
            self.outbound.remove(&stream_id);
            if !end_stream {
                debug!(stream_id, http_status, "non-200 response, cancelling");
                if let Err(e) = self.h2.reset_stream(stream_id, ErrorCode::Cancel) {
                    debug!(stream_id, error = %e, "reset failed");
                }
            }
            return;
        }

        let codec = self.peer_codec(head.message_encoding.as_deref());
        self.read_buffers.insert(
            stream_id,
            MessageReadBuffer::new(self.config.max_message_length, codec),
        );
        events.push(head.into_event(stream_id));
    }

    /// Client: trailers end the call. The read buffer goes with them.
    fn trailers_received(
        &mut self,
        stream_id: u32,
        headers: &[HeaderField],
        events: &mut Vec<GrpcEvent>,
    ) {
        if !self.config.client_side {
            trace!(stream_id, "request trailers ignored");
            return;
        }
        let Some(mut buffer) = self.read_buffers.remove(&stream_id) else {
            trace!(stream_id, "trailers for a finished call");
            return;
        };
        self.outbound.remove(&stream_id);

        let partial = buffer.has_partial_message();
        let residue = buffer.release_remaining();
        self.release_credit(stream_id, residue);

        let ended = if partial {
            warn!(stream_id, "response ended mid-message");
            failure(
                stream_id,
                &GrpcError::Protocol("response ended mid-message".into()),
            )
        } else {
            headers::response_ended(stream_id, headers, None)
                .unwrap_or_else(|e| failure(stream_id, &e))
        };
        events.push(ended);
    }

    fn data_received(
        &mut self,
        stream_id: u32,
        data: &[u8],
        flow_controlled_length: usize,
        events: &mut Vec<GrpcEvent>,
    ) -> Result<(), GrpcError> {
        let Some(buffer) = self.read_buffers.get_mut(&stream_id) else {
            self.acknowledge_received_data(stream_id, flow_controlled_length)?;
            if self.awaiting_headers.contains(&stream_id) {
                let err = GrpcError::Protocol("DATA before response headers".into());
                self.stream_error(stream_id, err, events);
                return Ok(());
            }
            debug!(stream_id, "DATA without an open call, resetting");
            if let Err(e) = self.h2.reset_stream(stream_id, ErrorCode::ProtocolError) {
                debug!(stream_id, error = %e, "reset failed");
            }
            return Ok(());
        };

        buffer.data_received(data, flow_controlled_length);
        let mut failed = None;
        for decoded in buffer.read_all_complete_messages_flowcontrol() {
            match decoded {
                Ok((data, flow_controlled_length)) => events.push(GrpcEvent::MessageReceived {
                    stream_id,
                    data,
                    flow_controlled_length,
                }),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            self.stream_error(stream_id, e, events);
        }
        Ok(())
    }

    fn stream_ended(&mut self, stream_id: u32, events: &mut Vec<GrpcEvent>) -> Result<(), GrpcError> {
        let Some(mut buffer) = self.read_buffers.remove(&stream_id) else {
            if self.awaiting_headers.remove(&stream_id) {
                warn!(stream_id, "response ended without headers");
                self.outbound.remove(&stream_id);
                events.push(failure(
                    stream_id,
                    &GrpcError::Protocol("response ended without headers".into()),
                ));
            }
            return Ok(());
        };
        let partial = buffer.has_partial_message();
        let residue = buffer.release_remaining();
        self.acknowledge_received_data(stream_id, residue)?;

        if self.config.client_side {
            warn!(stream_id, "response ended without trailers");
            self.outbound.remove(&stream_id);
            events.push(failure(
                stream_id,
                &GrpcError::Protocol("response ended without trailers".into()),
            ));
        } else if partial {
            let err = GrpcError::Protocol("request ended mid-message".into());
            self.stream_error(stream_id, err, events);
        } else {
            trace!(stream_id, "request ended");
            events.push(GrpcEvent::RequestEnded { stream_id });
        }
        Ok(())
    }

    fn stream_reset(
        &mut self,
        stream_id: u32,
        error_code: ErrorCode,
        remote_reset: bool,
        events: &mut Vec<GrpcEvent>,
    ) -> Result<(), GrpcError> {
        debug!(stream_id, ?error_code, remote_reset, "stream reset");
        self.outbound.remove(&stream_id);
        let awaiting = self.awaiting_headers.remove(&stream_id);
        let buffer = self.read_buffers.remove(&stream_id);
        if buffer.is_none() && !awaiting {
            return Ok(());
        }
        let residue = buffer.map_or(0, |mut b| b.release_remaining());
        self.acknowledge_received_data(stream_id, residue)?;

        // The engine reset the call for a violation it detected.
        if !remote_reset && self.config.client_side {
            let err = GrpcError::Protocol(format!("stream reset locally ({error_code:?})"));
            events.push(failure(stream_id, &err));
        }
        Ok(())
    }

    /// Reset a stream after a gRPC-level violation. The client is told
    /// through a terminal `ResponseEnded`.
    fn stream_error(&mut self, stream_id: u32, err: GrpcError, events: &mut Vec<GrpcEvent>) {
        warn!(stream_id, error = %err, "stream error, resetting");
        self.drop_call(stream_id, ErrorCode::ProtocolError, &err, events);
    }

    /// Forget everything held for a call, reset its stream with `code`
    /// and report `err` to the client.
    fn drop_call(
        &mut self,
        stream_id: u32,
        code: ErrorCode,
        err: &GrpcError,
        events: &mut Vec<GrpcEvent>,
    ) {
        self.outbound.remove(&stream_id);
        self.awaiting_headers.remove(&stream_id);
        let residue = self
            .read_buffers
            .remove(&stream_id)
            .map_or(0, |mut b| b.release_remaining());
        if let Err(e) = self.h2.reset_stream(stream_id, code) {
            debug!(stream_id, error = %e, "reset failed");
        }
        self.release_credit(stream_id, residue);

        if self.config.client_side {
            events.push(failure(stream_id, err));
        }
    }

    /// Return credit for bytes that will never be acknowledged by the
    /// application.
    fn release_credit(&mut self, stream_id: u32, length: usize) {
        if let Err(e) = self.acknowledge_received_data(stream_id, length) {
            debug!(stream_id, length, error = %e, "credit not returned");
        }
    }

    // -- Internal: outbound --

    /// Flush every queued stream after the peer granted credit. A stream
    /// that can no longer send is dropped on its own; the rest of the
    /// received batch is still translated.
    fn flush_on_credit(&mut self, events: &mut Vec<GrpcEvent>) {
        let mut ids: Vec<u32> = self.outbound.keys().copied().collect();
        ids.sort_unstable();
        for stream_id in ids {
            if let Err(e) = self.flush_stream(stream_id) {
                warn!(stream_id, error = %e, "send failed, dropping call");
                self.drop_call(stream_id, ErrorCode::Cancel, &e, events);
            }
        }
    }

    fn outbound_mut(&mut self, stream_id: u32) -> Result<&mut OutboundStream, GrpcError> {
        self.outbound
            .get_mut(&stream_id)
            .ok_or(GrpcError::H2(H2Error::UnknownStream(stream_id)))
    }

    fn finish(&mut self, stream_id: u32, end: PendingEnd) -> Result<(), GrpcError> {
        let out = self.outbound_mut(stream_id)?;
        if out.end.is_some() {
            return Err(GrpcError::Protocol(format!(
                "stream {stream_id} already ended"
            )));
        }
        out.end = Some(end);
        self.flush_stream(stream_id)
    }

    /// Move queued bytes into DATA frames within the send window, then the
    /// pending end once nothing is left.
    fn flush_stream(&mut self, stream_id: u32) -> Result<(), GrpcError> {
        let Some(out) = self.outbound.get_mut(&stream_id) else {
            return Ok(());
        };

        if !out.buffer.is_empty() {
            let Ok(window) = self.h2.local_flow_control_window(stream_id) else {
                debug!(stream_id, "stream gone, dropping queued messages");
                self.outbound.remove(&stream_id);
                return Ok(());
            };
            let chunk = out.buffer.take(window);
            if chunk.is_empty() {
                trace!(stream_id, queued = out.buffer.len(), "send window exhausted");
                return Ok(());
            }
            let end_stream = out.buffer.is_empty() && matches!(out.end, Some(PendingEnd::EndStream));
            self.h2.send_data(stream_id, &chunk, end_stream)?;
            trace!(stream_id, sent = chunk.len(), queued = out.buffer.len(), "flushed");
            if end_stream {
                self.outbound.remove(&stream_id);
                return Ok(());
            }
            if !out.buffer.is_empty() {
                return Ok(());
            }
        }

        match out.end.take() {
            Some(PendingEnd::EndStream) => {
                self.outbound.remove(&stream_id);
                self.h2.send_data(stream_id, &[], true)?;
            }
            Some(PendingEnd::Trailers(block)) => {
                self.outbound.remove(&stream_id);
                self.h2.send_headers(stream_id, &block, true)?;
            }
            None => {}
        }
        Ok(())
    }

    /// Codec for messages the peer sends with `encoding`.
    fn peer_codec(&self, encoding: Option<&str>) -> Option<Arc<dyn Codec>> {
        encoding.and_then(|name| self.config.codecs.get(name)).cloned()
    }

    /// Codec for messages we compress.
    fn local_codec(&self) -> Option<Arc<dyn Codec>> {
        self.peer_codec(self.config.message_encoding.as_deref())
    }
}

/// The stream window we advertise: large enough for one maximal message,
/// so a call can never stall on a message it is not allowed to finish.
fn stream_window(config: &GrpcConfiguration) -> u32 {
    let needed = config
        .max_message_length
        .saturating_add(PREFIX_LEN)
        .min(MAX_WINDOW_SIZE as usize) as u32;
    config.initial_window_size.max(needed)
}

/// Terminal event for a call that failed locally.
fn failure(stream_id: u32, err: &GrpcError) -> GrpcEvent {
    GrpcEvent::ResponseEnded {
        stream_id,
        status: err.status(),
        message: Some(err.to_string()),
        trailers: Metadata::new(),
    }
}
