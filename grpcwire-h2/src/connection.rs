//! HTTP/2 connection state machine.
//!
//! `H2Connection` is a sans-IO HTTP/2 endpoint for either role. Feed bytes
//! in via `receive_data()` (which returns the resulting events) and pull
//! bytes out via `data_to_send()`.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{ErrorCode, H2Error};
use crate::event::H2Event;
use crate::flowcontrol::{self, FlowControl, WindowManager};
use crate::frame::{self, Frame};
use crate::hpack::{Decoder, Encoder, HeaderField};
use crate::settings::{Setting, Settings};
use crate::stream::{self, H2Stream, StreamInput, StreamState, Transition, TransitionOverride};

/// HTTP/2 connection preface (RFC 9113 Section 3.4).
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Upper bound on an accumulated header block (HEADERS + CONTINUATION).
const MAX_HEADER_BLOCK_SIZE: usize = 1 << 20;

/// Locally reset streams remembered so that frames already in flight
/// from the peer are dropped instead of treated as errors.
const RESET_HISTORY: usize = 128;

/// Which end of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// `initiate_connection()` not yet called.
    Idle,
    /// Preface sent; frames flow in both directions.
    Open,
    /// GOAWAY sent, or an error GOAWAY received.
    Closed,
}

/// A header block spread over HEADERS/PUSH_PROMISE + CONTINUATION frames.
struct PendingHeaders {
    stream_id: u32,
    block: Vec<u8>,
    end_stream: bool,
    promised_stream_id: Option<u32>,
}

/// Sans-IO HTTP/2 connection.
pub struct H2Connection {
    role: Role,
    state: ConnState,
    preface_received: bool,
    local_settings: Settings,
    remote_settings: Settings,

    /// Streams that are not yet closed, keyed by stream ID.
    streams: HashMap<u32, H2Stream>,
    highest_local_stream_id: u32,
    highest_remote_stream_id: u32,
    next_stream_id: u32,
    recently_reset: VecDeque<u32>,
    /// `last_stream_id` of a graceful GOAWAY from the peer. Local streams
    /// above it are refused; those at or below it keep running.
    remote_goaway: Option<u32>,

    conn_recv_window: WindowManager,
    conn_send_window: FlowControl,

    encoder: Encoder,
    decoder: Decoder,
    /// No other frame may interleave until END_HEADERS.
    continuation: Option<PendingHeaders>,

    transition_override: Option<Box<dyn TransitionOverride>>,

    recv_buf: BytesMut,
    send_buf: BytesMut,
}

impl H2Connection {
    /// Create a connection for `role`. Nothing is queued until
    /// `initiate_connection()`.
    pub fn new(role: Role, settings: Settings) -> Self {
        Self {
            role,
            state: ConnState::Idle,
            preface_received: role == Role::Client,
            conn_recv_window: WindowManager::new(flowcontrol::DEFAULT_WINDOW_SIZE as u32),
            decoder: Decoder::new(settings.header_table_size as usize),
            local_settings: settings,
            remote_settings: Settings::default(),
            streams: HashMap::new(),
            highest_local_stream_id: 0,
            highest_remote_stream_id: 0,
            next_stream_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            recently_reset: VecDeque::new(),
            remote_goaway: None,
            conn_send_window: FlowControl::default(),
            encoder: Encoder::new(),
            continuation: None,
            transition_override: None,
            recv_buf: BytesMut::new(),
            send_buf: BytesMut::new(),
        }
    }

    pub fn client(settings: Settings) -> Self {
        Self::new(Role::Client, settings)
    }

    pub fn server(settings: Settings) -> Self {
        Self::new(Role::Server, settings)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Install a hook that is consulted before the stream state table.
    pub fn set_transition_override(&mut self, hook: Box<dyn TransitionOverride>) {
        self.transition_override = Some(hook);
    }

    /// Queue the connection preface: the client magic (client role only)
    /// followed by our SETTINGS.
    pub fn initiate_connection(&mut self) {
        if self.state != ConnState::Idle {
            return;
        }
        if self.role == Role::Client {
            self.send_buf.extend_from_slice(CLIENT_PREFACE);
        }
        Frame::Settings {
            ack: false,
            settings: self.local_settings.to_list(),
        }
        .encode(&mut self.send_buf);

        // The connection window is not covered by INITIAL_WINDOW_SIZE.
        let extra = i64::from(self.local_settings.initial_window_size) - flowcontrol::DEFAULT_WINDOW_SIZE;
        if extra > 0 {
            self.conn_recv_window.window_opened(extra as u32);
            Frame::WindowUpdate {
                stream_id: 0,
                increment: extra as u32,
            }
            .encode(&mut self.send_buf);
        }
        self.state = ConnState::Open;
    }

    /// Feed received bytes. Returns the events they produced, in order.
    ///
    /// A connection-level error queues GOAWAY and closes the connection.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<Vec<H2Event>, H2Error> {
        if self.state == ConnState::Idle {
            self.initiate_connection();
        }
        self.recv_buf.extend_from_slice(data);

        let mut events = Vec::new();
        match self.process_recv_buf(&mut events) {
            Ok(()) => Ok(events),
            Err(e) => {
                debug!(error = %e, "connection error, sending GOAWAY");
                self.close_connection(e.code());
                Err(e)
            }
        }
    }

    /// Take up to `limit` pending outbound bytes (all of them for `None`).
    pub fn data_to_send(&mut self, limit: Option<usize>) -> Bytes {
        let n = limit.map_or(self.send_buf.len(), |l| l.min(self.send_buf.len()));
        self.send_buf.split_to(n).freeze()
    }

    pub fn has_data_to_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// Send a header block. Opens the stream when it is idle; on an open
    /// stream this sends trailers.
    pub fn send_headers(
        &mut self,
        stream_id: u32,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        self.check_sendable(stream_id)?;

        let state = self.stream_state(stream_id);
        if state == StreamState::Idle {
            if !self.is_local(stream_id) {
                return Err(H2Error::Protocol(format!(
                    "stream {stream_id} cannot be opened by this side"
                )));
            }
            if let Some(max) = self.remote_settings.max_concurrent_streams
                && self.open_local_streams() >= max as usize
            {
                return Err(H2Error::Stream(stream_id, ErrorCode::RefusedStream));
            }
            let stream = H2Stream::new(
                self.local_settings.initial_window_size,
                i64::from(self.remote_settings.initial_window_size),
            );
            self.streams.insert(stream_id, stream);
            self.highest_local_stream_id = stream_id;
            self.next_stream_id = stream_id + 2;
        }

        self.advance_local(stream_id, StreamInput::SendHeaders)?;
        if end_stream {
            self.advance_local(stream_id, StreamInput::SendEndStream)?;
        }

        let mut block = Vec::new();
        self.encoder.encode(headers, &mut block);
        self.write_header_block(stream_id, Bytes::from(block), end_stream);
        trace!(stream_id, end_stream, count = headers.len(), "sent headers");

        self.forget_if_closed(stream_id);
        Ok(())
    }

    /// Send DATA, split into frames no larger than the peer's maximum.
    ///
    /// Fails with `FlowControl` (and sends nothing) when `data` exceeds
    /// the available connection or stream credit.
    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> Result<(), H2Error> {
        self.check_sendable(stream_id)?;
        if data.len() > self.local_flow_control_window(stream_id)? {
            return Err(H2Error::FlowControl);
        }
        self.check_local(stream_id, StreamInput::SendData)?;
        if end_stream {
            self.check_local(stream_id, StreamInput::SendEndStream)?;
        }

        let len = data.len() as u32;
        self.conn_send_window.consume(len)?;
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.send_window.consume(len)?;
        }

        let max_frame = self.remote_settings.max_frame_size as usize;
        let mut chunks = data.chunks(max_frame).peekable();
        if chunks.peek().is_none() {
            self.write_data_frame(stream_id, Bytes::new(), end_stream);
        }
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            self.write_data_frame(stream_id, Bytes::copy_from_slice(chunk), end_stream && last);
        }

        self.advance_local(stream_id, StreamInput::SendData)?;
        if end_stream {
            self.advance_local(stream_id, StreamInput::SendEndStream)?;
        }
        self.forget_if_closed(stream_id);
        Ok(())
    }

    /// Reset a stream. Resetting a stream that is already closed is a no-op.
    pub fn reset_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> Result<(), H2Error> {
        match self.stream_state(stream_id) {
            StreamState::Idle => Err(H2Error::UnknownStream(stream_id)),
            StreamState::Closed => Ok(()),
            _ => {
                self.write_reset(stream_id, error_code);
                Ok(())
            }
        }
    }

    /// Report `length` flow-controlled bytes as processed, re-opening the
    /// connection and stream windows (WINDOW_UPDATE is sent once enough
    /// has accumulated).
    pub fn acknowledge_received_data(&mut self, stream_id: u32, length: u32) {
        if length == 0 {
            return;
        }
        self.credit_connection(length);
        if let Some(stream) = self.streams.get_mut(&stream_id)
            && stream.state != StreamState::HalfClosedRemote
            && let Some(increment) = stream.recv_window.process_bytes(length)
        {
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
            .encode(&mut self.send_buf);
        }
    }

    /// Grant the peer `increment` bytes of extra credit on the connection
    /// (`None`) or on one stream.
    pub fn increment_flow_control_window(
        &mut self,
        increment: u32,
        stream_id: Option<u32>,
    ) -> Result<(), H2Error> {
        if increment == 0 || increment > crate::settings::MAX_WINDOW_SIZE {
            return Err(H2Error::FlowControl);
        }
        match stream_id {
            None | Some(0) => self.conn_recv_window.window_opened(increment),
            Some(id) => self
                .streams
                .get_mut(&id)
                .ok_or(H2Error::UnknownStream(id))?
                .recv_window
                .window_opened(increment),
        }
        Frame::WindowUpdate {
            stream_id: stream_id.unwrap_or(0),
            increment,
        }
        .encode(&mut self.send_buf);
        Ok(())
    }

    /// Bytes of DATA that may be sent on `stream_id` right now: the
    /// smaller of the connection and stream send windows.
    pub fn local_flow_control_window(&self, stream_id: u32) -> Result<usize, H2Error> {
        let stream = self
            .streams
            .get(&stream_id)
            .ok_or(H2Error::UnknownStream(stream_id))?;
        Ok(self
            .conn_send_window
            .available()
            .min(stream.send_window.available()))
    }

    /// Largest DATA frame payload the peer accepts.
    pub fn max_outbound_frame_size(&self) -> usize {
        self.remote_settings.max_frame_size as usize
    }

    /// The next stream ID this side may open.
    pub fn get_next_available_stream_id(&self) -> u32 {
        self.next_stream_id
    }

    /// Send a PING.
    pub fn ping(&mut self, opaque_data: [u8; 8]) {
        Frame::Ping {
            ack: false,
            opaque_data,
        }
        .encode(&mut self.send_buf);
    }

    /// Send GOAWAY and stop accepting new work.
    pub fn close_connection(&mut self, error_code: ErrorCode) {
        if self.state == ConnState::Closed {
            return;
        }
        Frame::GoAway {
            last_stream_id: self.highest_remote_stream_id,
            error_code,
            debug_data: Bytes::new(),
        }
        .encode(&mut self.send_buf);
        self.state = ConnState::Closed;
    }

    /// True once GOAWAY was sent or an error GOAWAY was received.
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// The `last_stream_id` of a graceful GOAWAY received from the peer.
    pub fn remote_goaway(&self) -> Option<u32> {
        self.remote_goaway
    }

    /// Current state of a stream; streams this connection has finished
    /// with report `Closed`.
    pub fn stream_state(&self, stream_id: u32) -> StreamState {
        if let Some(stream) = self.streams.get(&stream_id) {
            return stream.state;
        }
        let highest = if self.is_local(stream_id) {
            self.highest_local_stream_id
        } else {
            self.highest_remote_stream_id
        };
        if stream_id != 0 && stream_id <= highest {
            StreamState::Closed
        } else {
            StreamState::Idle
        }
    }

    /// Number of streams not yet closed.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    // -- Internal: state table --

    fn is_local(&self, stream_id: u32) -> bool {
        let odd = stream_id % 2 == 1;
        match self.role {
            Role::Client => odd,
            Role::Server => !odd,
        }
    }

    /// Frames may go out on `stream_id`: the connection is not closed, and
    /// a graceful GOAWAY from the peer did not exclude the stream.
    fn check_sendable(&self, stream_id: u32) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        if let Some(last) = self.remote_goaway
            && self.is_local(stream_id)
            && stream_id > last
        {
            return Err(H2Error::Closed);
        }
        Ok(())
    }

    fn open_local_streams(&self) -> usize {
        self.streams.keys().filter(|id| self.is_local(**id)).count()
    }

    fn resolve(&self, state: StreamState, input: StreamInput) -> Transition {
        if let Some(hook) = &self.transition_override
            && let Some(verdict) = hook.intercept(state, input)
        {
            return verdict;
        }
        stream::transition(state, input)
    }

    fn check_local(&self, stream_id: u32, input: StreamInput) -> Result<(), H2Error> {
        match self.resolve(self.stream_state(stream_id), input) {
            Transition::Error(code) => Err(H2Error::Stream(stream_id, code)),
            _ => Ok(()),
        }
    }

    /// Apply a locally generated input; errors are returned to the caller.
    fn advance_local(&mut self, stream_id: u32, input: StreamInput) -> Result<(), H2Error> {
        match self.resolve(self.stream_state(stream_id), input) {
            Transition::To(next) => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.state = next;
                }
                Ok(())
            }
            Transition::Ignore => Ok(()),
            Transition::Error(code) => Err(H2Error::Stream(stream_id, code)),
        }
    }

    fn forget_if_closed(&mut self, stream_id: u32) {
        if self
            .streams
            .get(&stream_id)
            .is_some_and(|s| s.state == StreamState::Closed)
        {
            self.streams.remove(&stream_id);
        }
    }

    fn was_reset_locally(&self, stream_id: u32) -> bool {
        self.recently_reset.contains(&stream_id)
    }

    // -- Internal: output --

    fn write_header_block(&mut self, stream_id: u32, block: Bytes, end_stream: bool) {
        let max_frame = self.remote_settings.max_frame_size as usize;
        let mut rest = block;
        let first = rest.split_to(rest.len().min(max_frame));
        Frame::Headers {
            stream_id,
            encoded: first,
            end_stream,
            end_headers: rest.is_empty(),
            priority: None,
        }
        .encode(&mut self.send_buf);
        while !rest.is_empty() {
            let fragment = rest.split_to(rest.len().min(max_frame));
            Frame::Continuation {
                stream_id,
                encoded: fragment,
                end_headers: rest.is_empty(),
            }
            .encode(&mut self.send_buf);
        }
    }

    fn write_data_frame(&mut self, stream_id: u32, payload: Bytes, end_stream: bool) {
        let flow_controlled_length = payload.len() as u32;
        Frame::Data {
            stream_id,
            payload,
            end_stream,
            flow_controlled_length,
        }
        .encode(&mut self.send_buf);
    }

    fn write_reset(&mut self, stream_id: u32, error_code: ErrorCode) {
        debug!(stream_id, ?error_code, "resetting stream");
        Frame::RstStream {
            stream_id,
            error_code,
        }
        .encode(&mut self.send_buf);
        self.streams.remove(&stream_id);
        if self.recently_reset.len() == RESET_HISTORY {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(stream_id);
    }

    fn credit_connection(&mut self, length: u32) {
        if let Some(increment) = self.conn_recv_window.process_bytes(length) {
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            }
            .encode(&mut self.send_buf);
        }
    }

    // -- Internal: input --

    fn process_recv_buf(&mut self, events: &mut Vec<H2Event>) -> Result<(), H2Error> {
        if !self.preface_received {
            let n = self.recv_buf.len().min(CLIENT_PREFACE.len());
            if self.recv_buf[..n] != CLIENT_PREFACE[..n] {
                return Err(H2Error::Protocol("invalid connection preface".into()));
            }
            if n < CLIENT_PREFACE.len() {
                return Ok(());
            }
            let _ = self.recv_buf.split_to(CLIENT_PREFACE.len());
            self.preface_received = true;
        }

        loop {
            let max_frame = self.local_settings.max_frame_size;
            let Some((frame, consumed)) = frame::decode_frame(&self.recv_buf, max_frame)? else {
                break;
            };
            let _ = self.recv_buf.split_to(consumed);
            trace!(?frame, "received frame");
            self.handle_frame(frame, events)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<H2Event>) -> Result<(), H2Error> {
        if let Some(pending) = &self.continuation {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == pending.stream_id => {}
                _ => return Err(H2Error::Protocol("expected CONTINUATION frame".into())),
            }
        }

        match frame {
            Frame::Settings { ack, settings } => self.handle_settings(ack, settings, events)?,
            Frame::Headers {
                stream_id,
                encoded,
                end_stream,
                end_headers,
                priority,
            } => {
                if let Some(priority) = priority {
                    events.push(H2Event::PriorityUpdated {
                        stream_id,
                        priority,
                    });
                }
                self.start_header_block(stream_id, encoded, end_stream, end_headers, None, events)?;
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                encoded,
                end_headers,
            } => {
                if self.role == Role::Server || !self.local_settings.enable_push {
                    return Err(H2Error::Protocol("PUSH_PROMISE not enabled".into()));
                }
                self.start_header_block(
                    stream_id,
                    encoded,
                    false,
                    end_headers,
                    Some(promised_stream_id),
                    events,
                )?;
            }
            Frame::Continuation {
                encoded,
                end_headers,
                ..
            } => {
                let Some(pending) = self.continuation.as_mut() else {
                    return Err(H2Error::Protocol("unexpected CONTINUATION frame".into()));
                };
                if pending.block.len() + encoded.len() > MAX_HEADER_BLOCK_SIZE {
                    return Err(H2Error::Protocol("header block too large".into()));
                }
                pending.block.extend_from_slice(&encoded);
                if end_headers && let Some(pending) = self.continuation.take() {
                    self.finish_header_block(pending, events)?;
                }
            }
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                flow_controlled_length,
            } => self.handle_data(stream_id, payload, end_stream, flow_controlled_length, events)?,
            Frame::RstStream {
                stream_id,
                error_code,
            } => self.handle_rst_stream(stream_id, error_code, events)?,
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.handle_window_update(stream_id, increment, events)?,
            Frame::Ping { ack, opaque_data } => {
                if ack {
                    events.push(H2Event::PingAckReceived { data: opaque_data });
                } else {
                    Frame::Ping {
                        ack: true,
                        opaque_data,
                    }
                    .encode(&mut self.send_buf);
                    events.push(H2Event::PingReceived { data: opaque_data });
                }
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                if error_code == ErrorCode::NoError {
                    // The peer may send GOAWAY more than once; the id only shrinks.
                    let last = self.remote_goaway.map_or(last_stream_id, |prev| prev.min(last_stream_id));
                    debug!(last_stream_id = last, "graceful GOAWAY received");
                    self.remote_goaway = Some(last);
                } else {
                    self.state = ConnState::Closed;
                }
                events.push(H2Event::ConnectionTerminated {
                    error_code,
                    last_stream_id,
                    debug_data,
                });
            }
            Frame::Priority {
                stream_id,
                priority,
            } => events.push(H2Event::PriorityUpdated {
                stream_id,
                priority,
            }),
            Frame::AltSvc {
                origin,
                field_value,
                ..
            } => {
                // Servers must ignore ALTSVC (RFC 7838 Section 4).
                if self.role == Role::Client {
                    events.push(H2Event::AlternativeServiceAvailable {
                        origin,
                        field_value,
                    });
                }
            }
            Frame::Unknown {
                frame_type,
                stream_id,
                ..
            } => events.push(H2Event::UnknownFrameReceived {
                frame_type,
                stream_id,
            }),
        }
        Ok(())
    }

    fn handle_settings(
        &mut self,
        ack: bool,
        changed: Vec<Setting>,
        events: &mut Vec<H2Event>,
    ) -> Result<(), H2Error> {
        if ack {
            events.push(H2Event::SettingsAcknowledged);
            return Ok(());
        }

        let old_window = i64::from(self.remote_settings.initial_window_size);
        self.remote_settings.apply(&changed);
        let delta = i64::from(self.remote_settings.initial_window_size) - old_window;

        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.send_window.adjust(delta)?;
            }
        }
        self.encoder
            .set_max_table_size(self.remote_settings.header_table_size as usize);

        Frame::Settings {
            ack: true,
            settings: Vec::new(),
        }
        .encode(&mut self.send_buf);
        events.push(H2Event::RemoteSettingsChanged { changed });
        Ok(())
    }

    fn start_header_block(
        &mut self,
        stream_id: u32,
        encoded: Bytes,
        end_stream: bool,
        end_headers: bool,
        promised_stream_id: Option<u32>,
        events: &mut Vec<H2Event>,
    ) -> Result<(), H2Error> {
        let pending = PendingHeaders {
            stream_id,
            block: encoded.to_vec(),
            end_stream,
            promised_stream_id,
        };
        if end_headers {
            self.finish_header_block(pending, events)
        } else {
            self.continuation = Some(pending);
            Ok(())
        }
    }

    fn finish_header_block(
        &mut self,
        pending: PendingHeaders,
        events: &mut Vec<H2Event>,
    ) -> Result<(), H2Error> {
        // Always decode, even for streams we drop, to keep HPACK state in sync.
        let headers = self.decoder.decode(&pending.block)?;
        let PendingHeaders {
            stream_id,
            end_stream,
            promised_stream_id,
            ..
        } = pending;

        if let Some(pushed_stream_id) = promised_stream_id {
            // Push is never serviced: surface it and refuse the stream.
            events.push(H2Event::PushedStreamReceived {
                pushed_stream_id,
                parent_stream_id: stream_id,
                headers,
            });
            self.highest_remote_stream_id = self.highest_remote_stream_id.max(pushed_stream_id);
            self.write_reset(pushed_stream_id, ErrorCode::RefusedStream);
            return Ok(());
        }

        let state = self.stream_state(stream_id);
        if state == StreamState::Idle {
            if self.role == Role::Client || self.is_local(stream_id) {
                return Err(H2Error::Protocol(format!(
                    "HEADERS on idle stream {stream_id}"
                )));
            }
            let stream = H2Stream::new(
                self.local_settings.initial_window_size,
                i64::from(self.remote_settings.initial_window_size),
            );
            self.streams.insert(stream_id, stream);
            self.highest_remote_stream_id = stream_id;
        }

        match self.resolve(state, StreamInput::RecvHeaders) {
            Transition::To(next) => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.state = next;
                }
            }
            Transition::Ignore => return Ok(()),
            Transition::Error(code) => {
                if !self.was_reset_locally(stream_id) {
                    self.write_reset(stream_id, code);
                }
                return Ok(());
            }
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        let event = if !stream.headers_received {
            match self.role {
                Role::Server => {
                    stream.headers_received = true;
                    H2Event::RequestReceived {
                        stream_id,
                        headers,
                        end_stream,
                    }
                }
                Role::Client if is_informational(&headers) => {
                    if end_stream {
                        self.write_reset(stream_id, ErrorCode::ProtocolError);
                        return Ok(());
                    }
                    stream.informational_pending = true;
                    H2Event::InformationalResponseReceived { stream_id, headers }
                }
                Role::Client => {
                    stream.headers_received = true;
                    stream.informational_pending = false;
                    H2Event::ResponseReceived {
                        stream_id,
                        headers,
                        end_stream,
                    }
                }
            }
        } else {
            if !end_stream {
                // Trailers must close the stream (RFC 9113 Section 8.1).
                self.write_reset(stream_id, ErrorCode::ProtocolError);
                events.push(H2Event::StreamReset {
                    stream_id,
                    error_code: ErrorCode::ProtocolError,
                    remote_reset: false,
                });
                return Ok(());
            }
            H2Event::TrailersReceived { stream_id, headers }
        };
        events.push(event);

        if end_stream {
            self.end_remote(stream_id, events)?;
        }
        Ok(())
    }

    fn handle_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        flow_controlled_length: u32,
        events: &mut Vec<H2Event>,
    ) -> Result<(), H2Error> {
        self.conn_recv_window.window_consumed(flow_controlled_length)?;

        let state = self.stream_state(stream_id);
        match self.resolve(state, StreamInput::RecvData) {
            Transition::To(next) => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return Ok(());
                };
                if stream.recv_window.window_consumed(flow_controlled_length).is_err() {
                    self.credit_connection(flow_controlled_length);
                    self.write_reset(stream_id, ErrorCode::FlowControlError);
                    events.push(H2Event::StreamReset {
                        stream_id,
                        error_code: ErrorCode::FlowControlError,
                        remote_reset: false,
                    });
                    return Ok(());
                }
                stream.state = next;
            }
            Transition::Ignore => {
                self.credit_connection(flow_controlled_length);
                return Ok(());
            }
            Transition::Error(ErrorCode::ProtocolError) if state == StreamState::Idle => {
                return Err(H2Error::Protocol(format!("DATA on idle stream {stream_id}")));
            }
            Transition::Error(code) => {
                // Nobody will acknowledge these bytes; hand them back.
                self.credit_connection(flow_controlled_length);
                if !self.was_reset_locally(stream_id) {
                    self.write_reset(stream_id, code);
                }
                return Ok(());
            }
        }

        events.push(H2Event::DataReceived {
            stream_id,
            data,
            flow_controlled_length,
            end_stream,
        });
        if end_stream {
            self.end_remote(stream_id, events)?;
        }
        Ok(())
    }

    fn end_remote(&mut self, stream_id: u32, events: &mut Vec<H2Event>) -> Result<(), H2Error> {
        match self.resolve(self.stream_state(stream_id), StreamInput::RecvEndStream) {
            Transition::To(next) => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.state = next;
                }
                events.push(H2Event::StreamEnded { stream_id });
                self.forget_if_closed(stream_id);
            }
            Transition::Ignore => {}
            Transition::Error(code) => self.write_reset(stream_id, code),
        }
        Ok(())
    }

    fn handle_rst_stream(
        &mut self,
        stream_id: u32,
        error_code: ErrorCode,
        events: &mut Vec<H2Event>,
    ) -> Result<(), H2Error> {
        let state = self.stream_state(stream_id);
        match self.resolve(state, StreamInput::RecvRstStream) {
            Transition::To(_) => {
                self.streams.remove(&stream_id);
                events.push(H2Event::StreamReset {
                    stream_id,
                    error_code,
                    remote_reset: true,
                });
                Ok(())
            }
            Transition::Ignore => Ok(()),
            Transition::Error(_) if self.was_reset_locally(stream_id) => Ok(()),
            Transition::Error(_) if state == StreamState::Idle => Err(H2Error::Protocol(format!(
                "RST_STREAM on idle stream {stream_id}"
            ))),
            Transition::Error(_) => Err(H2Error::StreamClosed(stream_id)),
        }
    }

    fn handle_window_update(
        &mut self,
        stream_id: u32,
        increment: u32,
        events: &mut Vec<H2Event>,
    ) -> Result<(), H2Error> {
        if stream_id == 0 {
            self.conn_send_window.increase(increment)?;
            events.push(H2Event::WindowUpdated {
                stream_id,
                delta: increment,
            });
            return Ok(());
        }

        let state = self.stream_state(stream_id);
        match self.resolve(state, StreamInput::RecvWindowUpdate) {
            Transition::To(_) => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return Ok(());
                };
                if stream.send_window.increase(increment).is_err() {
                    self.write_reset(stream_id, ErrorCode::FlowControlError);
                    events.push(H2Event::StreamReset {
                        stream_id,
                        error_code: ErrorCode::FlowControlError,
                        remote_reset: false,
                    });
                    return Ok(());
                }
                events.push(H2Event::WindowUpdated {
                    stream_id,
                    delta: increment,
                });
                Ok(())
            }
            Transition::Ignore => Ok(()),
            Transition::Error(_) if self.was_reset_locally(stream_id) => Ok(()),
            Transition::Error(_) if state == StreamState::Idle => Err(H2Error::Protocol(format!(
                "WINDOW_UPDATE on idle stream {stream_id}"
            ))),
            Transition::Error(_) => Err(H2Error::StreamClosed(stream_id)),
        }
    }
}

fn is_informational(headers: &[HeaderField]) -> bool {
    headers
        .iter()
        .find(|h| h.name == b":status")
        .is_some_and(|h| h.value.first() == Some(&b'1'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> Vec<u8> {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        buf
    }

    fn settings_frame() -> Vec<u8> {
        encode(Frame::Settings {
            ack: false,
            settings: Vec::new(),
        })
    }

    fn headers_frame(
        encoder: &mut Encoder,
        stream_id: u32,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Vec<u8> {
        let mut block = Vec::new();
        encoder.encode(headers, &mut block);
        encode(Frame::Headers {
            stream_id,
            encoded: block.into(),
            end_stream,
            end_headers: true,
            priority: None,
        })
    }

    fn data_frame(stream_id: u32, payload: &'static [u8], end_stream: bool) -> Vec<u8> {
        encode(Frame::Data {
            stream_id,
            payload: Bytes::from_static(payload),
            end_stream,
            flow_controlled_length: payload.len() as u32,
        })
    }

    fn ready_client() -> H2Connection {
        let mut conn = H2Connection::client(Settings::client_default());
        conn.initiate_connection();
        conn.receive_data(&settings_frame()).unwrap();
        let _ = conn.data_to_send(None);
        conn
    }

    fn ready_server() -> H2Connection {
        let mut conn = H2Connection::server(Settings::server_default());
        conn.initiate_connection();
        let mut input = CLIENT_PREFACE.to_vec();
        input.extend(settings_frame());
        conn.receive_data(&input).unwrap();
        let _ = conn.data_to_send(None);
        conn
    }

    fn request_headers() -> Vec<HeaderField> {
        vec![
            HeaderField::new(":method", "POST"),
            HeaderField::new(":scheme", "http"),
            HeaderField::new(":path", "/svc/Method"),
        ]
    }

    #[test]
    fn client_preface_includes_magic_and_settings() {
        let mut conn = H2Connection::client(Settings::client_default());
        assert!(!conn.has_data_to_send());
        conn.initiate_connection();
        let send = conn.data_to_send(None);
        assert!(send.starts_with(CLIENT_PREFACE));
        let header = frame::decode_frame_header(&send[CLIENT_PREFACE.len()..]).unwrap();
        assert_eq!(header.frame_type, frame::FRAME_SETTINGS);
        assert_eq!(header.flags, 0);
    }

    #[test]
    fn data_to_send_respects_limit() {
        let mut conn = H2Connection::client(Settings::client_default());
        conn.initiate_connection();
        let first = conn.data_to_send(Some(10));
        assert_eq!(first.len(), 10);
        assert!(conn.has_data_to_send());
    }

    #[test]
    fn server_rejects_bad_preface() {
        let mut conn = H2Connection::server(Settings::server_default());
        conn.initiate_connection();
        assert!(conn.receive_data(b"GET / HTTP/1.1\r\n").is_err());
        assert!(conn.is_closed());
    }

    #[test]
    fn settings_exchange() {
        let mut conn = H2Connection::client(Settings::client_default());
        conn.initiate_connection();
        let _ = conn.data_to_send(None);

        let events = conn
            .receive_data(&encode(Frame::Settings {
                ack: false,
                settings: vec![Setting::MaxFrameSize(32768)],
            }))
            .unwrap();
        assert_eq!(
            events,
            vec![H2Event::RemoteSettingsChanged {
                changed: vec![Setting::MaxFrameSize(32768)]
            }]
        );
        assert_eq!(conn.max_outbound_frame_size(), 32768);

        let send = conn.data_to_send(None);
        let header = frame::decode_frame_header(&send).unwrap();
        assert_eq!(header.frame_type, frame::FRAME_SETTINGS);
        assert_eq!(header.flags, frame::FLAG_ACK);
    }

    #[test]
    fn server_request_with_end_stream() {
        let mut conn = ready_server();
        let mut enc = Encoder::new();
        let events = conn
            .receive_data(&headers_frame(&mut enc, 1, &request_headers(), true))
            .unwrap();
        assert!(matches!(
            events[0],
            H2Event::RequestReceived {
                stream_id: 1,
                end_stream: true,
                ..
            }
        ));
        assert_eq!(events[1], H2Event::StreamEnded { stream_id: 1 });
        assert_eq!(conn.stream_state(1), StreamState::HalfClosedRemote);
    }

    #[test]
    fn client_response_data_trailers() {
        let mut conn = ready_client();
        let stream_id = conn.get_next_available_stream_id();
        conn.send_headers(stream_id, &request_headers(), true).unwrap();
        let _ = conn.data_to_send(None);

        let mut enc = Encoder::new();
        let mut input = headers_frame(&mut enc, stream_id, &[HeaderField::new(":status", "200")], false);
        input.extend(data_frame(stream_id, b"abc", false));
        input.extend(headers_frame(
            &mut enc,
            stream_id,
            &[HeaderField::new("grpc-status", "0")],
            true,
        ));

        let events = conn.receive_data(&input).unwrap();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], H2Event::ResponseReceived { end_stream: false, .. }));
        assert!(matches!(
            events[1],
            H2Event::DataReceived {
                flow_controlled_length: 3,
                ..
            }
        ));
        assert!(matches!(events[2], H2Event::TrailersReceived { .. }));
        assert_eq!(events[3], H2Event::StreamEnded { stream_id });
        assert_eq!(conn.stream_state(stream_id), StreamState::Closed);
        assert_eq!(conn.open_streams(), 0);
    }

    #[test]
    fn informational_response_precedes_final() {
        let mut conn = ready_client();
        conn.send_headers(1, &request_headers(), true).unwrap();
        let mut enc = Encoder::new();
        let mut input = headers_frame(&mut enc, 1, &[HeaderField::new(":status", "100")], false);
        input.extend(headers_frame(&mut enc, 1, &[HeaderField::new(":status", "200")], false));
        let events = conn.receive_data(&input).unwrap();
        assert!(matches!(events[0], H2Event::InformationalResponseReceived { .. }));
        assert!(matches!(events[1], H2Event::ResponseReceived { .. }));
    }

    #[test]
    fn stream_ids_increment() {
        let mut conn = ready_client();
        let headers = request_headers();
        for expected in [1, 3, 5] {
            let id = conn.get_next_available_stream_id();
            assert_eq!(id, expected);
            conn.send_headers(id, &headers, true).unwrap();
        }
        assert_eq!(ready_server().get_next_available_stream_id(), 2);
    }

    #[test]
    fn large_header_block_uses_continuation() {
        let mut client = ready_client();
        let mut headers = request_headers();
        headers.push(HeaderField::new("x-big", vec![b'a'; 40000]));
        client.send_headers(1, &headers, true).unwrap();
        let wire = client.data_to_send(None);
        let (first, consumed) = frame::decode_frame(&wire, 16384).unwrap().unwrap();
        assert!(matches!(first, Frame::Headers { end_headers: false, .. }));
        let (second, _) = frame::decode_frame(&wire[consumed..], 16384).unwrap().unwrap();
        assert!(matches!(second, Frame::Continuation { .. }));

        let mut server = H2Connection::server(Settings::server_default());
        server.initiate_connection();
        let mut input = CLIENT_PREFACE.to_vec();
        input.extend(settings_frame());
        input.extend_from_slice(&wire);
        let events = server.receive_data(&input).unwrap();
        match &events[1] {
            H2Event::RequestReceived { headers: got, .. } => assert_eq!(got, &headers),
            other => panic!("expected RequestReceived, got {other:?}"),
        }
    }

    #[test]
    fn send_data_splits_and_respects_window() {
        let mut conn = ready_client();
        conn.send_headers(1, &request_headers(), false).unwrap();
        let _ = conn.data_to_send(None);

        assert_eq!(conn.local_flow_control_window(1).unwrap(), 65535);
        assert!(matches!(
            conn.send_data(1, &vec![0u8; 70000], false),
            Err(H2Error::FlowControl)
        ));
        assert!(!conn.has_data_to_send());

        conn.send_data(1, &vec![0u8; 20000], true).unwrap();
        let wire = conn.data_to_send(None);
        let (first, consumed) = frame::decode_frame(&wire, 16384).unwrap().unwrap();
        let (second, _) = frame::decode_frame(&wire[consumed..], 16384).unwrap().unwrap();
        assert!(matches!(first, Frame::Data { end_stream: false, ref payload, .. } if payload.len() == 16384));
        assert!(matches!(second, Frame::Data { end_stream: true, ref payload, .. } if payload.len() == 3616));
        assert_eq!(conn.stream_state(1), StreamState::HalfClosedLocal);
    }

    #[test]
    fn acknowledged_data_reopens_window() {
        let mut conn = ready_client();
        conn.send_headers(1, &request_headers(), true).unwrap();
        let mut enc = Encoder::new();
        let mut input = headers_frame(&mut enc, 1, &[HeaderField::new(":status", "200")], false);
        for _ in 0..4 {
            input.extend(encode(Frame::Data {
                stream_id: 1,
                payload: Bytes::from(vec![0u8; 10000]),
                end_stream: false,
                flow_controlled_length: 10000,
            }));
        }
        conn.receive_data(&input).unwrap();
        let _ = conn.data_to_send(None);

        // Nothing is re-opened until the application acknowledges.
        conn.acknowledge_received_data(1, 40000);
        let wire = conn.data_to_send(None);
        let (conn_update, consumed) = frame::decode_frame(&wire, 16384).unwrap().unwrap();
        let (stream_update, _) = frame::decode_frame(&wire[consumed..], 16384).unwrap().unwrap();
        assert_eq!(
            conn_update,
            Frame::WindowUpdate {
                stream_id: 0,
                increment: 40000
            }
        );
        assert_eq!(
            stream_update,
            Frame::WindowUpdate {
                stream_id: 1,
                increment: 40000
            }
        );
    }

    #[test]
    fn peer_window_update_is_reported() {
        let mut conn = ready_client();
        conn.send_headers(1, &request_headers(), false).unwrap();
        let events = conn
            .receive_data(&encode(Frame::WindowUpdate {
                stream_id: 1,
                increment: 100,
            }))
            .unwrap();
        assert_eq!(events, vec![H2Event::WindowUpdated { stream_id: 1, delta: 100 }]);
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 65535);
    }

    #[test]
    fn strict_table_rejects_rst_on_closed_stream() {
        let mut conn = ready_client();
        conn.send_headers(1, &request_headers(), true).unwrap();
        let mut enc = Encoder::new();
        conn.receive_data(&headers_frame(
            &mut enc,
            1,
            &[HeaderField::new(":status", "200"), HeaderField::new("grpc-status", "0")],
            true,
        ))
        .unwrap();
        assert_eq!(conn.stream_state(1), StreamState::Closed);

        let rst = encode(Frame::RstStream {
            stream_id: 1,
            error_code: ErrorCode::NoError,
        });
        assert!(matches!(conn.receive_data(&rst), Err(H2Error::StreamClosed(1))));
        assert!(conn.is_closed());
    }

    #[test]
    fn override_absorbs_rst_on_closed_stream() {
        struct AbsorbClosed;
        impl TransitionOverride for AbsorbClosed {
            fn intercept(&self, state: StreamState, input: StreamInput) -> Option<Transition> {
                (state == StreamState::Closed && input == StreamInput::RecvRstStream)
                    .then_some(Transition::Ignore)
            }
        }

        let mut conn = ready_client();
        conn.set_transition_override(Box::new(AbsorbClosed));
        conn.send_headers(1, &request_headers(), true).unwrap();
        let mut enc = Encoder::new();
        conn.receive_data(&headers_frame(&mut enc, 1, &[HeaderField::new(":status", "200")], true))
            .unwrap();
        let _ = conn.data_to_send(None);

        let rst = encode(Frame::RstStream {
            stream_id: 1,
            error_code: ErrorCode::NoError,
        });
        assert!(conn.receive_data(&rst).unwrap().is_empty());
        assert!(!conn.is_closed());
        assert!(!conn.has_data_to_send());
    }

    #[test]
    fn frames_after_local_reset_are_dropped() {
        let mut conn = ready_server();
        let mut enc = Encoder::new();
        conn.receive_data(&headers_frame(&mut enc, 1, &request_headers(), false))
            .unwrap();
        conn.reset_stream(1, ErrorCode::Cancel).unwrap();
        let _ = conn.data_to_send(None);

        let mut input = data_frame(1, b"late", false);
        input.extend(encode(Frame::RstStream {
            stream_id: 1,
            error_code: ErrorCode::Cancel,
        }));
        assert!(conn.receive_data(&input).unwrap().is_empty());
        assert!(!conn.is_closed());
        // Resetting again is a no-op.
        conn.reset_stream(1, ErrorCode::Cancel).unwrap();
        assert!(!conn.has_data_to_send());
    }

    #[test]
    fn data_on_idle_stream_is_connection_error() {
        let mut conn = ready_server();
        assert!(conn.receive_data(&data_frame(5, b"x", false)).is_err());
        let wire = conn.data_to_send(None);
        let (goaway, _) = frame::decode_frame(&wire, 16384).unwrap().unwrap();
        assert!(matches!(
            goaway,
            Frame::GoAway {
                error_code: ErrorCode::ProtocolError,
                ..
            }
        ));
    }

    #[test]
    fn ping_is_answered() {
        let mut conn = ready_client();
        let events = conn
            .receive_data(&encode(Frame::Ping {
                ack: false,
                opaque_data: [1, 2, 3, 4, 5, 6, 7, 8],
            }))
            .unwrap();
        assert_eq!(events, vec![H2Event::PingReceived { data: [1, 2, 3, 4, 5, 6, 7, 8] }]);
        let (pong, _) = frame::decode_frame(&conn.data_to_send(None), 16384)
            .unwrap()
            .unwrap();
        assert_eq!(
            pong,
            Frame::Ping {
                ack: true,
                opaque_data: [1, 2, 3, 4, 5, 6, 7, 8]
            }
        );
    }

    #[test]
    fn goaway_terminates() {
        let mut conn = ready_client();
        let events = conn
            .receive_data(&encode(Frame::GoAway {
                last_stream_id: 0,
                error_code: ErrorCode::NoError,
                debug_data: Bytes::new(),
            }))
            .unwrap();
        assert!(matches!(
            events[0],
            H2Event::ConnectionTerminated {
                error_code: ErrorCode::NoError,
                ..
            }
        ));
        assert!(!conn.is_closed());
        assert_eq!(conn.remote_goaway(), Some(0));
        assert!(matches!(
            conn.send_headers(1, &request_headers(), true),
            Err(H2Error::Closed)
        ));
    }

    #[test]
    fn graceful_goaway_lets_accepted_streams_finish() {
        let mut conn = ready_client();
        conn.send_headers(1, &request_headers(), false).unwrap();
        conn.send_headers(3, &request_headers(), false).unwrap();
        let _ = conn.data_to_send(None);
        conn.receive_data(&encode(Frame::GoAway {
            last_stream_id: 1,
            error_code: ErrorCode::NoError,
            debug_data: Bytes::new(),
        }))
        .unwrap();

        conn.send_data(1, b"tail", true).unwrap();
        assert!(conn.has_data_to_send());
        assert!(matches!(conn.send_data(3, b"tail", true), Err(H2Error::Closed)));
        assert!(matches!(
            conn.send_headers(5, &request_headers(), true),
            Err(H2Error::Closed)
        ));
    }

    #[test]
    fn error_goaway_closes_every_stream() {
        let mut conn = ready_client();
        conn.send_headers(1, &request_headers(), false).unwrap();
        conn.receive_data(&encode(Frame::GoAway {
            last_stream_id: 1,
            error_code: ErrorCode::InternalError,
            debug_data: Bytes::new(),
        }))
        .unwrap();
        assert!(conn.is_closed());
        assert!(matches!(conn.send_data(1, b"tail", true), Err(H2Error::Closed)));
    }

    #[test]
    fn push_promise_rejected_when_disabled() {
        let mut conn = ready_client();
        conn.send_headers(1, &request_headers(), true).unwrap();
        let promise = encode(Frame::PushPromise {
            stream_id: 1,
            promised_stream_id: 2,
            encoded: Bytes::new(),
            end_headers: true,
        });
        assert!(matches!(conn.receive_data(&promise), Err(H2Error::Protocol(_))));
    }
}
