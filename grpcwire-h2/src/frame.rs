//! HTTP/2 frame encoding/decoding (RFC 9113 Section 4).
//!
//! HTTP/2 frames have a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes};

use crate::error::{ErrorCode, H2Error};
use crate::settings::{self, Setting};

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;
pub const FRAME_ALTSVC: u8 = 0xa;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// An HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// DATA (0x0). `flow_controlled_length` is the full payload length
    /// including any padding, which is what the frame costs against the
    /// receive window.
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        flow_controlled_length: u32,
    },
    /// HEADERS (0x1): HPACK-encoded header block fragment.
    Headers {
        stream_id: u32,
        encoded: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    /// PRIORITY (0x2). Deprecated by RFC 9113 but still parsed.
    Priority { stream_id: u32, priority: Priority },
    /// RST_STREAM (0x3).
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    /// SETTINGS (0x4). An ACK carries an empty list.
    Settings { ack: bool, settings: Vec<Setting> },
    /// PUSH_PROMISE (0x5).
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        encoded: Bytes,
        end_headers: bool,
    },
    /// PING (0x6).
    Ping { ack: bool, opaque_data: [u8; 8] },
    /// GOAWAY (0x7).
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    /// WINDOW_UPDATE (0x8).
    WindowUpdate { stream_id: u32, increment: u32 },
    /// CONTINUATION (0x9).
    Continuation {
        stream_id: u32,
        encoded: Bytes,
        end_headers: bool,
    },
    /// ALTSVC (0xa, RFC 7838).
    AltSvc {
        stream_id: u32,
        origin: Bytes,
        field_value: Bytes,
    },
    /// Any other frame type; ignored by the engine.
    Unknown {
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: Bytes,
    },
}

/// Stream priority information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

impl Priority {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        let dep = if self.exclusive {
            self.dependency | 0x8000_0000
        } else {
            self.dependency & STREAM_ID_MASK
        };
        buf.put_u32(dep);
        buf.put_u8(self.weight);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let raw = buf.get_u32();
        Self {
            exclusive: raw & 0x8000_0000 != 0,
            dependency: raw & STREAM_ID_MASK,
            weight: buf.get_u8(),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

/// Encode a 9-byte frame header.
pub fn encode_frame_header<B: BufMut>(
    buf: &mut B,
    payload_len: usize,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
) {
    let len = payload_len as u32;
    buf.put_u8((len >> 16) as u8);
    buf.put_u16(len as u16);
    buf.put_u8(frame_type);
    buf.put_u8(flags);
    buf.put_u32(stream_id & STREAM_ID_MASK);
}

/// Decode a 9-byte frame header from the start of `buf`.
/// Returns `None` if the buffer is too short.
pub fn decode_frame_header(mut buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let length = (u32::from(buf.get_u8()) << 16) | u32::from(buf.get_u16());
    let frame_type = buf.get_u8();
    let flags = buf.get_u8();
    let stream_id = buf.get_u32() & STREAM_ID_MASK;
    Some(FrameHeader {
        length,
        frame_type,
        flags,
        stream_id,
    })
}

impl Frame {
    /// Stream the frame belongs to (0 for connection-level frames).
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::AltSvc { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Encode this frame into `buf` (header + payload).
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                ..
            } => {
                let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
                encode_frame_header(buf, payload.len(), FRAME_DATA, flags, *stream_id);
                buf.put_slice(payload);
            }
            Frame::Headers {
                stream_id,
                encoded,
                end_stream,
                end_headers,
                priority,
            } => {
                let mut flags = 0u8;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                match priority {
                    Some(pri) => {
                        flags |= FLAG_PRIORITY;
                        encode_frame_header(
                            buf,
                            encoded.len() + 5,
                            FRAME_HEADERS,
                            flags,
                            *stream_id,
                        );
                        pri.encode(buf);
                    }
                    None => {
                        encode_frame_header(buf, encoded.len(), FRAME_HEADERS, flags, *stream_id);
                    }
                }
                buf.put_slice(encoded);
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                encode_frame_header(buf, 5, FRAME_PRIORITY, 0, *stream_id);
                priority.encode(buf);
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                encode_frame_header(buf, 4, FRAME_RST_STREAM, 0, *stream_id);
                buf.put_u32(*error_code as u32);
            }
            Frame::Settings { ack, settings } => {
                if *ack {
                    encode_frame_header(buf, 0, FRAME_SETTINGS, FLAG_ACK, 0);
                } else {
                    encode_frame_header(buf, settings.len() * 6, FRAME_SETTINGS, 0, 0);
                    settings::encode(settings, buf);
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                encoded,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                encode_frame_header(
                    buf,
                    4 + encoded.len(),
                    FRAME_PUSH_PROMISE,
                    flags,
                    *stream_id,
                );
                buf.put_u32(*promised_stream_id & STREAM_ID_MASK);
                buf.put_slice(encoded);
            }
            Frame::Ping { ack, opaque_data } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                encode_frame_header(buf, 8, FRAME_PING, flags, 0);
                buf.put_slice(opaque_data);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                encode_frame_header(buf, 8 + debug_data.len(), FRAME_GOAWAY, 0, 0);
                buf.put_u32(*last_stream_id & STREAM_ID_MASK);
                buf.put_u32(*error_code as u32);
                buf.put_slice(debug_data);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                encode_frame_header(buf, 4, FRAME_WINDOW_UPDATE, 0, *stream_id);
                buf.put_u32(*increment & STREAM_ID_MASK);
            }
            Frame::Continuation {
                stream_id,
                encoded,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                encode_frame_header(buf, encoded.len(), FRAME_CONTINUATION, flags, *stream_id);
                buf.put_slice(encoded);
            }
            Frame::AltSvc {
                stream_id,
                origin,
                field_value,
            } => {
                encode_frame_header(
                    buf,
                    2 + origin.len() + field_value.len(),
                    FRAME_ALTSVC,
                    0,
                    *stream_id,
                );
                buf.put_u16(origin.len() as u16);
                buf.put_slice(origin);
                buf.put_slice(field_value);
            }
            Frame::Unknown {
                frame_type,
                flags,
                stream_id,
                payload,
            } => {
                encode_frame_header(buf, payload.len(), *frame_type, *flags, *stream_id);
                buf.put_slice(payload);
            }
        }
    }
}

/// Decode one frame from the start of `buf`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` on success,
/// `Ok(None)` if the buffer is incomplete (need more data),
/// or `Err` on protocol error.
pub fn decode_frame(buf: &[u8], max_frame_size: u32) -> Result<Option<(Frame, usize)>, H2Error> {
    let Some(header) = decode_frame_header(buf) else {
        return Ok(None);
    };

    if header.length > max_frame_size {
        return Err(H2Error::FrameSize);
    }

    let total_len = FRAME_HEADER_LEN + header.length as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    let payload = &buf[FRAME_HEADER_LEN..total_len];
    let flags = header.flags;
    let stream_id = header.stream_id;
    let require_stream = |name: &str| {
        if stream_id == 0 {
            Err(H2Error::Protocol(format!("{name} on stream 0")))
        } else {
            Ok(())
        }
    };
    let require_connection = |name: &str| {
        if stream_id != 0 {
            Err(H2Error::Protocol(format!("{name} on non-zero stream")))
        } else {
            Ok(())
        }
    };

    let frame = match header.frame_type {
        FRAME_DATA => {
            require_stream("DATA")?;
            let data = strip_padding(payload, flags)?;
            Frame::Data {
                stream_id,
                payload: Bytes::copy_from_slice(data),
                end_stream: flags & FLAG_END_STREAM != 0,
                flow_controlled_length: header.length,
            }
        }
        FRAME_HEADERS => {
            require_stream("HEADERS")?;
            let data = strip_padding(payload, flags)?;
            let (priority, block) = if flags & FLAG_PRIORITY != 0 {
                if data.len() < 5 {
                    return Err(H2Error::FrameSize);
                }
                (Some(Priority::decode(&data[..5])), &data[5..])
            } else {
                (None, data)
            };
            Frame::Headers {
                stream_id,
                encoded: Bytes::copy_from_slice(block),
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
                priority,
            }
        }
        FRAME_PRIORITY => {
            require_stream("PRIORITY")?;
            if payload.len() != 5 {
                return Err(H2Error::FrameSize);
            }
            Frame::Priority {
                stream_id,
                priority: Priority::decode(payload),
            }
        }
        FRAME_RST_STREAM => {
            require_stream("RST_STREAM")?;
            if payload.len() != 4 {
                return Err(H2Error::FrameSize);
            }
            let mut data = payload;
            Frame::RstStream {
                stream_id,
                error_code: ErrorCode::from_u32(data.get_u32()),
            }
        }
        FRAME_SETTINGS => {
            require_connection("SETTINGS")?;
            let ack = flags & FLAG_ACK != 0;
            if ack && !payload.is_empty() {
                return Err(H2Error::FrameSize);
            }
            Frame::Settings {
                ack,
                settings: if ack { Vec::new() } else { settings::decode(payload)? },
            }
        }
        FRAME_PUSH_PROMISE => {
            require_stream("PUSH_PROMISE")?;
            let mut data = strip_padding(payload, flags)?;
            if data.len() < 4 {
                return Err(H2Error::FrameSize);
            }
            let promised_stream_id = data.get_u32() & STREAM_ID_MASK;
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                encoded: Bytes::copy_from_slice(data),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FRAME_PING => {
            require_connection("PING")?;
            let opaque_data: [u8; 8] = payload.try_into().map_err(|_| H2Error::FrameSize)?;
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                opaque_data,
            }
        }
        FRAME_GOAWAY => {
            require_connection("GOAWAY")?;
            if payload.len() < 8 {
                return Err(H2Error::FrameSize);
            }
            let mut data = payload;
            let last_stream_id = data.get_u32() & STREAM_ID_MASK;
            let error_code = ErrorCode::from_u32(data.get_u32());
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data: Bytes::copy_from_slice(data),
            }
        }
        FRAME_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(H2Error::FrameSize);
            }
            let mut data = payload;
            let increment = data.get_u32() & STREAM_ID_MASK;
            if increment == 0 {
                return Err(H2Error::Protocol("WINDOW_UPDATE with 0 increment".into()));
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        FRAME_CONTINUATION => {
            require_stream("CONTINUATION")?;
            Frame::Continuation {
                stream_id,
                encoded: Bytes::copy_from_slice(payload),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FRAME_ALTSVC => {
            if payload.len() < 2 {
                return Err(H2Error::FrameSize);
            }
            let mut data = payload;
            let origin_len = data.get_u16() as usize;
            if origin_len > data.len() {
                return Err(H2Error::Frame);
            }
            Frame::AltSvc {
                stream_id,
                origin: Bytes::copy_from_slice(&data[..origin_len]),
                field_value: Bytes::copy_from_slice(&data[origin_len..]),
            }
        }
        frame_type => Frame::Unknown {
            frame_type,
            flags,
            stream_id,
            payload: Bytes::copy_from_slice(payload),
        },
    };

    Ok(Some((frame, total_len)))
}

/// Strip padding from a frame payload if the PADDED flag is set.
fn strip_padding(payload: &[u8], flags: u8) -> Result<&[u8], H2Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    let Some((&pad_len, rest)) = payload.split_first() else {
        return Err(H2Error::FrameSize);
    };
    let pad_len = pad_len as usize;
    if pad_len > rest.len() {
        return Err(H2Error::Protocol("padding exceeds payload".into()));
    }
    Ok(&rest[..rest.len() - pad_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_decode(frame: &Frame) -> Frame {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let (decoded, consumed) = decode_frame(&buf, 16384).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        decoded
    }

    #[test]
    fn frame_header_round_trip() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 100, FRAME_DATA, FLAG_END_STREAM, 1);
        assert_eq!(buf.len(), 9);
        let header = decode_frame_header(&buf).unwrap();
        assert_eq!(header.length, 100);
        assert_eq!(header.frame_type, FRAME_DATA);
        assert_eq!(header.flags, FLAG_END_STREAM);
        assert_eq!(header.stream_id, 1);
    }

    #[test]
    fn reserved_bit_cleared() {
        let buf = [0, 0, 0, FRAME_DATA, 0, 0x80, 0, 0, 3];
        assert_eq!(decode_frame_header(&buf).unwrap().stream_id, 3);
    }

    #[test]
    fn headers_with_priority() {
        let frame = Frame::Headers {
            stream_id: 1,
            encoded: Bytes::from_static(&[0x82]),
            end_stream: true,
            end_headers: true,
            priority: Some(Priority {
                exclusive: true,
                dependency: 0,
                weight: 255,
            }),
        };
        assert_eq!(encode_decode(&frame), frame);
    }

    #[test]
    fn settings_carry_only_listed_parameters() {
        let frame = Frame::Settings {
            ack: false,
            settings: vec![Setting::InitialWindowSize(1 << 20)],
        };
        assert_eq!(encode_decode(&frame), frame);

        let ack = Frame::Settings {
            ack: true,
            settings: Vec::new(),
        };
        assert_eq!(encode_decode(&ack), ack);
    }

    #[test]
    fn goaway_and_ping() {
        let goaway = Frame::GoAway {
            last_stream_id: 5,
            error_code: ErrorCode::NoError,
            debug_data: Bytes::from_static(b"bye"),
        };
        assert_eq!(encode_decode(&goaway), goaway);

        let ping = Frame::Ping {
            ack: false,
            opaque_data: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        assert_eq!(encode_decode(&ping), ping);
    }

    #[test]
    fn padded_data_reports_flow_controlled_length() {
        // 5 payload bytes + 1 pad length byte + 4 padding bytes.
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 10, FRAME_DATA, FLAG_PADDED, 1);
        buf.put_u8(4);
        buf.put_slice(b"hello");
        buf.put_slice(&[0; 4]);
        let (frame, _) = decode_frame(&buf, 16384).unwrap().unwrap();
        match frame {
            Frame::Data {
                payload,
                flow_controlled_length,
                ..
            } => {
                assert_eq!(&payload[..], b"hello");
                assert_eq!(flow_controlled_length, 10);
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn altsvc_round_trip() {
        let frame = Frame::AltSvc {
            stream_id: 0,
            origin: Bytes::from_static(b"example.com"),
            field_value: Bytes::from_static(b"h2=\":443\""),
        };
        assert_eq!(encode_decode(&frame), frame);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 5, FRAME_DATA, 0, 1);
        buf.extend_from_slice(b"he");
        assert!(decode_frame(&buf, 16384).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected_before_payload_arrives() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 20000, FRAME_DATA, 0, 1);
        assert!(matches!(decode_frame(&buf, 16384), Err(H2Error::FrameSize)));
    }

    #[test]
    fn unknown_frame_type_accepted() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 3, 0xfe, 0x42, 7);
        buf.extend_from_slice(b"abc");
        let (frame, _) = decode_frame(&buf, 16384).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Unknown {
                frame_type: 0xfe,
                flags: 0x42,
                stream_id: 7,
                payload: Bytes::from_static(b"abc"),
            }
        );
    }

    #[test]
    fn stream_zero_rules() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 0, FRAME_DATA, 0, 0);
        assert!(matches!(
            decode_frame(&buf, 16384),
            Err(H2Error::Protocol(_))
        ));

        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 8, FRAME_PING, 0, 1);
        buf.extend_from_slice(&[0; 8]);
        assert!(matches!(
            decode_frame(&buf, 16384),
            Err(H2Error::Protocol(_))
        ));
    }

    #[test]
    fn window_update_zero_increment_rejected() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 4, FRAME_WINDOW_UPDATE, 0, 1);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            decode_frame(&buf, 16384),
            Err(H2Error::Protocol(_))
        ));
    }
}
