//! gRPC length-prefixed message framing.
//!
//! Format: 1 byte compressed flag + 4 byte big-endian length + payload.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::codec::Codec;
use crate::error::GrpcError;

/// Length of the message prefix.
pub const PREFIX_LEN: usize = 5;

/// Encode one length-prefixed message. Nothing is written when the
/// payload does not fit the 32-bit length prefix.
pub fn encode<B: BufMut>(payload: &[u8], compressed: bool, out: &mut B) -> Result<(), GrpcError> {
    let length = prefix_length(payload.len())?;
    out.put_u8(u8::from(compressed));
    out.put_u32(length);
    out.put_slice(payload);
    Ok(())
}

fn prefix_length(length: usize) -> Result<u32, GrpcError> {
    u32::try_from(length).map_err(|_| GrpcError::MessageTooLarge {
        length,
        limit: u32::MAX as usize,
    })
}

/// Bytes contributed by one DATA frame, and what they cost in flow control.
#[derive(Debug)]
struct Chunk {
    payload: usize,
    flow_controlled: usize,
}

/// Per-stream reassembly of messages from DATA frame payloads.
///
/// Tracks, for every buffered byte, the DATA frame it came from, so each
/// decoded message reports exactly the flow-controlled bytes it consumed.
pub struct MessageReadBuffer {
    buf: BytesMut,
    chunks: VecDeque<Chunk>,
    max_message_length: usize,
    codec: Option<Arc<dyn Codec>>,
    /// Set on the first framing error. Nothing is decoded afterwards.
    poisoned: bool,
    /// Credit for consumed bytes that never produced a message.
    unreported: usize,
}

impl MessageReadBuffer {
    /// `codec` decodes messages with the compressed flag set; `None`
    /// means the peer declared no (or an unsupported) encoding.
    pub fn new(max_message_length: usize, codec: Option<Arc<dyn Codec>>) -> Self {
        Self {
            buf: BytesMut::new(),
            chunks: VecDeque::new(),
            max_message_length,
            codec,
            poisoned: false,
            unreported: 0,
        }
    }

    /// Append the payload of a DATA frame that cost `flow_controlled_length`.
    pub fn data_received(&mut self, data: &[u8], flow_controlled_length: usize) {
        if self.poisoned {
            self.unreported += flow_controlled_length;
            return;
        }
        self.buf.extend_from_slice(data);
        self.chunks.push_back(Chunk {
            payload: data.len(),
            flow_controlled: flow_controlled_length,
        });
    }

    /// Decode every complete message buffered so far, in order, each with
    /// the flow-controlled bytes it consumed.
    ///
    /// Stops at the first incomplete message. After an error the buffer
    /// yields nothing more.
    pub fn read_all_complete_messages_flowcontrol(&mut self) -> CompleteMessages<'_> {
        CompleteMessages { buffer: self }
    }

    /// Whether a partial message is buffered.
    pub fn has_partial_message(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop everything still buffered and return the flow-controlled bytes
    /// that were never reported with a message.
    pub fn release_remaining(&mut self) -> usize {
        let credit = self.unreported + self.chunks.iter().map(|c| c.flow_controlled).sum::<usize>();
        self.buf.clear();
        self.chunks.clear();
        self.unreported = 0;
        credit
    }

    fn next_message(&mut self) -> Result<Option<(Bytes, usize)>, GrpcError> {
        if self.poisoned || self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }

        let flag = self.buf[0];
        let length = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if flag > 1 {
            self.poisoned = true;
            return Err(GrpcError::Protocol(format!("invalid compressed flag {flag}")));
        }
        if length > self.max_message_length {
            self.poisoned = true;
            return Err(GrpcError::MessageTooLarge {
                length,
                limit: self.max_message_length,
            });
        }
        let total = PREFIX_LEN + length;
        if self.buf.len() < total {
            return Ok(None);
        }

        let body = self.buf.split_to(total).freeze().slice(PREFIX_LEN..);
        let credit = self.consume(total);
        trace!(length, compressed = flag == 1, credit, "decoded message");

        if flag == 0 {
            return Ok(Some((body, credit)));
        }
        let decoded = match &self.codec {
            Some(codec) => codec.decompress(&body, self.max_message_length),
            None => Err(GrpcError::Decompression(
                "compressed message without a negotiated encoding".into(),
            )),
        };
        match decoded {
            Ok(message) => Ok(Some((Bytes::from(message), credit))),
            Err(e) => {
                self.poisoned = true;
                self.unreported += credit;
                Err(e)
            }
        }
    }

    /// Remove `n` payload bytes from the chunk ledger and return their
    /// flow-control cost. A fully drained chunk also yields its padding.
    fn consume(&mut self, mut n: usize) -> usize {
        let mut credit = 0;
        while let Some(chunk) = self.chunks.front_mut() {
            if n >= chunk.payload {
                n -= chunk.payload;
                credit += chunk.flow_controlled;
                self.chunks.pop_front();
            } else {
                let take = n.min(chunk.flow_controlled);
                chunk.payload -= n;
                chunk.flow_controlled -= take;
                credit += take;
                break;
            }
        }
        credit
    }
}

/// Iterator returned by
/// [`MessageReadBuffer::read_all_complete_messages_flowcontrol`].
pub struct CompleteMessages<'a> {
    buffer: &'a mut MessageReadBuffer,
}

impl Iterator for CompleteMessages<'_> {
    type Item = Result<(Bytes, usize), GrpcError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.next_message().transpose()
    }
}

/// Per-stream queue of framed outbound messages awaiting flow control.
#[derive(Default)]
pub struct MessageWriteBuffer {
    pending: BytesMut,
    codec: Option<Arc<dyn Codec>>,
}

impl MessageWriteBuffer {
    /// `codec` compresses messages written with `compress = true`.
    pub fn new(codec: Option<Arc<dyn Codec>>) -> Self {
        Self {
            pending: BytesMut::new(),
            codec,
        }
    }

    /// Frame `message` and queue it. Without a codec the message is sent
    /// uncompressed.
    pub fn write_message(&mut self, message: &[u8], compress: bool) -> Result<(), GrpcError> {
        match (&self.codec, compress) {
            (Some(codec), true) => {
                let packed = codec.compress(message)?;
                encode(&packed, true, &mut self.pending)
            }
            _ => encode(message, false, &mut self.pending),
        }
    }

    /// Take up to `max` queued bytes.
    pub fn take(&mut self, max: usize) -> Bytes {
        let n = max.min(self.pending.len());
        self.pending.split_to(n).freeze()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
