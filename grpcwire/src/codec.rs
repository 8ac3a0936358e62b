//! Per-message compression, keyed by the `grpc-encoding` header value.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};

use crate::error::GrpcError;

/// A message compression algorithm.
pub trait Codec: Send + Sync {
    /// Name used in `grpc-encoding` / `grpc-accept-encoding`.
    fn name(&self) -> &str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, GrpcError>;

    /// Decompress `data`, failing once the output would exceed `limit`.
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, GrpcError>;
}

/// Pass-through codec for `grpc-encoding: identity`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Codec for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, GrpcError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, GrpcError> {
        if data.len() > limit {
            return Err(GrpcError::MessageTooLarge {
                length: data.len(),
                limit,
            });
        }
        Ok(data.to_vec())
    }
}

/// gzip (RFC 1952).
#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    level: Compression,
}

impl Gzip {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Codec for Gzip {
    fn name(&self) -> &str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, GrpcError> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(data)
            .map_err(|e| GrpcError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| GrpcError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, GrpcError> {
        read_bounded(GzDecoder::new(data), limit)
    }
}

/// gRPC "deflate": the zlib format (RFC 1950).
#[derive(Debug, Clone, Copy)]
pub struct Deflate {
    level: Compression,
}

impl Deflate {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for Deflate {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Codec for Deflate {
    fn name(&self) -> &str {
        "deflate"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, GrpcError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(data)
            .map_err(|e| GrpcError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| GrpcError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, GrpcError> {
        read_bounded(ZlibDecoder::new(data), limit)
    }
}

fn read_bounded<R: Read>(reader: R, limit: usize) -> Result<Vec<u8>, GrpcError> {
    let mut out = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| GrpcError::Decompression(e.to_string()))?;
    if out.len() > limit {
        return Err(GrpcError::MessageTooLarge {
            length: out.len(),
            limit,
        });
    }
    Ok(out)
}

/// The codecs a connection can apply, in preference order.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// A registry with only `identity`.
    pub fn empty() -> Self {
        Self {
            codecs: vec![Arc::new(Identity)],
        }
    }

    /// Add a codec, replacing any existing one with the same name.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.retain(|c| c.name() != codec.name());
        self.codecs.push(codec);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Codec>> {
        self.codecs.iter().find(|c| c.name() == name)
    }

    /// Value for `grpc-accept-encoding`.
    pub fn accept_encoding(&self) -> String {
        self.names().collect::<Vec<_>>().join(",")
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.codecs.iter().map(|c| c.name())
    }
}

impl Default for CodecRegistry {
    /// `identity`, `gzip` and `deflate`.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Gzip::default()));
        registry.register(Arc::new(Deflate::default()));
        registry
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
