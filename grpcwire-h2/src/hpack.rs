//! Header fields and HPACK (RFC 7541) via `loona-hpack`.

use std::fmt;

use crate::error::H2Error;

/// A single header field (name-value pair).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Pseudo-header fields start with `:`.
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }

    /// Header value as UTF-8, if it is valid.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

impl fmt::Debug for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// HPACK encoder for one direction of a connection.
pub struct Encoder {
    inner: loona_hpack::Encoder<'static>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            inner: loona_hpack::Encoder::new(),
        }
    }

    /// Encode `headers` as one header block, appended to `buf`.
    pub fn encode(&mut self, headers: &[HeaderField], buf: &mut Vec<u8>) {
        let pairs = headers
            .iter()
            .map(|h| (h.name.as_slice(), h.value.as_slice()));
        // Writing into a Vec cannot fail.
        let _ = self.inner.encode_into(pairs, buf);
    }

    /// Peer changed SETTINGS_HEADER_TABLE_SIZE.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.inner.set_max_table_size(size);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// HPACK decoder for one direction of a connection.
pub struct Decoder {
    inner: loona_hpack::Decoder<'static>,
}

impl Decoder {
    /// `max_table_size` is our advertised SETTINGS_HEADER_TABLE_SIZE.
    pub fn new(max_table_size: usize) -> Self {
        let mut inner = loona_hpack::Decoder::new();
        inner.set_max_allowed_table_size(max_table_size);
        Self { inner }
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, H2Error> {
        let pairs = self
            .inner
            .decode(block)
            .map_err(|e| H2Error::Compression(format!("{e:?}")))?;
        Ok(pairs
            .into_iter()
            .map(|(name, value)| HeaderField { name, value })
            .collect())
    }
}
