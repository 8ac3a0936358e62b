//! Custom metadata and the wire formats of gRPC's reserved header values.

use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use grpcwire_h2::HeaderField;

use crate::error::GrpcError;

/// Binary metadata is sent unpadded and accepted either way.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Header names owned by the protocol. Never custom metadata.
const RESERVED: &[&str] = &[
    "content-type",
    "te",
    "user-agent",
    "grpc-status",
    "grpc-message",
    "grpc-status-details-bin",
    "grpc-timeout",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-message-type",
];

pub(crate) fn is_reserved(name: &[u8]) -> bool {
    name.first() == Some(&b':') || RESERVED.iter().any(|r| r.as_bytes() == name)
}

/// A metadata value. Keys ending in `-bin` carry binary values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Vec<u8>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Ascii(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Ascii(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }
}

/// Ordered custom metadata. A key may appear more than once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an ASCII entry.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), GrpcError> {
        self.append(key, MetadataValue::Ascii(value.to_string()))
    }

    /// Append a binary entry; `key` must end in `-bin`.
    pub fn insert_bin(&mut self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), GrpcError> {
        self.append(key, MetadataValue::Binary(value.into()))
    }

    fn append(&mut self, key: &str, value: MetadataValue) -> Result<(), GrpcError> {
        validate_key(key)?;
        match &value {
            MetadataValue::Binary(_) if !key.ends_with("-bin") => {
                return Err(GrpcError::InvalidMetadata(format!(
                    "binary value for non -bin key {key:?}"
                )));
            }
            MetadataValue::Ascii(_) if key.ends_with("-bin") => {
                return Err(GrpcError::InvalidMetadata(format!(
                    "ascii value for -bin key {key:?}"
                )));
            }
            MetadataValue::Ascii(v) if !v.bytes().all(|b| (0x20..=0x7e).contains(&b)) => {
                return Err(GrpcError::InvalidMetadata(format!(
                    "non-printable value for {key:?}"
                )));
            }
            _ => {}
        }
        self.entries.push((key.to_string(), value));
        Ok(())
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire representation, binary values base64 encoded.
    pub fn to_headers(&self) -> Vec<HeaderField> {
        self.entries
            .iter()
            .map(|(k, v)| match v {
                MetadataValue::Ascii(s) => HeaderField::new(k.as_str(), s.as_str()),
                MetadataValue::Binary(b) => HeaderField::new(k.as_str(), BASE64.encode(b)),
            })
            .collect()
    }

    /// Collect the non-reserved headers of a received block.
    ///
    /// Pseudo-headers other than `known_pseudo` are a protocol error:
    /// nothing may be left over once the known ones have been taken.
    pub(crate) fn from_headers(
        headers: &[HeaderField],
        known_pseudo: &[&str],
    ) -> Result<Self, GrpcError> {
        let mut metadata = Self::new();
        for field in headers {
            if field.is_pseudo() && !known_pseudo.iter().any(|p| p.as_bytes() == field.name) {
                return Err(GrpcError::Protocol(format!(
                    "unexpected pseudo-header {:?}",
                    String::from_utf8_lossy(&field.name)
                )));
            }
            if is_reserved(&field.name) {
                continue;
            }
            let key = std::str::from_utf8(&field.name)
                .map_err(|_| GrpcError::Protocol("non-ASCII header name".into()))?;
            let value = if key.ends_with("-bin") {
                MetadataValue::Binary(BASE64.decode(&field.value).map_err(|e| {
                    GrpcError::Protocol(format!("bad base64 in {key:?}: {e}"))
                })?)
            } else {
                MetadataValue::Ascii(String::from_utf8_lossy(&field.value).into_owned())
            };
            metadata.entries.push((key.to_string(), value));
        }
        Ok(metadata)
    }
}

fn validate_key(key: &str) -> Result<(), GrpcError> {
    if key.is_empty()
        || !key
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase() || b"-_.".contains(&b))
    {
        return Err(GrpcError::InvalidMetadata(format!("bad key {key:?}")));
    }
    if key.starts_with("grpc-") || is_reserved(key.as_bytes()) {
        return Err(GrpcError::InvalidMetadata(format!("reserved key {key:?}")));
    }
    Ok(())
}

// -- grpc-timeout --

/// Largest value a `grpc-timeout` may carry (8 digits).
const TIMEOUT_MAX_VALUE: u128 = 99_999_999;

const NANOS_PER: [(char, u128); 6] = [
    ('n', 1),
    ('u', 1_000),
    ('m', 1_000_000),
    ('S', 1_000_000_000),
    ('M', 60_000_000_000),
    ('H', 3_600_000_000_000),
];

/// Encode a `grpc-timeout` value.
///
/// Whole seconds use `S`; other values use `u`, or `n` when they carry
/// sub-microsecond precision. Values that do not fit in 8 digits move to
/// a coarser unit, rounded up.
pub fn encode_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    let start = if timeout.subsec_nanos() == 0 {
        3
    } else if nanos % 1_000 == 0 {
        1
    } else {
        0
    };
    for &(unit, per) in &NANOS_PER[start..] {
        let value = nanos.div_ceil(per);
        if value <= TIMEOUT_MAX_VALUE {
            return format!("{value}{unit}");
        }
    }
    format!("{TIMEOUT_MAX_VALUE}H")
}

/// Decode a `grpc-timeout` value.
pub fn decode_timeout(value: &str) -> Result<Duration, GrpcError> {
    let invalid = || GrpcError::InvalidTimeout(value.to_string());
    let mut chars = value.chars();
    let unit = chars.next_back().ok_or_else(invalid)?;
    let digits = chars.as_str();
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    Ok(match unit {
        'H' => Duration::from_secs(amount * 3600),
        'M' => Duration::from_secs(amount * 60),
        'S' => Duration::from_secs(amount),
        'm' => Duration::from_millis(amount),
        'u' => Duration::from_micros(amount),
        'n' => Duration::from_nanos(amount),
        _ => return Err(invalid()),
    })
}

// -- grpc-message --

/// Percent-encode a `grpc-message` value. Bytes outside printable ASCII,
/// and `%` itself, become `%XX`.
pub fn encode_grpc_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for b in message.bytes() {
        if (0x20..=0x7e).contains(&b) && b != b'%' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Decode a `grpc-message` value. Malformed escapes are kept as-is.
pub fn decode_grpc_message(value: &[u8]) -> String {
    let mut out = Vec::with_capacity(value.len());
    let mut i = 0;
    while i < value.len() {
        if value[i] == b'%'
            && let Some(byte) = value
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(value[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// -- content-type --

const CONTENT_TYPE_BASE: &str = "application/grpc";

/// `application/grpc` with an optional `+suffix` (e.g. `+proto`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentType {
    pub suffix: Option<String>,
}

impl ContentType {
    pub fn with_suffix(suffix: impl Into<String>) -> Self {
        Self {
            suffix: Some(suffix.into()),
        }
    }

    /// Parse a `content-type` value; `None` if it is not a gRPC type.
    pub fn parse(value: &[u8]) -> Option<Self> {
        let value = std::str::from_utf8(value).ok()?;
        let media = value.split(';').next()?.trim();
        let rest = media.strip_prefix(CONTENT_TYPE_BASE)?;
        if rest.is_empty() {
            return Some(Self::default());
        }
        let suffix = rest.strip_prefix('+')?;
        (!suffix.is_empty()).then(|| Self::with_suffix(suffix))
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.suffix {
            Some(suffix) => write!(f, "{CONTENT_TYPE_BASE}+{suffix}"),
            None => f.write_str(CONTENT_TYPE_BASE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::whole_seconds(Duration::from_secs(5), "5S")]
    #[case::sub_second(Duration::from_millis(1500), "1500000u")]
    #[case::nanos(Duration::from_nanos(1_500), "1500n")]
    #[case::zero(Duration::ZERO, "0S")]
    #[case::minutes(Duration::from_secs(100_000_000), "1666667M")]
    #[case::micros_overflow(Duration::from_micros(123_456_789), "123457m")]
    #[case::huge(Duration::from_secs(u64::MAX), "99999999H")]
    fn timeout_encoding(#[case] timeout: Duration, #[case] expected: &str) {
        assert_eq!(encode_timeout(timeout), expected);
    }

    #[rstest]
    #[case("5S", Duration::from_secs(5))]
    #[case("1500000u", Duration::from_millis(1500))]
    #[case("2H", Duration::from_secs(7200))]
    #[case("3M", Duration::from_secs(180))]
    #[case("250m", Duration::from_millis(250))]
    #[case("7n", Duration::from_nanos(7))]
    fn timeout_decoding(#[case] value: &str, #[case] expected: Duration) {
        assert_eq!(decode_timeout(value).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("S")]
    #[case("5")]
    #[case("5s")]
    #[case("123456789S")]
    #[case("-1S")]
    fn timeout_rejects(#[case] value: &str) {
        assert!(matches!(
            decode_timeout(value),
            Err(GrpcError::InvalidTimeout(_))
        ));
    }

    #[test]
    fn grpc_message_percent_encoding() {
        assert_eq!(encode_grpc_message("not found"), "not found");
        assert_eq!(encode_grpc_message("100%"), "100%25");
        assert_eq!(encode_grpc_message("a\nb"), "a%0Ab");
        assert_eq!(encode_grpc_message("é"), "%C3%A9");
        assert_eq!(decode_grpc_message(b"not%20found"), "not found");
        assert_eq!(decode_grpc_message(b"%C3%A9"), "é");
        // Malformed escapes pass through.
        assert_eq!(decode_grpc_message(b"50%"), "50%");
        assert_eq!(decode_grpc_message(b"%zz"), "%zz");
    }

    #[test]
    fn content_type_parsing() {
        assert_eq!(
            ContentType::parse(b"application/grpc"),
            Some(ContentType::default())
        );
        assert_eq!(
            ContentType::parse(b"application/grpc+proto"),
            Some(ContentType::with_suffix("proto"))
        );
        assert_eq!(
            ContentType::parse(b"application/grpc+json; charset=utf-8"),
            Some(ContentType::with_suffix("json"))
        );
        assert_eq!(ContentType::parse(b"application/grpc+"), None);
        assert_eq!(ContentType::parse(b"application/json"), None);
        assert_eq!(
            ContentType::with_suffix("proto").to_string(),
            "application/grpc+proto"
        );
    }

    #[test]
    fn metadata_wire_form() {
        let mut md = Metadata::new();
        md.insert("x-request-id", "abc").unwrap();
        md.insert_bin("trace-bin", vec![0xde, 0xad, 0xbe, 0xef]).unwrap();
        md.insert("x-request-id", "def").unwrap();

        let headers = md.to_headers();
        assert_eq!(headers[1], HeaderField::new("trace-bin", "3q2+7w"));

        let parsed = Metadata::from_headers(&headers, &[]).unwrap();
        assert_eq!(parsed, md);
        assert_eq!(parsed.get_all("x-request-id").count(), 2);
        assert_eq!(
            parsed.get("trace-bin").unwrap().as_bytes(),
            &[0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn padded_binary_metadata_accepted() {
        let headers = [HeaderField::new("trace-bin", "3q2+7w==")];
        let parsed = Metadata::from_headers(&headers, &[]).unwrap();
        assert_eq!(
            parsed.get("trace-bin"),
            Some(&MetadataValue::Binary(vec![0xde, 0xad, 0xbe, 0xef]))
        );
    }

    #[test]
    fn received_reserved_headers_skipped() {
        let headers = [
            HeaderField::new("content-type", "application/grpc"),
            HeaderField::new("grpc-encoding", "gzip"),
            HeaderField::new("x-custom", "1"),
        ];
        let parsed = Metadata::from_headers(&headers, &[]).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("x-custom").and_then(|v| v.as_str()), Some("1"));

        let headers = [HeaderField::new(":weird", "1")];
        assert!(matches!(
            Metadata::from_headers(&headers, &[]),
            Err(GrpcError::Protocol(_))
        ));
    }

    #[rstest]
    #[case("grpc-status")]
    #[case("grpc-custom")]
    #[case(":path")]
    #[case("content-type")]
    #[case("Upper")]
    #[case("")]
    fn reserved_or_bad_keys_rejected(#[case] key: &str) {
        assert!(matches!(
            Metadata::new().insert(key, "v"),
            Err(GrpcError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn value_kind_must_match_key() {
        let mut md = Metadata::new();
        assert!(md.insert("x-bin", "text").is_err());
        assert!(md.insert_bin("x-data", vec![1]).is_err());
        assert!(md.insert("x-data", "line\nbreak").is_err());
        assert!(md.is_empty());
    }
}
