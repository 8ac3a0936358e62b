//! Per-connection gRPC settings.

use grpcwire_h2::settings::MAX_WINDOW_SIZE;

use crate::codec::CodecRegistry;
use crate::error::GrpcError;

/// Default cap on one decoded message: 4 MiB.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;

/// Settings fixed for the lifetime of one connection.
#[derive(Debug, Clone)]
pub struct GrpcConfiguration {
    /// Client or server role; decides which headers are sent and expected.
    pub client_side: bool,
    /// Largest decoded message accepted from the peer.
    pub max_message_length: usize,
    /// Encoding applied to outgoing messages sent with `compress = true`.
    pub message_encoding: Option<String>,
    /// Value advertised in `grpc-accept-encoding`.
    pub message_accept_encoding: Option<String>,
    /// Client only: value of the `user-agent` header.
    pub user_agent: Option<String>,
    /// SETTINGS_INITIAL_WINDOW_SIZE advertised for our streams.
    pub initial_window_size: u32,
    /// Codecs available for `grpc-encoding`.
    pub codecs: CodecRegistry,
}

impl GrpcConfiguration {
    fn defaults(client_side: bool) -> Self {
        let codecs = CodecRegistry::default();
        Self {
            client_side,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            message_encoding: None,
            message_accept_encoding: Some(codecs.accept_encoding()),
            user_agent: client_side
                .then(|| concat!("grpcwire/", env!("CARGO_PKG_VERSION")).to_string()),
            initial_window_size: 65535,
            codecs,
        }
    }

    /// Client defaults.
    pub fn client() -> Self {
        Self::defaults(true)
    }

    /// Server defaults.
    pub fn server() -> Self {
        Self::defaults(false)
    }

    pub fn validate(&self) -> Result<(), GrpcError> {
        if self.max_message_length == 0 {
            return Err(GrpcError::InvalidConfig(
                "max_message_length must be > 0".into(),
            ));
        }
        if self.initial_window_size > MAX_WINDOW_SIZE {
            return Err(GrpcError::InvalidConfig(
                "initial_window_size must be <= 2^31-1".into(),
            ));
        }
        if let Some(name) = &self.message_encoding
            && self.codecs.get(name).is_none()
        {
            return Err(GrpcError::InvalidConfig(format!(
                "message_encoding {name:?} has no registered codec"
            )));
        }
        Ok(())
    }
}

/// Builder for [`GrpcConfiguration`].
///
/// ```rust,ignore
/// let config = GrpcConfigBuilder::client()
///     .message_encoding("gzip")
///     .max_message_length(1 << 20)
///     .build()?;
/// ```
pub struct GrpcConfigBuilder {
    config: GrpcConfiguration,
}

impl GrpcConfigBuilder {
    pub fn client() -> Self {
        Self {
            config: GrpcConfiguration::client(),
        }
    }

    pub fn server() -> Self {
        Self {
            config: GrpcConfiguration::server(),
        }
    }

    pub fn max_message_length(mut self, max: usize) -> Self {
        self.config.max_message_length = max;
        self
    }

    pub fn message_encoding(mut self, name: impl Into<String>) -> Self {
        self.config.message_encoding = Some(name.into());
        self
    }

    pub fn message_accept_encoding(mut self, value: Option<String>) -> Self {
        self.config.message_accept_encoding = value;
        self
    }

    pub fn user_agent(mut self, value: Option<String>) -> Self {
        self.config.user_agent = value;
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config.initial_window_size = size;
        self
    }

    /// Replace the codec registry. `grpc-accept-encoding` follows it.
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.config.message_accept_encoding = Some(codecs.accept_encoding());
        self.config.codecs = codecs;
        self
    }

    /// Validate and build the final [`GrpcConfiguration`].
    pub fn build(self) -> Result<GrpcConfiguration, GrpcError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::codec::Gzip;

    #[test]
    fn role_defaults() {
        let client = GrpcConfiguration::client();
        assert!(client.client_side);
        assert_eq!(client.max_message_length, DEFAULT_MAX_MESSAGE_LENGTH);
        assert!(client.user_agent.unwrap().starts_with("grpcwire/"));
        assert_eq!(
            client.message_accept_encoding.as_deref(),
            Some("identity,gzip,deflate")
        );
        assert_eq!(client.message_encoding, None);

        let server = GrpcConfiguration::server();
        assert!(!server.client_side);
        assert_eq!(server.user_agent, None);
        assert_eq!(server.initial_window_size, 65535);
    }

    #[test]
    fn builder_overrides() {
        let mut codecs = CodecRegistry::empty();
        codecs.register(Arc::new(Gzip::default()));
        let config = GrpcConfigBuilder::client()
            .max_message_length(1024)
            .message_encoding("gzip")
            .user_agent(None)
            .codecs(codecs)
            .build()
            .unwrap();
        assert_eq!(config.max_message_length, 1024);
        assert_eq!(config.message_encoding.as_deref(), Some("gzip"));
        assert_eq!(config.user_agent, None);
        assert_eq!(
            config.message_accept_encoding.as_deref(),
            Some("identity,gzip")
        );
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(GrpcConfigBuilder::server()
            .max_message_length(0)
            .build()
            .is_err());
        assert!(GrpcConfigBuilder::client()
            .message_encoding("snappy")
            .build()
            .is_err());
        assert!(GrpcConfigBuilder::client()
            .initial_window_size(1 << 31)
            .build()
            .is_err());
    }
}
