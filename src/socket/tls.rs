use crate::base::neterror::NetError;
use crate::future::{Context, Deferred};
use crate::socket::channel::TcpChannel;
use crate::socket::handshake::{HandshakeCompletion, HandshakeEvent, HandshakeHandler};
use crate::socket::transport::Address;
use boring::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode, SslVersion};
use std::time::Duration;

/// Name of the TLS stage in a channel's handler chain.
pub const TLS_HANDLER: &str = "ssl";

/// Client TLS parameters applied to every handshake.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub min_version: Option<SslVersion>,
    pub max_version: Option<SslVersion>,
    pub cipher_list: String,
    /// Offered when a connection asks for ALPN.
    pub alpn_protos: Vec<String>,
    pub curves: Vec<String>,
    pub sigalgs: String,
    /// Verify the peer certificate chain and hostname.
    pub verify_peer: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_version: Some(SslVersion::TLS1_2),
            max_version: Some(SslVersion::TLS1_3),
            cipher_list: "TLS_AES_128_GCM_SHA256:TLS_AES_256_GCM_SHA384:TLS_CHACHA20_POLY1305_SHA256:\
                ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
                ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
                ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305"
                .to_string(),
            alpn_protos: vec!["h2".to_string(), "http/1.1".to_string()],
            curves: vec!["X25519".to_string(), "P-256".to_string(), "P-384".to_string()],
            sigalgs: "ECDSA+SHA256:RSA-PSS+SHA256:RSA+SHA256:\
                ECDSA+SHA384:RSA-PSS+SHA384:RSA+SHA384:\
                RSA-PSS+SHA512:RSA+SHA512"
                .to_string(),
            verify_peer: true,
        }
    }
}

impl TlsConfig {
    /// Skip certificate verification. Only for tests against self-signed
    /// endpoints.
    pub fn insecure() -> Self {
        Self {
            verify_peer: false,
            ..Self::default()
        }
    }

    /// Wire encoding of the ALPN list (length-prefixed names).
    pub fn alpn_wire(&self) -> Result<Vec<u8>, NetError> {
        let mut wire = Vec::new();
        for proto in &self.alpn_protos {
            let len = u8::try_from(proto.len()).map_err(|_| NetError::SslProtocolError)?;
            if len == 0 {
                return Err(NetError::SslProtocolError);
            }
            wire.push(len);
            wire.extend_from_slice(proto.as_bytes());
        }
        Ok(wire)
    }

    /// Apply this configuration to an SSL connector builder.
    pub fn apply_to_builder(
        &self,
        builder: &mut SslConnectorBuilder,
        use_alpn: bool,
    ) -> Result<(), NetError> {
        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min)).map_err(|_| NetError::SslProtocolError)?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max)).map_err(|_| NetError::SslProtocolError)?;
        }

        builder.set_cipher_list(&self.cipher_list).map_err(|_| NetError::SslProtocolError)?;

        if use_alpn && !self.alpn_protos.is_empty() {
            builder
                .set_alpn_protos(&self.alpn_wire()?)
                .map_err(|_| NetError::SslProtocolError)?;
        }

        if !self.sigalgs.is_empty() {
            builder.set_sigalgs_list(&self.sigalgs).map_err(|_| NetError::SslProtocolError)?;
        }

        if !self.curves.is_empty() {
            builder
                .set_curves_list(&self.curves.join(":"))
                .map_err(|_| NetError::SslProtocolError)?;
        }

        builder.set_verify(if self.verify_peer { SslVerifyMode::PEER } else { SslVerifyMode::NONE });
        Ok(())
    }

    /// Check if SNI (Server Name Indication) should be set for this host.
    /// Per RFC 6066, SNI MUST NOT be set for raw IP addresses.
    pub fn should_set_sni(host: &str) -> bool {
        host.parse::<std::net::IpAddr>().is_err()
    }
}

/// Builds the TLS stage of the establishment pipeline for channels of type
/// `C`.
pub trait TlsContextProvider<C>: Send + Sync + 'static {
    fn create_client_handshake_handler(
        &self,
        peer: &Address,
        server_name: Option<&str>,
        use_alpn: bool,
        timeout: Duration,
    ) -> Result<Box<dyn HandshakeHandler<C>>, NetError>;
}

/// BoringSSL-backed provider for [`TcpChannel`]s.
#[derive(Debug, Clone, Default)]
pub struct BoringTlsProvider {
    config: TlsConfig,
}

impl BoringTlsProvider {
    pub fn new(config: TlsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

impl TlsContextProvider<TcpChannel> for BoringTlsProvider {
    fn create_client_handshake_handler(
        &self,
        peer: &Address,
        server_name: Option<&str>,
        use_alpn: bool,
        timeout: Duration,
    ) -> Result<Box<dyn HandshakeHandler<TcpChannel>>, NetError> {
        let mut builder =
            SslConnector::builder(SslMethod::tls()).map_err(|_| NetError::SslProtocolError)?;
        self.config.apply_to_builder(&mut builder, use_alpn)?;

        let domain = server_name
            .or_else(|| peer.host())
            .unwrap_or_default()
            .to_string();
        Ok(Box::new(TlsHandshake {
            connector: builder.build(),
            domain,
            verify_peer: self.config.verify_peer,
            timeout,
        }))
    }
}

struct TlsHandshake {
    connector: SslConnector,
    domain: String,
    verify_peer: bool,
    timeout: Duration,
}

impl TlsHandshake {
    async fn run(&self, channel: &TcpChannel) -> Result<HandshakeEvent, NetError> {
        let mut config = self.connector.configure().map_err(|_| NetError::SslProtocolError)?;
        config.set_use_server_name_indication(TlsConfig::should_set_sni(&self.domain));
        config.set_verify_hostname(self.verify_peer && TlsConfig::should_set_sni(&self.domain));

        let socket = channel.take_socket().await?;
        let stream = tokio_boring::connect(config, &self.domain, socket)
            .await
            .map_err(|e| NetError::SslError {
                message: format!("{e:?}"),
            })?;
        let application_protocol = stream
            .ssl()
            .selected_alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());
        tracing::debug!(
            domain = %self.domain,
            alpn = ?application_protocol,
            "TLS handshake complete"
        );
        if !channel
            .put_socket(crate::socket::client::SocketType::Tls(Box::new(stream)))
            .await
        {
            return Err(NetError::ConnectionClosed);
        }
        Ok(HandshakeEvent::TlsCompleted {
            application_protocol,
        })
    }
}

impl HandshakeHandler<TcpChannel> for TlsHandshake {
    fn name(&self) -> &'static str {
        TLS_HANDLER
    }

    fn handshake(&self, context: &Context, channel: &TcpChannel) -> Deferred<HandshakeEvent> {
        let completion = HandshakeCompletion::new(context, TLS_HANDLER);
        let handshake = TlsHandshake {
            connector: self.connector.clone(),
            domain: self.domain.clone(),
            verify_peer: self.verify_peer,
            timeout: self.timeout,
        };
        let channel = channel.clone();
        completion.drive(self.timeout, async move { handshake.run(&channel).await });
        completion.result()
    }
}
