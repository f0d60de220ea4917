//! Instrumented TLS handshakes on top of rustls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ProtocolVersion, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::dialer::{BoxConn, Dialer, SharedDialer, split_host_port};
use super::errorx::{ConfigError, NetError, maybe_wrap, operation};
use super::trace::{Event, EventName, SharedSaver};
use crate::context::Context;

/// Default TLS handshake timeout.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static ROOTS: Lazy<Arc<RootCertStore>> = Lazy::new(|| {
    Arc::new(RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    })
});

/// Client-side handshake parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// SNI and name to verify. Empty means "use the dialed host".
    pub server_name: String,
    /// ALPN protocols to offer.
    pub alpn: Vec<String>,
    /// Skip certificate verification entirely.
    pub no_tls_verify: bool,
}

/// What a completed handshake negotiated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub cipher_suite: String,
    pub negotiated_protocol: String,
    /// DER certificates, leaf first.
    pub peer_certificates: Vec<Vec<u8>>,
    pub version: String,
}

/// Performs a TLS handshake over an established connection.
#[async_trait]
pub trait TlsHandshaker: Send + Sync {
    async fn handshake(
        &self,
        ctx: &Context,
        conn: BoxConn,
        config: &TlsConfig,
    ) -> Result<(BoxConn, ConnectionState), NetError>;
}

pub type SharedHandshaker = Arc<dyn TlsHandshaker>;

/// Accepts any certificate while still checking handshake signatures.
#[derive(Debug)]
struct NoVerify(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Build a rustls client configuration for `config`.
pub fn client_config(config: &TlsConfig) -> Result<ClientConfig, NetError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;
    let mut client = if config.no_tls_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(Arc::clone(&ROOTS))
            .with_no_client_auth()
    };
    client.alpn_protocols = config.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(client)
}

/// `TLS13_AES_128_GCM_SHA256` becomes `TLS_AES_128_GCM_SHA256`.
fn cipher_suite_name(suite: rustls::CipherSuite) -> String {
    let name = format!("{suite:?}");
    match name.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{rest}"),
        None => name,
    }
}

fn version_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        ProtocolVersion::TLSv1_1 => "TLSv1.1".to_string(),
        ProtocolVersion::TLSv1_0 => "TLSv1.0".to_string(),
        other => format!("{other:?}"),
    }
}

// ============================================================================
// Handshakers
// ============================================================================

/// rustls handshaker with a timeout.
#[derive(Debug, Clone)]
pub struct SystemTlsHandshaker {
    pub timeout: Duration,
}

impl Default for SystemTlsHandshaker {
    fn default() -> Self {
        Self {
            timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

#[async_trait]
impl TlsHandshaker for SystemTlsHandshaker {
    async fn handshake(
        &self,
        ctx: &Context,
        conn: BoxConn,
        config: &TlsConfig,
    ) -> Result<(BoxConn, ConnectionState), NetError> {
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| ConfigError::InvalidServerName(config.server_name.clone()))?;
        let connector = TlsConnector::from(Arc::new(client_config(config)?));
        let timeout = self.timeout;
        let stream = ctx
            .run(async move {
                match tokio::time::timeout(timeout, connector.connect(server_name, conn)).await {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(err)) => Err(NetError::from(err)),
                    Err(_) => Err(NetError::other("net/http: TLS handshake timeout")),
                }
            })
            .await?;
        let (_, session) = stream.get_ref();
        let state = ConnectionState {
            cipher_suite: session
                .negotiated_cipher_suite()
                .map(|s| cipher_suite_name(s.suite()))
                .unwrap_or_default(),
            negotiated_protocol: session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default(),
            peer_certificates: session
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default(),
            version: session.protocol_version().map(version_name).unwrap_or_default(),
        };
        Ok((Box::new(stream), state))
    }
}

/// Tags handshake failures with the `tls_handshake` operation.
pub struct ErrorWrapperTlsHandshaker {
    pub handshaker: SharedHandshaker,
}

#[async_trait]
impl TlsHandshaker for ErrorWrapperTlsHandshaker {
    async fn handshake(
        &self,
        ctx: &Context,
        conn: BoxConn,
        config: &TlsConfig,
    ) -> Result<(BoxConn, ConnectionState), NetError> {
        maybe_wrap(
            self.handshaker.handshake(ctx, conn, config).await,
            operation::TLS_HANDSHAKE,
        )
    }
}

/// Records `tls_handshake_start` and `tls_handshake_done` events.
pub struct SaverTlsHandshaker {
    pub handshaker: SharedHandshaker,
    pub saver: SharedSaver,
}

#[async_trait]
impl TlsHandshaker for SaverTlsHandshaker {
    async fn handshake(
        &self,
        ctx: &Context,
        conn: BoxConn,
        config: &TlsConfig,
    ) -> Result<(BoxConn, ConnectionState), NetError> {
        self.saver.write(Event {
            no_tls_verify: config.no_tls_verify,
            tls_next_protos: config.alpn.clone(),
            tls_server_name: config.server_name.clone(),
            ..Event::now(EventName::TlsHandshakeStart)
        });
        let start = Instant::now();
        let res = self.handshaker.handshake(ctx, conn, config).await;
        let duration = start.elapsed();
        let (state, err) = match &res {
            Ok((_, state)) => (state.clone(), None),
            Err(err) => (ConnectionState::default(), Some(err.clone())),
        };
        debug!(
            server_name = %config.server_name,
            version = %state.version,
            ok = err.is_none(),
            ?duration,
            "tls handshake"
        );
        self.saver.write(Event {
            duration,
            err,
            no_tls_verify: config.no_tls_verify,
            tls_cipher_suite: state.cipher_suite,
            tls_negotiated_proto: state.negotiated_protocol,
            tls_next_protos: config.alpn.clone(),
            tls_peer_certs: state.peer_certificates,
            tls_server_name: config.server_name.clone(),
            tls_version: state.version,
            ..Event::now(EventName::TlsHandshakeDone)
        });
        res
    }
}

// ============================================================================
// TLS dialer
// ============================================================================

/// Dials a TCP connection and then runs a TLS handshake on it.
pub struct TlsDialer {
    pub dialer: SharedDialer,
    pub handshaker: SharedHandshaker,
    pub config: TlsConfig,
}

impl TlsDialer {
    /// Dial and handshake, also returning the negotiated state.
    pub async fn dial_tls_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<(BoxConn, ConnectionState), NetError> {
        let (host, _) = split_host_port(address).ok_or_else(|| {
            NetError::other(format!("address {address}: missing port in address"))
        })?;
        let conn = self.dialer.dial_context(ctx, network, address).await?;
        let mut config = self.config.clone();
        if config.server_name.is_empty() {
            config.server_name = host;
        }
        self.handshaker.handshake(ctx, conn, &config).await
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxConn, NetError> {
        let (conn, _) = self.dial_tls_context(ctx, network, address).await?;
        Ok(conn)
    }
}
