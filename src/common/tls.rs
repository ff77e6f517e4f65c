use std::sync::Arc;

use anyhow::Result;
use rustls::crypto::ring as ring_provider;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use tracing::debug;

use super::error::TunnelError;
use super::stream::ProxyStream;

/// 跳过证书验证的 verifier（仅用于 allow_insecure=true）
#[derive(Debug)]
pub struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        ring_provider::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// 构建 TLS ClientConfig
///
/// - `allow_insecure`: 跳过证书验证
pub fn build_tls_config(allow_insecure: bool) -> Result<ClientConfig> {
    let provider = Arc::new(ring_provider::default_provider());
    let config = if allow_insecure {
        ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    Ok(config)
}

/// 构建 TLS ClientConfig，接受自定义根证书（供测试使用）
pub fn build_tls_config_with_roots(roots: Vec<CertificateDer<'static>>) -> Result<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in roots {
        root_store
            .add(cert)
            .map_err(|e| anyhow::anyhow!("add custom root cert failed: {}", e))?;
    }

    let provider = Arc::new(ring_provider::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}

/// Client TLS settings applied once the last hop has opened its tunnel.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsContext {
    pub fn new(config: ClientConfig, server_name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| anyhow::anyhow!("invalid TLS server name '{}': {}", server_name, e))?;
        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }

    /// Context verifying against the bundled web PKI roots.
    pub fn for_host(server_name: &str, allow_insecure: bool) -> Result<Self> {
        Self::new(build_tls_config(allow_insecure)?, server_name)
    }

    pub fn with_roots(server_name: &str, roots: Vec<CertificateDer<'static>>) -> Result<Self> {
        Self::new(build_tls_config_with_roots(roots)?, server_name)
    }

    /// Run the client handshake over an already tunnelled stream.
    pub async fn connect(&self, stream: ProxyStream) -> Result<ProxyStream, TunnelError> {
        debug!(server_name = ?self.server_name, "starting TLS handshake");
        let connector = tokio_rustls::TlsConnector::from(self.config.clone());
        let tls_stream = connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(TunnelError::from_tls)?;
        Ok(Box::new(tls_stream))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}
