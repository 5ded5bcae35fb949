use crate::{config::NodeConfig, config::TransportKind, Error, Result};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    client::{EchConfig, EchMode},
    crypto::{aws_lc_rs, CryptoProvider},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use rustls_pki_types::{CertificateDer, EchConfigListBytes, ServerName, UnixTime};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client::TlsStream, TlsConnector};

/// Browser ClientHello profile applied to the rustls provider: cipher
/// suites restricted to the browser's list in the browser's order, plus
/// the browser's ALPN. rustls fixes extension layout itself, so this is
/// the fingerprint surface we control.
struct Fingerprint {
    cipher_suites: &'static [u16],
    alpn: &'static [&'static [u8]],
}

/// Chrome 110 ordering.
const CHROME: Fingerprint = Fingerprint {
    cipher_suites: &[
        0x1301, // TLS_AES_128_GCM_SHA256
        0x1302, // TLS_AES_256_GCM_SHA384
        0x1303, // TLS_CHACHA20_POLY1305_SHA256
        0xc02b, // TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
        0xc02f, // TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
        0xc02c, // TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
        0xc030, // TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
        0xcca9, // TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
        0xcca8, // TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
    ],
    alpn: &[b"h2", b"http/1.1"],
};

fn fingerprinted_provider(fp: &Fingerprint) -> CryptoProvider {
    let mut provider = aws_lc_rs::default_provider();
    let mut ordered = Vec::with_capacity(fp.cipher_suites.len());
    for id in fp.cipher_suites {
        if let Some(suite) = provider
            .cipher_suites
            .iter()
            .find(|s| u16::from(s.suite()) == *id)
        {
            ordered.push(*suite);
        }
    }
    if !ordered.is_empty() {
        provider.cipher_suites = ordered;
    }
    provider
}

fn root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Build the client config for a node. `ech_config_list` is the raw
/// ECHConfigList from DNS; injecting it pins the handshake to TLS 1.3.
pub fn client_config(node: &NodeConfig, ech_config_list: Option<Vec<u8>>) -> Result<ClientConfig> {
    let provider = Arc::new(fingerprinted_provider(&CHROME));

    let builder = match ech_config_list {
        Some(list) => {
            let ech = EchConfig::new(EchConfigListBytes::from(list), aws_lc_rs::hpke::ALL_SUPPORTED_SUITES)?;
            ClientConfig::builder_with_provider(provider).with_ech(EchMode::from(ech))?
        }
        None => ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?,
    };

    let mut config = if node.tls.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_store())
            .with_no_client_auth()
    };

    // An h2-negotiating server would swallow the upgrade request, so the
    // WebSocket transport pins HTTP/1.1.
    config.alpn_protocols = match node.transport.kind {
        TransportKind::Ws => vec![b"http/1.1".to_vec()],
        TransportKind::Tcp => CHROME.alpn.iter().map(|p| p.to_vec()).collect(),
    };

    Ok(config)
}

pub async fn handshake<S>(
    node: &NodeConfig,
    stream: S,
    ech_config_list: Option<Vec<u8>>,
) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let config = client_config(node, ech_config_list)?;
    let server_name = ServerName::try_from(node.effective_server_name().to_string())
        .map_err(|e| Error::Tls(format!("invalid server name: {e}")))?;
    let connector = TlsConnector::from(Arc::new(config));
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::Tls(format!("handshake: {e}")))?;
    Ok(tls)
}

/// Certificate verifier that accepts anything. Installed only when the
/// node explicitly sets `tls.insecure`.
#[derive(Debug)]
pub(crate) struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
