//! Channel establishment for the gRPC runner.
//!
//! TLS is on by default and off for `:80` targets or an explicit
//! `tls: false`. The verification-disabled path cannot go through tonic's
//! own TLS config, so it dials through a rustls connector with a
//! chain-accepting verifier.

use std::sync::Arc;
use std::time::Duration;

use opsbook_core::book::GrpcConfig;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity, Uri};

use crate::runner::RunnerError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("opsbook/", env!("CARGO_PKG_VERSION"));

pub(crate) async fn dial(cfg: &GrpcConfig) -> Result<Channel, RunnerError> {
    let use_tls = cfg.tls.unwrap_or_else(|| !cfg.target.ends_with(":80"));
    if !use_tls {
        return connect_endpoint(endpoint(cfg, "http")?).await;
    }
    if cfg.skip_verify {
        return dial_skip_verify(cfg).await;
    }

    // rustls only negotiates TLS 1.2 and newer, which is the floor we want.
    let mut tlsc = ClientTlsConfig::new().with_native_roots();
    if let Some(ca) = &cfg.cacert {
        let pem = tokio::fs::read(ca)
            .await
            .map_err(|e| RunnerError::Connect(format!("failed to read cacert: {e}")))?;
        tlsc = tlsc.ca_certificate(Certificate::from_pem(pem));
    }
    if let (Some(cert), Some(key)) = (&cfg.cert, &cfg.key) {
        let cert = tokio::fs::read(cert)
            .await
            .map_err(|e| RunnerError::Connect(format!("failed to read cert: {e}")))?;
        let key = tokio::fs::read(key)
            .await
            .map_err(|e| RunnerError::Connect(format!("failed to read key: {e}")))?;
        tlsc = tlsc.identity(Identity::from_pem(cert, key));
    }
    let ep = endpoint(cfg, "https")?
        .tls_config(tlsc)
        .map_err(|e| RunnerError::Connect(e.to_string()))?;
    connect_endpoint(ep).await
}

fn endpoint(cfg: &GrpcConfig, scheme: &str) -> Result<Endpoint, RunnerError> {
    Endpoint::from_shared(format!("{scheme}://{}", cfg.target))
        .and_then(|ep| ep.user_agent(USER_AGENT))
        .map(|ep| ep.connect_timeout(DIAL_TIMEOUT))
        .map_err(|e| RunnerError::Connect(e.to_string()))
}

async fn connect_endpoint(ep: Endpoint) -> Result<Channel, RunnerError> {
    // Connection errors are reported verbatim.
    ep.connect()
        .await
        .map_err(|e| RunnerError::Connect(e.to_string()))
}

async fn dial_skip_verify(cfg: &GrpcConfig) -> Result<Channel, RunnerError> {
    let (host, port) = host_port(&cfg.target)?;

    let provider = rustls::crypto::ring::default_provider();
    let builder = ClientConfig::builder_with_provider(Arc::new(provider.clone()))
        .with_safe_default_protocol_versions()
        .map_err(|e| RunnerError::Connect(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }));
    let mut config = match (&cfg.cert, &cfg.key) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert).await?;
            let key = load_key(key).await?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| RunnerError::Connect(e.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"h2".to_vec()];

    let tls = tokio_rustls::TlsConnector::from(Arc::new(config));
    let sni = ServerName::try_from(host.clone())
        .map_err(|e| RunnerError::Connect(format!("invalid server name {host:?}: {e}")))?;

    let connector = tower::service_fn(move |_: Uri| {
        let tls = tls.clone();
        let host = host.clone();
        let sni = sni.clone();
        async move {
            let tcp = TcpStream::connect((host.as_str(), port)).await?;
            let stream = tls.connect(sni, tcp).await?;
            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(stream))
        }
    });

    endpoint(cfg, "https")?
        .connect_with_connector(connector)
        .await
        .map_err(|e| RunnerError::Connect(e.to_string()))
}

fn host_port(target: &str) -> Result<(String, u16), RunnerError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| RunnerError::Connect(format!("target {target:?} has no port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| RunnerError::Connect(format!("invalid port in {target:?}")))?;
    Ok((host.to_string(), port))
}

async fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, RunnerError> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| RunnerError::Connect(format!("failed to read cert: {e}")))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RunnerError::Connect(format!("invalid cert: {e}")))
}

async fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, RunnerError> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| RunnerError::Connect(format!("failed to read key: {e}")))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| RunnerError::Connect(format!("invalid key: {e}")))?
        .ok_or_else(|| RunnerError::Connect("no private key found".to_string()))
}

/// Accepts whatever chain the server presents; signatures are still checked
/// with the provider's algorithms.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: CryptoProvider,
}

impl ServerCertVerifier for AcceptAnyCert {
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
            &self.provider.signature_verification_algorithms,
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
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_defaults_follow_the_port() {
        let cfg = GrpcConfig {
            target: "svc.example.com:80".to_string(),
            ..GrpcConfig::default()
        };
        assert!(!cfg.tls.unwrap_or_else(|| !cfg.target.ends_with(":80")));
        let cfg = GrpcConfig {
            target: "svc.example.com:443".to_string(),
            ..GrpcConfig::default()
        };
        assert!(cfg.tls.unwrap_or_else(|| !cfg.target.ends_with(":80")));
    }

    #[test]
    fn splits_host_and_port() {
        assert_eq!(
            host_port("svc.example.com:443").unwrap(),
            ("svc.example.com".to_string(), 443)
        );
        assert!(host_port("no-port").is_err());
    }
}
