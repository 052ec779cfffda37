use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use crate::config::TlsConfig;

/// TLS for both roles of a link. The same certificate is presented when accepting and when
///  connecting, and peers must present a certificate issued directly by the configured CA
///  (i.e. verification depth 1, no intermediates) in either role.
#[derive(Clone)]
pub struct LinkTls {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

impl LinkTls {
    pub fn load(config: &TlsConfig) -> anyhow::Result<LinkTls> {
        info!("setting up TLS with CA {:?} and certificate {:?}", config.ca_cert, config.cert);

        let ca_certs = load_certs(&config.ca_cert)?;
        let certs = load_certs(&config.cert)?;
        let key = PrivateKeyDer::from_pem_file(&config.key)
            .with_context(|| format!("reading private key from {:?}", config.key))?;

        let mut roots = RootCertStore::empty();
        for ca_cert in ca_certs {
            roots.add(ca_cert)
                .context("adding CA certificate to the trust store")?;
        }
        let roots = Arc::new(roots);

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server_verifier = WebPkiServerVerifier::builder_with_provider(roots.clone(), provider.clone())
            .build()?;
        let client_verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
            .build()?;

        let server_config = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(DirectlyIssuedClientVerifier { inner: client_verifier }))
            .with_single_cert(certs.clone(), key.clone_key())
            .context("invalid certificate / private key for the server role")?;

        let client_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DirectlyIssuedServerVerifier { inner: server_verifier }))
            .with_client_auth_cert(certs, key)
            .context("invalid certificate / private key for the client role")?;

        Ok(LinkTls {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .with_context(|| format!("reading certificates from {:?}", path))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates in {:?}", path))?;

    if certs.is_empty() {
        return Err(anyhow!("no certificate found in {:?}", path));
    }
    debug!("loaded {} certificate(s) from {:?}", certs.len(), path);
    Ok(certs)
}

/// the name to verify a peer's certificate against, derived from its `host:port` address
pub fn server_name_for(address: &str) -> anyhow::Result<ServerName<'static>> {
    let host = address.rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(address);
    let host = host.trim_start_matches('[').trim_end_matches(']');

    ServerName::try_from(host.to_string())
        .map_err(|e| anyhow!("{:?} is not a valid TLS server name: {}", host, e))
}

fn reject_intermediates(intermediates: &[CertificateDer<'_>]) -> Result<(), rustls::Error> {
    if intermediates.is_empty() {
        Ok(())
    }
    else {
        Err(rustls::Error::General(format!(
            "peer presented {} intermediate certificate(s), but only certificates issued directly by the CA are accepted",
            intermediates.len()
        )))
    }
}

#[derive(Debug)]
struct DirectlyIssuedServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for DirectlyIssuedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        reject_intermediates(intermediates)?;
        self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[derive(Debug)]
struct DirectlyIssuedClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl ClientCertVerifier for DirectlyIssuedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(&self, end_entity: &CertificateDer<'_>, intermediates: &[CertificateDer<'_>], now: UnixTime) -> Result<ClientCertVerified, rustls::Error> {
        reject_intermediates(intermediates)?;
        self.inner.verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
