//! Throwaway certificate authorities and PEM files for TLS tests

use std::fs;
use std::path::PathBuf;

use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose};
use uuid::Uuid;

use crate::config::TlsConfig;

/// A CA that issues certificates for `127.0.0.1`. It is either a self-signed root or an
///  intermediate below some other [TestCa].
pub struct TestCa {
    cert: Certificate,
    key: KeyPair,
    root_pem: String,
    /// this CA's certificate followed by those of its issuers, excluding the root
    chain_pem: String,
}

impl TestCa {
    pub fn root(name: &str) -> TestCa {
        let key = KeyPair::generate().unwrap();
        let cert = ca_params(name).self_signed(&key).unwrap();
        TestCa {
            root_pem: cert.pem(),
            chain_pem: String::new(),
            cert,
            key,
        }
    }

    pub fn intermediate(&self, name: &str) -> TestCa {
        let key = KeyPair::generate().unwrap();
        let cert = ca_params(name).signed_by(&key, &self.cert, &self.key).unwrap();
        TestCa {
            root_pem: self.root_pem.clone(),
            chain_pem: format!("{}{}", cert.pem(), self.chain_pem),
            cert,
            key,
        }
    }

    /// Issues a certificate for a party, returning the PEM of the certificate together with
    ///  its chain (up to but excluding the root), and the PEM of its private key
    fn issue(&self, name: &str) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        (format!("{}{}", cert.pem(), self.chain_pem), key.serialize_pem())
    }
}

fn ca_params(name: &str) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];
    params
}

/// A temporary directory holding PEM files. It is deleted when dropped.
pub struct PemDir {
    dir: PathBuf,
}

impl PemDir {
    pub fn new() -> PemDir {
        let dir = std::env::temp_dir().join(format!("fedproxy-pki-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        PemDir { dir }
    }

    /// Writes the material for a party with a certificate issued by `issuer` that trusts the
    ///  root of `trusted`
    pub fn party_tls(&self, name: &str, issuer: &TestCa, trusted: &TestCa) -> TlsConfig {
        let (cert_pem, key_pem) = issuer.issue(name);

        let config = TlsConfig {
            ca_cert: self.dir.join(format!("{}-ca.crt", name)),
            cert: self.dir.join(format!("{}.crt", name)),
            key: self.dir.join(format!("{}.key", name)),
        };
        fs::write(&config.ca_cert, &trusted.root_pem).unwrap();
        fs::write(&config.cert, cert_pem).unwrap();
        fs::write(&config.key, key_pem).unwrap();
        config
    }
}

impl Drop for PemDir {
    fn drop(&mut self) {
        fs::remove_dir_all(&self.dir).ok();
    }
}
