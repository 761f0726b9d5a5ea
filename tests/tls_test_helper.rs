#![allow(dead_code)]

use nbconn::Settings;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Guard that holds temporary certificate files and auto-cleans them on drop
pub struct TlsCertGuard {
    _cert_file: NamedTempFile,
    _key_file: NamedTempFile,
    _ca_cert_file: NamedTempFile,
    pub cert_der: CertificateDer<'static>,
}

impl TlsCertGuard {
    /// A rustls client config that trusts the test certificate.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert_der.clone()).unwrap();
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }
}

/// Generate settings with server and client TLS material.
/// `tls_start` is `"eager"` or `"on_demand"`.
/// Returns (settings, cleanup_guard)
pub fn generate_test_tls_settings(name: &str, tls_start: &str) -> (Settings, TlsCertGuard) {
    let (cert_file, key_file, ca_cert_file, cert_der) = create_temp_cert_files();

    let config = config::Config::builder()
        .set_default("tls_server_cert", cert_file.path().to_str().unwrap())
        .unwrap()
        .set_default("tls_server_key", key_file.path().to_str().unwrap())
        .unwrap()
        .set_default("tls_ca_cert", ca_cert_file.path().to_str().unwrap())
        .unwrap()
        .set_default("tls_start", tls_start)
        .unwrap()
        .set_default("dispatcher_pool_size", 2)
        .unwrap()
        .set_default("worker_pool_size", 2)
        .unwrap()
        .build()
        .unwrap();

    let settings = Settings::from_config_named(&config, name).unwrap();

    (
        settings,
        TlsCertGuard {
            _cert_file: cert_file,
            _key_file: key_file,
            _ca_cert_file: ca_cert_file,
            cert_der,
        },
    )
}

/// In-memory rustls configs for engine-level tests
pub fn generate_test_rustls_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
    let certified_key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = certified_key.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified_key.key_pair.serialize_der(),
    ));

    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (Arc::new(server), Arc::new(client))
}

/// Create temporary certificate files with self-signed cert
fn create_temp_cert_files() -> (NamedTempFile, NamedTempFile, NamedTempFile, CertificateDer<'static>) {
    let certified_key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_pem = certified_key.cert.pem();
    let key_pem = certified_key.key_pair.serialize_pem();

    // Create temporary files that will auto-delete on drop
    let mut cert_file = NamedTempFile::new().unwrap();
    let mut key_file = NamedTempFile::new().unwrap();
    let mut ca_cert_file = NamedTempFile::new().unwrap();

    cert_file.write_all(cert_pem.as_bytes()).unwrap();
    key_file.write_all(key_pem.as_bytes()).unwrap();
    // For testing, CA cert is the same as server cert (self-signed)
    ca_cert_file.write_all(cert_pem.as_bytes()).unwrap();

    cert_file.flush().unwrap();
    key_file.flush().unwrap();
    ca_cert_file.flush().unwrap();

    (cert_file, key_file, ca_cert_file, certified_key.cert.der().clone())
}
