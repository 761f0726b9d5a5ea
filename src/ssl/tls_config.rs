use crate::config::Settings;
use crate::error::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::info;

/// rustls configurations built from the `tls_*` settings.
#[derive(Clone, Default)]
pub(crate) struct TlsConfigs {
    pub(crate) server: Option<Arc<ServerConfig>>,
    pub(crate) client: Option<Arc<ClientConfig>>,
}

impl TlsConfigs {
    /// Loads whatever the settings name. A server config needs both
    /// `tls_server_cert` and `tls_server_key`; a client config needs
    /// `tls_ca_cert`.
    pub(crate) fn load(settings: &Settings) -> Result<Self, Error> {
        let server = match (&settings.tls_server_cert, &settings.tls_server_key) {
            (Some(cert_path), Some(key_path)) => {
                info!(cert = %cert_path, "Loading TLS server certificate");
                Some(Arc::new(server_config(cert_path, key_path)?))
            }
            _ => None,
        };

        let client = match &settings.tls_ca_cert {
            Some(ca_path) => {
                info!(ca = %ca_path, "Loading TLS trust root");
                Some(Arc::new(client_config(ca_path)?))
            }
            None => None,
        };

        Ok(Self { server, client })
    }
}

fn read_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("{path}: {e}")))?;

    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "{path}: no certificates found"
        )));
    }
    Ok(chain)
}

fn read_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsKeyLoad {
        path: path.to_string(),
        source: e,
    })?;
    private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsInvalidKey(format!("{path}: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("{path}: no private key found")))
}

pub(crate) fn server_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, Error> {
    let chain = read_certificates(cert_path)?;
    let key = read_private_key(key_path)?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))
}

pub(crate) fn client_config(ca_path: &str) -> Result<ClientConfig, Error> {
    let mut roots = RootCertStore::empty();
    for cert in read_certificates(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
