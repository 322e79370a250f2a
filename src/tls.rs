//! TLS configuration and connection sniffing

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio_rustls::{
    rustls::{
        pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
        ServerConfig,
    },
    TlsAcceptor,
};

pub(crate) mod https_redirect;

const CERT_FILE_NAME: &str = "cert.pem";
const KEY_FILE_NAME: &str = "key.pem";

/// Certificate and private key the listener terminates TLS with.
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsConfig {
    /// Uses the given certificate and private key PEM files.
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self { cert: cert.into(), key: key.into() }
    }

    /// Looks for `cert.pem` and `key.pem` inside `dir`.
    pub fn from_pem(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join(CERT_FILE_NAME), dir.join(KEY_FILE_NAME))
    }

    pub(crate) fn build(&self) -> io::Result<TlsAcceptor> {
        let certs = load_certificates(&self.cert)?;
        let key = load_private_key(&self.key)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| material_error(&self.cert, err))?;
        config.alpn_protocols = vec![b"http/1.1".into(), b"http/1.0".into()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::from_pem(".")
    }
}

/// Reads the whole certificate chain out of one PEM file.
fn load_certificates(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path).map_err(|err| material_error(path, err))?;

    let mut certs = Vec::new();
    for cert in CertificateDer::pem_slice_iter(&pem) {
        certs.push(cert.map_err(|err| material_error(path, err))?);
    }
    if certs.is_empty() {
        return Err(material_error(path, "no certificates in file"));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).map_err(|err| material_error(path, err))?;
    PrivateKeyDer::from_pem_slice(&pem).map_err(|err| material_error(path, err))
}

fn material_error(path: &Path, err: impl fmt::Display) -> io::Error {
    io::Error::other(format!("couldn't use TLS material from {}: {err}", path.display()))
}

/// Whether the first byte of a connection looks like a TLS client hello:
/// the handshake record type, or the high bit SSLv2 set.
#[inline]
pub(crate) fn is_tls_first_byte(byte: u8) -> bool {
    byte == 0x16 || byte == 0x80
}
