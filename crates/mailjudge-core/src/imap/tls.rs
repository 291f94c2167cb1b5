//! TLS support for the IMAP client

use mailjudge_common::{Error, Result};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Load trusted roots from a PEM bundle and create a connector
pub fn create_tls_connector(ca_file: &Path) -> Result<TlsConnector> {
    let file = File::open(ca_file).map_err(|e| {
        Error::Config(format!(
            "Failed to open CA file {}: {}",
            ca_file.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);
    let roots: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse CA certificates: {}", e)))?;

    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(roots);
    if store.is_empty() {
        return Err(Error::Config(format!(
            "No usable certificates found in {}",
            ca_file.display()
        )));
    }

    debug!(added, ignored, "Loaded trusted root certificates");

    let config = ClientConfig::builder()
        .with_root_certificates(store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server name used for certificate verification
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|e| Error::Config(format!("Invalid server name {:?}: {}", host, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_ca_file() {
        let err = create_tls_connector(Path::new("/nonexistent/ca.pem"))
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_empty_ca_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        assert!(create_tls_connector(file.path()).is_err());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("imap.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("::1").is_ok());
        assert!(server_name("bad host name").is_err());
    }
}
