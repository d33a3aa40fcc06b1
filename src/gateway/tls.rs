//! TLS termination for server blocks that declare `tls_cert` and `tls_key`.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig as RustlsServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::core::error::{GatewayError, GatewayResult};

/// ALPN identifiers offered to clients, most preferred first
pub fn alpn_protocols(enable_http2: bool) -> Vec<Vec<u8>> {
    if enable_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    }
}

pub fn load_certs(path: &Path) -> GatewayResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| GatewayError::tls(format!("failed to open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::tls(format!("failed to parse {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(GatewayError::tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> GatewayResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| GatewayError::tls(format!("failed to open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| GatewayError::tls(format!("failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| GatewayError::tls(format!("no private key found in {}", path.display())))
}

/// Acceptor for one listener
pub fn build_acceptor(cert: &Path, key: &Path, enable_http2: bool) -> GatewayResult<TlsAcceptor> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;

    let mut config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::tls(format!("failed to configure TLS: {}", e)))?;
    config.alpn_protocols = alpn_protocols(enable_http2);

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_alpn_follows_http2_flag() {
        assert_eq!(alpn_protocols(true)[0], b"h2".to_vec());
        assert_eq!(alpn_protocols(false), vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_missing_certificate_file() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, GatewayError::Tls { .. }));
    }

    #[test]
    fn test_pem_without_material_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a pem file").unwrap();

        assert!(load_certs(file.path()).unwrap_err().to_string().contains("no certificates"));
        assert!(load_private_key(file.path()).unwrap_err().to_string().contains("no private key"));
    }
}
