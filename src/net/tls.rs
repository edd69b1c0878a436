//! TLS contexts for the server/client link.
//!
//! The trust model is a shared certificate: the server presents its cert
//! (self-signed or operator-provided), clients trust exactly that file.
//! One acceptor/connector is built per endpoint and shared by all of its
//! connections.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::constants::APP_NAME;

/// Build a server-side acceptor from PEM cert + key files.
pub fn load_acceptor(certfile: &Path, keyfile: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(certfile)?;
    let key = load_key(keyfile)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid certificate/key pair")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a client-side connector trusting exactly one certificate file.
pub fn load_connector(certfile: &Path) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(certfile)? {
        roots
            .add(cert)
            .context("Certificate not usable as trust root")?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server name for the TLS handshake: the host if it parses as a DNS
/// name or IP, else the app's well-known name the self-signed cert
/// carries.
pub fn server_name(host: &str) -> ServerName<'static> {
    ServerName::try_from(host.to_string())
        .unwrap_or_else(|_| ServerName::try_from(format!("{APP_NAME}.local")).expect("static name"))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read certificate {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .context("Malformed certificate file")?;
    if certs.is_empty() {
        bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem =
        std::fs::read(path).with_context(|| format!("Failed to read key {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .context("Malformed key file")?
        .with_context(|| format!("No private key found in {}", path.display()))
}

/// Generate a self-signed identity into `certfile`/`keyfile`.
///
/// Used by `enable_ssl` when the operator has not provided material. The
/// certificate names the app plus the local hostname so clients can
/// verify against either.
pub fn generate_identity(certfile: &Path, keyfile: &Path) -> Result<()> {
    let mut names = vec![format!("{APP_NAME}.local"), "localhost".to_string()];
    if let Ok(host) = hostname::get() {
        names.push(host.to_string_lossy().into_owned());
    }

    let identity =
        rcgen::generate_simple_self_signed(names).context("Certificate generation failed")?;
    std::fs::write(certfile, identity.cert.pem())
        .with_context(|| format!("Failed to write {}", certfile.display()))?;
    std::fs::write(keyfile, identity.key_pair.serialize_pem())
        .with_context(|| format!("Failed to write {}", keyfile.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(keyfile, std::fs::Permissions::from_mode(0o600))?;
    }

    log::info!("[TLS] Generated self-signed identity at {}", certfile.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_load_identity() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cert = tmp.path().join("cert.pem");
        let key = tmp.path().join("key.pem");

        generate_identity(&cert, &key).unwrap();
        assert!(cert.exists());
        assert!(key.exists());

        // Both endpoints must accept the generated material.
        load_acceptor(&cert, &key).unwrap();
        load_connector(&cert).unwrap();
    }

    #[test]
    fn test_missing_cert_is_config_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("nope.pem");
        assert!(load_connector(&missing).is_err());
    }

    #[test]
    fn test_server_name_accepts_ip_and_dns() {
        // IPs and hostnames both produce a usable SNI value.
        let _ = server_name("192.168.1.4");
        let _ = server_name("myhost.local");
    }
}
