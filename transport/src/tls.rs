//! Mutual-TLS setup for the controller and agent sides of a
//! connection. Both peers present a certificate and verify the
//! other's against a shared root, rather than relying on any
//! public CA hierarchy -- a cluster's agents and controller are
//! expected to be provisioned from one set of self-issued certs.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_rustls::rustls::{self, Certificate, PrivateKey, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Loads a PEM certificate chain.
pub fn load_certs(path: &Path) -> anyhow::Result<Vec<Certificate>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .with_context(|| format!("parsing certificates in {}", path.display()))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Loads a PEM PKCS#8 private key.
pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKey> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file))
        .with_context(|| format!("parsing private key in {}", path.display()))?;
    let key = keys.pop().context("no private key found")?;
    Ok(PrivateKey(key))
}

/// Builds the controller-side TLS acceptor: terminates the connection
/// with `cert`/`key`, and requires the peer to present a certificate
/// signed by `client_root`.
pub fn controller_acceptor(
    cert: Vec<Certificate>,
    key: PrivateKey,
    client_root: &[Certificate],
) -> anyhow::Result<TlsAcceptor> {
    let mut roots = RootCertStore::empty();
    for root in client_root {
        roots.add(root).context("adding client root certificate")?;
    }
    let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(cert, key)
        .context("building controller TLS server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the agent-side TLS connector: presents `cert`/`key` as the
/// client certificate, and verifies the controller's certificate
/// against `server_root`.
pub fn agent_connector(
    cert: Vec<Certificate>,
    key: PrivateKey,
    server_root: &[Certificate],
) -> anyhow::Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for root in server_root {
        roots.add(root).context("adding controller root certificate")?;
    }
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_single_cert(cert, key)
        .context("building agent TLS client config")?;
    Ok(TlsConnector::from(Arc::new(config)))
}
