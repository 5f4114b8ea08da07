use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio_rustls::TlsAcceptor;

/// Builds a TLS acceptor from PEM certificate and key files. Once built,
/// the secure listener behaves exactly like the plain one downstream.
/// Bad material is fatal at startup.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("failed to open certificate {:?}", cert_path))?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain: Vec<Certificate> = certs(&mut cert_reader)
        .map_err(|_| anyhow!("failed to parse certificate {:?}", cert_path))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(anyhow!("no certificate found in {:?}", cert_path));
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("failed to open private key {:?}", key_path))?;
    let mut key_reader = BufReader::new(key_file);
    let mut keys = pkcs8_private_keys(&mut key_reader)
        .map_err(|_| anyhow!("failed to parse private key {:?}", key_path))?;
    if keys.is_empty() {
        return Err(anyhow!("no private key found in {:?}", key_path));
    }
    let private_key = PrivateKey(keys.remove(0));

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow!("failed to build TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
