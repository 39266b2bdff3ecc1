//! TLS material for the agent's HTTPS server.
//!
//! A self-signed certificate (365 days, SAN `127.0.0.1`) is generated at
//! startup when none is present; the client pins against the returned AES
//! key rather than the certificate chain.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tracing::info;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// Loads or generates the certificate and builds the rustls server config.
pub fn server_config(private_dir: &Path) -> Result<Arc<rustls::ServerConfig>> {
    std::fs::create_dir_all(private_dir).context("creating private dir")?;
    let cert_path = private_dir.join(CERT_FILE);
    let key_path = private_dir.join(KEY_FILE);

    if !cert_path.exists() || !key_path.exists() {
        let generated = generate_self_signed()?;
        std::fs::write(&cert_path, &generated.cert_pem).context("writing certificate")?;
        std::fs::write(&key_path, &generated.key_pem).context("writing private key")?;
        info!(cert = %cert_path.display(), "generated self-signed TLS certificate");
    }

    let cert_pem = std::fs::read(&cert_path).context("reading certificate")?;
    let key_pem = std::fs::read(&key_path).context("reading private key")?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<std::result::Result<_, _>>()
        .context("parsing certificate PEM")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
        .context("parsing private key PEM")?
        .context("no private key found in PEM")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS config")?;
    Ok(Arc::new(config))
}

struct GeneratedCert {
    cert_pem: String,
    key_pem: String,
}

fn generate_self_signed() -> Result<GeneratedCert> {
    let mut params = CertificateParams::new(vec!["127.0.0.1".to_owned()])
        .context("building certificate params")?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "fleetbox");
    dn.push(DnType::CommonName, "fleetbox host agent");
    params.distinguished_name = dn;
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(365);

    let key_pair = KeyPair::generate().context("generating key pair")?;
    let cert = params.self_signed(&key_pair).context("self-signing")?;

    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_and_reloads_certificate() {
        let tmp = TempDir::new().unwrap();
        let first = server_config(tmp.path()).unwrap();
        assert!(tmp.path().join(CERT_FILE).exists());
        assert!(tmp.path().join(KEY_FILE).exists());

        // Second call reuses the files rather than regenerating.
        let before = std::fs::read(tmp.path().join(CERT_FILE)).unwrap();
        let _second = server_config(tmp.path()).unwrap();
        let after = std::fs::read(tmp.path().join(CERT_FILE)).unwrap();
        assert_eq!(before, after);
        drop(first);
    }
}
