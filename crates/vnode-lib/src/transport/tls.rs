//! TLS material loading
//!
//! The broker certificate is always verified against the supplied CA bundle.

use crate::error::{Error, Result};
use rumqttc::TlsConfiguration;
use std::path::Path;

/// Build a verifying TLS configuration from a CA bundle and an optional client pair
pub(crate) async fn load_tls_config(
    ca_path: &Path,
    client_pair: Option<(&Path, &Path)>,
) -> Result<TlsConfiguration> {
    let ca = read_pem(ca_path, "CA bundle").await?;
    let ca_count = count_certs(&ca)
        .map_err(|e| Error::connection(format!("invalid CA bundle {:?}: {}", ca_path, e)))?;
    if ca_count == 0 {
        return Err(Error::connection(format!(
            "no certificates found in CA bundle {:?}",
            ca_path
        )));
    }

    let client_auth = match client_pair {
        Some((crt_path, key_path)) => {
            let crt = read_pem(crt_path, "client certificate").await?;
            let crt_count = count_certs(&crt).map_err(|e| {
                Error::connection(format!("invalid client certificate {:?}: {}", crt_path, e))
            })?;
            if crt_count == 0 {
                return Err(Error::connection(format!(
                    "no certificates found in {:?}",
                    crt_path
                )));
            }

            let key = read_pem(key_path, "client key").await?;
            match rustls_pemfile::private_key(&mut key.as_slice()) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(Error::connection(format!(
                        "no private key found in {:?}",
                        key_path
                    )))
                }
                Err(e) => {
                    return Err(Error::connection(format!(
                        "invalid client key {:?}: {}",
                        key_path, e
                    )))
                }
            }
            Some((crt, key))
        }
        None => None,
    };

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}

async fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| Error::connection(format!("failed to read {} {:?}: {}", what, path, e)))
}

fn count_certs(pem: &[u8]) -> std::io::Result<usize> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<std::io::Result<Vec<_>>>()?;
    Ok(certs.len())
}
