//! Minimal store-backed TLS certificate resolver. Listeners configured
//! without TLS material for a host serve plaintext HTTP for it instead.

use crate::router::cache::CACHE_TTL;
use crate::store::StoreFacade;
use parking_lot::Mutex;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{CertifiedKey, SigningKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

struct CachedKey {
    key: Option<Arc<CertifiedKey>>,
    fetched_at: Instant,
}

/// Queries the shared store for `tls:<host>` material by SNI hostname and
/// caches the resulting `CertifiedKey` for [`CACHE_TTL`] — the same
/// duration as the `BackendSet` cache, since both trust the store and
/// refresh periodically.
pub struct StoreCertResolver {
    store: Arc<dyn StoreFacade>,
    cache: Mutex<HashMap<String, CachedKey>>,
    rt: tokio::runtime::Handle,
}

impl StoreCertResolver {
    pub fn new(store: Arc<dyn StoreFacade>, rt: tokio::runtime::Handle) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            rt,
        }
    }

    fn fetch(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let store = self.store.clone();
        let host = host.to_string();
        let result = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    self.rt
                        .block_on(async move { store.read_tls_material(&host).await })
                })
                .join()
        });

        let material = match result {
            Ok(Ok(Some(material))) => material,
            Ok(Ok(None)) => return None,
            _ => {
                warn!(
                    component = "tls",
                    event = "read_tls_material_failed",
                    "failed to read TLS material from store"
                );
                return None;
            }
        };

        build_certified_key(&material.certificate_pem, &material.key_pem)
    }
}

fn build_certified_key(certificate_pem: &str, key_pem: &str) -> Option<Arc<CertifiedKey>> {
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut certificate_pem.as_bytes())
        .ok()?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if certs.is_empty() {
        return None;
    }

    let key_der = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
        .ok()
        .and_then(|mut keys| keys.pop())
        .or_else(|| {
            rustls_pemfile::rsa_private_keys(&mut key_pem.as_bytes())
                .ok()
                .and_then(|mut keys| keys.pop())
        })?;

    let signing_key: Arc<dyn SigningKey> =
        rustls::sign::any_supported_type(&rustls::PrivateKey(key_der)).ok()?;

    Some(Arc::new(CertifiedKey::new(certs, signing_key)))
}

impl ResolvesServerCert for StoreCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?.to_string();

        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(&host) {
                if entry.fetched_at.elapsed() < CACHE_TTL {
                    return entry.key.clone();
                }
            }
        }

        let key = self.fetch(&host);
        self.cache.lock().insert(
            host,
            CachedKey {
                key: key.clone(),
                fetched_at: Instant::now(),
            },
        );
        key
    }
}
