//! Process-wide TLS state: the shared `SslContext` with its verify
//! callback, the certificate trust store, the user verify function and
//! the session cache. Everything is lazily initialized on first TLS use.

use crate::error::Result;
use crate::tls::certificate::{TlsCertificate, VerifyStatus};
use crate::tls::request::TlsRequest;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use openssl::ex_data::Index;
use openssl::ssl::{Ssl, SslContext, SslMethod, SslOptions, SslSessionCacheMode, SslVerifyMode};
use openssl::stack::{Stack, StackRef};
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::{X509, X509StoreContext, X509StoreContextRef, X509VerifyResult};
use quark::logging::{self, debug, warn};
use quark::time::timestamp_secs;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

/// Cached sessions expire after ten minutes.
const MAX_SESSION_AGE_SECS: u64 = 10 * 60;

pub type VerifyFn = Arc<dyn Fn(&Arc<TlsRequest>, &TlsCertificate, u32) -> bool + Send + Sync>;

pub(crate) struct CachedSession {
    session_der: Vec<u8>,
    timestamp: u64,
    cert: TlsCertificate,
    client_hash: Vec<u8>,
}

struct TlsContext {
    ssl: Mutex<SslContext>,
    ciphers: Mutex<Option<String>>,
    request_index: Index<Ssl, Weak<TlsRequest>>,
    cert_store: Mutex<Option<X509Store>>,
    verify_fn: Mutex<Option<VerifyFn>>,
    cache: Mutex<HashMap<String, CachedSession>>,
}

lazy_static! {
    static ref CONTEXT: TlsContext = TlsContext {
        ssl: Mutex::new(
            build_ssl_context(None).expect("OpenSSL client context initialization failed")
        ),
        ciphers: Mutex::new(None),
        request_index: Ssl::new_ex_index().expect("SSL ex-data index allocation failed"),
        cert_store: Mutex::new(None),
        verify_fn: Mutex::new(None),
        cache: Mutex::new(HashMap::new()),
    };
}

fn build_ssl_context(ciphers: Option<&str>) -> Result<SslContext> {
    let mut builder = SslContext::builder(SslMethod::tls_client())?;
    builder.set_verify_callback(SslVerifyMode::PEER, verify_callback);
    // Interoperability workarounds, as recommended for clients talking to
    // arbitrary servers.
    builder.set_options(SslOptions::ALL);
    builder.set_session_cache_mode(
        SslSessionCacheMode::CLIENT | SslSessionCacheMode::NO_INTERNAL_STORE,
    );
    if let Some(list) = ciphers {
        builder.set_cipher_list(list)?;
    }
    Ok(builder.build())
}

fn verify_callback(preverify_ok: bool, ctx: &mut X509StoreContextRef) -> bool {
    if preverify_ok {
        return true;
    }
    let user = CONTEXT.verify_fn.lock().unwrap().clone();
    let user = match user {
        Some(user) => user,
        // Without a user verify function the pre-verification result is
        // advisory only.
        None => return true,
    };
    let request = match current_request(ctx) {
        Some(request) => request,
        None => return true,
    };
    let depth = ctx.error_depth();
    let cert = match ctx.current_cert() {
        Some(cert) => cert.to_owned(),
        None => return true,
    };
    let cert = TlsCertificate::from_x509(cert, None);
    let accepted = user(&request, &cert, depth);
    if !accepted {
        request.record_verify_failure(cert);
    }
    accepted
}

/// The request driving the handshake, recovered through the SSL object's
/// ex-data slot.
fn current_request(ctx: &X509StoreContextRef) -> Option<Arc<TlsRequest>> {
    let ssl_index = X509StoreContext::ssl_idx().ok()?;
    let ssl = ctx.ex_data(ssl_index)?;
    let weak = ssl.ex_data(CONTEXT.request_index)?;
    weak.upgrade()
}

/*--- public configuration surface ----------------------------------------*/

/// Replaces the trust store with certificates loaded from a PEM bundle
/// file and/or a directory of PEM files.
pub fn set_ca_certificates(file: Option<&Path>, dir: Option<&Path>) -> Result<()> {
    let log = logging::process();
    let mut builder = X509StoreBuilder::new()?;
    if let Some(file) = file {
        let data = std::fs::read(file)?;
        for cert in X509::stack_from_pem(&data)? {
            builder.add_cert(cert)?;
        }
    }
    if let Some(dir) = dir {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_pem = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| matches!(ext, "pem" | "crt" | "cer"));
            if !is_pem {
                continue;
            }
            let data = std::fs::read(&path)?;
            match X509::stack_from_pem(&data) {
                Ok(certs) => {
                    for cert in certs {
                        builder.add_cert(cert)?;
                    }
                }
                Err(err) => {
                    warn!(log, "skipping unparseable CA file";
                          "path" => path.display().to_string(), "error" => %err);
                }
            }
        }
    }
    *CONTEXT.cert_store.lock().unwrap() = Some(builder.build());
    Ok(())
}

/// Installs the user verify function consulted when OpenSSL's own
/// pre-verification rejects a certificate.
pub fn set_verify_func<F>(verify: F)
where
    F: Fn(&Arc<TlsRequest>, &TlsCertificate, u32) -> bool + Send + Sync + 'static,
{
    *CONTEXT.verify_fn.lock().unwrap() = Some(Arc::new(verify));
}

pub fn clear_verify_func() {
    *CONTEXT.verify_fn.lock().unwrap() = None;
}

/// Restricts the cipher list used by subsequent requests.
pub fn set_ciphers(cipher_list: &str) -> Result<()> {
    let rebuilt = build_ssl_context(Some(cipher_list))?;
    *CONTEXT.ciphers.lock().unwrap() = Some(cipher_list.to_string());
    *CONTEXT.ssl.lock().unwrap() = rebuilt;
    Ok(())
}

/// Name of the TLS implementation backing the library.
pub fn library_name() -> &'static str {
    if openssl::version::version().contains("LibreSSL") {
        "LibreSSL"
    } else {
        "OpenSSL"
    }
}

/// Applies the TLS-relevant parts of a library configuration.
pub fn configure(config: &quark::Config) -> Result<()> {
    if config.ca_file.is_some() || config.ca_path.is_some() {
        set_ca_certificates(config.ca_file.as_deref(), config.ca_path.as_deref())?;
    }
    Ok(())
}

/*--- crate-internal services ----------------------------------------------*/

pub(crate) fn new_ssl() -> Result<Ssl> {
    let ctx = CONTEXT.ssl.lock().unwrap().clone();
    Ok(Ssl::new(&ctx)?)
}

pub(crate) fn attach_request(ssl: &mut Ssl, request: Weak<TlsRequest>) {
    ssl.set_ex_data(CONTEXT.request_index, request);
}

/// Verifies a certificate (and optional chain) against the configured
/// trust store and classifies the outcome.
pub(crate) fn verify_with_store(cert: &X509, chain: Option<&Stack<X509>>) -> VerifyStatus {
    let store_guard = CONTEXT.cert_store.lock().unwrap();
    let outcome: std::result::Result<bool, openssl::error::ErrorStack> = (|| {
        let empty;
        let chain_ref: &StackRef<X509> = match chain {
            Some(chain) => chain,
            None => {
                empty = Stack::new()?;
                &empty
            }
        };
        let mut ctx = X509StoreContext::new()?;
        match &*store_guard {
            Some(store) => ctx.init(store, cert, chain_ref, |c| c.verify_cert()),
            None => {
                let store = X509StoreBuilder::new()?.build();
                ctx.init(&store, cert, chain_ref, |c| c.verify_cert())
            }
        }
    })();
    match outcome {
        Ok(true) => VerifyStatus::Authority,
        _ => {
            let self_issued = cert.issued(cert) == X509VerifyResult::OK;
            let self_signed = self_issued
                && cert
                    .public_key()
                    .and_then(|key| cert.verify(&key))
                    .unwrap_or(false);
            if self_signed {
                VerifyStatus::SelfSigned
            } else {
                VerifyStatus::Unverified
            }
        }
    }
}

fn cache_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// Evicts stale sessions, then returns the serialized session and the
/// previously observed server certificate for the key, provided the
/// client-certificate fingerprint matches byte for byte.
pub(crate) fn take_reusable_session(
    host: &str,
    port: u16,
    client_hash: &[u8],
) -> Option<(Vec<u8>, TlsCertificate)> {
    let log = logging::process();
    let now = timestamp_secs();
    let mut cache = CONTEXT.cache.lock().unwrap();
    cache.retain(|key, entry| {
        let keep = now.saturating_sub(entry.timestamp) <= MAX_SESSION_AGE_SECS;
        if !keep {
            debug!(log, "tls session expired"; "key" => key.clone());
        }
        keep
    });
    let entry = cache.get(&cache_key(host, port))?;
    if entry.client_hash != client_hash {
        return None;
    }
    Some((entry.session_der.clone(), entry.cert.clone()))
}

/// Inserts or replaces the session for `host:port`.
pub(crate) fn save_session(
    host: &str,
    port: u16,
    session_der: Vec<u8>,
    cert: &TlsCertificate,
    client_hash: Vec<u8>,
) {
    if cert.is_empty() {
        return;
    }
    let mut cache = CONTEXT.cache.lock().unwrap();
    cache.insert(
        cache_key(host, port),
        CachedSession {
            session_der,
            timestamp: timestamp_secs(),
            cert: cert.clone(),
            client_hash,
        },
    );
}

#[cfg(test)]
pub(crate) fn cached_session_exists(host: &str, port: u16) -> bool {
    CONTEXT
        .cache
        .lock()
        .unwrap()
        .contains_key(&cache_key(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::certificate::{CertName, NameField};

    fn test_cert() -> TlsCertificate {
        let until = quark::time::timestamp_secs() as i64 + 86_400;
        TlsCertificate::self_signed_rsa(
            2048,
            until,
            &[CertName::both(NameField::CommonName, "cache-test")],
        )
        .unwrap()
    }

    #[test]
    fn test_session_roundtrip_and_hash_scoping() {
        let cert = test_cert();
        save_session("alpha.test", 443, vec![1, 2, 3], &cert, vec![9, 9]);

        // Matching fingerprint.
        let (der, cached_cert) = take_reusable_session("alpha.test", 443, &[9, 9]).unwrap();
        assert_eq!(der, vec![1, 2, 3]);
        assert!(cached_cert.equal(&cert));

        // A different client identity must not reuse the session.
        assert!(take_reusable_session("alpha.test", 443, &[]).is_none());
        // Different port is a different bucket.
        assert!(take_reusable_session("alpha.test", 444, &[9, 9]).is_none());
    }

    #[test]
    fn test_session_eviction_after_max_age() {
        let cert = test_cert();
        save_session("beta.test", 443, vec![7], &cert, Vec::new());
        assert!(cached_session_exists("beta.test", 443));

        {
            let mut cache = CONTEXT.cache.lock().unwrap();
            let entry = cache.get_mut(&cache_key("beta.test", 443)).unwrap();
            entry.timestamp = timestamp_secs() - MAX_SESSION_AGE_SECS - 1;
        }

        assert!(take_reusable_session("beta.test", 443, &[]).is_none());
        assert!(!cached_session_exists("beta.test", 443));
    }

    #[test]
    fn test_empty_server_cert_is_not_cached() {
        save_session("gamma.test", 443, vec![1], &TlsCertificate::empty(), Vec::new());
        assert!(!cached_session_exists("gamma.test", 443));
    }

    #[test]
    fn test_library_name() {
        let name = library_name();
        assert!(name == "OpenSSL" || name == "LibreSSL");
    }

    #[test]
    fn test_store_classification() {
        let cert = test_cert();
        assert_eq!(cert.verify(), VerifyStatus::SelfSigned);
    }
}
