//! TLS request coverage against an in-process TLS server.

use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslMethod};
use openssl::x509::X509;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tachyon::tls::{self, CertName, NameField, TlsCertificate, TlsRequest, TlsRequestStatus};
use tachyon::tls::request::{TlsFinished, TlsReadyRead};

// The verify function and session cache are process-wide; TLS tests take
// this lock so they cannot interfere with each other.
static TLS_TEST_LOCK: Mutex<()> = Mutex::new(());

fn server_certificate() -> TlsCertificate {
    let until = quark::time::timestamp_secs() as i64 + 365 * 86_400;
    TlsCertificate::self_signed_rsa(
        2048,
        until,
        &[CertName::both(NameField::CommonName, "localhost")],
    )
    .unwrap()
}

/// A TLS echo-ish server: accepts `connections` handshakes, reads one
/// request chunk, writes `response` and shuts down cleanly.
fn spawn_tls_server(
    cert: &TlsCertificate,
    response: &'static [u8],
    connections: usize,
) -> (u16, JoinHandle<()>) {
    let x509 = X509::from_pem(cert.to_pem().as_bytes()).unwrap();
    let pkey = PKey::private_key_from_pem(cert.private_key_to_pem().as_bytes()).unwrap();
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
    builder.set_private_key(&pkey).unwrap();
    builder.set_certificate(&x509).unwrap();
    let acceptor = builder.build();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = std::thread::spawn(move || {
        for _ in 0..connections {
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(_) => return,
            };
            match acceptor.accept(stream) {
                Ok(mut tls) => {
                    let mut buf = [0u8; 1024];
                    let _ = tls.read(&mut buf);
                    let _ = tls.write_all(response);
                    let _ = tls.shutdown();
                }
                Err(_) => {} // rejected handshakes end up here
            }
        }
    });
    (port, handle)
}

#[test]
fn test_full_exchange() {
    let _guard = TLS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    tls::clear_verify_func();

    let cert = server_certificate();
    let (port, server) = spawn_tls_server(&cert, b"PONG", 1);

    let request = TlsRequest::new(None);
    request.set_host("127.0.0.1", port);
    request.set_content(b"PING");
    request.set_session_cache_enabled(false);
    request.submit();
    request.wait_for_finished();

    assert_eq!(request.status(), TlsRequestStatus::Finished);
    assert_eq!(request.read_all(), b"PONG");
    assert!(request.is_verified());

    let observed = request.server_certificate().expect("server cert captured");
    assert!(observed.equal(&cert));
    assert!(observed.verify_domain("localhost"));

    server.join().unwrap();
}

#[test]
fn test_ready_read_precedes_finished() {
    let _guard = TLS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    tls::clear_verify_func();

    struct EventLog {
        events: Mutex<Vec<&'static str>>,
    }
    impl EventLog {
        fn on_ready_read(this: &Arc<EventLog>, _event: &TlsReadyRead) {
            this.events.lock().unwrap().push("ready_read");
        }
        fn on_finished(this: &Arc<EventLog>, _event: &TlsFinished) {
            this.events.lock().unwrap().push("finished");
        }
    }

    let cert = server_certificate();
    let (port, server) = spawn_tls_server(&cert, b"data flows before completion", 1);

    let log = Arc::new(EventLog {
        events: Mutex::new(Vec::new()),
    });
    let request = TlsRequest::new(None);
    request.ready_read().insert(&log, EventLog::on_ready_read);
    request.finished().insert(&log, EventLog::on_finished);
    request.set_host("127.0.0.1", port);
    request.set_content(b"GET");
    request.set_session_cache_enabled(false);
    request.submit();
    request.wait_for_finished();

    assert_eq!(request.status(), TlsRequestStatus::Finished);
    let events = log.events.lock().unwrap().clone();
    assert!(events.contains(&"ready_read"));
    assert_eq!(events.last(), Some(&"finished"));
    let first_finished = events.iter().position(|e| *e == "finished").unwrap();
    let last_ready = events.iter().rposition(|e| *e == "ready_read").unwrap();
    assert!(last_ready < first_finished);

    server.join().unwrap();
}

#[test]
fn test_session_reuse() {
    let _guard = TLS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    tls::clear_verify_func();

    let cert = server_certificate();
    let (port, server) = spawn_tls_server(&cert, b"SESSIONS", 2);

    let first = TlsRequest::new(None);
    first.set_host("127.0.0.1", port);
    first.set_content(b"ONE");
    first.submit();
    first.wait_for_finished();
    assert_eq!(first.status(), TlsRequestStatus::Finished);
    assert!(!first.session_was_reused());

    let second = TlsRequest::new(None);
    second.set_host("127.0.0.1", port);
    second.set_content(b"TWO");
    second.submit();
    second.wait_for_finished();
    assert_eq!(second.status(), TlsRequestStatus::Finished);
    assert!(second.session_was_reused());
    // The cached server certificate was installed on the request.
    assert!(second.server_certificate().unwrap().equal(&cert));

    server.join().unwrap();
}

#[test]
fn test_verify_rejection() {
    let _guard = TLS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let cert = server_certificate();
    let (port, server) = spawn_tls_server(&cert, b"NEVER SENT", 1);

    tls::set_verify_func(|_request, _cert, _depth| false);

    let request = TlsRequest::new(None);
    request.set_host("127.0.0.1", port);
    request.set_content(b"HELLO");
    request.set_session_cache_enabled(false);
    request.submit();
    request.wait_for_finished();

    assert_eq!(request.status(), TlsRequestStatus::Error);
    assert!(!request.is_verified());
    assert_eq!(request.error_message(), "TLS/SSL handshake failed");
    // The rejected certificate is attached for inspection.
    let rejected = request.server_certificate().expect("rejected cert recorded");
    assert!(rejected.equal(&cert));

    tls::clear_verify_func();
    server.join().unwrap();
}

#[test]
fn test_cancel_during_handshake() {
    let _guard = TLS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    tls::clear_verify_func();

    // Accepts the TCP connection but never speaks TLS, so the handshake
    // stalls until cancelled.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
        let accepted = listener.accept();
        std::thread::sleep(Duration::from_secs(3));
        drop(accepted);
    });

    let request = TlsRequest::new(None);
    request.set_host("127.0.0.1", port);
    request.set_content(b"STALL");
    request.set_session_cache_enabled(false);
    request.submit();
    std::thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    request.cancel();
    request.wait_for_finished();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(request.status(), TlsRequestStatus::Error);
    assert_eq!(request.error_message(), "request cancelled");

    server.join().unwrap();
}
