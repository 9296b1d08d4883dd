//! A full TLS request/response exchange over a `Socket`.
//!
//! `submit` prepares the SSL handle (SNI, client certificate, cached
//! session) and opens a socket; once the socket connects, a dedicated
//! worker thread drives the handshake, encrypts the request payload and
//! decrypts the response. Ciphertext arriving on the socket's I/O thread
//! is appended to an incoming buffer with its own mutex and condition;
//! the worker blocks there, so every `ready_read` notification and the
//! final `finished` fire from the worker thread in order.

use crate::audience::Audience;
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::net::address::Address;
use crate::net::socket::{
    Socket, SocketBytesWritten, SocketConnected, SocketDisconnected, SocketError, SocketReadyRead,
};
use crate::tls::certificate::TlsCertificate;
use crate::tls::context;
use openssl::ssl::{ErrorCode, Ssl, SslSession, SslStream};
use openssl::stack::Stack;
use quark::logging::{self, debug, o, warn, Logger};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

const READ_CHUNK: usize = 8192;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TlsRequestStatus {
    Initialized = 0,
    Submitted = 1,
    Finished = 2,
    Error = 3,
}

fn status_of(raw: u8) -> TlsRequestStatus {
    match raw {
        0 => TlsRequestStatus::Initialized,
        1 => TlsRequestStatus::Submitted,
        2 => TlsRequestStatus::Finished,
        _ => TlsRequestStatus::Error,
    }
}

pub struct TlsReadyRead {
    pub request: Arc<TlsRequest>,
}

pub struct TlsSent {
    pub request: Arc<TlsRequest>,
    pub sent: usize,
    pub to_send: usize,
}

pub struct TlsFinished {
    pub request: Arc<TlsRequest>,
}

struct Incoming {
    buffer: Buffer,
    eof: bool,
}

struct RequestState {
    host: String,
    port: u16,
    content: Vec<u8>,
    client_cert: Option<TlsCertificate>,
    session_cache_enabled: bool,
    socket: Option<Arc<Socket>>,
    worker: Option<JoinHandle<()>>,
    pending_ssl: Option<Ssl>,
    result: Buffer,
    server_cert: Option<TlsCertificate>,
    cert_verify_failed: bool,
    session_reused: bool,
    error_msg: String,
    total_sent: usize,
    total_to_send: usize,
}

pub struct TlsRequest {
    self_ref: Weak<TlsRequest>,
    status: AtomicU8,
    state: Mutex<RequestState>,
    done: Condvar,
    incoming: Mutex<Incoming>,
    got_incoming: Condvar,
    ready_read: Audience<TlsReadyRead>,
    sent: Audience<TlsSent>,
    finished: Audience<TlsFinished>,
    log: Logger,
}

impl TlsRequest {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Arc<TlsRequest> {
        Arc::new_cyclic(|self_ref| TlsRequest {
            self_ref: self_ref.clone(),
            status: AtomicU8::new(TlsRequestStatus::Initialized as u8),
            state: Mutex::new(RequestState {
                host: String::new(),
                port: 0,
                content: Vec::new(),
                client_cert: None,
                session_cache_enabled: true,
                socket: None,
                worker: None,
                pending_ssl: None,
                result: Buffer::new(),
                server_cert: None,
                cert_verify_failed: false,
                session_reused: false,
                error_msg: String::new(),
                total_sent: 0,
                total_to_send: 0,
            }),
            done: Condvar::new(),
            incoming: Mutex::new(Incoming {
                buffer: Buffer::new(),
                eof: false,
            }),
            got_incoming: Condvar::new(),
            ready_read: Audience::new(),
            sent: Audience::new(),
            finished: Audience::new(),
            log: logging::resolve(log).new(o!("request" => "tls")),
        })
    }

    pub fn ready_read(&self) -> &Audience<TlsReadyRead> {
        &self.ready_read
    }

    pub fn sent(&self) -> &Audience<TlsSent> {
        &self.sent
    }

    pub fn finished(&self) -> &Audience<TlsFinished> {
        &self.finished
    }

    pub fn set_host(&self, host: &str, port: u16) {
        let mut state = self.state.lock().unwrap();
        state.host = host.to_string();
        state.port = port;
    }

    pub fn set_content(&self, content: &[u8]) {
        self.state.lock().unwrap().content = content.to_vec();
    }

    pub fn set_certificate(&self, cert: &TlsCertificate) {
        self.state.lock().unwrap().client_cert = Some(cert.clone());
    }

    pub fn set_session_cache_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().session_cache_enabled = enabled;
    }

    pub fn status(&self) -> TlsRequestStatus {
        status_of(self.status.load(Ordering::SeqCst))
    }

    pub fn error_message(&self) -> String {
        self.state.lock().unwrap().error_msg.clone()
    }

    /// False when the user verify function rejected a certificate during
    /// the handshake.
    pub fn is_verified(&self) -> bool {
        !self.state.lock().unwrap().cert_verify_failed
    }

    pub fn server_certificate(&self) -> Option<TlsCertificate> {
        self.state.lock().unwrap().server_cert.clone()
    }

    /// True when the completed exchange resumed a cached session instead
    /// of performing a full handshake.
    pub fn session_was_reused(&self) -> bool {
        self.state.lock().unwrap().session_reused
    }

    pub fn address(&self) -> Option<Arc<Address>> {
        let socket = self.state.lock().unwrap().socket.clone();
        socket.and_then(|socket| socket.address())
    }

    /// Takes everything received and decrypted so far.
    pub fn read_all(&self) -> Vec<u8> {
        self.state.lock().unwrap().result.take_all()
    }

    pub fn received_bytes(&self) -> usize {
        self.state.lock().unwrap().result.len()
    }

    /// Starts the exchange. A no-op when already submitted.
    pub fn submit(&self) {
        if self.status() == TlsRequestStatus::Submitted {
            debug!(self.log, "request already ongoing");
            return;
        }
        let this = match self.self_ref.upgrade() {
            Some(this) => this,
            None => return,
        };
        {
            let mut state = self.state.lock().unwrap();
            state.result.clear();
            state.error_msg.clear();
            state.server_cert = None;
            state.cert_verify_failed = false;
            state.total_sent = 0;
            state.total_to_send = 0;
            state.session_reused = false;
            state.worker = None;
            state.socket = None;
        }
        {
            let mut incoming = self.incoming.lock().unwrap();
            incoming.buffer.clear();
            incoming.eof = false;
        }
        let ssl = match self.prepare_ssl() {
            Ok(ssl) => ssl,
            Err(err) => {
                warn!(self.log, "request setup failed"; "error" => %err);
                self.state.lock().unwrap().error_msg = err.to_string();
                self.status
                    .store(TlsRequestStatus::Error as u8, Ordering::SeqCst);
                self.signal_done();
                self.notify_finished();
                return;
            }
        };
        let (host, port) = {
            let state = self.state.lock().unwrap();
            (state.host.clone(), state.port)
        };
        let socket = Socket::connect_to(&host, port, &self.log);
        socket.connected().insert(&this, Self::on_connected);
        socket.disconnected().insert(&this, Self::on_disconnected);
        socket.ready_read().insert(&this, Self::on_socket_ready_read);
        socket.bytes_written().insert(&this, Self::on_bytes_written);
        socket.error().insert(&this, Self::on_socket_error);
        {
            let mut state = self.state.lock().unwrap();
            state.pending_ssl = Some(ssl);
            state.socket = Some(socket.clone());
        }
        self.status
            .store(TlsRequestStatus::Submitted as u8, Ordering::SeqCst);
        if socket.open().is_err() {
            self.set_error("failed to open connection");
            self.notify_finished();
        }
    }

    /// Forces the request into the error state, closes the socket and
    /// joins the worker thread.
    pub fn cancel(&self) {
        if self
            .status
            .compare_exchange(
                TlsRequestStatus::Submitted as u8,
                TlsRequestStatus::Error as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.state.lock().unwrap().error_msg = "request cancelled".to_string();
            self.signal_done();
            let socket = self.state.lock().unwrap().socket.clone();
            if let Some(socket) = socket {
                socket.close();
            }
        }
        {
            let mut incoming = self.incoming.lock().unwrap();
            incoming.eof = true;
        }
        self.got_incoming.notify_all();
        let worker = self.state.lock().unwrap().worker.take();
        if let Some(handle) = worker {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Blocks until the request reaches `Finished` or `Error`.
    pub fn wait_for_finished(&self) {
        let mut state = self.state.lock().unwrap();
        while self.status() == TlsRequestStatus::Submitted {
            state = self.done.wait(state).unwrap();
        }
    }

    pub(crate) fn record_verify_failure(&self, cert: TlsCertificate) {
        let mut state = self.state.lock().unwrap();
        if state.server_cert.is_none() {
            state.server_cert = Some(cert);
        }
        state.cert_verify_failed = true;
    }

    /*--- submission internals --------------------------------------------*/

    fn prepare_ssl(&self) -> Result<Ssl> {
        let (host, port, client_cert, cache_enabled) = {
            let state = self.state.lock().unwrap();
            (
                state.host.clone(),
                state.port,
                state.client_cert.clone(),
                state.session_cache_enabled,
            )
        };
        if host.is_empty() {
            return Err(Error::InvalidState("request has no host"));
        }
        let mut ssl = context::new_ssl()?;
        context::attach_request(&mut ssl, self.self_ref.clone());
        ssl.set_connect_state();
        ssl.param_mut().set_host(&host)?;
        // SNI carries domain names only, never bracketed IPv6 literals.
        if !host.contains(':') {
            ssl.set_hostname(&host)?;
        }
        if let Some(cert) = &client_cert {
            if let (Some(x509), Some(key)) = (cert.x509(), cert.private_key()) {
                ssl.set_certificate(x509)?;
                ssl.set_private_key(key)?;
            }
        }
        if cache_enabled {
            let hash = client_cert
                .as_ref()
                .map(|cert| cert.fingerprint())
                .unwrap_or_default();
            if let Some((der, cert)) = context::take_reusable_session(&host, port, &hash) {
                if let Ok(session) = SslSession::from_der(&der) {
                    if unsafe { ssl.set_session(&session) }.is_ok() {
                        debug!(self.log, "reusing tls session";
                               "host" => host.clone(), "port" => port);
                        self.state.lock().unwrap().server_cert = Some(cert);
                    }
                }
            }
        }
        Ok(ssl)
    }

    fn on_connected(this: &Arc<TlsRequest>, _event: &SocketConnected) {
        // The socket stays locked during this notification; the TLS
        // exchange needs its own thread.
        let ssl = this.state.lock().unwrap().pending_ssl.take();
        let ssl = match ssl {
            Some(ssl) => ssl,
            None => return,
        };
        let request = this.clone();
        match std::thread::Builder::new()
            .name("tls-request".to_string())
            .spawn(move || request.run_worker(ssl))
        {
            Ok(handle) => {
                this.state.lock().unwrap().worker = Some(handle);
            }
            Err(err) => {
                warn!(this.log, "worker spawn failed"; "error" => %err);
                this.set_error("failed to start TLS worker");
                this.notify_finished();
            }
        }
    }

    fn on_disconnected(this: &Arc<TlsRequest>, _event: &SocketDisconnected) {
        {
            let mut incoming = this.incoming.lock().unwrap();
            incoming.eof = true;
        }
        this.got_incoming.notify_all();
        this.try_finish(TlsRequestStatus::Finished);
    }

    fn on_socket_ready_read(this: &Arc<TlsRequest>, event: &SocketReadyRead) {
        let data = event.socket.read_all();
        if data.is_empty() {
            return;
        }
        {
            let mut incoming = this.incoming.lock().unwrap();
            incoming.buffer.append(&data);
        }
        this.got_incoming.notify_all();
    }

    fn on_bytes_written(this: &Arc<TlsRequest>, event: &SocketBytesWritten) {
        let (sent, to_send) = {
            let mut state = this.state.lock().unwrap();
            state.total_sent += event.count;
            (state.total_sent, state.total_to_send)
        };
        this.sent.notify(&TlsSent {
            request: this.clone(),
            sent,
            to_send,
        });
    }

    fn on_socket_error(this: &Arc<TlsRequest>, event: &SocketError) {
        let had_worker = this.state.lock().unwrap().worker.is_some();
        this.set_error(&event.message);
        {
            let mut incoming = this.incoming.lock().unwrap();
            incoming.eof = true;
        }
        this.got_incoming.notify_all();
        if !had_worker {
            this.notify_finished();
        }
    }

    /*--- the worker thread ------------------------------------------------*/

    fn run_worker(self: Arc<TlsRequest>, ssl: Ssl) {
        let (host, port, content, client_hash) = {
            let state = self.state.lock().unwrap();
            let hash = state
                .client_cert
                .as_ref()
                .map(|cert| cert.fingerprint())
                .unwrap_or_default();
            (state.host.clone(), state.port, state.content.clone(), hash)
        };
        debug!(self.log, "tls worker started"; "bytes_to_send" => content.len());
        let socket = match self.state.lock().unwrap().socket.clone() {
            Some(socket) => socket,
            None => {
                self.try_finish(TlsRequestStatus::Finished);
                self.notify_finished();
                return;
            }
        };
        let transport = Transport {
            request: self.clone(),
            socket,
        };
        let mut tls = match SslStream::new(ssl, transport) {
            Ok(tls) => tls,
            Err(err) => {
                warn!(self.log, "ssl stream setup failed"; "error" => %err);
                self.set_error("TLS/SSL handshake failed");
                self.notify_finished();
                return;
            }
        };
        match tls.do_handshake() {
            Ok(()) => {
                self.state.lock().unwrap().session_reused = tls.ssl().session_reused();
                self.run_exchange(&mut tls, &content);
            }
            Err(err) => {
                if self.status() == TlsRequestStatus::Submitted {
                    debug!(self.log, "handshake failed"; "error" => %err);
                    self.set_error("TLS/SSL handshake failed");
                }
            }
        }
        if !tls.ssl().session_reused() && self.status() != TlsRequestStatus::Error {
            let server_cert = self.state.lock().unwrap().server_cert.clone();
            if let (Some(session), Some(cert)) = (tls.ssl().session(), server_cert) {
                if let Ok(der) = session.to_der() {
                    context::save_session(&host, port, der, &cert, client_hash);
                    debug!(self.log, "saved tls session";
                           "host" => host.clone(), "port" => port);
                }
            }
        }
        self.try_finish(TlsRequestStatus::Finished);
        self.notify_finished();
        debug!(self.log, "tls worker finished"; "status" => ?self.status());
    }

    fn run_exchange(&self, tls: &mut SslStream<Transport>, content: &[u8]) {
        // The handshake is done; capture the server certificate unless a
        // cached session already provided it.
        {
            let mut state = self.state.lock().unwrap();
            if state.server_cert.is_none() {
                if let Some(peer) = tls.ssl().peer_certificate() {
                    let chain = tls.ssl().peer_cert_chain().map(|chain| {
                        let mut copy = Stack::new().expect("X509 stack allocation failed");
                        for link in chain.iter() {
                            copy.push(link.to_owned()).expect("X509 stack push failed");
                        }
                        copy
                    });
                    state.server_cert = Some(TlsCertificate::from_x509(peer, chain));
                }
            }
        }
        if !content.is_empty() && self.status() == TlsRequestStatus::Submitted {
            if tls.write_all(content).is_err() && self.status() == TlsRequestStatus::Submitted {
                self.set_error("failure to encrypt data");
            }
        }
        let mut chunk = [0u8; READ_CHUNK];
        while self.status() == TlsRequestStatus::Submitted {
            match tls.ssl_read(&mut chunk) {
                Ok(0) => {
                    self.try_finish(TlsRequestStatus::Finished);
                    break;
                }
                Ok(count) => {
                    self.append_result(&chunk[..count]);
                    self.notify_ready_read();
                }
                Err(err) => {
                    self.handle_read_error(&err);
                    break;
                }
            }
        }
        // The peer may close the socket before the worker has decrypted
        // everything buffered; drain the leftovers.
        if self.status() == TlsRequestStatus::Finished {
            loop {
                match tls.ssl_read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(count) => {
                        self.append_result(&chunk[..count]);
                        self.notify_ready_read();
                    }
                }
            }
        }
    }

    fn handle_read_error(&self, err: &openssl::ssl::Error) {
        match err.code() {
            ErrorCode::ZERO_RETURN => {
                self.try_finish(TlsRequestStatus::Finished);
            }
            ErrorCode::SYSCALL if err.io_error().is_none() => {
                // Peer closed without a close_notify.
                self.try_finish(TlsRequestStatus::Finished);
            }
            _ => {
                let eof = err
                    .io_error()
                    .map_or(false, |io_err| io_err.kind() == io::ErrorKind::UnexpectedEof);
                if eof {
                    self.try_finish(TlsRequestStatus::Finished);
                } else if self.status() == TlsRequestStatus::Submitted {
                    debug!(self.log, "decrypt failed"; "error" => %err);
                    self.set_error("error while decrypting incoming data");
                }
            }
        }
    }

    fn append_result(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.result.append(bytes);
    }

    /*--- status plumbing ---------------------------------------------------*/

    fn try_finish(&self, to: TlsRequestStatus) -> bool {
        let changed = self
            .status
            .compare_exchange(
                TlsRequestStatus::Submitted as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if changed {
            self.signal_done();
        }
        changed
    }

    fn set_error(&self, msg: &str) {
        if self
            .status
            .compare_exchange(
                TlsRequestStatus::Submitted as u8,
                TlsRequestStatus::Error as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.state.lock().unwrap().error_msg = msg.to_string();
            self.signal_done();
        }
    }

    fn signal_done(&self) {
        {
            let _guard = self.state.lock().unwrap();
            self.done.notify_all();
        }
        {
            let _guard = self.incoming.lock().unwrap();
            self.got_incoming.notify_all();
        }
    }

    fn notify_ready_read(&self) {
        if let Some(request) = self.self_ref.upgrade() {
            self.ready_read.notify(&TlsReadyRead { request });
        }
    }

    fn notify_finished(&self) {
        if let Some(request) = self.self_ref.upgrade() {
            self.finished.notify(&TlsFinished { request });
        }
    }
}

impl Drop for TlsRequest {
    fn drop(&mut self) {
        {
            let mut incoming = self.incoming.lock().unwrap();
            incoming.eof = true;
        }
        self.got_incoming.notify_all();
        let (socket, worker) = {
            let mut state = self.state.lock().unwrap();
            (state.socket.take(), state.worker.take())
        };
        if let Some(socket) = socket {
            socket.close();
        }
        if let Some(handle) = worker {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/*--- the socket bridge ----------------------------------------------------*/

/// Blocking transport between the TLS engine and the socket. Reads pull
/// ciphertext from the incoming buffer, waiting on its condition until
/// bytes arrive or the exchange ends; writes append ciphertext to the
/// socket's output buffer and never block.
struct Transport {
    request: Arc<TlsRequest>,
    socket: Arc<Socket>,
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut incoming = self.request.incoming.lock().unwrap();
        loop {
            if !incoming.buffer.is_empty() {
                return Ok(incoming.buffer.consume_into(buf));
            }
            if incoming.eof || self.request.status() != TlsRequestStatus::Submitted {
                return Ok(0);
            }
            incoming = self.request.got_incoming.wait(incoming).unwrap();
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut state = self.request.state.lock().unwrap();
            state.total_to_send += buf.len();
        }
        self.socket.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let request = TlsRequest::new(None);
        assert_eq!(request.status(), TlsRequestStatus::Initialized);
        assert!(request.is_verified());
        assert!(request.error_message().is_empty());
        assert!(request.server_certificate().is_none());
        assert_eq!(request.received_bytes(), 0);
    }

    #[test]
    fn test_submit_without_host_is_an_error() {
        let request = TlsRequest::new(None);
        request.submit();
        assert_eq!(request.status(), TlsRequestStatus::Error);
        assert!(!request.error_message().is_empty());
        // waitForFinished must not block on a failed submission.
        request.wait_for_finished();
    }

    #[test]
    fn test_cancel_before_submit_is_a_no_op() {
        let request = TlsRequest::new(None);
        request.cancel();
        assert_eq!(request.status(), TlsRequestStatus::Initialized);
    }

    #[test]
    fn test_setters() {
        let request = TlsRequest::new(None);
        request.set_host("example.org", 443);
        request.set_content(b"GET / HTTP/1.0\r\n\r\n");
        request.set_session_cache_enabled(false);
        let state = request.state.lock().unwrap();
        assert_eq!(state.host, "example.org");
        assert_eq!(state.port, 443);
        assert!(!state.session_cache_enabled);
    }
}
