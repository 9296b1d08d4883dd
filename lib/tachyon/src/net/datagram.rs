//! UDP datagram endpoints. All open datagrams are serviced by a single
//! process-wide I/O thread waiting on their sockets plus a waker; incoming
//! payloads are queued as `(sender, payload)` messages, outgoing payloads
//! are queued for transmission with exactly one `send_to` each. Reads are
//! drained before writes on every iteration so the loop keeps consuming
//! input even under heavy send pressure.

use crate::audience::Audience;
use crate::error::{Error, Result};
use crate::net::address::{Address, Family, SocketKind};
use indexmap::IndexMap;
use lazy_static::lazy_static;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use quark::logging::{self, debug, o, warn, Logger};
use std::collections::VecDeque;
use std::io;
use std::net::UdpSocket as StdUdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Datagrams larger than this are not deliverable through this endpoint.
pub const MAX_PAYLOAD: usize = 4096;

const WAKE_TOKEN: Token = Token(0);

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct DatagramMessage {
    pub datagram: Arc<Datagram>,
}

pub struct DatagramError {
    pub datagram: Arc<Datagram>,
    pub code: i32,
    pub message: String,
}

pub struct DatagramWriteFinished {
    pub datagram: Arc<Datagram>,
}

struct QueuedMessage {
    address: Arc<Address>,
    payload: Vec<u8>,
}

struct DatagramState {
    port: u16,
    socket: Option<MioUdpSocket>,
    token: Option<Token>,
    address: Option<Arc<Address>>,
    destination: Option<Arc<Address>>,
    input: VecDeque<QueuedMessage>,
    output: VecDeque<QueuedMessage>,
    want_write: bool,
}

pub struct Datagram {
    self_ref: Weak<Datagram>,
    state: Mutex<DatagramState>,
    all_sent: Condvar,
    message_received: Condvar,
    error: Audience<DatagramError>,
    message: Audience<DatagramMessage>,
    write_finished: Audience<DatagramWriteFinished>,
    log: Logger,
}

impl Datagram {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Arc<Datagram> {
        Arc::new_cyclic(|self_ref| Datagram {
            self_ref: self_ref.clone(),
            state: Mutex::new(DatagramState {
                port: 0,
                socket: None,
                token: None,
                address: None,
                destination: None,
                input: VecDeque::new(),
                output: VecDeque::new(),
                want_write: false,
            }),
            all_sent: Condvar::new(),
            message_received: Condvar::new(),
            error: Audience::new(),
            message: Audience::new(),
            write_finished: Audience::new(),
            log: logging::resolve(log).new(o!("endpoint" => "datagram")),
        })
    }

    pub fn error(&self) -> &Audience<DatagramError> {
        &self.error
    }

    pub fn message(&self) -> &Audience<DatagramMessage> {
        &self.message
    }

    pub fn write_finished(&self) -> &Audience<DatagramWriteFinished> {
        &self.write_finished
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().socket.is_some()
    }

    /// The bound port while open, zero otherwise.
    pub fn port(&self) -> u16 {
        self.state.lock().unwrap().port
    }

    pub fn address(&self) -> Option<Arc<Address>> {
        self.state.lock().unwrap().address.clone()
    }

    /// Total queued output bytes, for callers wanting backpressure.
    pub fn bytes_to_send(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .output
            .iter()
            .map(|msg| msg.payload.len())
            .sum()
    }

    /// Binds an IPv4 UDP socket with broadcast enabled and joins the
    /// shared I/O thread. Port 0 asks the system for a free port.
    pub fn open(&self, port: u16) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.socket.is_some() {
            return Err(Error::InvalidState("datagram is already open"));
        }
        let std_socket = StdUdpSocket::bind(("0.0.0.0", port))?;
        std_socket.set_broadcast(true)?;
        std_socket.set_nonblocking(true)?;
        let bound = std_socket.local_addr()?;
        let mut socket = MioUdpSocket::from_std(std_socket);
        let token = Token(HUB.next_token.fetch_add(1, Ordering::SeqCst));
        HUB.registry
            .register(&mut socket, token, Interest::READABLE)?;
        state.socket = Some(socket);
        state.token = Some(token);
        state.port = bound.port();
        state.address = Some(Address::from_socket_addr(bound, SocketKind::Udp));
        drop(state);

        HUB.members
            .lock()
            .unwrap()
            .insert(token.0, self.self_ref.clone());
        let _ = HUB.waker.wake();
        debug!(self.log, "datagram open"; "port" => bound.port());
        Ok(())
    }

    /// Flushes pending output, leaves the shared I/O thread and closes the
    /// socket.
    pub fn close(&self) {
        self.close_internal(true);
    }

    fn close_internal(&self, wait_flush: bool) {
        if wait_flush {
            self.flush();
        }
        let token = self.state.lock().unwrap().token;
        if let Some(token) = token {
            HUB.members.lock().unwrap().shift_remove(&token.0);
            let _ = HUB.waker.wake();
        }
        let mut state = self.state.lock().unwrap();
        if let Some(mut socket) = state.socket.take() {
            let _ = HUB.registry.deregister(&mut socket);
            debug!(self.log, "datagram closed"; "port" => state.port);
        }
        state.token = None;
        state.port = 0;
        state.want_write = false;
    }

    /// Queues one payload for the destination. Blocks only until the
    /// destination address has finished resolving.
    pub fn send(&self, payload: &[u8], to: &Arc<Address>) -> Result<()> {
        to.wait_for_finished();
        if !to.is_host_found() {
            return Err(Error::HostNotFound);
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.socket.is_none() {
                return Err(Error::InvalidState("datagram is not open"));
            }
            state.output.push_back(QueuedMessage {
                address: to.clone(),
                payload: payload.to_vec(),
            });
        }
        let _ = HUB.waker.wake();
        Ok(())
    }

    /// Sets the default destination used by `write`.
    pub fn connect(&self, address: &Arc<Address>) {
        self.state.lock().unwrap().destination = Some(address.clone());
    }

    /// Clears the default destination.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().destination = None;
    }

    /// Sends to the connected destination.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        let destination = self
            .state
            .lock()
            .unwrap()
            .destination
            .clone()
            .ok_or(Error::InvalidState("datagram has no destination"))?;
        self.send(payload, &destination)
    }

    /// Pops one received message, or `None` when the input queue is empty.
    pub fn receive(&self) -> Option<(Arc<Address>, Vec<u8>)> {
        self.state
            .lock()
            .unwrap()
            .input
            .pop_front()
            .map(|msg| (msg.address, msg.payload))
    }

    /// Waits until a message is queued. Returns false on timeout.
    pub fn wait_for_message(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.input.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .message_received
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        true
    }

    /// Blocks until the output queue has drained.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        while state.socket.is_some() && !state.output.is_empty() {
            state = self.all_sent.wait(state).unwrap();
        }
    }

    /*--- shared I/O thread internals -------------------------------------*/

    fn service_reads(&self) {
        loop {
            enum Outcome {
                Got,
                Empty,
                Failed(io::Error),
            }
            let outcome = {
                let mut state = self.state.lock().unwrap();
                let mut buf = [0u8; MAX_PAYLOAD];
                let received = match &state.socket {
                    Some(socket) => socket.recv_from(&mut buf),
                    None => return,
                };
                match received {
                    Ok((len, sender)) => {
                        let message = QueuedMessage {
                            address: Address::from_socket_addr(sender, SocketKind::Udp),
                            payload: buf[..len].to_vec(),
                        };
                        state.input.push_back(message);
                        Outcome::Got
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Outcome::Empty,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Outcome::Empty,
                    Err(err) => Outcome::Failed(err),
                }
            };
            match outcome {
                Outcome::Got => {
                    self.message_received.notify_all();
                    if let Some(datagram) = self.self_ref.upgrade() {
                        self.message.notify(&DatagramMessage { datagram });
                    }
                }
                Outcome::Empty => return,
                Outcome::Failed(err) => {
                    warn!(self.log, "datagram receive failed"; "error" => %err);
                    self.notify_error(&err);
                    return;
                }
            }
        }
    }

    /// Sends at most one queued message. Returns true when more output
    /// remains ready to send (the hub re-wakes itself for it).
    fn service_write_one(&self) -> bool {
        enum Outcome {
            Sent { drained: bool },
            Blocked,
            Failed(io::Error),
            Idle,
        }
        let outcome = {
            let mut state = self.state.lock().unwrap();
            if state.socket.is_none() {
                return false;
            }
            if state.output.is_empty() {
                // Ready for more output; drop write interest if armed.
                if state.want_write {
                    state.want_write = false;
                    let token = state.token;
                    if let (Some(socket), Some(token)) = (state.socket.as_mut(), token) {
                        let _ = HUB.registry.reregister(socket, token, Interest::READABLE);
                    }
                }
                Outcome::Idle
            } else {
                let message = state.output.pop_front().expect("Output queue is non-empty");
                let endpoint = message.address.first_endpoint(Some(Family::V4));
                match endpoint {
                    None => Outcome::Failed(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "destination has no IPv4 endpoint",
                    )),
                    Some(endpoint) => {
                        let socket = state.socket.as_ref().expect("Datagram is open");
                        match socket.send_to(&message.payload, endpoint) {
                            Ok(_) => Outcome::Sent {
                                drained: state.output.is_empty(),
                            },
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                state.output.push_front(message);
                                if !state.want_write {
                                    state.want_write = true;
                                    let token = state.token;
                                    if let (Some(socket), Some(token)) =
                                        (state.socket.as_mut(), token)
                                    {
                                        let _ = HUB.registry.reregister(
                                            socket,
                                            token,
                                            Interest::READABLE | Interest::WRITABLE,
                                        );
                                    }
                                }
                                Outcome::Blocked
                            }
                            Err(err) => Outcome::Failed(err),
                        }
                    }
                }
            }
        };
        match outcome {
            Outcome::Sent { drained } => {
                if drained {
                    self.all_sent.notify_all();
                    if let Some(datagram) = self.self_ref.upgrade() {
                        self.write_finished.notify(&DatagramWriteFinished { datagram });
                    }
                    false
                } else {
                    true
                }
            }
            Outcome::Blocked => false,
            Outcome::Failed(err) => {
                warn!(self.log, "datagram send failed"; "error" => %err);
                self.notify_error(&err);
                // The message is dropped; the socket stays usable.
                self.all_sent.notify_all();
                !self.state.lock().unwrap().output.is_empty()
            }
            Outcome::Idle => false,
        }
    }

    fn notify_error(&self, err: &io::Error) {
        if let Some(datagram) = self.self_ref.upgrade() {
            self.error.notify(&DatagramError {
                datagram,
                code: err.raw_os_error().unwrap_or(0),
                message: err.to_string(),
            });
        }
    }
}

impl Drop for Datagram {
    fn drop(&mut self) {
        // The shared I/O thread only holds a weak handle and cannot send
        // the remaining queue anymore; skip the flush wait.
        self.close_internal(false);
    }
}

/*--- the shared I/O thread -----------------------------------------------*/

struct Hub {
    registry: Registry,
    waker: Arc<Waker>,
    members: Mutex<IndexMap<usize, Weak<Datagram>>>,
    next_token: AtomicUsize,
}

lazy_static! {
    static ref HUB: Hub = start_hub();
}

fn start_hub() -> Hub {
    let poll = Poll::new().expect("Datagram poll construction failed");
    let registry = poll
        .registry()
        .try_clone()
        .expect("Datagram registry clone failed");
    let waker = Arc::new(
        Waker::new(poll.registry(), WAKE_TOKEN).expect("Datagram waker construction failed"),
    );
    std::thread::Builder::new()
        .name("datagram-io".to_string())
        .spawn(move || run_hub(poll))
        .expect("Datagram I/O thread spawn failed");
    Hub {
        registry,
        waker,
        members: Mutex::new(IndexMap::new()),
        next_token: AtomicUsize::new(1),
    }
}

fn run_hub(mut poll: Poll) {
    let mut events = Events::with_capacity(64);
    loop {
        match poll.poll(&mut events, Some(POLL_INTERVAL)) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
        let mut readable = Vec::new();
        for event in events.iter() {
            if event.token() != WAKE_TOKEN && event.is_readable() {
                readable.push(event.token().0);
            }
        }
        let members: Vec<(usize, Weak<Datagram>)> = {
            let mut members = HUB.members.lock().unwrap();
            members.retain(|_, weak| weak.strong_count() > 0);
            members
                .iter()
                .map(|(key, weak)| (*key, weak.clone()))
                .collect()
        };
        // Drain input first so the loop keeps reading under write load.
        for (key, weak) in &members {
            if readable.contains(key) {
                if let Some(datagram) = weak.upgrade() {
                    datagram.service_reads();
                }
            }
        }
        // One outgoing message per datagram per iteration; re-wake while
        // any queue still has work.
        let mut more_pending = false;
        for (_, weak) in &members {
            if let Some(datagram) = weak.upgrade() {
                if datagram.service_write_one() {
                    more_pending = true;
                }
            }
        }
        if more_pending {
            let _ = HUB.waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close() {
        let datagram = Datagram::new(None);
        assert!(!datagram.is_open());
        datagram.open(0).unwrap();
        assert!(datagram.is_open());
        assert_ne!(datagram.port(), 0);
        assert!(datagram.open(0).is_err());
        datagram.close();
        assert!(!datagram.is_open());
        assert_eq!(datagram.port(), 0);
    }

    #[test]
    fn test_send_requires_open() {
        let datagram = Datagram::new(None);
        let to = Address::resolve(Some("127.0.0.1"), 9, SocketKind::Udp);
        assert!(datagram.send(b"nope", &to).is_err());
    }

    #[test]
    fn test_write_requires_destination() {
        let datagram = Datagram::new(None);
        datagram.open(0).unwrap();
        assert!(datagram.write(b"nowhere").is_err());

        let to = Address::resolve(Some("127.0.0.1"), datagram.port(), SocketKind::Udp);
        datagram.connect(&to);
        datagram.write(b"loop").unwrap();
        datagram.flush();

        datagram.disconnect();
        assert!(datagram.write(b"nowhere").is_err());
        datagram.close();
    }

    #[test]
    fn test_loopback_roundtrip() {
        let receiver = Datagram::new(None);
        receiver.open(0).unwrap();
        let sender = Datagram::new(None);
        sender.open(0).unwrap();

        let to = Address::resolve(Some("127.0.0.1"), receiver.port(), SocketKind::Udp);
        sender.send(b"ping", &to).unwrap();
        sender.flush();

        assert!(receiver.wait_for_message(Duration::from_secs(5)));
        let (from, payload) = receiver.receive().unwrap();
        assert_eq!(payload, b"ping");
        assert_eq!(from.port(), sender.port());
        assert!(receiver.receive().is_none());

        sender.close();
        receiver.close();
    }
}
