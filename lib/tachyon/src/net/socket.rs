//! TCP socket with a background I/O thread.
//!
//! A socket owns its `Address`, an output buffer of bytes awaiting
//! transmission and an input buffer of received bytes. While connected, a
//! dedicated thread polls the stream for readiness and a waker raised by
//! writers; every state transition notifies the corresponding audience at
//! most once, and the `all_sent` condition is signalled whenever the
//! output buffer drains.

use crate::audience::Audience;
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::net::address::{Address, LookupFinished, SocketKind};
use crate::stream::{ByteOrder, Stream};
use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use quark::logging::{self, debug, o, warn, Logger};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// One send chunk per write pass; the receive scratch is larger so a busy
// peer can be drained in few syscalls.
const SEND_CHUNK: usize = 0x10000;
const RECV_SCRATCH: usize = 0x20000;

const STREAM_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

// Poll timeout; doubles as the liveness check for a socket whose handles
// were dropped without close().
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketStatus {
    AddressLookup,
    Initialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub struct SocketConnected {
    pub socket: Arc<Socket>,
}

pub struct SocketDisconnected {
    pub socket: Arc<Socket>,
}

pub struct SocketError {
    pub socket: Arc<Socket>,
    pub code: i32,
    pub message: String,
}

pub struct SocketReadyRead {
    pub socket: Arc<Socket>,
}

pub struct SocketBytesWritten {
    pub socket: Arc<Socket>,
    pub count: usize,
}

pub struct SocketWriteFinished {
    pub socket: Arc<Socket>,
}

struct IoHandle {
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

struct SocketState {
    status: SocketStatus,
    address: Option<Arc<Address>>,
    output: Buffer,
    input: Buffer,
    // Connected stream awaiting hand-off to the I/O thread.
    pending_stream: Option<MioTcpStream>,
    io: Option<IoHandle>,
    connecting: Option<JoinHandle<()>>,
}

pub struct Socket {
    self_ref: Weak<Socket>,
    state: Mutex<SocketState>,
    all_sent: Condvar,
    data_available: Condvar,
    little_endian: AtomicBool,
    connected: Audience<SocketConnected>,
    disconnected: Audience<SocketDisconnected>,
    error: Audience<SocketError>,
    ready_read: Audience<SocketReadyRead>,
    bytes_written: Audience<SocketBytesWritten>,
    write_finished: Audience<SocketWriteFinished>,
    log: Logger,
}

enum WriteOutcome {
    Idle,
    Blocked,
    Failed(io::Error),
}

enum ReadOutcome {
    Open,
    PeerClosed,
    Failed(io::Error),
}

impl Socket {
    /// A socket that resolves `host:port` and can then be opened. Starts
    /// in the `AddressLookup` state until resolution completes.
    pub fn connect_to<'a, L: Into<Option<&'a Logger>>>(
        host: &str,
        port: u16,
        log: L,
    ) -> Arc<Socket> {
        let log = logging::resolve(log).new(o!("host" => host.to_string(), "port" => port));
        let socket = Self::empty(SocketStatus::AddressLookup, log);
        let address = Address::new();
        address
            .lookup_finished()
            .insert(&socket, Socket::on_lookup_finished);
        socket.state.lock().unwrap().address = Some(address.clone());
        address.lookup(Some(host), port, SocketKind::Tcp);
        socket
    }

    /// A socket over an already-created address. Blocks until any pending
    /// lookup on the address finishes.
    pub fn with_address<'a, L: Into<Option<&'a Logger>>>(
        address: &Arc<Address>,
        log: L,
    ) -> Arc<Socket> {
        address.wait_for_finished();
        let log = logging::resolve(log).new(o!("address" => address.to_string()));
        let socket = Self::empty(SocketStatus::Initialized, log);
        socket.state.lock().unwrap().address = Some(address.clone());
        socket
    }

    /// Wraps an already-accepted connection: no lookup, no connect, the
    /// I/O thread starts immediately.
    pub fn from_accepted<'a, L: Into<Option<&'a Logger>>>(
        stream: MioTcpStream,
        peer: SocketAddr,
        log: L,
    ) -> Arc<Socket> {
        let log = logging::resolve(log).new(o!("peer" => peer.to_string()));
        let socket = Self::empty(SocketStatus::Connected, log);
        {
            let mut state = socket.state.lock().unwrap();
            state.address = Some(Address::from_socket_addr(peer, SocketKind::Tcp));
            state.pending_stream = Some(stream);
            Self::start_io(&socket, &mut state);
        }
        socket
    }

    fn empty(status: SocketStatus, log: Logger) -> Arc<Socket> {
        Arc::new_cyclic(|self_ref| Socket {
            self_ref: self_ref.clone(),
            state: Mutex::new(SocketState {
                status,
                address: None,
                output: Buffer::new(),
                input: Buffer::new(),
                pending_stream: None,
                io: None,
                connecting: None,
            }),
            all_sent: Condvar::new(),
            data_available: Condvar::new(),
            little_endian: AtomicBool::new(false),
            connected: Audience::new(),
            disconnected: Audience::new(),
            error: Audience::new(),
            ready_read: Audience::new(),
            bytes_written: Audience::new(),
            write_finished: Audience::new(),
            log,
        })
    }

    pub fn connected(&self) -> &Audience<SocketConnected> {
        &self.connected
    }

    pub fn disconnected(&self) -> &Audience<SocketDisconnected> {
        &self.disconnected
    }

    pub fn error(&self) -> &Audience<SocketError> {
        &self.error
    }

    pub fn ready_read(&self) -> &Audience<SocketReadyRead> {
        &self.ready_read
    }

    pub fn bytes_written(&self) -> &Audience<SocketBytesWritten> {
        &self.bytes_written
    }

    pub fn write_finished(&self) -> &Audience<SocketWriteFinished> {
        &self.write_finished
    }

    pub fn status(&self) -> SocketStatus {
        self.state.lock().unwrap().status
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status(),
            SocketStatus::Connecting | SocketStatus::Connected
        )
    }

    pub fn address(&self) -> Option<Arc<Address>> {
        self.state.lock().unwrap().address.clone()
    }

    pub fn bytes_to_send(&self) -> usize {
        self.state.lock().unwrap().output.len()
    }

    pub fn received_bytes(&self) -> usize {
        self.state.lock().unwrap().input.len()
    }

    /// Begins connecting. If the address is still resolving, the socket
    /// moves to `Connecting` and the connect proceeds when resolution
    /// finishes; otherwise a transient worker performs the blocking
    /// connect against the first resolved endpoint.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.status {
            SocketStatus::Connecting | SocketStatus::Connected => {
                return Err(Error::InvalidState("socket is already open"))
            }
            SocketStatus::Disconnecting => {
                return Err(Error::InvalidState("socket is closing"))
            }
            _ => {}
        }
        let address = state
            .address
            .clone()
            .ok_or(Error::InvalidState("socket has no address"))?;
        if address.is_pending() {
            self.set_status(&mut state, SocketStatus::Connecting);
            return Ok(());
        }
        if !address.is_host_found() {
            return Err(Error::HostNotFound);
        }
        self.begin_connect(&mut state)
    }

    fn on_lookup_finished(this: &Arc<Socket>, _event: &LookupFinished) {
        let mut state = this.state.lock().unwrap();
        match state.status {
            SocketStatus::AddressLookup => {
                this.set_status(&mut state, SocketStatus::Initialized);
            }
            SocketStatus::Connecting => {
                if let Err(err) = this.begin_connect(&mut state) {
                    this.set_status(&mut state, SocketStatus::Disconnected);
                    drop(state);
                    this.notify_error(0, &err.to_string());
                }
            }
            _ => {}
        }
    }

    fn begin_connect(&self, state: &mut SocketState) -> Result<()> {
        self.set_status(state, SocketStatus::Connecting);
        let socket = self
            .self_ref
            .upgrade()
            .expect("Sockets are always handled through their Arc");
        let handle = std::thread::Builder::new()
            .name("socket-connect".to_string())
            .spawn(move || socket.run_connect())
            .map_err(Error::from)?;
        state.connecting = Some(handle);
        Ok(())
    }

    fn run_connect(self: Arc<Socket>) {
        let endpoint = self
            .address()
            .and_then(|address| address.first_endpoint(None));
        let connected = match endpoint {
            Some(endpoint) => StdTcpStream::connect(endpoint).and_then(|stream| {
                stream.set_nonblocking(true)?;
                Ok(MioTcpStream::from_std(stream))
            }),
            None => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "address lookup produced no endpoints",
            )),
        };
        match connected {
            Ok(stream) => {
                let mut state = self.state.lock().unwrap();
                // Detach; this thread is about to exit.
                state.connecting.take();
                if state.status != SocketStatus::Connecting {
                    return; // closed during connect
                }
                self.set_status(&mut state, SocketStatus::Connected);
                state.pending_stream = Some(stream);
                Self::start_io(&self, &mut state);
                drop(state);
                self.notify_connected();
            }
            Err(err) => {
                warn!(self.log, "connection failed"; "error" => %err);
                let notify = {
                    let mut state = self.state.lock().unwrap();
                    state.connecting.take();
                    if state.status == SocketStatus::Connecting {
                        self.set_status(&mut state, SocketStatus::Disconnected);
                        true
                    } else {
                        false
                    }
                };
                if notify {
                    self.notify_error(err.raw_os_error().unwrap_or(0), &err.to_string());
                }
            }
        }
    }

    fn start_io(this: &Arc<Socket>, state: &mut SocketState) {
        let mut stream = state
            .pending_stream
            .take()
            .expect("Connected socket must hold its stream");
        let poll = Poll::new().expect("Readiness poll construction failed");
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKE_TOKEN).expect("Readiness waker construction failed"),
        );
        poll.registry()
            .register(&mut stream, STREAM_TOKEN, Interest::READABLE)
            .expect("Stream registration failed");
        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(this);
        let stop_flag = stop.clone();
        let join = std::thread::Builder::new()
            .name("socket-io".to_string())
            .spawn(move || run_io(weak, poll, stream, stop_flag))
            .expect("Socket I/O thread spawn failed");
        state.io = Some(IoHandle {
            waker,
            stop,
            join: Some(join),
        });
    }

    /// Appends to the output buffer and kicks the I/O thread.
    pub fn write_bytes(&self, bytes: &[u8]) {
        let waker = {
            let mut state = self.state.lock().unwrap();
            state.output.append(bytes);
            state.io.as_ref().map(|io| io.waker.clone())
        };
        if let Some(waker) = waker {
            let _ = waker.wake();
        }
    }

    /// Takes everything from the input buffer.
    pub fn read_all(&self) -> Vec<u8> {
        self.state.lock().unwrap().input.take_all()
    }

    /// Blocks until every buffered output byte has been handed to the
    /// network, the socket disconnects, or there is no I/O thread to do
    /// the sending.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.output.is_empty()
            && state.status == SocketStatus::Connected
            && state.io.is_some()
        {
            state = self.all_sent.wait(state).unwrap();
        }
    }

    /// Waits until received data is available. Returns false on timeout or
    /// when the socket has disconnected with an empty input buffer.
    pub fn wait_for_ready_read(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.input.is_empty() {
            if state.status == SocketStatus::Disconnected {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .data_available
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        true
    }

    /// Closes the connection: flushes pending output while the I/O thread
    /// is alive, stops and joins it, and transitions to `Disconnected`.
    /// Safe to call from any thread except the socket's own I/O thread;
    /// a no-op when already disconnecting or disconnected.
    pub fn close(&self) {
        self.close_internal(true);
    }

    fn close_internal(&self, wait_flush: bool) {
        let connecting = self.state.lock().unwrap().connecting.take();
        if let Some(handle) = connecting {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        let io = {
            let mut state = self.state.lock().unwrap();
            match state.status {
                SocketStatus::Disconnected | SocketStatus::Disconnecting => {
                    state.io.take();
                    return;
                }
                SocketStatus::Connected => {
                    while wait_flush
                        && !state.output.is_empty()
                        && state.status == SocketStatus::Connected
                        && state.io.is_some()
                    {
                        state = self.all_sent.wait(state).unwrap();
                    }
                    if state.status != SocketStatus::Disconnected {
                        self.set_status(&mut state, SocketStatus::Disconnecting);
                    }
                    state.io.take()
                }
                _ => {
                    self.set_status(&mut state, SocketStatus::Disconnecting);
                    state.io.take()
                }
            }
        };
        if let Some(mut io) = io {
            io.stop.store(true, Ordering::SeqCst);
            let _ = io.waker.wake();
            if let Some(join) = io.join.take() {
                if join.thread().id() != std::thread::current().id() {
                    let _ = join.join();
                }
            }
        }
        let notify = {
            let mut state = self.state.lock().unwrap();
            self.set_status(&mut state, SocketStatus::Disconnected)
        };
        self.all_sent.notify_all();
        self.data_available.notify_all();
        if notify {
            self.notify_disconnected();
        }
    }

    fn set_status(&self, state: &mut SocketState, status: SocketStatus) -> bool {
        if state.status != status {
            debug!(self.log, "socket state changed";
                   "from" => ?state.status, "to" => ?status);
            state.status = status;
            true
        } else {
            false
        }
    }

    fn this(&self) -> Option<Arc<Socket>> {
        self.self_ref.upgrade()
    }

    fn notify_connected(&self) {
        if let Some(socket) = self.this() {
            self.connected.notify(&SocketConnected { socket });
        }
    }

    fn notify_disconnected(&self) {
        if let Some(socket) = self.this() {
            self.disconnected.notify(&SocketDisconnected { socket });
        }
    }

    fn notify_error(&self, code: i32, message: &str) {
        if let Some(socket) = self.this() {
            self.error.notify(&SocketError {
                socket,
                code,
                message: message.to_string(),
            });
        }
    }

    /*--- I/O thread internals --------------------------------------------*/

    /// One write pass: drain the output buffer in 64 KiB chunks, emitting
    /// `bytes_written` per chunk and `write_finished`/`all_sent` when the
    /// buffer empties.
    fn service_output(&self, stream: &mut MioTcpStream) -> WriteOutcome {
        loop {
            let (written, now_empty) = {
                let mut state = self.state.lock().unwrap();
                if state.output.is_empty() {
                    return WriteOutcome::Idle;
                }
                match state.output.egress(stream, SEND_CHUNK) {
                    Ok(written) => (written, state.output.is_empty()),
                    Err(err) => return WriteOutcome::Failed(err),
                }
            };
            if written > 0 {
                if let Some(socket) = self.this() {
                    self.bytes_written
                        .notify(&SocketBytesWritten { socket, count: written });
                }
            }
            if now_empty {
                self.all_sent.notify_all();
                if let Some(socket) = self.this() {
                    self.write_finished.notify(&SocketWriteFinished { socket });
                }
                return WriteOutcome::Idle;
            }
            if written < SEND_CHUNK {
                return WriteOutcome::Blocked;
            }
        }
    }

    /// One read pass: drain the stream into the input buffer, signalling
    /// `data_available` and notifying `ready_read` per received chunk.
    fn service_input(&self, stream: &mut MioTcpStream, scratch: &mut [u8]) -> ReadOutcome {
        loop {
            match stream.read(scratch) {
                Ok(0) => return ReadOutcome::PeerClosed,
                Ok(count) => {
                    {
                        let mut state = self.state.lock().unwrap();
                        state.input.append(&scratch[..count]);
                    }
                    self.data_available.notify_all();
                    if let Some(socket) = self.this() {
                        self.ready_read.notify(&SocketReadyRead { socket });
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return ReadOutcome::Open
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return ReadOutcome::Failed(err),
            }
        }
    }

    /// Transport failure while connected: `error` fires, then
    /// `disconnected`.
    fn fail_io(&self, err: io::Error) {
        warn!(self.log, "socket i/o error"; "error" => %err);
        let notify = {
            let mut state = self.state.lock().unwrap();
            if let Some(io) = state.io.as_mut() {
                io.join = None; // this thread is exiting; nothing to join
            }
            self.set_status(&mut state, SocketStatus::Disconnected)
        };
        self.all_sent.notify_all();
        self.data_available.notify_all();
        if notify {
            self.notify_error(err.raw_os_error().unwrap_or(0), &err.to_string());
            self.notify_disconnected();
        }
    }

    /// Graceful shutdown after the peer closed the connection.
    fn peer_closed(&self) {
        debug!(self.log, "peer closed the connection");
        let notify = {
            let mut state = self.state.lock().unwrap();
            if let Some(io) = state.io.as_mut() {
                io.join = None; // this thread is exiting; nothing to join
            }
            self.set_status(&mut state, SocketStatus::Disconnecting);
            self.set_status(&mut state, SocketStatus::Disconnected)
        };
        self.all_sent.notify_all();
        self.data_available.notify_all();
        if notify {
            self.notify_disconnected();
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // The I/O thread only holds a weak handle and cannot drain the
        // output buffer anymore; skip the flush wait.
        self.close_internal(false);
    }
}

fn run_io(
    weak: Weak<Socket>,
    mut poll: Poll,
    mut stream: MioTcpStream,
    stop: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(8);
    let mut scratch = vec![0u8; RECV_SCRATCH];
    let mut write_interest = false;
    loop {
        // Service pending work; the socket handle going away ends the
        // thread.
        let mut readable = false;
        {
            let socket = match weak.upgrade() {
                Some(socket) => socket,
                None => return,
            };
            if stop.load(Ordering::SeqCst) {
                return;
            }
            match socket.service_output(&mut stream) {
                WriteOutcome::Idle => {
                    if write_interest {
                        if poll
                            .registry()
                            .reregister(&mut stream, STREAM_TOKEN, Interest::READABLE)
                            .is_err()
                        {
                            return;
                        }
                        write_interest = false;
                    }
                }
                WriteOutcome::Blocked => {
                    if !write_interest {
                        if poll
                            .registry()
                            .reregister(
                                &mut stream,
                                STREAM_TOKEN,
                                Interest::READABLE | Interest::WRITABLE,
                            )
                            .is_err()
                        {
                            return;
                        }
                        write_interest = true;
                    }
                }
                WriteOutcome::Failed(err) => {
                    socket.fail_io(err);
                    return;
                }
            }
        }
        match poll.poll(&mut events, Some(POLL_INTERVAL)) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if let Some(socket) = weak.upgrade() {
                    socket.fail_io(err);
                }
                return;
            }
        }
        for event in events.iter() {
            if event.token() == STREAM_TOKEN && event.is_readable() {
                readable = true;
            }
        }
        if readable {
            let socket = match weak.upgrade() {
                Some(socket) => socket,
                None => return,
            };
            if stop.load(Ordering::SeqCst) {
                return;
            }
            match socket.service_input(&mut stream, &mut scratch) {
                ReadOutcome::Open => {}
                ReadOutcome::PeerClosed => {
                    socket.peer_closed();
                    return;
                }
                ReadOutcome::Failed(err) => {
                    socket.fail_io(err);
                    return;
                }
            }
        }
    }
}

/*--- Stream bridge -------------------------------------------------------*/

impl Read for &Socket {
    /// Consumes from the input buffer; a short or empty read simply means
    /// nothing has been received yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        Ok(state.input.consume_into(buf))
    }
}

impl Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Socket::flush(*self);
        Ok(())
    }
}

impl Stream for &Socket {
    fn seek(&mut self, _pos: u64) -> Result<u64> {
        Err(Error::Unsupported("sockets cannot seek"))
    }

    fn pos(&self) -> u64 {
        0
    }

    fn size(&self) -> u64 {
        self.received_bytes() as u64
    }

    fn byte_order(&self) -> ByteOrder {
        if self.little_endian.load(Ordering::Relaxed) {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    fn set_byte_order(&mut self, order: ByteOrder) {
        self.little_endian
            .store(order == ByteOrder::Little, Ordering::Relaxed);
    }

    fn flush_stream(&mut self) -> Result<()> {
        Socket::flush(*self);
        Ok(())
    }
}
