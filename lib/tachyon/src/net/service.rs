//! TCP listening service. `open` binds and listens, then a background
//! accept thread wraps every incoming connection in a `Socket` (already
//! connected, I/O thread running) and announces it on the
//! `incoming_accepted` audience.

use crate::audience::Audience;
use crate::error::{Error, Result};
use crate::net::socket::Socket;
use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use quark::logging::{self, debug, o, warn, Logger};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

const LISTEN_BACKLOG: i32 = 10;

const LISTENER_TOKEN: Token = Token(0);
const STOP_TOKEN: Token = Token(1);

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct IncomingAccepted {
    pub service: Arc<Service>,
    pub socket: Arc<Socket>,
}

struct AcceptHandle {
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

struct ServiceState {
    requested_port: u16,
    bound_port: u16,
    accept: Option<AcceptHandle>,
}

pub struct Service {
    self_ref: Weak<Service>,
    state: Mutex<ServiceState>,
    incoming_accepted: Audience<IncomingAccepted>,
    log: Logger,
}

impl Service {
    /// A closed service for the given port; port 0 asks the system for a
    /// free port, readable through `port` after `open`.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(port: u16, log: L) -> Arc<Service> {
        let log = logging::resolve(log).new(o!("service_port" => port));
        Arc::new_cyclic(|self_ref| Service {
            self_ref: self_ref.clone(),
            state: Mutex::new(ServiceState {
                requested_port: port,
                bound_port: 0,
                accept: None,
            }),
            incoming_accepted: Audience::new(),
            log,
        })
    }

    pub fn incoming_accepted(&self) -> &Audience<IncomingAccepted> {
        &self.incoming_accepted
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().accept.is_some()
    }

    /// The actual bound port while open, the requested port otherwise.
    pub fn port(&self) -> u16 {
        let state = self.state.lock().unwrap();
        if state.bound_port != 0 {
            state.bound_port
        } else {
            state.requested_port
        }
    }

    /// Binds an IPv4 listening socket with a backlog of 10 and starts the
    /// accept thread.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.accept.is_some() {
            return Err(Error::InvalidState("service is already open"));
        }
        let raw = RawSocket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        raw.set_reuse_address(true)?;
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            state.requested_port,
        ));
        raw.bind(&bind_addr.into())?;
        raw.listen(LISTEN_BACKLOG)?;
        raw.set_nonblocking(true)?;
        let std_listener: std::net::TcpListener = raw.into();
        let bound_port = std_listener.local_addr()?.port();
        let mut listener = MioTcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), STOP_TOKEN)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let stop = Arc::new(AtomicBool::new(false));
        let weak = self.self_ref.clone();
        let stop_flag = stop.clone();
        let join = std::thread::Builder::new()
            .name("service-accept".to_string())
            .spawn(move || run_accept(weak, poll, listener, stop_flag))
            .map_err(Error::from)?;

        state.bound_port = bound_port;
        state.accept = Some(AcceptHandle {
            waker,
            stop,
            join: Some(join),
        });
        debug!(self.log, "service listening"; "port" => bound_port);
        Ok(())
    }

    /// Signals the accept thread to stop, joins it and closes the
    /// listening socket.
    pub fn close(&self) {
        let accept = {
            let mut state = self.state.lock().unwrap();
            state.bound_port = 0;
            state.accept.take()
        };
        if let Some(mut accept) = accept {
            accept.stop.store(true, Ordering::SeqCst);
            let _ = accept.waker.wake();
            if let Some(join) = accept.join.take() {
                if join.thread().id() != std::thread::current().id() {
                    let _ = join.join();
                }
            }
            debug!(self.log, "service closed");
        }
    }

    fn accept_one(&self, stream: mio::net::TcpStream, peer: SocketAddr) {
        debug!(self.log, "incoming connection"; "peer" => peer.to_string());
        if let Some(service) = self.self_ref.upgrade() {
            let socket = Socket::from_accepted(stream, peer, &self.log);
            self.incoming_accepted
                .notify(&IncomingAccepted { service, socket });
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_accept(
    weak: Weak<Service>,
    mut poll: Poll,
    listener: MioTcpListener,
    stop: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(8);
    loop {
        if stop.load(Ordering::SeqCst) || weak.upgrade().is_none() {
            return;
        }
        match poll.poll(&mut events, Some(POLL_INTERVAL)) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
        let mut readable = false;
        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                readable = true;
            }
        }
        if !readable {
            continue;
        }
        let service = match weak.upgrade() {
            Some(service) => service,
            None => return,
        };
        if stop.load(Ordering::SeqCst) {
            return;
        }
        loop {
            match listener.accept() {
                Ok((stream, peer)) => service.accept_one(stream, peer),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(service.log, "accept failed"; "error" => %err);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_assigns_port() {
        let service = Service::new(0, None);
        assert!(!service.is_open());
        service.open().unwrap();
        assert!(service.is_open());
        assert_ne!(service.port(), 0);
        service.close();
        assert!(!service.is_open());
    }

    #[test]
    fn test_double_open_fails() {
        let service = Service::new(0, None);
        service.open().unwrap();
        assert!(service.open().is_err());
        service.close();
    }

    #[test]
    fn test_reopen_after_close() {
        let service = Service::new(0, None);
        service.open().unwrap();
        let first = service.port();
        service.close();
        service.open().unwrap();
        assert_ne!(service.port(), 0);
        let _ = first;
        service.close();
    }
}
