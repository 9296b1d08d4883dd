//! Network addresses with asynchronous host resolution.
//!
//! Lookups are queued on a single lazily-started resolver thread so a
//! connection storm cannot fan out into many blocking resolver calls. An
//! address is *pending* from `lookup` until the resolver finishes; the
//! `lookup_finished` audience fires and the per-address condition is
//! signalled exactly once per lookup.

use crate::audience::Audience;
use crate::thread::Thread;
use lazy_static::lazy_static;
use quark::logging::{self, warn};
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, Weak};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketKind {
    Tcp,
    Udp,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// The `(family, type, protocol)` projection of a resolved endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SocketParams {
    pub family: Family,
    pub kind: SocketKind,
}

pub struct LookupFinished {
    pub address: Arc<Address>,
}

struct AddressState {
    host: Option<String>,
    port: u16,
    kind: SocketKind,
    pending: bool,
    /// `None` until a lookup has produced a result; an empty list means
    /// the host was not found.
    endpoints: Option<Vec<SocketAddr>>,
}

pub struct Address {
    self_ref: Weak<Address>,
    state: Mutex<AddressState>,
    finished_cond: Condvar,
    lookup_finished: Audience<LookupFinished>,
}

impl Address {
    /// An empty, invalid address; arm it with `lookup`.
    pub fn new() -> Arc<Address> {
        Arc::new_cyclic(|self_ref| Address {
            self_ref: self_ref.clone(),
            state: Mutex::new(AddressState {
                host: None,
                port: 0,
                kind: SocketKind::Tcp,
                pending: false,
                endpoints: None,
            }),
            finished_cond: Condvar::new(),
            lookup_finished: Audience::new(),
        })
    }

    /// Shortcut: a new address with a lookup already underway.
    pub fn resolve(host: Option<&str>, port: u16, kind: SocketKind) -> Arc<Address> {
        let address = Address::new();
        address.lookup(host, port, kind);
        address
    }

    /// The IPv4 broadcast address for the given port.
    pub fn broadcast(port: u16) -> Arc<Address> {
        Address::resolve(Some("255.255.255.255"), port, SocketKind::Udp)
    }

    /// A finished single-endpoint address wrapping an already-resolved
    /// socket address.
    pub fn from_socket_addr(addr: SocketAddr, kind: SocketKind) -> Arc<Address> {
        Arc::new_cyclic(|self_ref| Address {
            self_ref: self_ref.clone(),
            state: Mutex::new(AddressState {
                host: None,
                port: addr.port(),
                kind,
                pending: false,
                endpoints: Some(vec![addr]),
            }),
            finished_cond: Condvar::new(),
            lookup_finished: Audience::new(),
        })
    }

    pub fn lookup_finished(&self) -> &Audience<LookupFinished> {
        &self.lookup_finished
    }

    /// Arms an asynchronous resolution: any prior result is discarded, the
    /// address turns pending and is handed to the shared resolver thread.
    pub fn lookup(&self, host: Option<&str>, port: u16, kind: SocketKind) {
        self.wait_for_finished();
        {
            let mut state = self.state.lock().unwrap();
            state.endpoints = None;
            state.pending = true;
            state.port = port;
            state.kind = kind;
            // Bracketed IPv6 literals resolve in their plain form.
            state.host = host.map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string());
        }
        let this = self
            .self_ref
            .upgrade()
            .expect("Lookup requires the address to be held in an Arc");
        enqueue_lookup(this);
    }

    /// Blocks until any pending lookup has completed.
    pub fn wait_for_finished(&self) {
        let mut state = self.state.lock().unwrap();
        while state.pending {
            state = self.finished_cond.wait(state).unwrap();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().unwrap().pending
    }

    /// False until a lookup has produced any result, even an empty one.
    pub fn is_valid(&self) -> bool {
        self.state.lock().unwrap().endpoints.is_some()
    }

    pub fn is_host_found(&self) -> bool {
        self.count() > 0
    }

    /// Number of resolved endpoints.
    pub fn count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .endpoints
            .as_ref()
            .map_or(0, Vec::len)
    }

    pub fn kind(&self) -> SocketKind {
        self.state.lock().unwrap().kind
    }

    /// The resolved port, falling back to the requested service port.
    pub fn port(&self) -> u16 {
        let state = self.state.lock().unwrap();
        state
            .endpoints
            .as_ref()
            .and_then(|eps| eps.first())
            .map_or(state.port, SocketAddr::port)
    }

    /// The host name given to `lookup`, or the numeric rendering of the
    /// first endpoint when the address was built from raw endpoints.
    pub fn host_name(&self) -> String {
        let state = self.state.lock().unwrap();
        if let Some(host) = &state.host {
            return host.clone();
        }
        state
            .endpoints
            .as_ref()
            .and_then(|eps| eps.first())
            .map_or_else(String::new, |ep| ep.ip().to_string())
    }

    /// Snapshot of the resolved endpoints.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.state
            .lock()
            .unwrap()
            .endpoints
            .clone()
            .unwrap_or_default()
    }

    /// First endpoint, optionally restricted to one address family.
    pub fn first_endpoint(&self, family: Option<Family>) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap();
        state.endpoints.as_ref().and_then(|eps| {
            eps.iter()
                .find(|ep| family.map_or(true, |f| f.matches(ep)))
                .copied()
        })
    }

    pub fn socket_params(&self, index: usize) -> Option<SocketParams> {
        let state = self.state.lock().unwrap();
        let endpoint = state.endpoints.as_ref()?.get(index)?;
        Some(SocketParams {
            family: if endpoint.is_ipv4() { Family::V4 } else { Family::V6 },
            kind: state.kind,
        })
    }

    pub fn socket_params_family(&self, family: Option<Family>) -> Option<SocketParams> {
        let kind = self.kind();
        self.first_endpoint(family).map(|endpoint| SocketParams {
            family: if endpoint.is_ipv4() { Family::V4 } else { Family::V6 },
            kind,
        })
    }

    /// Two addresses are equal when they share at least one endpoint of
    /// the same kind. Blocks until both lookups have finished.
    pub fn equal(&self, other: &Address) -> bool {
        self.wait_for_finished();
        other.wait_for_finished();
        if self.kind() != other.kind() {
            return false;
        }
        let mine = self.endpoints();
        let theirs = other.endpoints();
        mine.iter().any(|ep| theirs.contains(ep))
    }

    /// Formats the first endpoint of the requested family; IPv6 hosts are
    /// bracketed when the port is included. The port is omitted when it is
    /// zero or `include_port` is false.
    pub fn to_string_parts(&self, include_port: bool, family: Option<Family>) -> String {
        match self.first_endpoint(family) {
            Some(endpoint) if include_port && endpoint.port() != 0 => endpoint.to_string(),
            Some(endpoint) => endpoint.ip().to_string(),
            None => String::new(),
        }
    }

    /// Addresses of the locally configured network interfaces. May be
    /// empty on platforms without `getifaddrs`.
    pub fn network_interfaces() -> Vec<Arc<Address>> {
        interfaces_impl()
    }

    fn finish_lookup(&self, endpoints: Vec<SocketAddr>) {
        {
            let mut state = self.state.lock().unwrap();
            state.endpoints = Some(endpoints);
            state.pending = false;
        }
        if let Some(this) = self.self_ref.upgrade() {
            self.lookup_finished.notify(&LookupFinished { address: this });
        }
        self.finished_cond.notify_all();
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_string_parts(true, None))
    }
}

/*-------------------------------------------------------------------------*/

struct ResolverQueue {
    pending: Mutex<VecDeque<Arc<Address>>>,
    available: Condvar,
}

lazy_static! {
    static ref RESOLVER_QUEUE: ResolverQueue = ResolverQueue {
        pending: Mutex::new(VecDeque::new()),
        available: Condvar::new(),
    };
    static ref RESOLVER_THREAD: Mutex<Option<Arc<Thread>>> = Mutex::new(None);
}

fn enqueue_lookup(address: Arc<Address>) {
    {
        let mut thread = RESOLVER_THREAD.lock().unwrap();
        if thread.is_none() {
            let worker = Thread::new("address-lookup", || {
                resolver_loop();
                0
            });
            worker
                .start()
                .expect("Resolver thread is started exactly once");
            *thread = Some(worker);
        }
    }
    let mut pending = RESOLVER_QUEUE.pending.lock().unwrap();
    pending.push_back(address);
    RESOLVER_QUEUE.available.notify_one();
}

fn resolver_loop() {
    let log = logging::process();
    loop {
        let address = {
            let mut pending = RESOLVER_QUEUE.pending.lock().unwrap();
            loop {
                if let Some(address) = pending.pop_front() {
                    break address;
                }
                pending = RESOLVER_QUEUE.available.wait(pending).unwrap();
            }
        };
        let (host, port, kind) = {
            let state = address.state.lock().unwrap();
            (state.host.clone(), state.port, state.kind)
        };
        let mut endpoints = match &host {
            Some(host) => match (host.as_str(), port).to_socket_addrs() {
                Ok(found) => found.collect(),
                Err(err) => {
                    warn!(log, "host lookup failed";
                          "host" => host, "port" => port, "error" => %err);
                    Vec::new()
                }
            },
            // Passive: bind-anywhere endpoints.
            None => {
                let mut eps: Vec<SocketAddr> =
                    vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)];
                if kind == SocketKind::Tcp {
                    eps.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port));
                }
                eps
            }
        };
        // The datagram and broadcast layers are IPv4-only.
        if kind == SocketKind::Udp {
            endpoints.retain(SocketAddr::is_ipv4);
        }
        address.finish_lookup(endpoints);
    }
}

/*-------------------------------------------------------------------------*/

#[cfg(unix)]
fn interfaces_impl() -> Vec<Arc<Address>> {
    let mut list = Vec::new();
    unsafe {
        let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut addrs) != 0 {
            return list;
        }
        let mut cursor = addrs;
        while !cursor.is_null() {
            let entry = &*cursor;
            cursor = entry.ifa_next;
            if entry.ifa_addr.is_null() {
                continue;
            }
            let family = i32::from((*entry.ifa_addr).sa_family);
            let ip = if family == libc::AF_INET {
                let sin = &*(entry.ifa_addr as *const libc::sockaddr_in);
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
            } else if family == libc::AF_INET6 {
                let sin6 = &*(entry.ifa_addr as *const libc::sockaddr_in6);
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
            } else {
                continue;
            };
            list.push(Address::from_socket_addr(
                SocketAddr::new(ip, 0),
                SocketKind::Tcp,
            ));
        }
        libc::freeifaddrs(addrs);
    }
    list
}

#[cfg(not(unix))]
fn interfaces_impl() -> Vec<Arc<Address>> {
    Vec::new()
}
