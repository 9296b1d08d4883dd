//! Network endpoints: address resolution, TCP sockets and services, and
//! UDP datagrams sharing one process-wide I/O thread.

pub mod address;
pub mod datagram;
pub mod service;
pub mod socket;

pub use self::address::{Address, Family, SocketKind};
pub use self::datagram::Datagram;
pub use self::service::Service;
pub use self::socket::{Socket, SocketStatus};
