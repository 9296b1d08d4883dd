//! Asynchronous networking foundation: observer audiences, byte streams,
//! background thread plumbing, address resolution, TCP/UDP endpoints and
//! TLS client requests.
//!
//! All asynchrony is thread-based: each connected socket runs a dedicated
//! I/O thread, datagrams share one process-wide I/O thread, host lookups
//! run on a shared resolver thread and every submitted TLS request drives
//! its handshake and decryption on its own worker thread. Results flow
//! back through audiences (observer sets) and condition variables.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod audience;
pub mod buffer;
pub mod error;
pub mod net;
pub mod pool;
pub mod stream;
pub mod thread;
pub mod tls;

pub use crate::audience::Audience;
pub use crate::buffer::Buffer;
pub use crate::error::{Error, Result};
pub use crate::stream::{ByteOrder, MemoryStream, ReadPrimitives, Stream, WritePrimitives};
