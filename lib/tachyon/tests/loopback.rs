//! Loopback coverage for the TCP service and socket plumbing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tachyon::net::service::{IncomingAccepted, Service};
use tachyon::net::socket::{Socket, SocketBytesWritten, SocketReadyRead, SocketStatus};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + WAIT_LIMIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Pushes every received byte straight back to the sender.
struct Echo {
    clients: Mutex<Vec<Arc<Socket>>>,
}

impl Echo {
    fn new() -> Arc<Echo> {
        Arc::new(Echo {
            clients: Mutex::new(Vec::new()),
        })
    }

    fn on_incoming(this: &Arc<Echo>, event: &IncomingAccepted) {
        event.socket.ready_read().insert(this, Echo::on_ready_read);
        // Anything that raced in before the observer joined.
        let pending = event.socket.read_all();
        if !pending.is_empty() {
            event.socket.write_bytes(&pending);
        }
        this.clients.lock().unwrap().push(event.socket.clone());
    }

    fn on_ready_read(_this: &Arc<Echo>, event: &SocketReadyRead) {
        let data = event.socket.read_all();
        if !data.is_empty() {
            event.socket.write_bytes(&data);
        }
    }
}

fn connect_client(port: u16) -> Arc<Socket> {
    let client = Socket::connect_to("127.0.0.1", port, None);
    client.open().unwrap();
    assert!(
        wait_until(|| client.status() == SocketStatus::Connected),
        "client failed to connect"
    );
    client
}

#[test]
fn test_echo_roundtrip() {
    let service = Service::new(0, None);
    let echo = Echo::new();
    service.incoming_accepted().insert(&echo, Echo::on_incoming);
    service.open().unwrap();

    let client = connect_client(service.port());
    client.write_bytes(b"hello\n");
    client.flush();

    assert!(wait_until(|| client.received_bytes() >= 6));
    assert_eq!(client.read_all(), b"hello\n");

    client.close();
    assert_eq!(client.status(), SocketStatus::Disconnected);
    service.close();
}

#[test]
fn test_flush_waits_for_all_writes() {
    struct Accounting {
        written: AtomicUsize,
    }
    impl Accounting {
        fn on_bytes_written(this: &Arc<Accounting>, event: &SocketBytesWritten) {
            this.written.fetch_add(event.count, Ordering::SeqCst);
        }
    }

    let service = Service::new(0, None);
    let echo = Echo::new();
    service.incoming_accepted().insert(&echo, Echo::on_incoming);
    service.open().unwrap();

    let client = connect_client(service.port());
    let accounting = Arc::new(Accounting {
        written: AtomicUsize::new(0),
    });
    client
        .bytes_written()
        .insert(&accounting, Accounting::on_bytes_written);

    // Spans several 64 KiB send chunks.
    let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    client.write_bytes(&payload);
    client.flush();

    // Flush returns only once the output buffer has drained; the final
    // bytes_written notification may still be in flight.
    assert_eq!(client.bytes_to_send(), 0);
    assert!(wait_until(|| {
        accounting.written.load(Ordering::SeqCst) == payload.len()
    }));

    // And the echo sends the whole payload back.
    assert!(wait_until(|| client.received_bytes() >= payload.len()));
    assert_eq!(client.read_all(), payload);

    client.close();
    service.close();
}

#[test]
fn test_peer_close_disconnects_client() {
    let service = Service::new(0, None);
    let echo = Echo::new();
    service.incoming_accepted().insert(&echo, Echo::on_incoming);
    service.open().unwrap();

    let client = connect_client(service.port());
    assert!(wait_until(|| !echo.clients.lock().unwrap().is_empty()));

    // Closing the accepted side sends EOF to the client.
    for accepted in echo.clients.lock().unwrap().iter() {
        accepted.close();
    }
    assert!(wait_until(|| client.status() == SocketStatus::Disconnected));

    service.close();
}

#[test]
fn test_multiple_clients() {
    let service = Service::new(0, None);
    let echo = Echo::new();
    service.incoming_accepted().insert(&echo, Echo::on_incoming);
    service.open().unwrap();

    let clients: Vec<_> = (0..4).map(|_| connect_client(service.port())).collect();
    for (index, client) in clients.iter().enumerate() {
        client.write_bytes(format!("client-{}", index).as_bytes());
    }
    for (index, client) in clients.iter().enumerate() {
        let expected = format!("client-{}", index).into_bytes();
        assert!(wait_until(|| client.received_bytes() >= expected.len()));
        assert_eq!(client.read_all(), expected);
        client.close();
    }
    service.close();
}

#[test]
fn test_connect_through_prepared_address() {
    use tachyon::net::address::{Address, SocketKind};

    let service = Service::new(0, None);
    let echo = Echo::new();
    service.incoming_accepted().insert(&echo, Echo::on_incoming);
    service.open().unwrap();

    let address = Address::resolve(Some("127.0.0.1"), service.port(), SocketKind::Tcp);
    let client = Socket::with_address(&address, None);
    assert_eq!(client.status(), SocketStatus::Initialized);
    client.open().unwrap();
    assert!(wait_until(|| client.status() == SocketStatus::Connected));
    assert!(client.address().unwrap().equal(&address));

    client.write_bytes(b"addressed");
    assert!(wait_until(|| client.received_bytes() >= 9));
    assert_eq!(client.read_all(), b"addressed");

    client.close();
    service.close();
}

#[test]
fn test_connect_to_closed_port_reports_error() {
    // Bind-and-drop to find a port with nothing listening.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let client = Socket::connect_to("127.0.0.1", port, None);
    client.open().unwrap();
    assert!(wait_until(|| client.status() == SocketStatus::Disconnected));
}
