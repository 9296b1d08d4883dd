//! Minimal echo service: every byte a client sends comes straight back.
//!
//! Usage: `echo [port]` (defaults to 7777; use 0 for a system-assigned
//! port).

use quark::logging::{self, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tachyon::net::service::{IncomingAccepted, Service};
use tachyon::net::socket::{Socket, SocketReadyRead};

struct Echo {
    clients: Mutex<Vec<Arc<Socket>>>,
}

impl Echo {
    fn on_incoming(this: &Arc<Echo>, event: &IncomingAccepted) {
        event.socket.ready_read().insert(this, Echo::on_ready_read);
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

fn main() {
    let log = logging::terminal();
    logging::set_process_logger(&log);

    let port = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(7777);

    let service = Service::new(port, &log);
    let echo = Arc::new(Echo {
        clients: Mutex::new(Vec::new()),
    });
    service.incoming_accepted().insert(&echo, Echo::on_incoming);
    service.open().expect("Failed to open the echo service");
    info!(log, "echo service running"; "port" => service.port());

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
