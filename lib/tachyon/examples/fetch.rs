//! Fetches the front page of a host over TLS and prints the beginning of
//! the response.
//!
//! Usage: `fetch [host]` (defaults to example.org).

use quark::logging::{self, info};
use tachyon::tls::{library_name, TlsRequest, TlsRequestStatus};

fn main() {
    let log = logging::terminal();
    logging::set_process_logger(&log);

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "example.org".to_string());
    info!(log, "fetching"; "host" => host.clone(), "tls" => library_name());

    let request = TlsRequest::new(&log);
    request.set_host(&host, 443);
    request.set_content(format!("GET / HTTP/1.0\r\nHost: {}\r\n\r\n", host).as_bytes());
    request.submit();
    request.wait_for_finished();

    match request.status() {
        TlsRequestStatus::Finished => {
            if let Some(cert) = request.server_certificate() {
                info!(log, "server certificate"; "subject" => cert.subject());
            }
            let body = request.read_all();
            let head = String::from_utf8_lossy(&body[..body.len().min(400)]).into_owned();
            println!("{}", head);
        }
        _ => {
            eprintln!("request failed: {}", request.error_message());
            std::process::exit(1);
        }
    }
}
