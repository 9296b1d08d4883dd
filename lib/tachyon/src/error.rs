use std::fmt;
use std::io;
use std::net;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for the networking core. Transport problems keep the
/// underlying `io::ErrorKind`; TLS problems carry the diagnostic message
/// that is also surfaced through the request status.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    Io(io::ErrorKind),
    AddrParse,
    /// Lookup finished without producing any endpoint.
    HostNotFound,
    /// Operation is not valid in the object's current state.
    InvalidState(&'static str),
    /// Operation is not supported by this stream type.
    Unsupported(&'static str),
    Tls(String),
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(kind) => write!(f, "i/o error: {:?}", kind),
            Error::AddrParse => write!(f, "malformed network address"),
            Error::HostNotFound => write!(f, "host not found"),
            Error::InvalidState(what) => write!(f, "invalid state: {}", what),
            Error::Unsupported(what) => write!(f, "unsupported operation: {}", what),
            Error::Tls(msg) => write!(f, "tls error: {}", msg),
            Error::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        Error::Io(err.kind())
    }
}

impl From<net::AddrParseError> for Error {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        Error::AddrParse
    }
}

impl From<openssl::error::ErrorStack> for Error {
    #[inline]
    fn from(err: openssl::error::ErrorStack) -> Self {
        Error::Tls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_keeps_kind() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(err, Error::Io(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_addr_parse_folds() {
        let parse_err = "not-an-addr".parse::<net::SocketAddr>().unwrap_err();
        assert_eq!(Error::from(parse_err), Error::AddrParse);
    }
}
