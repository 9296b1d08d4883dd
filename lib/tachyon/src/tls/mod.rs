//! TLS client support: certificates, the process-wide context with its
//! verify callback and session cache, and the request state machine that
//! drives a full encrypted exchange over a `Socket`.

pub mod certificate;
pub mod context;
pub mod request;

pub use self::certificate::{CertName, NameField, NameScope, TlsCertificate, VerifyStatus};
pub use self::context::{
    clear_verify_func, configure, library_name, set_ca_certificates, set_ciphers,
    set_verify_func,
};
pub use self::request::{TlsRequest, TlsRequestStatus};
