//! X.509 certificates: parsing, self-signed generation, verification and
//! fingerprinting.

use crate::error::Result;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::{hash, MessageDigest};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::{X509, X509Builder, X509Name, X509NameBuilder, X509NameRef};
use std::cmp::Ordering;
use std::net::IpAddr;
use std::sync::Mutex;

pub const FINGERPRINT_SIZE: usize = 32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VerifyStatus {
    Unknown,
    Unverified,
    SelfSigned,
    Authority,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NameField {
    CommonName,
    EmailAddress,
    UserId,
    Domain,
    Organization,
    OrganizationalUnit,
    Country,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NameScope {
    Issuer,
    Subject,
    Both,
}

/// One component of a certificate name, scoped to the issuer, the subject
/// or both.
#[derive(Debug, Clone)]
pub struct CertName {
    pub field: NameField,
    pub scope: NameScope,
    pub text: String,
}

impl CertName {
    pub fn both(field: NameField, text: &str) -> CertName {
        CertName {
            field,
            scope: NameScope::Both,
            text: text.to_string(),
        }
    }

    pub fn subject(field: NameField, text: &str) -> CertName {
        CertName {
            field,
            scope: NameScope::Subject,
            text: text.to_string(),
        }
    }

    pub fn issuer(field: NameField, text: &str) -> CertName {
        CertName {
            field,
            scope: NameScope::Issuer,
            text: text.to_string(),
        }
    }
}

/// A decoded certificate with an optional chain and private key. The
/// verification result is cached per instance; copies carry it along.
pub struct TlsCertificate {
    cert: Option<X509>,
    chain: Option<Stack<X509>>,
    pkey: Option<PKey<Private>>,
    cached_verify: Mutex<VerifyStatus>,
}

impl TlsCertificate {
    /// An empty (invalid) certificate.
    pub fn empty() -> TlsCertificate {
        TlsCertificate {
            cert: None,
            chain: None,
            pkey: None,
            cached_verify: Mutex::new(VerifyStatus::Unknown),
        }
    }

    pub fn from_pem(pem: &str) -> Result<TlsCertificate> {
        let cert = X509::from_pem(pem.as_bytes())?;
        Ok(TlsCertificate {
            cert: Some(cert),
            ..TlsCertificate::empty()
        })
    }

    pub fn from_pem_with_key(cert_pem: &str, key_pem: &str) -> Result<TlsCertificate> {
        let mut cert = TlsCertificate::from_pem(cert_pem)?;
        cert.pkey = Some(PKey::private_key_from_pem(key_pem.as_bytes())?);
        Ok(cert)
    }

    pub(crate) fn from_x509(cert: X509, chain: Option<Stack<X509>>) -> TlsCertificate {
        TlsCertificate {
            cert: Some(cert),
            chain,
            ..TlsCertificate::empty()
        }
    }

    /// Generates a self-signed RSA certificate: public exponent 65537, a
    /// random 64-bit serial, names composed from the scoped component
    /// list (domains split into `DC` entries), valid from now until
    /// `valid_until` (unix seconds), signed with SHA-256.
    pub fn self_signed_rsa(
        bits: u32,
        valid_until: i64,
        names: &[CertName],
    ) -> Result<TlsCertificate> {
        let rsa = Rsa::generate(bits)?;
        let pkey = PKey::from_rsa(rsa)?;
        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let mut serial = BigNum::new()?;
        serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_pubkey(&pkey)?;
        let issuer_name = build_name(NameScope::Issuer, names)?;
        builder.set_issuer_name(&issuer_name)?;
        let subject_name = build_name(NameScope::Subject, names)?;
        builder.set_subject_name(&subject_name)?;
        let now = quark::time::timestamp_secs() as i64;
        let not_before = Asn1Time::from_unix(now as _)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::from_unix(valid_until as _)?;
        builder.set_not_after(&not_after)?;
        builder.sign(&pkey, MessageDigest::sha256())?;
        Ok(TlsCertificate {
            cert: Some(builder.build()),
            chain: None,
            pkey: Some(pkey),
            cached_verify: Mutex::new(VerifyStatus::Unknown),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.cert.is_none()
    }

    pub fn has_private_key(&self) -> bool {
        self.pkey.is_some()
    }

    pub(crate) fn x509(&self) -> Option<&X509> {
        self.cert.as_ref()
    }

    pub(crate) fn private_key(&self) -> Option<&PKey<Private>> {
        self.pkey.as_ref()
    }

    /// Subject name as `FIELD = value` pairs.
    pub fn subject(&self) -> String {
        self.cert
            .as_ref()
            .map_or_else(String::new, |cert| format_name(cert.subject_name()))
    }

    /// Issuer name as `FIELD = value` pairs.
    pub fn issuer(&self) -> String {
        self.cert
            .as_ref()
            .map_or_else(String::new, |cert| format_name(cert.issuer_name()))
    }

    /// End of the validity period in unix seconds.
    pub fn valid_until(&self) -> Option<i64> {
        let cert = self.cert.as_ref()?;
        let epoch = Asn1Time::from_unix(0).ok()?;
        let diff = epoch.diff(cert.not_after()).ok()?;
        Some(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
    }

    /// An empty certificate counts as expired.
    pub fn is_expired(&self) -> bool {
        let cert = match &self.cert {
            Some(cert) => cert,
            None => return true,
        };
        match Asn1Time::days_from_now(0) {
            Ok(now) => cert
                .not_after()
                .compare(&now)
                .map(|order| order == Ordering::Less)
                .unwrap_or(true),
            Err(_) => true,
        }
    }

    /// Verifies against the configured trust store. `Authority` when the
    /// store vouches for the chain; `SelfSigned` when the certificate is
    /// self-issued and carries a valid self-signature; `Unverified`
    /// otherwise. The result is cached.
    pub fn verify(&self) -> VerifyStatus {
        {
            let cached = *self.cached_verify.lock().unwrap();
            if cached != VerifyStatus::Unknown {
                return cached;
            }
        }
        let cert = match &self.cert {
            Some(cert) => cert,
            None => return VerifyStatus::Unverified,
        };
        let status = crate::tls::context::verify_with_store(cert, self.chain.as_ref());
        *self.cached_verify.lock().unwrap() = status;
        status
    }

    /// Checks the domain against the common names first (the OpenSSL host
    /// check prioritizes subject-alternative names, hiding CN-only
    /// certificates), then the SAN DNS entries. `*.domain` wildcards
    /// match one or more leading labels.
    pub fn verify_domain(&self, domain: &str) -> bool {
        let cert = match &self.cert {
            Some(cert) => cert,
            None => return false,
        };
        for entry in cert.subject_name().entries_by_nid(Nid::COMMONNAME) {
            if let Ok(name) = entry.data().as_utf8() {
                if domain_matches(&name, domain) {
                    return true;
                }
            }
        }
        if let Some(sans) = cert.subject_alt_names() {
            for san in sans.iter() {
                if let Some(dns) = san.dnsname() {
                    if domain_matches(dns, domain) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Checks a textual IP address against the SAN IP entries.
    pub fn verify_ip(&self, ip_text: &str) -> bool {
        let cert = match &self.cert {
            Some(cert) => cert,
            None => return false,
        };
        let ip: IpAddr = match ip_text.parse() {
            Ok(ip) => ip,
            Err(_) => return false,
        };
        let octets = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        if let Some(sans) = cert.subject_alt_names() {
            for san in sans.iter() {
                if san.ipaddress() == Some(&octets[..]) {
                    return true;
                }
            }
        }
        false
    }

    /// Certificates are equal when their DER encodings match; two empty
    /// certificates are equal.
    pub fn equal(&self, other: &TlsCertificate) -> bool {
        match (&self.cert, &other.cert) {
            (None, None) => true,
            (Some(mine), Some(theirs)) => match (mine.to_der(), theirs.to_der()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            },
            _ => false,
        }
    }

    /// SHA-256 over the DER encoding of the certificate; zeroes when
    /// empty.
    pub fn fingerprint(&self) -> Vec<u8> {
        self.cert
            .as_ref()
            .and_then(|cert| cert.digest(MessageDigest::sha256()).ok())
            .map(|digest| digest.to_vec())
            .unwrap_or_else(|| vec![0; FINGERPRINT_SIZE])
    }

    /// SHA-256 over the DER encoding of the public key.
    pub fn public_key_fingerprint(&self) -> Vec<u8> {
        self.cert
            .as_ref()
            .and_then(|cert| cert.public_key().ok())
            .and_then(|key| key.public_key_to_der().ok())
            .and_then(|der| hash(MessageDigest::sha256(), &der).ok())
            .map(|digest| digest.to_vec())
            .unwrap_or_else(|| vec![0; FINGERPRINT_SIZE])
    }

    /// SHA-256 over the DER encoding of the private key.
    pub fn private_key_fingerprint(&self) -> Vec<u8> {
        self.pkey
            .as_ref()
            .and_then(|key| key.private_key_to_der().ok())
            .and_then(|der| hash(MessageDigest::sha256(), &der).ok())
            .map(|digest| digest.to_vec())
            .unwrap_or_else(|| vec![0; FINGERPRINT_SIZE])
    }

    /// PEM export of the certificate; empty string when there is none.
    pub fn to_pem(&self) -> String {
        self.cert
            .as_ref()
            .and_then(|cert| cert.to_pem().ok())
            .map(|pem| String::from_utf8_lossy(&pem).into_owned())
            .unwrap_or_default()
    }

    /// PEM export of the private key (PKCS#8); empty string when absent.
    pub fn private_key_to_pem(&self) -> String {
        self.pkey
            .as_ref()
            .and_then(|key| key.private_key_to_pem_pkcs8().ok())
            .map(|pem| String::from_utf8_lossy(&pem).into_owned())
            .unwrap_or_default()
    }
}

impl Clone for TlsCertificate {
    fn clone(&self) -> TlsCertificate {
        let chain = self.chain.as_ref().map(|chain| {
            let mut copy = Stack::new().expect("X509 stack allocation failed");
            for link in chain.iter() {
                copy.push(link.to_owned())
                    .expect("X509 stack push failed");
            }
            copy
        });
        TlsCertificate {
            cert: self.cert.clone(),
            chain,
            pkey: self.pkey.clone(),
            cached_verify: Mutex::new(*self.cached_verify.lock().unwrap()),
        }
    }
}

fn domain_matches(pattern: &str, domain: &str) -> bool {
    if pattern.eq_ignore_ascii_case(domain) {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        let tail = format!(".{}", suffix);
        if domain.len() > tail.len()
            && domain.to_ascii_lowercase().ends_with(&tail.to_ascii_lowercase())
        {
            return true;
        }
    }
    false
}

fn format_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let field = entry
                .object()
                .nid()
                .short_name()
                .unwrap_or("?")
                .to_string();
            let value = entry
                .data()
                .as_utf8()
                .map(|text| text.to_string())
                .unwrap_or_default();
            format!("{} = {}", field, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_name(side: NameScope, names: &[CertName]) -> Result<X509Name> {
    let mut builder = X509NameBuilder::new()?;
    let find = |field: NameField| {
        names
            .iter()
            .find(|name| name.field == field && (name.scope == NameScope::Both || name.scope == side))
    };
    if let Some(name) = find(NameField::CommonName) {
        builder.append_entry_by_text("CN", &name.text)?;
    }
    if let Some(name) = find(NameField::EmailAddress) {
        builder.append_entry_by_text("emailAddress", &name.text)?;
    }
    if let Some(name) = find(NameField::UserId) {
        builder.append_entry_by_text("UID", &name.text)?;
    }
    if let Some(name) = find(NameField::Domain) {
        for component in name.text.split('.').filter(|part| !part.is_empty()) {
            builder.append_entry_by_text("DC", component)?;
        }
    }
    if let Some(name) = find(NameField::OrganizationalUnit) {
        builder.append_entry_by_text("OU", &name.text)?;
    }
    if let Some(name) = find(NameField::Organization) {
        builder.append_entry_by_text("O", &name.text)?;
    }
    if let Some(name) = find(NameField::Country) {
        builder.append_entry_by_text("C", &name.text)?;
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn year_from_now() -> i64 {
        quark::time::timestamp_secs() as i64 + 365 * 86_400
    }

    fn test_names() -> Vec<CertName> {
        vec![
            CertName::both(NameField::CommonName, "Test"),
            CertName::subject(NameField::Organization, "Testers"),
            CertName::subject(NameField::Country, "FI"),
        ]
    }

    #[test]
    fn test_self_signed_generation() {
        let cert = TlsCertificate::self_signed_rsa(2048, year_from_now(), &test_names()).unwrap();
        assert!(!cert.is_empty());
        assert!(cert.has_private_key());
        assert!(!cert.is_expired());
        assert_eq!(cert.verify(), VerifyStatus::SelfSigned);
        assert!(cert.verify_domain("Test"));
        assert!(!cert.verify_domain("Other"));

        let subject = cert.subject();
        assert!(subject.contains("CN = Test"));
        assert!(subject.contains("O = Testers"));
        assert!(subject.contains("C = FI"));
        // Only the CN was scoped to the issuer.
        let issuer = cert.issuer();
        assert!(issuer.contains("CN = Test"));
        assert!(!issuer.contains("O = Testers"));
    }

    #[test]
    fn test_domain_components_are_split() {
        let names = vec![
            CertName::both(NameField::CommonName, "svc"),
            CertName::subject(NameField::Domain, "node.example.com"),
        ];
        let cert = TlsCertificate::self_signed_rsa(2048, year_from_now(), &names).unwrap();
        let subject = cert.subject();
        assert!(subject.contains("DC = node"));
        assert!(subject.contains("DC = example"));
        assert!(subject.contains("DC = com"));
    }

    #[test]
    fn test_wildcard_common_name() {
        let names = vec![CertName::both(NameField::CommonName, "*.example.org")];
        let cert = TlsCertificate::self_signed_rsa(2048, year_from_now(), &names).unwrap();
        assert!(cert.verify_domain("foo.example.org"));
        assert!(cert.verify_domain("FOO.EXAMPLE.ORG"));
        assert!(!cert.verify_domain("example.org"));
        assert!(!cert.verify_domain("foo.example.com"));
    }

    #[test]
    fn test_expired_certificate() {
        let past = quark::time::timestamp_secs() as i64 - 86_400;
        let cert =
            TlsCertificate::self_signed_rsa(2048, past, &test_names()).unwrap();
        assert!(cert.is_expired());
    }

    #[test]
    fn test_valid_until_roundtrip() {
        let until = year_from_now();
        let cert = TlsCertificate::self_signed_rsa(2048, until, &test_names()).unwrap();
        let reported = cert.valid_until().unwrap();
        assert!((reported - until).abs() <= 1);
    }

    #[test]
    fn test_pem_roundtrip_and_equality() {
        let cert = TlsCertificate::self_signed_rsa(2048, year_from_now(), &test_names()).unwrap();
        let pem = cert.to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        let key_pem = cert.private_key_to_pem();
        assert!(key_pem.contains("PRIVATE KEY"));

        let parsed = TlsCertificate::from_pem_with_key(&pem, &key_pem).unwrap();
        assert!(cert.equal(&parsed));
        assert!(parsed.has_private_key());
        assert_eq!(cert.fingerprint(), parsed.fingerprint());
        assert_eq!(
            cert.private_key_fingerprint(),
            parsed.private_key_fingerprint()
        );

        let other = TlsCertificate::self_signed_rsa(2048, year_from_now(), &test_names()).unwrap();
        assert!(!cert.equal(&other));
        assert_ne!(cert.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_fingerprints_have_expected_shape() {
        let empty = TlsCertificate::empty();
        assert_eq!(empty.fingerprint(), vec![0; FINGERPRINT_SIZE]);
        assert!(empty.is_expired());
        assert!(!empty.verify_domain("anything"));

        let cert = TlsCertificate::self_signed_rsa(2048, year_from_now(), &test_names()).unwrap();
        assert_eq!(cert.fingerprint().len(), FINGERPRINT_SIZE);
        assert_eq!(cert.public_key_fingerprint().len(), FINGERPRINT_SIZE);
        assert_ne!(cert.fingerprint(), cert.public_key_fingerprint());
    }

    #[test]
    fn test_copy_preserves_cached_verify_status() {
        let cert = TlsCertificate::self_signed_rsa(2048, year_from_now(), &test_names()).unwrap();
        assert_eq!(cert.verify(), VerifyStatus::SelfSigned);
        let copy = cert.clone();
        assert_eq!(*copy.cached_verify.lock().unwrap(), VerifyStatus::SelfSigned);
    }

    #[test]
    fn test_bad_pem_is_an_error() {
        assert!(TlsCertificate::from_pem("not a certificate").is_err());
    }
}
