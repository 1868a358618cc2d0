//! CA / certificate factory: loads (or mints) a root CA and mints per-host
//! leaf certificates on demand, caching them by hostname.
//!
//! See `spec.md` §4.3. Grounded on `examples/original_source/pkg/jnproxy/
//! internal/proxy/http/{ca,cert}.go` for the shape of the cache and the
//! "re-enable upstream verification" requirement, and on
//! `docs/proxy/mitm-proxy/src/main.rs` for the `rcgen` CA bootstrap idiom in
//! this codebase.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P521_SHA512,
};

use crate::error::{Error, Result};

/// `{ certificate_pem, private_key_pem }`. Used only to sign leaves, never
/// served directly to clients.
pub struct CertificateAuthority {
    issuer_cert: Certificate,
    issuer_key: KeyPair,
    cert_pem: String,
    key_pem: String,
    cache: Mutex<HashMap<String, LeafCert>>,
}

/// A minted leaf certificate, keyed by hostname in the CA's cache.
pub struct LeafCert {
    pub hostname: String,
    pub der: rustls::pki_types::CertificateDer<'static>,
    pub private_key: rustls::pki_types::PrivatePkcs8KeyDer<'static>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl Clone for LeafCert {
    fn clone(&self) -> Self {
        Self {
            hostname: self.hostname.clone(),
            der: self.der.clone(),
            private_key: self.private_key.clone_key(),
            not_before: self.not_before,
            not_after: self.not_after,
        }
    }
}

impl CertificateAuthority {
    /// Loads a CA from PEM-encoded certificate and key bytes.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        if cert_pem.trim().is_empty() {
            return Err(Error::invalid("empty CA certificate"));
        }
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::invalid(format!("parse CA key: {e}")))?;
        let issuer_params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| Error::invalid(format!("parse CA certificate: {e}")))?;
        let issuer_cert = issuer_params
            .self_signed(&key_pair)
            .map_err(|e| Error::invalid(format!("parse CA certificate: {e}")))?;
        Ok(Self {
            issuer_cert,
            issuer_key: key_pair,
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Mints a fresh, self-signed root CA in memory. Used when no cert
    /// directory is configured (ad hoc runs, tests) — CA state lives on this
    /// instance, never in a package-level global, per `spec.md` §9's note
    /// about the original library's mutable `GoproxyCa`.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Jupyter Lineage Proxy Root CA");
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P521_SHA512)
            .map_err(|e| Error::invalid(format!("generate CA key: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::invalid(format!("self-sign CA: {e}")))?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Returns the cached leaf for `hostname`, minting one if necessary.
    /// `hostname` must already have any port suffix stripped by the caller
    /// (see [`strip_port`]).
    pub fn leaf_for(&self, hostname: &str) -> Result<LeafCert> {
        {
            let cache = self.cache.lock().expect("CA cache poisoned");
            if let Some(leaf) = cache.get(hostname) {
                return Ok(leaf.clone());
            }
        }

        let leaf = self.mint_leaf(hostname)?;
        let mut cache = self.cache.lock().expect("CA cache poisoned");
        Ok(cache
            .entry(hostname.to_string())
            .or_insert(leaf)
            .clone())
    }

    fn mint_leaf(&self, hostname: &str) -> Result<LeafCert> {
        let san = if let Ok(ip) = hostname.parse::<std::net::IpAddr>() {
            SanType::IpAddress(ip)
        } else {
            let name = Ia5String::try_from(hostname)
                .map_err(|e| Error::invalid(format!("invalid hostname for SAN: {e}")))?;
            SanType::DnsName(name)
        };

        let not_before = SystemTime::now() - Duration::from_secs(30 * 24 * 3600);
        let not_after = SystemTime::now() + Duration::from_secs(365 * 24 * 3600);

        let mut params = CertificateParams::new(Vec::new())
            .map_err(|e| Error::invalid(format!("cert params: {e}")))?;
        params.subject_alt_names = vec![san];
        params.not_before = not_before.into();
        params.not_after = not_after.into();
        params.serial_number = Some(rcgen::SerialNumber::from(random_63_bit_serial()));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P521_SHA512)
            .map_err(|e| Error::invalid(format!("generate leaf key: {e}")))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer_cert, &self.issuer_key)
            .map_err(|e| Error::invalid(format!("sign leaf for {hostname}: {e}")))?;

        Ok(LeafCert {
            hostname: hostname.to_string(),
            der: cert.der().clone(),
            private_key: rustls::pki_types::PrivatePkcs8KeyDer::from(
                key_pair.serialize_der(),
            ),
            not_before,
            not_after,
        })
    }
}

fn random_63_bit_serial() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    hasher.finish() & 0x7fff_ffff_ffff_ffff
}

/// Strips the `:port` suffix from a CONNECT target, honoring IPv6 brackets
/// (`[::1]:443` -> `::1`).
pub fn strip_port(host_port: &str) -> &str {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match host_port.rfind(':') {
        Some(idx) => &host_port[..idx],
        None => host_port,
    }
}
