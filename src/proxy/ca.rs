//! Certificate authority for TLS interception.
//!
//! The browser is launched with certificate errors ignored, so the CA only
//! needs to be internally consistent. Operators who run an unflagged browser
//! must trust the CA certificate written by `tcfaudit generate-ca`.

use crate::base::error::AuditError;
use boring::asn1::Asn1Time;
use boring::bn::{BigNum, MsbOption};
use boring::hash::MessageDigest;
use boring::pkey::{PKey, Private};
use boring::rsa::Rsa;
use boring::ssl::{SslAcceptor, SslMethod};
use boring::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use boring::x509::{X509Builder, X509Name, X509NameBuilder, X509};
use dashmap::DashMap;
use std::path::Path;

const CA_VALIDITY_DAYS: u32 = 3650;
const LEAF_VALIDITY_DAYS: u32 = 365;

fn cert_err(context: &str) -> impl Fn(boring::error::ErrorStack) -> AuditError + '_ {
    move |e| AuditError::Certificate(format!("{context}: {e}"))
}

/// Signs per-host leaf certificates and caches one acceptor per host.
pub struct CertificateAuthority {
    cert: X509,
    key: PKey<Private>,
    /// Shared by every leaf; key generation dominates minting cost.
    leaf_key: PKey<Private>,
    acceptors: DashMap<String, SslAcceptor>,
}

impl CertificateAuthority {
    /// Create a fresh self-signed CA.
    pub fn generate(common_name: &str) -> Result<Self, AuditError> {
        let key = rsa_key()?;
        let name = x509_name(common_name)?;

        let mut builder = X509Builder::new().map_err(cert_err("builder"))?;
        builder.set_version(2).map_err(cert_err("version"))?;
        builder
            .set_serial_number(&*random_serial()?)
            .map_err(cert_err("serial"))?;
        builder.set_subject_name(&name).map_err(cert_err("subject"))?;
        builder.set_issuer_name(&name).map_err(cert_err("issuer"))?;
        builder.set_pubkey(&key).map_err(cert_err("pubkey"))?;
        let not_before = Asn1Time::days_from_now(0).map_err(cert_err("not_before"))?;
        let not_after = Asn1Time::days_from_now(CA_VALIDITY_DAYS).map_err(cert_err("not_after"))?;
        builder.set_not_before(&not_before).map_err(cert_err("not_before"))?;
        builder.set_not_after(&not_after).map_err(cert_err("not_after"))?;

        let constraints = BasicConstraints::new()
            .critical()
            .ca()
            .build()
            .map_err(cert_err("basic constraints"))?;
        let usage = KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build()
            .map_err(cert_err("key usage"))?;
        builder.append_extension(constraints).map_err(cert_err("extension"))?;
        builder.append_extension(usage).map_err(cert_err("extension"))?;
        builder
            .sign(&key, MessageDigest::sha256())
            .map_err(cert_err("sign"))?;

        Self::from_parts(builder.build(), key)
    }

    /// Load a CA from PEM-encoded certificate and private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, AuditError> {
        let cert = X509::from_pem(cert_pem).map_err(cert_err("CA certificate"))?;
        let key = PKey::private_key_from_pem(key_pem).map_err(cert_err("CA key"))?;
        Self::from_parts(cert, key)
    }

    /// Load a CA from PEM files on disk.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, AuditError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                AuditError::Certificate(format!("reading {}: {e}", path.display()))
            })
        };
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }

    fn from_parts(cert: X509, key: PKey<Private>) -> Result<Self, AuditError> {
        Ok(Self {
            cert,
            key,
            leaf_key: rsa_key()?,
            acceptors: DashMap::new(),
        })
    }

    pub fn cert_pem(&self) -> Result<Vec<u8>, AuditError> {
        self.cert.to_pem().map_err(cert_err("CA certificate"))
    }

    pub fn key_pem(&self) -> Result<Vec<u8>, AuditError> {
        self.key
            .private_key_to_pem_pkcs8()
            .map_err(cert_err("CA key"))
    }

    /// Write the certificate and key as PEM files.
    pub fn write_pem(&self, cert_path: &Path, key_path: &Path) -> Result<(), AuditError> {
        let write = |path: &Path, bytes: Vec<u8>| {
            std::fs::write(path, bytes).map_err(|e| {
                AuditError::Certificate(format!("writing {}: {e}", path.display()))
            })
        };
        write(cert_path, self.cert_pem()?)?;
        write(key_path, self.key_pem()?)
    }

    pub fn certificate(&self) -> &X509 {
        &self.cert
    }

    /// TLS acceptor presenting a leaf certificate for `host`.
    pub fn acceptor_for(&self, host: &str) -> Result<SslAcceptor, AuditError> {
        let host = host.to_ascii_lowercase();
        if let Some(existing) = self.acceptors.get(&host) {
            return Ok(existing.clone());
        }

        let leaf = self.mint_leaf(&host)?;
        let mut builder =
            SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).map_err(AuditError::from)?;
        builder.set_private_key(&self.leaf_key)?;
        builder.set_certificate(&leaf)?;
        builder.add_extra_chain_cert(self.cert.clone())?;
        let acceptor = builder.build();

        self.acceptors.insert(host, acceptor.clone());
        Ok(acceptor)
    }

    fn mint_leaf(&self, host: &str) -> Result<X509, AuditError> {
        let mut builder = X509Builder::new().map_err(cert_err("builder"))?;
        builder.set_version(2).map_err(cert_err("version"))?;
        builder
            .set_serial_number(&*random_serial()?)
            .map_err(cert_err("serial"))?;
        builder
            .set_subject_name(&*x509_name(host)?)
            .map_err(cert_err("subject"))?;
        builder
            .set_issuer_name(self.cert.subject_name())
            .map_err(cert_err("issuer"))?;
        builder.set_pubkey(&self.leaf_key).map_err(cert_err("pubkey"))?;
        // Backdated to tolerate clock skew between proxy and browser.
        let not_before = Asn1Time::from_unix(time::OffsetDateTime::now_utc().unix_timestamp() - 86_400)
            .map_err(cert_err("not_before"))?;
        let not_after = Asn1Time::days_from_now(LEAF_VALIDITY_DAYS).map_err(cert_err("not_after"))?;
        builder.set_not_before(&not_before).map_err(cert_err("not_before"))?;
        builder.set_not_after(&not_after).map_err(cert_err("not_after"))?;

        let san = {
            let mut san = SubjectAlternativeName::new();
            if host.parse::<std::net::IpAddr>().is_ok() {
                san.ip(host);
            } else {
                san.dns(host);
            }
            san.build(&builder.x509v3_context(Some(&*self.cert), None))
                .map_err(cert_err("subject alt name"))?
        };
        let constraints = BasicConstraints::new()
            .build()
            .map_err(cert_err("basic constraints"))?;
        let eku = ExtendedKeyUsage::new()
            .server_auth()
            .build()
            .map_err(cert_err("extended key usage"))?;
        builder.append_extension(san).map_err(cert_err("extension"))?;
        builder.append_extension(constraints).map_err(cert_err("extension"))?;
        builder.append_extension(eku).map_err(cert_err("extension"))?;
        builder
            .sign(&self.key, MessageDigest::sha256())
            .map_err(cert_err("sign"))?;

        tracing::debug!(host = %host, "minted leaf certificate");
        Ok(builder.build())
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached_hosts", &self.acceptors.len())
            .finish_non_exhaustive()
    }
}

fn rsa_key() -> Result<PKey<Private>, AuditError> {
    let rsa = Rsa::generate(2048).map_err(cert_err("RSA key"))?;
    PKey::from_rsa(rsa).map_err(cert_err("RSA key"))
}

fn random_serial() -> Result<boring::asn1::Asn1Integer, AuditError> {
    let mut serial = BigNum::new().map_err(cert_err("serial"))?;
    serial
        .rand(127, MsbOption::MAYBE_ZERO, false)
        .map_err(cert_err("serial"))?;
    serial.to_asn1_integer().map_err(cert_err("serial"))
}

fn x509_name(common_name: &str) -> Result<X509Name, AuditError> {
    let mut name = X509NameBuilder::new().map_err(cert_err("name"))?;
    name.append_entry_by_text("O", "tcfaudit")
        .map_err(cert_err("name"))?;
    name.append_entry_by_text("CN", common_name)
        .map_err(cert_err("name"))?;
    Ok(name.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ca_round_trips_through_pem() {
        let ca = CertificateAuthority::generate("tcfaudit test CA").unwrap();
        let cert = ca.cert_pem().unwrap();
        let key = ca.key_pem().unwrap();
        assert!(String::from_utf8_lossy(&cert).contains("BEGIN CERTIFICATE"));

        let reloaded = CertificateAuthority::from_pem(&cert, &key).unwrap();
        assert_eq!(
            reloaded.certificate().to_der().unwrap(),
            ca.certificate().to_der().unwrap()
        );
    }

    #[test]
    fn test_acceptor_cached_per_host() {
        let ca = CertificateAuthority::generate("tcfaudit test CA").unwrap();
        ca.acceptor_for("ads.example").unwrap();
        ca.acceptor_for("ADS.example").unwrap();
        ca.acceptor_for("127.0.0.1").unwrap();
        assert_eq!(ca.acceptors.len(), 2);
    }

    #[test]
    fn test_from_pem_rejects_garbage() {
        assert!(matches!(
            CertificateAuthority::from_pem(b"nope", b"nope"),
            Err(AuditError::Certificate(_))
        ));
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca.key");
        let ca = CertificateAuthority::generate("tcfaudit test CA").unwrap();
        ca.write_pem(&cert_path, &key_path).unwrap();

        let loaded = CertificateAuthority::load(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.cert_pem().unwrap(), ca.cert_pem().unwrap());
    }
}
