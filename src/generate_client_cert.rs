//! Client Certificate Generation Module
//!
//! Builds and signs VPN client certificates against the local CA. The subject is the CA's
//! subject with the common name swapped for the client's, so every client inherits the CA's
//! organization, country and so on.
//!
//! # Certificate Properties
//! - **Version**: X.509v3
//! - **Signature Algorithm**: SHA-256 with RSA
//! - **Basic Constraints**: CA=false, critical
//! - **Key Usage**: digitalSignature, keyEncipherment (critical)
//! - **Extended Key Usage**: clientAuth
//! - **Serial Number**: allocated from the PKI's serial file by the caller
//! - **Default Validity**: 365 days
//!
//! # Example
//! ```rust,no_run
//! # use vpn_pki::ca_context::CaContext;
//! # use vpn_pki::generate_client_cert::ClientCertificateBuilder;
//! # async fn example(ca: &CaContext) -> vpn_pki::error::Result<()> {
//! let bundle = ClientCertificateBuilder::new(ca, "alice", 7)
//!     .key_size(2048)
//!     .validity_days(365)
//!     .passphrase(Some("correct horse".to_string()))
//!     .build()
//!     .await?;
//! assert_eq!(bundle.serial, 7);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::symm::Cipher;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509Ref, X509};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::ca_context::CaContext;
use crate::error::{PkiError, Result};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const RSA_KEY_SIZE_DEFAULT: u32 = 2048;
const VALIDITY_DAYS_DEFAULT: u32 = 365;

/// Everything a client needs to connect, created fresh for each issuance.
#[derive(Clone)]
pub struct CertificateBundle {
    /// PEM private key. PKCS#8 `ENCRYPTED PRIVATE KEY` when issued with a passphrase,
    /// PKCS#1 `RSA PRIVATE KEY` otherwise.
    pub private_key: String,
    pub public_key: String,
    pub certificate: String,
    /// CA certificate PEM, copied unchanged.
    pub ca: String,
    /// DH parameters PEM, copied unchanged.
    pub dh: String,
    pub serial: u64,
    pub not_after: DateTime<Utc>,
}

impl CertificateBundle {
    /// Reject bundles where key generation or signing silently produced nothing.
    pub fn validate(&self) -> Result<()> {
        for (value, message) in [
            (&self.private_key, "Invalid or missing private key"),
            (&self.public_key, "Invalid or missing public key"),
            (&self.certificate, "Invalid certificate"),
        ] {
            if value.trim().is_empty() {
                return Err(PkiError::Validation(message.to_string()));
            }
        }
        Ok(())
    }

    pub fn is_key_encrypted(&self) -> bool {
        self.private_key.contains("ENCRYPTED")
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("serial", &self.serial)
            .field("not_after", &self.not_after)
            .field("private_key", &"<redacted>")
            .field("certificate", &self.certificate)
            .finish()
    }
}

// ================= Client Certificate Builder =================

/// Builder for an RSA key pair and a client certificate signed by the CA.
pub struct ClientCertificateBuilder<'a> {
    ca: &'a CaContext,
    common_name: String,
    serial: u64,
    key_size: u32,
    validity_days: u32,
    passphrase: Option<SecretString>,
}

impl<'a> ClientCertificateBuilder<'a> {
    /// # Arguments
    /// * `ca` - CA whose key signs the certificate and whose subject is copied
    /// * `common_name` - CN of the client
    /// * `serial` - serial number, already allocated and persisted
    pub fn new(ca: &'a CaContext, common_name: &str, serial: u64) -> Self {
        Self {
            ca,
            common_name: common_name.to_string(),
            serial,
            key_size: RSA_KEY_SIZE_DEFAULT,
            validity_days: VALIDITY_DAYS_DEFAULT,
            passphrase: None,
        }
    }

    pub fn key_size(mut self, bits: u32) -> Self {
        self.key_size = bits;
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Encrypt the private key with this passphrase. `None` and the empty string both leave
    /// the key unencrypted.
    pub fn passphrase(mut self, passphrase: Option<String>) -> Self {
        self.passphrase = passphrase
            .filter(|p| !p.is_empty())
            .map(SecretString::from);
        self
    }

    /// Generate the key pair on the blocking pool, then sign.
    pub async fn build(self) -> Result<CertificateBundle> {
        let key = generate_rsa_key(self.key_size).await?;
        self.sign(&key)
    }

    /// Sign a certificate for an existing key pair.
    pub fn sign(self, key: &PKey<Private>) -> Result<CertificateBundle> {
        let ca_cert: &X509Ref = self.ca.certificate();

        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;

        let serial = BigNum::from_dec_str(&self.serial.to_string())?.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let subject = self.subject_name()?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(ca_cert.subject_name())?;

        let (not_before, not_after) = self.validity_window()?;
        let not_before_asn1 = Asn1Time::from_unix(not_before.timestamp())?;
        let not_after_asn1 = Asn1Time::from_unix(not_after.timestamp())?;
        builder.set_not_before(&not_before_asn1)?;
        builder.set_not_after(&not_after_asn1)?;

        builder.set_pubkey(key)?;

        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;

        let subject_key_id =
            SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(subject_key_id)?;
        if ca_cert.subject_key_id().is_some() {
            let authority_key_id = AuthorityKeyIdentifier::new()
                .keyid(false)
                .build(&builder.x509v3_context(Some(ca_cert), None))?;
            builder.append_extension(authority_key_id)?;
        }

        let ca_key = self.ca.key().signing_key()?;
        builder.sign(&ca_key, MessageDigest::sha256())?;
        let certificate = builder.build();

        let private_key = match &self.passphrase {
            Some(passphrase) => key.private_key_to_pem_pkcs8_passphrase(
                Cipher::aes_256_cbc(),
                passphrase.expose_secret().as_bytes(),
            )?,
            None => key.rsa()?.private_key_to_pem()?,
        };

        Ok(CertificateBundle {
            private_key: pem_string(private_key, "private key")?,
            public_key: pem_string(key.public_key_to_pem()?, "public key")?,
            certificate: pem_string(certificate.to_pem()?, "certificate")?,
            ca: pem_string(ca_cert.to_pem()?, "CA certificate")?,
            dh: self.ca.dh_params().to_string(),
            serial: self.serial,
            not_after,
        })
    }

    /// CA subject without its CN, followed by the client's CN.
    fn subject_name(&self) -> Result<X509Name> {
        let mut name_builder = X509Name::builder()?;
        for entry in self.ca.certificate().subject_name().entries() {
            let nid = entry.object().nid();
            if nid == Nid::COMMONNAME {
                continue;
            }
            let value = entry.data().as_utf8()?;
            name_builder.append_entry_by_nid(nid, &value)?;
        }
        name_builder.append_entry_by_nid(Nid::COMMONNAME, &self.common_name)?;
        Ok(name_builder.build())
    }

    /// `[now, now + validity_days]`, truncated to whole seconds.
    fn validity_window(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let now = Utc
            .timestamp_opt(Utc::now().timestamp(), 0)
            .single()
            .ok_or_else(|| PkiError::Validation("system clock out of range".to_string()))?;
        let not_after = now
            .checked_add_signed(Duration::days(i64::from(self.validity_days)))
            .ok_or_else(|| PkiError::Validation("validity period out of range".to_string()))?;
        Ok((now, not_after))
    }
}

/// Generate an RSA key without blocking the async executor.
pub async fn generate_rsa_key(bits: u32) -> Result<PKey<Private>> {
    tokio::task::spawn_blocking(move || -> Result<PKey<Private>> {
        Ok(PKey::from_rsa(Rsa::generate(bits)?)?)
    })
    .await
    .map_err(|e| PkiError::Validation(format!("key generation task failed: {}", e)))?
}

fn pem_string(pem: Vec<u8>, what: &str) -> Result<String> {
    String::from_utf8(pem).map_err(|_| PkiError::Validation(format!("{} is not valid PEM", what)))
}
