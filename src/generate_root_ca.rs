//! Root CA Bootstrap Module
//!
//! Creates a fresh PKI directory with a self-signed RSA CA, in the same layout EasyRSA's
//! `init-pki`, `build-ca` and `gen-dh` produce. Normal operation never calls this; it exists so a
//! new deployment does not need a separate CA tool.
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Key Usage**: keyCertSign, cRLSign (critical)
//! - **Basic Constraints**: CA=true, pathlen=0 (signs client certificates only)
//! - **Default Key Size**: RSA 4096-bit
//! - **Default Validity**: 3650 days
//!
//! # Example
//! ```rust,no_run
//! use vpn_pki::configs::PkiPaths;
//! use vpn_pki::generate_root_ca::{init_pki_dir, RsaRootCABuilder};
//! # fn example() -> anyhow::Result<()> {
//! let builder = RsaRootCABuilder::new()
//!     .subject_common_name("Acme VPN CA".to_string())
//!     .organization("Acme".to_string())
//!     .country("US".to_string());
//! init_pki_dir(&PkiPaths::from_root("pki"), builder, None, None)?;
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, bail, Context, Result};
use openssl::bn::{BigNum, MsbOption};
use openssl::dh::Dh;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::symm::Cipher;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509Name, X509};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::configs::PkiPaths;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const RSA_KEY_SIZE_DEFAULT: u32 = 4096;
const CA_PATH_LENGTH: u32 = 0;
const DH_GENERATOR: u32 = 2;
const PRIVATE_FILE_MODE: u32 = 0o600;

// ================= RSA Root CA Builder =================

/// Builder for a self-signed RSA CA certificate.
///
/// Only the common name is required. Empty distinguished name fields are left out of the
/// subject, so every attribute set here is later copied into issued client certificates.
#[derive(Debug, Clone)]
pub struct RsaRootCABuilder {
    subject_common_name: String,
    organization: String,
    organizational_unit: String,
    locality: String,
    state: String,
    country: String,
    validity_days: u32,
    key_size: u32,
}

impl Default for RsaRootCABuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RsaRootCABuilder {
    pub fn new() -> Self {
        Self {
            subject_common_name: String::new(),
            organization: String::new(),
            organizational_unit: String::new(),
            locality: String::new(),
            state: String::new(),
            country: String::new(),
            validity_days: 3650,
            key_size: RSA_KEY_SIZE_DEFAULT,
        }
    }

    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    pub fn organizational_unit(mut self, ou: String) -> Self {
        self.organizational_unit = ou;
        self
    }

    pub fn locality(mut self, locality: String) -> Self {
        self.locality = locality;
        self
    }

    pub fn state(mut self, state: String) -> Self {
        self.state = state;
        self
    }

    /// Two-letter ISO 3166-1 country code
    pub fn country(mut self, country: String) -> Self {
        self.country = country;
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn key_size(mut self, bits: u32) -> Self {
        self.key_size = bits;
        self
    }

    /// Subject in the usual OpenSSL order: C, ST, L, O, OU, CN.
    fn subject_name(&self) -> Result<X509Name> {
        if self.subject_common_name.is_empty() {
            bail!("CA common name is required");
        }

        let mut name_builder =
            X509Name::builder().map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        for (nid, value) in [
            (Nid::COUNTRYNAME, &self.country),
            (Nid::STATEORPROVINCENAME, &self.state),
            (Nid::LOCALITYNAME, &self.locality),
            (Nid::ORGANIZATIONNAME, &self.organization),
            (Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit),
            (Nid::COMMONNAME, &self.subject_common_name),
        ] {
            if value.is_empty() {
                continue;
            }
            name_builder
                .append_entry_by_nid(nid, value)
                .map_err(|e| anyhow!("Failed to set {}: {}", nid.short_name().unwrap_or("?"), e))?;
        }
        Ok(name_builder.build())
    }

    /// Build the RSA key pair and self-signed CA certificate
    ///
    /// # Returns
    /// * `Ok((PKey<Private>, X509))` - Tuple of (private key, self-signed certificate)
    ///
    /// # Errors
    /// Returns error if the common name is empty or any OpenSSL step fails.
    pub fn build(self) -> Result<(PKey<Private>, X509)> {
        let name = self.subject_name()?;

        let rsa = openssl::rsa::Rsa::generate(self.key_size)
            .map_err(|e| anyhow!("Failed to generate RSA keypair: {}", e))?;
        let private_key =
            PKey::from_rsa(rsa).map_err(|e| anyhow!("Failed to create private key: {}", e))?;

        let mut builder =
            X509::builder().map_err(|e| anyhow!("Failed to create X509 builder: {}", e))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| anyhow!("Failed to set version: {}", e))?;

        // Random 128-bit serial; client serials come from the serial file instead
        let mut serial = BigNum::new()?;
        serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        builder
            .set_subject_name(&name)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;
        builder
            .set_issuer_name(&name)
            .map_err(|e| anyhow!("Failed to set issuer: {}", e))?;

        let not_before = openssl::asn1::Asn1Time::days_from_now(0)
            .map_err(|e| anyhow!("Failed to create not_before: {}", e))?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| anyhow!("Failed to set not_before: {}", e))?;
        let not_after = openssl::asn1::Asn1Time::days_from_now(self.validity_days)
            .map_err(|e| anyhow!("Failed to create not_after: {}", e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| anyhow!("Failed to set not_after: {}", e))?;

        builder
            .set_pubkey(&private_key)
            .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

        let basic_constraints = BasicConstraints::new()
            .critical()
            .ca()
            .pathlen(CA_PATH_LENGTH)
            .build()
            .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
        builder
            .append_extension(basic_constraints)
            .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

        let key_usage = KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build()
            .map_err(|e| anyhow!("Failed to build KeyUsage: {}", e))?;
        builder
            .append_extension(key_usage)
            .map_err(|e| anyhow!("Failed to add KeyUsage: {}", e))?;

        let subject_key_id = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .map_err(|e| anyhow!("Failed to build SubjectKeyIdentifier: {}", e))?;
        builder
            .append_extension(subject_key_id)
            .map_err(|e| anyhow!("Failed to add SubjectKeyIdentifier: {}", e))?;

        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;

        Ok((private_key, builder.build()))
    }
}

/// Diffie-Hellman parameters as PEM.
///
/// Without `bits` the 2048-bit RFC 5114 group is used; generating fresh parameters takes
/// minutes for 2048 bits and more.
pub fn dh_params_pem(bits: Option<u32>) -> Result<String> {
    let dh = match bits {
        Some(bits) => Dh::generate_params(bits, DH_GENERATOR)
            .map_err(|e| anyhow!("Failed to generate DH params: {}", e))?,
        None => Dh::get_2048_256().map_err(|e| anyhow!("Failed to load DH group: {}", e))?,
    };
    let pem = dh.params_to_pem()?;
    String::from_utf8(pem).context("DH params are not valid PEM text")
}

/// Create a new PKI directory: CA cert and key, DH params, empty index and serial `00`.
///
/// Refuses to touch a tree that already holds a CA certificate.
pub fn init_pki_dir(
    paths: &PkiPaths,
    builder: RsaRootCABuilder,
    ca_passphrase: Option<&str>,
    dh_bits: Option<u32>,
) -> Result<X509> {
    if paths.cacert.exists() {
        bail!(
            "CA certificate already exists at {}",
            paths.cacert.display()
        );
    }

    for dir in [
        paths.path.clone(),
        paths.path.join("private"),
        paths.path.join("issued"),
    ] {
        fs::create_dir_all(&dir)
            .context(format!("Failed to create directory {}", dir.display()))?;
    }

    let (private_key, certificate) = builder.build()?;
    let key_pem = match ca_passphrase {
        Some(pwd) => private_key
            .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), pwd.as_bytes())?,
        None => private_key.private_key_to_pem_pkcs8()?,
    };

    write_new_file(&paths.cakey, &key_pem, PRIVATE_FILE_MODE)?;
    write_new_file(&paths.cacert, &certificate.to_pem()?, 0o644)?;
    write_new_file(&paths.dh, dh_params_pem(dh_bits)?.as_bytes(), 0o644)?;
    write_new_file(&paths.index, b"", 0o644)?;
    write_new_file(&paths.serial, b"00\n", 0o644)?;

    info!(path = %paths.path.display(), "initialized PKI directory");
    Ok(certificate)
}

fn write_new_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = opts
        .open(path)
        .context(format!("Failed to create {}", path.display()))?;
    file.write_all(contents)
        .context(format!("Failed to write {}", path.display()))?;
    file.sync_all()
        .context(format!("Failed to sync {}", path.display()))?;
    Ok(())
}
