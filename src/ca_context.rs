//! CA key material, loaded once at startup and passed by reference into every issuance.
//!
//! The CA private key is kept as PKCS#8 DER inside a [`secrecy::SecretBox`] so that it is
//! zeroized on drop and never shows up in debug output. It is only turned back into an OpenSSL
//! key for the duration of a signing operation.

use anyhow::{ensure, Context, Result};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretBox};
use std::fmt;

use crate::configs::PkiPaths;

/// Secure container for the CA signing key
pub struct CaKeyStore {
    der_bytes: SecretBox<Vec<u8>>,
}

impl CaKeyStore {
    pub fn new(key: &PKey<Private>) -> Result<Self> {
        let der_bytes = key
            .private_key_to_pkcs8()
            .context("Failed to convert CA private key to DER")?;
        Ok(Self {
            der_bytes: SecretBox::new(Box::new(der_bytes)),
        })
    }

    /// Parse a PEM encoded key, decrypting it when a passphrase is given.
    pub fn from_pem(pem_data: &[u8], passphrase: Option<&str>) -> Result<Self> {
        let key = match passphrase {
            Some(pwd) => PKey::private_key_from_pem_passphrase(pem_data, pwd.as_bytes())
                .context("Failed to decrypt CA private key with passphrase")?,
            // empty passphrase instead of none, so an encrypted key fails instead of prompting
            None => PKey::private_key_from_pem_passphrase(pem_data, b"")
                .context("Failed to parse CA key PEM (encrypted key without passphrase?)")?,
        };
        Self::new(&key)
    }

    /// Reconstruct the key for a single signing operation.
    pub(crate) fn signing_key(&self) -> Result<PKey<Private>, openssl::error::ErrorStack> {
        PKey::private_key_from_der(self.der_bytes.expose_secret())
    }
}

impl fmt::Debug for CaKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaKeyStore")
            .field("private_key", &"<securely stored>")
            .finish()
    }
}

/// CA certificate, CA key and Diffie-Hellman parameters.
#[derive(Debug)]
pub struct CaContext {
    certificate: X509,
    key: CaKeyStore,
    dh_params: String,
}

impl CaContext {
    /// Assemble a context from already parsed material. No consistency checks are made.
    pub fn new(certificate: X509, key: &PKey<Private>, dh_params: String) -> Result<Self> {
        Ok(Self {
            certificate,
            key: CaKeyStore::new(key)?,
            dh_params,
        })
    }

    /// Load CA cert, key and DH params from the PKI tree.
    ///
    /// # Errors
    /// Fails if any file is unreadable, if the key cannot be decrypted, or if the key does not
    /// belong to the certificate.
    pub fn load(paths: &PkiPaths, passphrase: Option<&str>) -> Result<Self> {
        let cert_pem = std::fs::read(&paths.cacert).context(format!(
            "Failed to read CA certificate from {}",
            paths.cacert.display()
        ))?;
        let key_pem = std::fs::read(&paths.cakey).context(format!(
            "Failed to read CA key from {}",
            paths.cakey.display()
        ))?;
        let dh_params = std::fs::read_to_string(&paths.dh).context(format!(
            "Failed to read DH params from {}",
            paths.dh.display()
        ))?;

        let certificate =
            X509::from_pem(&cert_pem).context("Failed to parse CA certificate PEM")?;
        let key = CaKeyStore::from_pem(&key_pem, passphrase)?;

        let signing_key = key.signing_key()?;
        let cert_key = certificate.public_key()?;
        ensure!(
            cert_key.public_eq(&signing_key),
            "CA key at {} does not match certificate at {}",
            paths.cakey.display(),
            paths.cacert.display()
        );

        Ok(Self {
            certificate,
            key,
            dh_params,
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn key(&self) -> &CaKeyStore {
        &self.key
    }

    pub fn dh_params(&self) -> &str {
        &self.dh_params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_root_ca::{init_pki_dir, RsaRootCABuilder};

    #[test]
    fn test_debug_no_leak() {
        let pkey = PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap()).unwrap();
        let store = CaKeyStore::new(&pkey).unwrap();

        let debug_str = format!("{:?}", store);
        assert!(!debug_str.contains("der_bytes"));
        assert!(debug_str.contains("securely stored"));
    }

    #[test]
    fn test_signing_key_round_trip() {
        let pkey = PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap()).unwrap();
        let store = CaKeyStore::new(&pkey).unwrap();
        assert!(store.signing_key().unwrap().public_eq(&pkey));
    }

    #[test]
    fn test_load_with_passphrase() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = PkiPaths::from_root(dir.path());
        let builder = RsaRootCABuilder::new()
            .subject_common_name("Test CA".to_string())
            .organization("Acme".to_string())
            .key_size(2048);
        init_pki_dir(&paths, builder, Some("s3cret"), None).unwrap();

        assert!(CaContext::load(&paths, None).is_err());
        let ca = CaContext::load(&paths, Some("s3cret")).unwrap();
        assert!(ca.dh_params().contains("DH PARAMETERS"));
    }

    #[test]
    fn test_load_rejects_mismatched_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = PkiPaths::from_root(dir.path());
        let builder = RsaRootCABuilder::new()
            .subject_common_name("Test CA".to_string())
            .key_size(2048);
        init_pki_dir(&paths, builder, None, None).unwrap();

        let other = PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap()).unwrap();
        std::fs::write(&paths.cakey, other.private_key_to_pem_pkcs8().unwrap()).unwrap();

        let err = CaContext::load(&paths, None).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
