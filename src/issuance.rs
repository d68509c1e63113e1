//! Issuance service.
//!
//! One issuance moves through these states:
//!
//! ```text
//! Idle -> CheckingUniqueness -> AcquiringLock -> AllocatingSerial -> Signing
//!      -> Appending -> ReleasingLock -> Done
//! ```
//!
//! Any failure after the lock is taken still goes through `ReleasingLock` before the error is
//! returned. Failures before that return immediately and leave nothing behind.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::ca_context::CaContext;
use crate::configs::PkiPaths;
use crate::error::{PkiError, Result};
use crate::generate_client_cert::{CertificateBundle, ClientCertificateBuilder};
use crate::index::{IndexFile, IndexRecord};
use crate::index_lock::IndexLock;
use crate::serial::SerialFile;

static COMMON_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").expect("common name pattern is valid"));

/// Common names are restricted to what the index's CN pattern can read back, which also makes
/// them safe to use as file names.
pub fn is_valid_common_name(name: &str) -> bool {
    COMMON_NAME.is_match(name)
}

/// Per-endpoint issuance parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointProfile {
    pub key_size: u32,
    pub validity_days: u32,
}

impl Default for EndpointProfile {
    fn default() -> Self {
        Self {
            key_size: 2048,
            validity_days: 365,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceState {
    Idle,
    CheckingUniqueness,
    AcquiringLock,
    AllocatingSerial,
    Signing,
    Appending,
    ReleasingLock,
    Done,
    Error,
}

impl fmt::Display for IssuanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Issues client certificates against one PKI tree.
#[derive(Debug, Clone)]
pub struct IssuanceService {
    index: IndexFile,
    serials: SerialFile,
    lock: IndexLock,
}

impl IssuanceService {
    pub fn new(paths: &PkiPaths) -> Self {
        Self {
            index: IndexFile::new(&paths.index),
            serials: SerialFile::new(&paths.serial),
            lock: IndexLock::for_index(&paths.index),
        }
    }

    /// Treat lock markers older than `lease` as abandoned.
    pub fn with_lock_lease(mut self, lease: Option<Duration>) -> Self {
        self.lock = self.lock.with_lease(lease);
        self
    }

    pub fn index(&self) -> &IndexFile {
        &self.index
    }

    pub fn lock(&self) -> &IndexLock {
        &self.lock
    }

    /// Issue a certificate for `common_name` and record it in the index.
    ///
    /// # Errors
    /// * `InvalidName` - name cannot be represented in the index
    /// * `Conflict` - a certificate with this name already exists
    /// * `Locked` - another issuance holds the index
    /// * `Parse`, `Crypto`, `Validation`, `Io` - from the guarded region, lock already released
    pub async fn issue(
        &self,
        ca: &CaContext,
        endpoint: &EndpointProfile,
        common_name: &str,
        passphrase: Option<&str>,
    ) -> Result<CertificateBundle> {
        if !is_valid_common_name(common_name) {
            return Err(PkiError::InvalidName(common_name.to_string()));
        }

        transition(common_name, IssuanceState::Idle, IssuanceState::CheckingUniqueness);
        if self.index.is_name_taken(common_name).await? {
            return Err(PkiError::Conflict(common_name.to_string()));
        }

        transition(common_name, IssuanceState::CheckingUniqueness, IssuanceState::AcquiringLock);
        let guard = self.lock.acquire().await?;

        let outcome = self
            .issue_locked(ca, endpoint, common_name, passphrase)
            .await;

        let last = match &outcome {
            Ok(_) => IssuanceState::Appending,
            Err(_) => IssuanceState::Error,
        };
        transition(common_name, last, IssuanceState::ReleasingLock);
        let released = guard.release().await;

        match (outcome, released) {
            (Ok(bundle), Ok(())) => {
                transition(common_name, IssuanceState::ReleasingLock, IssuanceState::Done);
                info!(
                    name = common_name,
                    serial = bundle.serial,
                    expires = %bundle.not_after.to_rfc3339(),
                    "issued client certificate"
                );
                Ok(bundle)
            }
            (Ok(bundle), Err(e)) => {
                error!(
                    name = common_name,
                    serial = bundle.serial,
                    error = %e,
                    "certificate recorded but index lock could not be released"
                );
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                error!(name = common_name, error = %release_err, "failed to release index lock");
                Err(e)
            }
        }
    }

    /// Everything between lock and release.
    async fn issue_locked(
        &self,
        ca: &CaContext,
        endpoint: &EndpointProfile,
        common_name: &str,
        passphrase: Option<&str>,
    ) -> Result<CertificateBundle> {
        // Another issuer may have recorded the name between our check and the lock
        if self.index.is_name_taken(common_name).await? {
            return Err(PkiError::Conflict(common_name.to_string()));
        }

        transition(common_name, IssuanceState::AcquiringLock, IssuanceState::AllocatingSerial);
        let serial = self.serials.next().await?;

        transition(common_name, IssuanceState::AllocatingSerial, IssuanceState::Signing);
        let bundle = ClientCertificateBuilder::new(ca, common_name, serial)
            .key_size(endpoint.key_size)
            .validity_days(endpoint.validity_days)
            .passphrase(passphrase.map(str::to_string))
            .build()
            .await?;
        bundle.validate()?;

        transition(common_name, IssuanceState::Signing, IssuanceState::Appending);
        self.index
            .append(common_name, serial, bundle.not_after)
            .await?;

        Ok(bundle)
    }

    /// All issued certificates in issuance order. Read-only, takes no lock.
    pub async fn list(&self) -> Result<Vec<IndexRecord>> {
        self.index.list_records().await
    }
}

fn transition(name: &str, from: IssuanceState, to: IssuanceState) {
    debug!(name, %from, %to, "issuance state");
}
