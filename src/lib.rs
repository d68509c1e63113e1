//! VPN PKI - client certificate issuance for a single local CA
//!
//! Issues X.509 client certificates for OpenVPN users and keeps track of them in an
//! EasyRSA-compatible PKI directory, so the same tree can still be handed to EasyRSA or
//! `openssl ca` for revocation.
//!
//! # Overview
//!
//! ```text
//! IssuanceService::issue
//!   ├── IndexFile::is_name_taken      (index.txt)
//!   ├── IndexLock::acquire            (index.txt.lock)
//!   ├── SerialFile::next              (serial)
//!   ├── ClientCertificateBuilder      (signs with the CA in CaContext)
//!   ├── IndexFile::append
//!   └── IndexLockGuard::release
//! ```
//!
//! Guarantees:
//! - **Unique names**: a common name is issued at most once per index
//! - **Unique serials**: the serial file is persisted before a serial is used
//! - **No leaked locks**: every failure after the lock is taken releases it before returning
//! - **Legacy format**: index lines are byte-compatible with OpenSSL's `index.txt`
//!
//! # Example
//!
//! ```no_run
//! use vpn_pki::ca_context::CaContext;
//! use vpn_pki::configs::AppConfig;
//! use vpn_pki::issuance::IssuanceService;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AppConfig::load()?;
//! let paths = config.pki.paths();
//! let ca = CaContext::load(&paths, None)?;
//! let service = IssuanceService::new(&paths).with_lock_lease(config.pki.lock_lease());
//!
//! let endpoint = config.endpoint("office")?.profile();
//! let bundle = service.issue(&ca, &endpoint, "alice", Some("passphrase")).await?;
//! println!("issued serial {}", bundle.serial);
//!
//! for record in service.list().await? {
//!     println!("{} {} {}", record.state, record.serial_text, record.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! The issuance core returns [`error::PkiError`], a closed set of failure kinds with an HTTP
//! status mapping. Startup code (configuration, CA loading, bootstrap) returns `anyhow::Result`.

pub mod ca_context;
pub mod cert_store;
pub mod configs;
pub mod error;
pub mod generate_client_cert;
pub mod generate_root_ca;
pub mod index;
pub mod index_lock;
pub mod issuance;
pub mod ovpn;
pub mod serial;
