use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::issuance::EndpointProfile;

const MIN_KEY_SIZE: u32 = 1024;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub pki: PkiConfig,
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

/// `[pki]` table. Every file path defaults to its EasyRSA location below `path`.
#[derive(Debug, Deserialize, Clone)]
pub struct PkiConfig {
    pub path: PathBuf,
    pub cakey: Option<PathBuf>,
    pub cacert: Option<PathBuf>,
    pub dh: Option<PathBuf>,
    pub index: Option<PathBuf>,
    pub serial: Option<PathBuf>,
    /// Age after which a leftover lock marker is considered abandoned.
    pub lock_lease_secs: Option<u64>,
    /// Name of the environment variable holding the CA key passphrase.
    pub ca_passphrase_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub keysize: u32,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub ovpn_template: Option<PathBuf>,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

fn default_validity_days() -> u32 {
    365
}

impl EndpointConfig {
    pub fn profile(&self) -> EndpointProfile {
        EndpointProfile {
            key_size: self.keysize,
            validity_days: self.validity_days,
        }
    }
}

/// Resolved locations of every file in the PKI tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkiPaths {
    pub path: PathBuf,
    pub cakey: PathBuf,
    pub cacert: PathBuf,
    pub dh: PathBuf,
    pub index: PathBuf,
    pub serial: PathBuf,
}

impl PkiPaths {
    /// EasyRSA default layout below `pki_path`.
    pub fn from_root(pki_path: impl AsRef<Path>) -> Self {
        let path = pki_path.as_ref().to_path_buf();
        Self {
            cakey: path.join("private").join("ca.key"),
            cacert: path.join("ca.crt"),
            dh: path.join("dh.pem"),
            index: path.join("index.txt"),
            serial: path.join("serial"),
            path,
        }
    }
}

impl PkiConfig {
    pub fn paths(&self) -> PkiPaths {
        let defaults = PkiPaths::from_root(&self.path);
        PkiPaths {
            cakey: self.cakey.clone().unwrap_or(defaults.cakey),
            cacert: self.cacert.clone().unwrap_or(defaults.cacert),
            dh: self.dh.clone().unwrap_or(defaults.dh),
            index: self.index.clone().unwrap_or(defaults.index),
            serial: self.serial.clone().unwrap_or(defaults.serial),
            path: defaults.path,
        }
    }

    pub fn lock_lease(&self) -> Option<Duration> {
        self.lock_lease_secs.map(Duration::from_secs)
    }

    /// Reads the CA key passphrase from the configured environment variable, if any.
    pub fn ca_passphrase(&self) -> Result<Option<String>> {
        match &self.ca_passphrase_env {
            Some(var) => std::env::var(var)
                .map(Some)
                .context(format!("CA passphrase variable {} is not set", var)),
            None => Ok(None),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(config_str).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }

    pub fn endpoint(&self, id: &str) -> Result<&EndpointConfig> {
        match self.endpoints.get(id) {
            Some(endpoint) => Ok(endpoint),
            None => bail!("Invalid endpoint: {}", id),
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.pki.path.as_os_str().is_empty(),
            "Path to PKI missing in config"
        );
        ensure!(!self.endpoints.is_empty(), "Invalid endpoints configuration");
        for (id, endpoint) in &self.endpoints {
            ensure!(
                !endpoint.name.trim().is_empty(),
                "Missing client name for endpoint {}",
                id
            );
            ensure!(
                endpoint.keysize >= MIN_KEY_SIZE,
                "Invalid client keysize {} for endpoint {}",
                endpoint.keysize,
                id
            );
            ensure!(
                endpoint.validity_days > 0,
                "Invalid validity_days for endpoint {}",
                id
            );
        }
        Ok(())
    }

    /// Every file of the PKI must exist before the service starts, even the index and serial
    /// file, since the PKI is expected to hold at least the server certificate already.
    pub fn check_files(&self) -> Result<()> {
        let paths = self.pki.paths();
        ensure!(
            paths.path.is_dir(),
            "Path to PKI does not exist: {}",
            paths.path.display()
        );
        for (label, file) in [
            ("CA key", &paths.cakey),
            ("CA cert", &paths.cacert),
            ("DH params", &paths.dh),
            ("Index", &paths.index),
            ("Serial", &paths.serial),
        ] {
            ensure!(
                file.is_file(),
                "{} file not found at {}",
                label,
                file.display()
            );
        }
        Ok(())
    }
}
