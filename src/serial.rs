//! Serial number counter.
//!
//! The serial file holds the highest serial issued so far as zero-padded decimal text
//! (`"07\n"`). Padding is two digits, so from 100 on the width simply grows; deployments this
//! small are not expected to get there.

use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{PkiError, Result};

#[derive(Debug, Clone)]
pub struct SerialFile {
    path: PathBuf,
}

impl SerialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest serial issued so far.
    pub async fn current(&self) -> Result<u64> {
        let data = fs::read_to_string(&self.path).await.map_err(|e| {
            PkiError::io(format!("Failed to read serial file {}", self.path.display()), e)
        })?;
        data.trim().parse::<u64>().map_err(|_| PkiError::Parse {
            line: 1,
            reason: format!(
                "serial file {} does not hold a decimal number: '{}'",
                self.path.display(),
                data.trim()
            ),
        })
    }

    /// Allocate the next serial.
    ///
    /// The incremented value is written and synced before it is returned, so a crash after
    /// this call can skip a serial but never hand the same one out twice.
    pub async fn next(&self) -> Result<u64> {
        let current = self.current().await?;
        let next = current.checked_add(1).ok_or_else(|| PkiError::Parse {
            line: 1,
            reason: format!(
                "serial file {} is exhausted at {}",
                self.path.display(),
                current
            ),
        })?;
        let context = || format!("Failed to write serial file {}", self.path.display());

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|e| PkiError::io(context(), e))?;
        file.write_all(format!("{:02}\n", next).as_bytes())
            .await
            .map_err(|e| PkiError::io(context(), e))?;
        file.sync_all()
            .await
            .map_err(|e| PkiError::io(context(), e))?;

        debug!(serial = next, "allocated serial");
        Ok(next)
    }
}
