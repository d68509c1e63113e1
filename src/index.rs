//! Issuance index
//!
//! Append-only record of every certificate issued, in the flat `index.txt` format that OpenSSL's
//! `ca` command and EasyRSA use for revocation. One record per line:
//!
//! ```text
//! V\t<YYMMDDHHmmssZ>\t\t<serial>\tunknown\t/CN=<name>
//! ```
//!
//! Expiry dates from 2050 on are written with a four digit year (`YYYYMMDDHHmmssZ`).
//!
//! The line format is shared with external tooling, so field order and delimiters must not
//! change. [`IndexRecord::encode`] and [`IndexRecord::decode`] are the only places that know
//! about it.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{PkiError, Result};

/// `YYMMDDHHmmss`, always followed by a literal `Z` in the file.
const SHORT_TIME_FORMAT: &str = "%y%m%d%H%M%S";
/// Four digit year variant written by OpenSSL for dates from 2050 on.
const LONG_TIME_FORMAT: &str = "%Y%m%d%H%M%S";
const UTC_TIME_FIRST_YEAR: i32 = 1950;
const UTC_TIME_END_YEAR: i32 = 2050;
const UNKNOWN_FILENAME: &str = "unknown";

// ASCII word characters only, like the legacy index consumers
static CN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/CN=([A-Za-z0-9_]+)").expect("CN pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    Valid,
    Revoked,
    Expired,
}

impl CertState {
    fn as_str(&self) -> &'static str {
        match self {
            CertState::Valid => "V",
            CertState::Revoked => "R",
            CertState::Expired => "E",
        }
    }

    fn parse(field: &str) -> Option<Self> {
        match field {
            "V" => Some(CertState::Valid),
            "R" => Some(CertState::Revoked),
            "E" => Some(CertState::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for CertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub state: CertState,
    pub expires: DateTime<Utc>,
    /// Revocation date, only present on `R` lines.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Numeric serial. `None` for serials written by other tools that do not fit a `u64`,
    /// such as the 128-bit random serials of EasyRSA 3.
    pub serial: Option<u64>,
    /// Serial column exactly as written in the file.
    pub serial_text: String,
    /// Full subject as written in the file, e.g. `/CN=alice`.
    pub subject: String,
    /// Common name extracted from `subject`.
    pub name: String,
}

impl IndexRecord {
    /// A fresh record for a certificate issued by this system.
    pub fn issued(name: &str, serial: u64, expires: DateTime<Utc>) -> Self {
        Self {
            state: CertState::Valid,
            expires,
            revoked_at: None,
            serial: Some(serial),
            serial_text: format!("{:02}", serial),
            subject: format!("/CN={}", name),
            name: name.to_string(),
        }
    }

    /// Format the record as one index line, including the trailing newline.
    pub fn encode(&self) -> String {
        let revoked = self.revoked_at.map(format_time).unwrap_or_default();
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            self.state,
            format_time(self.expires),
            revoked,
            self.serial_text,
            UNKNOWN_FILENAME,
            self.subject
        )
    }

    /// Parse one index line. `line_no` is 1-based and only used for error reporting.
    ///
    /// Runs of tabs and semicolons both separate fields. The revocation date column is empty
    /// on valid lines and therefore disappears; it is only expected on revoked lines.
    pub fn decode(line: &str, line_no: usize) -> Result<Self> {
        let parse_err = |reason: String| PkiError::Parse {
            line: line_no,
            reason,
        };

        let fields: Vec<&str> = line
            .trim_end_matches(['\r', '\n'])
            .split(['\t', ';'])
            .filter(|f| !f.is_empty())
            .collect();

        let state_field = fields
            .first()
            .ok_or_else(|| parse_err("empty line".to_string()))?;
        let state = CertState::parse(state_field)
            .ok_or_else(|| parse_err(format!("unknown state '{}'", state_field)))?;

        let has_revocation = state == CertState::Revoked && fields.len() >= 6;
        let expected = if has_revocation { 6 } else { 5 };
        if fields.len() < expected {
            return Err(parse_err(format!(
                "expected {} fields, found {}",
                expected,
                fields.len()
            )));
        }

        let expires = parse_time(fields[1]).map_err(&parse_err)?;
        let (revoked_at, rest) = if has_revocation {
            // OpenSSL may append ",<reason>" to the revocation date
            let date = fields[2].split(',').next().unwrap_or_default();
            (Some(parse_time(date).map_err(&parse_err)?), &fields[3..])
        } else {
            (None, &fields[2..])
        };

        let serial_text = rest[0].to_string();
        let serial = parse_serial(&serial_text);
        let subject = rest[2..].join(";");
        let name = CN_PATTERN
            .captures(&subject)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| parse_err(format!("no /CN= field in subject '{}'", subject)))?;

        Ok(Self {
            state,
            expires,
            revoked_at,
            serial,
            serial_text,
            subject,
            name,
        })
    }
}

/// Serials written by this system are decimal. Anything else is read as hex, the way OpenSSL
/// and EasyRSA write them.
fn parse_serial(text: &str) -> Option<u64> {
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    if text.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(serial) = text.parse::<u64>() {
            return Some(serial);
        }
    }
    u64::from_str_radix(text, 16).ok()
}

fn format_time(time: DateTime<Utc>) -> String {
    let format = if (UTC_TIME_FIRST_YEAR..UTC_TIME_END_YEAR).contains(&time.year()) {
        SHORT_TIME_FORMAT
    } else {
        LONG_TIME_FORMAT
    };
    format!("{}Z", time.format(format))
}

fn parse_time(field: &str) -> std::result::Result<DateTime<Utc>, String> {
    let digits = field.strip_suffix('Z').unwrap_or(field);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid timestamp '{}'", field));
    }
    let full = match digits.len() {
        // two digit years 50-99 are 1950-1999, as in X.509 UTCTime
        12 if &digits[..2] >= "50" => format!("19{}", digits),
        12 => format!("20{}", digits),
        14 => digits.to_string(),
        _ => return Err(format!("invalid timestamp '{}'", field)),
    };
    NaiveDateTime::parse_from_str(&full, LONG_TIME_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| format!("invalid timestamp '{}': {}", field, e))
}

/// Parse a complete index file. Blank lines are skipped.
pub fn parse_index(data: &str) -> Result<Vec<IndexRecord>> {
    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| IndexRecord::decode(line, idx + 1))
        .collect()
}

/// Handle on the index file of a PKI.
#[derive(Debug, Clone)]
pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in issuance order.
    ///
    /// Takes no lock; a concurrent append may show up as a partially written last line.
    pub async fn list_records(&self) -> Result<Vec<IndexRecord>> {
        let data = fs::read_to_string(&self.path).await.map_err(|e| {
            PkiError::io(format!("Failed to read index {}", self.path.display()), e)
        })?;
        parse_index(&data)
    }

    /// Exact, case-sensitive comparison against each record's common name.
    pub async fn is_name_taken(&self, name: &str) -> Result<bool> {
        Ok(self
            .list_records()
            .await?
            .iter()
            .any(|record| record.name == name))
    }

    /// Append a valid record for `name` and flush it to disk.
    pub async fn append(
        &self,
        name: &str,
        serial: u64,
        expires: DateTime<Utc>,
    ) -> Result<IndexRecord> {
        let record = IndexRecord::issued(name, serial, expires);
        let line = record.encode();
        let context = || format!("Failed to append to index {}", self.path.display());

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PkiError::io(context(), e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PkiError::io(context(), e))?;
        file.sync_all()
            .await
            .map_err(|e| PkiError::io(context(), e))?;

        debug!(serial, name, "appended index record");
        Ok(record)
    }
}
