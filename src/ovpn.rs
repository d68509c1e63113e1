//! `.ovpn` client config rendering.
//!
//! A minimal template language: `{{privateKey}}`, `{{certificate}}`, `{{ca}}` and
//! `{{dh}}` are replaced with the trimmed PEM text. Nothing is escaped and unknown placeholders
//! stay as they are.

use std::path::Path;

use crate::cert_store::{self, StoredCredentials, PRIVATE_FILE_MODE};
use crate::error::Result;

pub fn render(template: &str, credentials: &StoredCredentials) -> String {
    [
        ("privateKey", &credentials.private_key),
        ("certificate", &credentials.certificate),
        ("ca", &credentials.ca),
        ("dh", &credentials.dh),
    ]
    .iter()
    .fold(template.to_string(), |rendered, (var, value)| {
        rendered.replace(&format!("{{{{{}}}}}", var), value.trim())
    })
}

/// Write a rendered config. It embeds the private key, so it gets the key's file mode.
pub async fn write_config(path: &Path, rendered: &str) -> Result<()> {
    cert_store::write_file(path, rendered, PRIVATE_FILE_MODE).await
}

/// Download file name, e.g. `alice-office.ovpn`.
pub fn file_name(name: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) if !suffix.is_empty() => format!("{}-{}.ovpn", name, suffix),
        _ => format!("{}.ovpn", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> StoredCredentials {
        StoredCredentials {
            private_key: "KEY\n".to_string(),
            certificate: "\nCERT\n".to_string(),
            ca: "CA".to_string(),
            dh: "DH\n\n".to_string(),
        }
    }

    #[test]
    fn test_render_replaces_known_placeholders() {
        let template = "client\n<ca>\n{{ca}}\n</ca>\n<cert>\n{{certificate}}\n</cert>\n<key>\n{{privateKey}}\n</key>\n<dh>\n{{dh}}\n</dh>\n{{unknown}}\n";
        let rendered = render(template, &credentials());
        assert_eq!(
            rendered,
            "client\n<ca>\nCA\n</ca>\n<cert>\nCERT\n</cert>\n<key>\nKEY\n</key>\n<dh>\nDH\n</dh>\n{{unknown}}\n"
        );
    }

    #[test]
    fn test_render_does_not_escape() {
        let creds = StoredCredentials {
            ca: "<&>".to_string(),
            ..credentials()
        };
        assert_eq!(render("{{ca}}", &creds), "<&>");
    }

    #[tokio::test]
    async fn test_write_config_is_owner_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("alice.ovpn");

        write_config(&path, &render("<key>\n{{privateKey}}\n</key>\n", &credentials()))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<key>\nKEY\n</key>\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("alice", Some("office")), "alice-office.ovpn");
        assert_eq!(file_name("alice", Some("")), "alice.ovpn");
        assert_eq!(file_name("alice", None), "alice.ovpn");
    }
}
