//! Content digests for bundle blobs and index database files

use sha2::{Digest as _, Sha256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use crate::error::{CatalogError, Result};

const ALGORITHM: &str = "sha256";

/// SHA256 digest rendered as `sha256:<hex>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Compute digest from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute digest from JSON value
    ///
    /// `serde_json::Value` keeps object keys sorted, so equal documents
    /// serialize to equal bytes.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let canonical = serde_json::to_vec(value).unwrap_or_default();
        Self::from_bytes(&canonical)
    }

    /// Stream a file through the hasher
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    /// Hex portion without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for temporary names and log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }

    pub fn verify(&self, data: &[u8]) -> bool {
        *self == Self::from_bytes(data)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ALGORITHM, self.0)
    }
}

impl FromStr for Digest {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        let hex = s.strip_prefix("sha256:").unwrap_or(s);
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CatalogError::validation(format!("malformed digest '{}'", s)));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Digest {
    type Error = CatalogError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_digest_consistency() {
        let content = br#"{"kind": "ClusterServiceVersion"}"#;
        assert_eq!(Digest::from_bytes(content), Digest::from_bytes(content));
        assert_ne!(Digest::from_bytes(content), Digest::from_bytes(b"other"));
    }

    #[test]
    fn test_json_key_order_is_irrelevant() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(Digest::from_json(&a), Digest::from_json(&b));
    }

    #[test]
    fn test_display_and_parse() {
        let d = Digest::from_bytes(b"index");
        let rendered = d.to_string();
        assert!(rendered.starts_with("sha256:"));
        let parsed: Digest = rendered.parse().unwrap();
        assert_eq!(parsed, d);
        assert!("sha256:nothex".parse::<Digest>().is_err());
    }

    #[test]
    fn test_file_digest_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"database bytes").unwrap();
        let from_file = Digest::from_file(file.path()).unwrap();
        assert_eq!(from_file, Digest::from_bytes(b"database bytes"));
        assert!(from_file.verify(b"database bytes"));
    }
}
