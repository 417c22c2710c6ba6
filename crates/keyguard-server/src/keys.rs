use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ipnet::IpNet;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::policy::ApiKeyPolicy;

/// One issued key as stored in the keys file.
///
/// Only the SHA-256 of the credential is kept; the plaintext is shown once
/// at issue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub key_sha256: String,
    #[serde(flatten)]
    pub policy: ApiKeyPolicy,
}

/// Immutable credential → record lookup, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    by_digest: Arc<HashMap<String, ApiKeyRecord>>,
}

impl KeyStore {
    /// Load a JSON array of [`ApiKeyRecord`]s.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read keys file {}", path.display()))?;
        let records: Vec<ApiKeyRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("parse keys file {}", path.display()))?;
        Self::from_records(records)
    }

    pub fn from_records(records: Vec<ApiKeyRecord>) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut by_digest = HashMap::with_capacity(records.len());

        for mut rec in records {
            if rec.id.is_empty() {
                anyhow::bail!("key record with empty id");
            }
            if !ids.insert(rec.id.clone()) {
                anyhow::bail!("duplicate key id {:?}", rec.id);
            }

            rec.key_sha256.make_ascii_lowercase();
            if rec.key_sha256.len() != 64 || hex::decode(&rec.key_sha256).is_err() {
                anyhow::bail!("key {:?}: key_sha256 must be 64 hex characters", rec.id);
            }

            // Bad ranges are kept; they simply never match.
            for range in &rec.policy.allowed_ips {
                if range.parse::<IpNet>().is_err() {
                    warn!(key_id = %rec.id, %range, "malformed CIDR range will never match");
                }
            }

            if by_digest.contains_key(&rec.key_sha256) {
                anyhow::bail!("key {:?} reuses another key's credential", rec.id);
            }
            by_digest.insert(rec.key_sha256.clone(), rec);
        }

        Ok(Self {
            by_digest: Arc::new(by_digest),
        })
    }

    /// Find the record issued for `credential`, if any.
    pub fn resolve(&self, credential: &str) -> Option<&ApiKeyRecord> {
        self.by_digest.get(&hash_credential(credential))
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

/// Lowercase hex SHA-256 of a plaintext credential.
pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// Fresh random credential: `kg_` followed by 64 hex characters.
pub fn generate_credential() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("kg_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(id: &str, credential: &str) -> ApiKeyRecord {
        ApiKeyRecord {
            id: id.to_owned(),
            key_sha256: hash_credential(credential),
            policy: ApiKeyPolicy::default(),
        }
    }

    #[test]
    fn resolve_by_credential() {
        let store =
            KeyStore::from_records(vec![record("a", "secret-a"), record("b", "secret-b")]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.resolve("secret-b").map(|r| r.id.as_str()), Some("b"));
        assert!(store.resolve("secret-c").is_none());
        assert!(store.resolve("").is_none());
    }

    #[test]
    fn uppercase_digest_is_normalised() {
        let mut rec = record("a", "secret-a");
        rec.key_sha256 = rec.key_sha256.to_ascii_uppercase();
        let store = KeyStore::from_records(vec![rec]).unwrap();
        assert!(store.resolve("secret-a").is_some());
    }

    #[test]
    fn rejects_duplicate_ids_and_credentials() {
        let err = KeyStore::from_records(vec![record("a", "x"), record("a", "y")]).unwrap_err();
        assert!(err.to_string().contains("duplicate key id"));

        let err = KeyStore::from_records(vec![record("a", "x"), record("b", "x")]).unwrap_err();
        assert!(err.to_string().contains("reuses"));
    }

    #[test]
    fn rejects_bad_digest() {
        let mut rec = record("a", "x");
        rec.key_sha256 = "not-hex".into();
        assert!(KeyStore::from_records(vec![rec]).is_err());
    }

    #[test]
    fn malformed_range_is_kept() {
        let mut rec = record("a", "x");
        rec.policy.allowed_ips = vec!["10.0.0.0/99".into()];
        let store = KeyStore::from_records(vec![rec]).unwrap();
        assert_eq!(store.resolve("x").unwrap().policy.allowed_ips.len(), 1);
    }

    #[test]
    fn load_from_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "open", "key_sha256": "{}"}},
                {{"id": "scoped", "key_sha256": "{}",
                  "allowed_fqdn": "example.com",
                  "allowed_ips": ["192.168.0.0/24"],
                  "expires_at": 1700000000}}
            ]"#,
            hash_credential("open-key"),
            hash_credential("scoped-key"),
        )
        .unwrap();

        let store = KeyStore::load(file.path()).unwrap();
        assert_eq!(store.resolve("open-key").unwrap().policy, ApiKeyPolicy::default());

        let scoped = &store.resolve("scoped-key").unwrap().policy;
        assert_eq!(scoped.allowed_fqdn, "example.com");
        assert_eq!(scoped.allowed_ips, vec!["192.168.0.0/24".to_string()]);
        assert_eq!(scoped.expires_at, Some(1_700_000_000));
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(KeyStore::load(&dir.path().join("keys.json")).is_err());
    }

    #[test]
    fn generated_credentials_are_unique() {
        let a = generate_credential();
        let b = generate_credential();
        assert!(a.starts_with("kg_"));
        assert_eq!(a.len(), 67);
        assert_ne!(a, b);
    }
}
