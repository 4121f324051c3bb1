//! API-key authentication
//!
//! Clients send their key id in `x-client-id` and the secret in
//! `x-api-key`. Only the SHA-256 of each secret is stored, and hashes are
//! compared in constant time.

use super::AgentError;
use crate::metadb::{ApiKey, MetadataStore};
use crate::migration::checksum;
use chrono::{DateTime, Utc};
use rand::RngCore;

/// Every generated secret starts with this
pub const KEY_PREFIX: &str = "sg_";

const SECRET_BYTES: usize = 32;

/// A freshly created key. `secret` is shown once and never stored.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub key: ApiKey,
    pub secret: String,
}

pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{KEY_PREFIX}{hex}")
}

/// Hex SHA-256 of a secret, as stored in `api_keys.key_hash`
pub fn hash_secret(secret: &str) -> String {
    checksum(secret)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Build a new active key for `client_id` with a random secret.
pub fn issue_key(
    client_id: &str,
    description: Option<String>,
    permissions: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
    created_by: Option<String>,
) -> IssuedKey {
    let secret = generate_secret();
    IssuedKey {
        key: ApiKey {
            key_id: client_id.to_string(),
            key_hash: hash_secret(&secret),
            description,
            permissions,
            is_active: true,
            expires_at,
            last_used_at: None,
            usage_count: 0,
            created_by,
            created_at: Utc::now(),
        },
        secret,
    }
}

/// Check a client's credentials and return its id.
///
/// Missing or malformed credentials are rejected without touching the
/// store. A successful check bumps the key's usage; failing to record that
/// is only logged.
pub fn authenticate(
    store: &dyn MetadataStore,
    client_id: Option<&str>,
    api_key: Option<&str>,
    now: DateTime<Utc>,
) -> Result<String, AgentError> {
    let client_id = client_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AgentError::Unauthenticated("missing client ID".into()))?;
    let api_key = api_key
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| AgentError::Unauthenticated("missing API key".into()))?;
    if !api_key.starts_with(KEY_PREFIX) {
        return Err(AgentError::Unauthenticated("invalid API key".into()));
    }

    let stored = store
        .find_api_key(client_id)?
        .ok_or_else(|| AgentError::Unauthenticated("invalid API key".into()))?;
    if !constant_time_eq(stored.key_hash.as_bytes(), hash_secret(api_key).as_bytes()) {
        return Err(AgentError::Unauthenticated("invalid API key".into()));
    }
    if !stored.is_active {
        return Err(AgentError::Unauthenticated("API key is inactive".into()));
    }
    if stored.is_expired_at(now) {
        return Err(AgentError::Unauthenticated("API key has expired".into()));
    }

    if let Err(e) = store.touch_api_key(client_id) {
        log::warn!("Failed to record usage of API key {}: {}", client_id, e);
    }
    Ok(client_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryMetadataStore;
    use chrono::Duration;

    fn store_with(key: ApiKey) -> MemoryMetadataStore {
        let store = MemoryMetadataStore::new();
        store.register_api_key(&key).unwrap();
        store
    }

    #[test]
    fn test_secrets_are_prefixed_and_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert!(a.starts_with(KEY_PREFIX));
        assert_eq!(a.len(), KEY_PREFIX.len() + 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_valid_key_is_accepted_and_touched() {
        let issued = issue_key("ci", None, vec![], None, None);
        let store = store_with(issued.key.clone());
        let id = authenticate(&store, Some("ci"), Some(&issued.secret), Utc::now()).unwrap();
        assert_eq!(id, "ci");
        assert_eq!(store.find_api_key("ci").unwrap().unwrap().usage_count, 1);
    }

    #[test]
    fn test_missing_or_malformed_credentials_never_reach_the_store() {
        let store = MemoryMetadataStore::new();
        let now = Utc::now();
        for (client, key) in [
            (None, Some("sg_abc")),
            (Some("ci"), None),
            (Some(""), Some("sg_abc")),
            (Some("ci"), Some("  ")),
            (Some("ci"), Some("not-a-key")),
        ] {
            let err = authenticate(&store, client, key, now).unwrap_err();
            assert_eq!(err.status_code(), 401);
        }
        assert_eq!(store.calls(), 0);
    }

    #[test]
    fn test_wrong_inactive_and_expired_keys_are_rejected() {
        let now = Utc::now();
        let issued = issue_key("ci", None, vec![], None, None);

        let store = store_with(issued.key.clone());
        assert!(authenticate(&store, Some("ci"), Some(&generate_secret()), now).is_err());
        assert!(authenticate(&store, Some("other"), Some(&issued.secret), now).is_err());

        let store = store_with(ApiKey {
            is_active: false,
            ..issued.key.clone()
        });
        assert!(authenticate(&store, Some("ci"), Some(&issued.secret), now).is_err());

        let store = store_with(ApiKey {
            expires_at: Some(now - Duration::minutes(1)),
            ..issued.key.clone()
        });
        let err = authenticate(&store, Some("ci"), Some(&issued.secret), now).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
