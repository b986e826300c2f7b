//! API key issuance and validation.
//!
//! Raw keys are `hld_pub_…` / `hld_sub_…` followed by 24 URL-safe random
//! characters.  The store keeps sha256(raw) as lowercase hex plus the first
//! 12 raw characters for human identification; the raw key is returned to
//! the caller exactly once at issuance.

use herald_protocol::{generate_id, id_prefix};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::repo::api_keys::{self, ApiKeyRow};

/// How many leading raw characters are retained for logging.
const KEY_PREFIX_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerType {
    Publisher,
    Subscriber,
}

impl OwnerType {
    pub fn as_str(self) -> &'static str {
        match self {
            OwnerType::Publisher => "publisher",
            OwnerType::Subscriber => "subscriber",
        }
    }

    pub fn parse(s: &str) -> Option<OwnerType> {
        match s {
            "publisher" => Some(OwnerType::Publisher),
            "subscriber" => Some(OwnerType::Subscriber),
            _ => None,
        }
    }

    fn key_prefix(self) -> &'static str {
        match self {
            OwnerType::Publisher => id_prefix::PUBLISHER_KEY,
            OwnerType::Subscriber => id_prefix::SUBSCRIBER_KEY,
        }
    }
}

/// Attached to the request context after successful validation.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key_id: String,
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub tier: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or invalid credentials")]
    Unauthorized,
    #[error("credential lookup failed: {0}")]
    Store(#[from] sqlx::Error),
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

pub fn hash_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// A freshly minted key before persistence.  `raw` is handed to the caller
/// exactly once; only `hash` and `prefix` are stored.
pub struct MintedKey {
    pub raw: String,
    pub hash: String,
    pub prefix: String,
}

pub fn mint_key(owner_type: OwnerType) -> MintedKey {
    let raw = generate_id(owner_type.key_prefix());
    MintedKey {
        hash: hash_key(&raw),
        prefix: raw[..KEY_PREFIX_LEN].to_owned(),
        raw,
    }
}

/// Issue a new key for an owner.  Returns the stored row and the raw key;
/// the raw key is not recoverable afterwards.
pub async fn issue_key(
    pool: &PgPool,
    owner_type: OwnerType,
    owner_id: &str,
    tier: &str,
) -> Result<(ApiKeyRow, String), sqlx::Error> {
    let key = mint_key(owner_type);
    let row = api_keys::insert(
        pool,
        &key.hash,
        &key.prefix,
        owner_type.as_str(),
        owner_id,
        tier,
    )
    .await?;
    Ok((row, key.raw))
}

/// Validate a raw key (no auth scheme).  Looks up an active row by hash and
/// updates `last_used_at` best-effort off the request path.
pub async fn validate_raw_key(pool: &PgPool, raw: &str) -> Result<AuthContext, AuthError> {
    let hash = hash_key(raw);
    let row = api_keys::find_active_by_hash(pool, &hash)
        .await?
        .ok_or(AuthError::Unauthorized)?;

    let owner_type = OwnerType::parse(&row.owner_type).ok_or(AuthError::Unauthorized)?;

    let pool = pool.clone();
    let key_id = row.api_key_id.clone();
    tokio::spawn(async move {
        if let Err(e) = api_keys::touch_last_used(&pool, &key_id).await {
            tracing::debug!(error = %e, "last_used_at update failed");
        }
    });

    Ok(AuthContext {
        api_key_id: row.api_key_id,
        owner_type,
        owner_id: row.owner_id,
        tier: row.tier,
    })
}

/// Validate the value of an `Authorization` header.
pub async fn validate_bearer(pool: &PgPool, authorization: &str) -> Result<AuthContext, AuthError> {
    let raw = extract_bearer(authorization).ok_or(AuthError::Unauthorized)?;
    validate_raw_key(pool, raw).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("bearer abc"), None);
        assert_eq!(extract_bearer("abc"), None);
    }

    #[test]
    fn key_hash_is_sha256_hex() {
        // sha256("hld_pub_test") computed independently.
        let hash = hash_key("hld_pub_test");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_key("hld_pub_test"));
        assert_ne!(hash, hash_key("hld_pub_test2"));
    }

    #[test]
    fn owner_types_round_trip() {
        assert_eq!(OwnerType::parse("publisher"), Some(OwnerType::Publisher));
        assert_eq!(OwnerType::parse("subscriber"), Some(OwnerType::Subscriber));
        assert_eq!(OwnerType::parse("admin"), None);
    }

    #[test]
    fn minted_keys_carry_role_prefix_and_hash() {
        let publisher = mint_key(OwnerType::Publisher);
        assert!(publisher.raw.starts_with("hld_pub_"));
        assert_eq!(publisher.raw.len(), "hld_pub_".len() + 24);
        assert_eq!(publisher.prefix, &publisher.raw[..12]);
        // The stored hash is exactly sha256 of the raw key returned once.
        assert_eq!(publisher.hash, hash_key(&publisher.raw));

        let subscriber = mint_key(OwnerType::Subscriber);
        assert!(subscriber.raw.starts_with("hld_sub_"));
        assert_ne!(publisher.hash, subscriber.hash);
    }
}
