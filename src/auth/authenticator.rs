//! Credential verification.
//!
//! Tokens look like `pdf2md_<base64url of 32 random bytes>`. Only a keyed
//! HMAC-SHA256 of the full credential is stored; the keyed hash doubles as
//! the lookup index, so verification is a single indexed fetch followed by
//! a constant-time comparison of the stored digest.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::errors::{AppError, AuthError};
use crate::store::postgres::PgStore;

use super::models::Identity;

pub const TOKEN_PREFIX: &str = "pdf2md_";

/// Base64url of 32 bytes, unpadded.
const SECRET_LEN: usize = 43;

/// Generate a fresh credential string. The secret exists only in the
/// returned value; callers hash it immediately for storage.
pub fn generate_credential() -> String {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(raw))
}

/// Keyed one-way hash of a credential, hex encoded.
pub fn hash_credential(pepper: &str, credential: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(pepper.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(credential.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Reject anything that does not look like one of our credentials before
/// touching the store.
pub fn parse_credential(bearer: &str) -> Result<&str, AuthError> {
    let secret = bearer.strip_prefix(TOKEN_PREFIX).ok_or(AuthError::Malformed)?;
    if secret.len() != SECRET_LEN || !secret.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
        return Err(AuthError::Malformed);
    }
    Ok(secret)
}

#[derive(Clone)]
pub struct Authenticator {
    db: PgStore,
    pepper: String,
}

impl Authenticator {
    pub fn new(db: PgStore, pepper: String) -> Self {
        Self { db, pepper }
    }

    /// Verify a presented bearer credential and resolve it to an identity.
    ///
    /// Check order: shape → existence → active flag → expiry. The caller
    /// supplies `now` so expiry is testable and consistent per request.
    pub async fn authenticate(
        &self,
        bearer: &str,
        now: DateTime<Utc>,
    ) -> Result<Identity, AppError> {
        parse_credential(bearer)?;

        let presented_hash = hash_credential(&self.pepper, bearer);
        let row = self
            .db
            .get_token_by_hash(&presented_hash)
            .await?
            .ok_or(AuthError::Unknown)?;

        // The lookup was by hash, but compare again in constant time so a
        // store-level collation quirk can never weaken verification.
        let matches: bool = row
            .token_hash
            .as_bytes()
            .ct_eq(presented_hash.as_bytes())
            .into();
        if !matches {
            return Err(AuthError::Unknown.into());
        }

        if !row.is_active {
            return Err(AuthError::Inactive.into());
        }
        if let Some(expires_at) = row.expires_at {
            if now > expires_at {
                return Err(AuthError::Expired.into());
            }
        }

        let role = super::models::Role::parse(&row.role).ok_or_else(|| {
            anyhow::anyhow!("token {} has unknown role '{}'", row.token_id, row.role)
        })?;

        self.touch_last_used(row.token_id);

        Ok(Identity {
            token_id: row.token_id,
            user_id: row.user_id,
            role,
            rate_limit: row.rate_limit,
        })
    }

    /// Record last-used off the hot path. A failed write must never fail
    /// the authentication call.
    fn touch_last_used(&self, token_id: Uuid) {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.touch_token_last_used(token_id).await {
                tracing::warn!(token_id = %token_id, "failed to record token last_used: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_credentials_parse() {
        for _ in 0..32 {
            let cred = generate_credential();
            assert!(cred.starts_with(TOKEN_PREFIX));
            assert!(parse_credential(&cred).is_ok(), "rejected {cred}");
        }
    }

    #[test]
    fn test_malformed_credentials_fail_fast() {
        for bad in [
            "",
            "pdf2md_",
            "pdf2md_short",
            "Bearer pdf2md_x",
            "apikey_0123456789012345678901234567890123456789012",
            "pdf2md_!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!",
        ] {
            assert_eq!(parse_credential(bad), Err(AuthError::Malformed));
        }
    }

    #[test]
    fn test_hash_is_keyed_and_deterministic() {
        let cred = generate_credential();
        assert_eq!(
            hash_credential("pepper-a", &cred),
            hash_credential("pepper-a", &cred)
        );
        assert_ne!(
            hash_credential("pepper-a", &cred),
            hash_credential("pepper-b", &cred)
        );
        assert_ne!(
            hash_credential("pepper-a", &cred),
            hash_credential("pepper-a", &generate_credential())
        );
    }

    #[test]
    fn test_hash_never_contains_plaintext() {
        let cred = generate_credential();
        let hash = hash_credential("pepper", &cred);
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains(TOKEN_PREFIX));
    }
}
