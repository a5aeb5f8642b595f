use anyhow::Result;
use jwt_simple::prelude::*;
use std::sync::Arc;

const TOKEN_SUBJECT: &str = "arrival-board-agent";
const TOKEN_EXPIRE_HOURS: u64 = 2;
const TOKEN_TIME_TOLERANCE_MINS: u64 = 15;

/// Issues and checks the session tokens of the admin API
///
/// Cheap to clone, clones share the signing key.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenManagerInner>,
}

struct TokenManagerInner {
    key: HS256Key,
}

impl TokenManager {
    /// Create a new TokenManager
    ///
    /// # Arguments
    /// * `secret` - Secret key for HMAC-SHA256 signing
    pub fn new(secret: &str) -> Self {
        Self {
            inner: Arc::new(TokenManagerInner {
                key: HS256Key::from_bytes(secret.as_bytes()),
            }),
        }
    }

    /// Create a signed token valid for two hours
    pub fn create_token(&self) -> Result<String> {
        let claims =
            Claims::create(Duration::from_hours(TOKEN_EXPIRE_HOURS)).with_subject(TOKEN_SUBJECT);

        self.inner
            .key
            .authenticate(claims)
            .map_err(|e| anyhow::anyhow!("failed to create token: {e}"))
    }

    /// Check signature, expiry, age and subject of a token
    pub fn verify_token(&self, token: &str) -> bool {
        let options = VerificationOptions {
            accept_future: true,
            time_tolerance: Some(Duration::from_mins(TOKEN_TIME_TOLERANCE_MINS)),
            max_validity: Some(Duration::from_hours(TOKEN_EXPIRE_HOURS)),
            required_subject: Some(TOKEN_SUBJECT.to_string()),
            ..Default::default()
        };

        self.inner
            .key
            .verify_token::<NoCustomClaims>(token, Some(options))
            .is_ok()
    }
}
