//! Bearer token authentication
//!
//! Tokens are HMAC-signed JWTs carrying the caller's id in a `user_id`
//! claim. The authenticator is configured once at startup and is otherwise
//! stateless: verifying a credential never touches the network or the
//! database.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::error::AuthFailure;

/// Subject claim; issuers emit either a number or a numeric string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SubjectClaim {
    Id(i64),
    Text(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    user_id: SubjectClaim,
    exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<u64>,
}

/// Verifies bearer credentials and extracts the subject id
#[derive(Clone)]
pub struct TokenAuthenticator {
    algorithm: Algorithm,
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl TokenAuthenticator {
    pub fn new(secret: &[u8], algorithm: Algorithm, leeway_seconds: u64) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.leeway = leeway_seconds;
        validation.validate_exp = true;

        Self {
            algorithm,
            decoding_key: DecodingKey::from_secret(secret),
            encoding_key: EncodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.jwt_secret.as_bytes(),
            config.jwt_algorithm,
            config.jwt_leeway_seconds,
        )
    }

    /// Authenticate a raw `Authorization` header value.
    ///
    /// Returns the subject's user id on success.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<i64, AuthFailure> {
        let token = bearer_token(authorization)?;

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthFailure::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthFailure::InvalidSignature
                }
                _ => AuthFailure::MalformedHeader,
            })?;

        match data.claims.user_id {
            SubjectClaim::Id(id) => Ok(id),
            SubjectClaim::Text(s) => s.trim().parse().map_err(|_| AuthFailure::MalformedHeader),
        }
    }

    /// Mint a token for `user_id` valid for `ttl`
    pub fn issue(&self, user_id: i64, ttl: Duration) -> anyhow::Result<String> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let claims = Claims {
            user_id: SubjectClaim::Id(user_id),
            exp: now + ttl.as_secs(),
            iat: Some(now),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(self.algorithm),
            &claims,
            &self.encoding_key,
        )?)
    }
}

/// Extract the token from a `Bearer <token>` header value
pub fn bearer_token(authorization: Option<&str>) -> Result<&str, AuthFailure> {
    let header = authorization.ok_or(AuthFailure::MissingHeader)?;
    let (scheme, token) = header
        .trim()
        .split_once(' ')
        .ok_or(AuthFailure::MalformedHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthFailure::MalformedHeader);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthFailure::MalformedHeader);
    }
    Ok(token)
}
