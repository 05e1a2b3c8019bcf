//! Bearer credential verification.
//!
//! Credentials are HS256 JWTs carrying the principal (`sub` = user id,
//! `email`, `role`) and an expiry. Verification is synchronous and runs once
//! per connection or REST request.

use std::time::Duration;

use axum::http::{header, HeaderMap};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use convoy_core::ids::UserId;
use convoy_core::model::{Principal, Role};
use convoy_core::AuthFailure;

/// Turns a presented credential into the principal it proves.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<Principal, AuthFailure>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    role: Role,
    exp: u64,
}

pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Sign a credential for `principal` valid for `ttl`.
    pub fn issue(&self, principal: &Principal, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
        let exp = chrono::Utc::now().timestamp().max(0) as u64 + ttl.as_secs();
        self.sign(principal, exp)
    }

    fn sign(&self, principal: &Principal, exp: u64) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: principal.user_id.to_string(),
            email: principal.email.clone(),
            role: principal.role,
            exp,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, credential: &str) -> Result<Principal, AuthFailure> {
        let data = jsonwebtoken::decode::<Claims>(credential, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthFailure::Expired,
                _ => AuthFailure::Invalid,
            }
        })?;
        let user_id: UserId = data.claims.sub.parse().map_err(|_| AuthFailure::Invalid)?;
        Ok(Principal {
            user_id,
            email: data.claims.email,
            role: data.claims.role,
        })
    }
}

/// Pull the credential from `Authorization: Bearer ...`, falling back to the
/// `token` query parameter.
pub fn presented_credential(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    from_header
        .or(query_token.filter(|t| !t.is_empty()))
        .map(str::to_string)
}

/// Verify an optional credential; absence is its own failure.
pub fn authenticate(verifier: &dyn CredentialVerifier, credential: Option<&str>) -> Result<Principal, AuthFailure> {
    match credential {
        Some(token) => verifier.verify(token),
        None => Err(AuthFailure::Missing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal {
            user_id: UserId(1),
            email: "ana@example.com".into(),
            role: Role::Renter,
        }
    }

    #[test]
    fn issued_token_verifies() {
        let verifier = JwtVerifier::new(b"secret");
        let token = verifier.issue(&principal(), Duration::from_secs(60)).unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), principal());
    }

    #[test]
    fn expired_token_is_reported_as_expired() {
        let verifier = JwtVerifier::new(b"secret");
        let past = chrono::Utc::now().timestamp() as u64 - 3600;
        let token = verifier.sign(&principal(), past).unwrap();
        assert_eq!(verifier.verify(&token), Err(AuthFailure::Expired));
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let token = JwtVerifier::new(b"one").issue(&principal(), Duration::from_secs(60)).unwrap();
        assert_eq!(JwtVerifier::new(b"two").verify(&token), Err(AuthFailure::Invalid));
        assert_eq!(JwtVerifier::new(b"two").verify("garbage"), Err(AuthFailure::Invalid));
    }

    #[test]
    fn missing_credential() {
        let verifier = JwtVerifier::new(b"secret");
        assert_eq!(authenticate(&verifier, None), Err(AuthFailure::Missing));
    }

    #[test]
    fn header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer from-header".parse().unwrap());
        assert_eq!(presented_credential(&headers, Some("from-query")).as_deref(), Some("from-header"));
        assert_eq!(presented_credential(&HeaderMap::new(), Some("from-query")).as_deref(), Some("from-query"));
        assert_eq!(presented_credential(&HeaderMap::new(), Some("")), None);
    }

    #[test]
    fn non_bearer_scheme_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(presented_credential(&headers, None), None);
    }
}
