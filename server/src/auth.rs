//! Bearer-token verification for the control socket.
//!
//! Tokens are minted and signed by the auth service; this side only checks
//! the HS256 signature against the shared secret and extracts the identity.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use cadenzalib::ids::UserId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization header missing or malformed")]
    MissingBearer,
    #[error("token malformed")]
    Malformed,
    #[error("token algorithm unsupported")]
    BadAlgorithm,
    #[error("token signature invalid")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token subject is not a user id")]
    BadSubject,
}

#[derive(Deserialize)]
struct Header {
    alg: String,
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Check an `Authorization: Bearer <jwt>` header value.
    pub fn verify_bearer(&self, header: Option<&str>) -> Result<UserId, AuthError> {
        let token = header
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingBearer)?;
        self.verify(token.trim())
    }

    /// Verify a raw JWT and extract the user id from its `sub` claim.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let mut parts = token.split('.');
        let (header_b64, payload_b64, signature_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(header), Some(payload), Some(signature), None) => {
                    (header, payload, signature)
                }
                _ => return Err(AuthError::Malformed),
            };

        let header_json = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| AuthError::Malformed)?;
        let header: Header =
            serde_json::from_slice(&header_json).map_err(|_| AuthError::Malformed)?;
        if header.alg != "HS256" {
            return Err(AuthError::BadAlgorithm);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|_| AuthError::BadSignature)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        // constant-time comparison
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload_json).map_err(|_| AuthError::Malformed)?;

        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        let id: u64 = claims.sub.parse().map_err(|_| AuthError::BadSubject)?;
        if id == 0 {
            // the anonymous identity must not authenticate as a controller
            return Err(AuthError::BadSubject);
        }

        Ok(UserId(id))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SECRET: &str = "test-secret";

    fn sign(secret: &str, header: &str, payload: &str) -> String {
        let header_b64 = URL_SAFE_NO_PAD.encode(header);
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{header_b64}.{payload_b64}.{signature}")
    }

    fn token(sub: &str, exp: i64) -> String {
        sign(
            SECRET,
            r#"{"alg":"HS256","typ":"JWT"}"#,
            &format!(r#"{{"sub":"{sub}","exp":{exp}}}"#),
        )
    }

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn a_valid_token_yields_the_user() {
        let verifier = TokenVerifier::new(SECRET);
        let user = verifier.verify(&token("1234", far_future())).unwrap();
        assert_eq!(user, UserId(1234));
    }

    #[test]
    fn bearer_prefix_is_required() {
        let verifier = TokenVerifier::new(SECRET);
        let token = token("1234", far_future());

        let bearer = format!("Bearer {token}");
        let user = verifier.verify_bearer(Some(bearer.as_str())).unwrap();
        assert_eq!(user, UserId(1234));

        assert_eq!(
            verifier.verify_bearer(Some(token.as_str())),
            Err(AuthError::MissingBearer)
        );
        assert_eq!(verifier.verify_bearer(None), Err(AuthError::MissingBearer));
    }

    #[test]
    fn a_tampered_signature_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        let forged = sign(
            "wrong-secret",
            r#"{"alg":"HS256","typ":"JWT"}"#,
            &format!(r#"{{"sub":"1234","exp":{}}}"#, far_future()),
        );
        assert_eq!(verifier.verify(&forged), Err(AuthError::BadSignature));
    }

    #[test]
    fn an_expired_token_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        let stale = token("1234", chrono::Utc::now().timestamp() - 10);
        assert_eq!(verifier.verify(&stale), Err(AuthError::Expired));
    }

    #[test]
    fn only_hs256_is_accepted() {
        let verifier = TokenVerifier::new(SECRET);
        let none_alg = sign(
            SECRET,
            r#"{"alg":"none"}"#,
            &format!(r#"{{"sub":"1234","exp":{}}}"#, far_future()),
        );
        assert_eq!(verifier.verify(&none_alg), Err(AuthError::BadAlgorithm));
    }

    #[test]
    fn garbage_and_anonymous_subjects_are_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        assert_eq!(verifier.verify("not-a-jwt"), Err(AuthError::Malformed));
        assert_eq!(verifier.verify("a.b.c.d"), Err(AuthError::Malformed));
        assert_eq!(
            verifier.verify(&token("someone", far_future())),
            Err(AuthError::BadSubject)
        );
        assert_eq!(
            verifier.verify(&token("0", far_future())),
            Err(AuthError::BadSubject)
        );
    }
}
