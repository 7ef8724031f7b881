use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::claims::{Claims, Scope};
use crate::secret::HmacSecret;

type HmacSha256 = Hmac<Sha256>;

const ALG_HS256: &str = "HS256";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
}

/// Errors from [`TokenIssuer::validate`]. Matches the taxonomy in spec §4.C.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported signing algorithm")]
    BadAlg,
    #[error("signature verification failed")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

impl TokenError {
    pub fn kind(&self) -> imgforge_core::ErrorKind {
        imgforge_core::ErrorKind::TokenError
    }
}

/// Issues and validates HMAC-signed, repository-scoped bearer tokens.
///
/// MAC-only by design (spec §4.C rationale): issuer and verifier are the
/// same process family, so there's no need for asymmetric signing or a
/// JWKS endpoint. The signing secret is process-wide and immutable after
/// startup (§9).
pub struct TokenIssuer {
    secret: HmacSecret,
    issuer: String,
}

impl TokenIssuer {
    pub fn new(secret: HmacSecret, issuer: impl Into<String>) -> Self {
        Self {
            secret,
            issuer: issuer.into(),
        }
    }

    /// Issue a bearer token scoped to `repositories`, expiring `ttl_secs`
    /// from now. `build_id` and `repositories` must be non-empty.
    pub fn issue(
        &self,
        build_id: &str,
        repositories: Vec<String>,
        ttl_secs: u64,
    ) -> Result<String, TokenError> {
        if build_id.is_empty() || repositories.is_empty() {
            return Err(TokenError::Malformed);
        }
        let now = unix_now();
        let claims = Claims {
            build_id: build_id.to_string(),
            repositories,
            scope: Scope::Push,
            issued_at: now,
            expires_at: now + ttl_secs,
            subject: format!("builder-{build_id}"),
            issuer: self.issuer.clone(),
        };
        Ok(self.encode(&claims))
    }

    fn encode(&self, claims: &Claims) -> String {
        let header = Header {
            alg: ALG_HS256.to_string(),
        };
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).expect("header"));
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims"));
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = self.sign(signing_input.as_bytes());
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature);
        format!("{signing_input}.{signature_b64}")
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// Parse and verify a bearer token: signing algorithm, MAC, and
    /// expiry. Returns the claim set on success.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let parts: Vec<&str> = token.split('.').collect();
        let [header_b64, payload_b64, signature_b64] = parts[..] else {
            return Err(TokenError::Malformed);
        };

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| TokenError::Malformed)?;
        let header: Header =
            serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Malformed)?;
        if header.alg != ALG_HS256 {
            return Err(TokenError::BadAlg);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signing_input = format!("{header_b64}.{payload_b64}");
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Malformed)?;

        if claims.expires_at <= unix_now() {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(HmacSecret::new(b"test-secret-key-material".to_vec()), "imgforge")
    }

    #[test]
    fn test_issue_and_validate_round_trip() {
        let issuer = issuer();
        let token = issuer
            .issue("b-1", vec!["builds/b-1".to_string()], 1800)
            .unwrap();
        let claims = issuer.validate(&token).unwrap();
        assert_eq!(claims.build_id, "b-1");
        assert_eq!(claims.subject, "builder-b-1");
        assert!(claims.is_repo_allowed("builds/b-1"));
        assert!(!claims.is_repo_allowed("builds/b-2"));
    }

    #[test]
    fn test_issue_rejects_empty_build_id() {
        assert_eq!(
            issuer().issue("", vec!["a".to_string()], 60).unwrap_err(),
            TokenError::Malformed
        );
    }

    #[test]
    fn test_issue_rejects_empty_repositories() {
        assert_eq!(
            issuer().issue("b-1", vec![], 60).unwrap_err(),
            TokenError::Malformed
        );
    }

    #[test]
    fn test_validate_rejects_garbage() {
        assert_eq!(issuer().validate("not-a-token").unwrap_err(), TokenError::Malformed);
        assert_eq!(issuer().validate("a.b").unwrap_err(), TokenError::Malformed);
    }

    #[test]
    fn test_validate_rejects_wrong_secret() {
        let a = issuer();
        let b = TokenIssuer::new(HmacSecret::new(b"different-secret".to_vec()), "imgforge");
        let token = a.issue("b-1", vec!["builds/b-1".to_string()], 1800).unwrap();
        assert_eq!(b.validate(&token).unwrap_err(), TokenError::BadSignature);
    }

    #[test]
    fn test_validate_rejects_tampered_payload() {
        let issuer = issuer();
        let token = issuer
            .issue("b-1", vec!["builds/b-1".to_string()], 1800)
            .unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let tampered_claims = Claims {
            build_id: "b-2".to_string(),
            repositories: vec!["builds/b-2".to_string()],
            scope: Scope::Push,
            issued_at: 0,
            expires_at: u64::MAX,
            subject: "builder-b-2".to_string(),
            issuer: "imgforge".to_string(),
        };
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&tampered_claims).unwrap());
        parts[1] = &forged_payload;
        let forged = parts.join(".");
        assert_eq!(issuer.validate(&forged).unwrap_err(), TokenError::BadSignature);
    }

    #[test]
    fn test_validate_rejects_expired_token() {
        let issuer = issuer();
        // ttl of 0 with issued_at == now means expires_at == now, which is
        // already <= unix_now() by the time validate() runs.
        let token = issuer
            .issue("b-1", vec!["builds/b-1".to_string()], 0)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(issuer.validate(&token).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn test_validate_rejects_bad_alg() {
        let issuer = issuer();
        let header = Header {
            alg: "none".to_string(),
        };
        let claims = Claims {
            build_id: "b-1".to_string(),
            repositories: vec!["builds/b-1".to_string()],
            scope: Scope::Push,
            issued_at: 0,
            expires_at: u64::MAX,
            subject: "builder-b-1".to_string(),
            issuer: "imgforge".to_string(),
        };
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let forged = format!("{header_b64}.{payload_b64}.sig");
        assert_eq!(issuer.validate(&forged).unwrap_err(), TokenError::BadAlg);
    }
}
