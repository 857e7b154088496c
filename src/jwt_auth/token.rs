//! Thin adapter over `jsonwebtoken`: parse, validation defaults, verify, sign.
//!
//! Parsing never checks the signature. It only establishes that the token is
//! three base64url segments with a decodable header and a JSON object payload,
//! so the issuer can be read before any key is resolved.

use base64::Engine;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};

use crate::config::Algorithm;

/// JWT claims as a JSON object.
pub type Claims = Map<String, Value>;

/// Token parse/verify/sign failures.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Not a structurally valid JWT.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Signature or claim check failed.
    #[error("{0}")]
    Verification(jsonwebtoken::errors::Error),

    /// The signing primitive rejected the input.
    #[error("signing failed: {0}")]
    Signing(jsonwebtoken::errors::Error),
}

/// A structurally decoded, not yet verified token.
#[derive(Debug, Clone)]
pub struct JwtObject {
    raw: String,
    header: Header,
    claims: Claims,
}

impl JwtObject {
    /// Decode `raw` without checking its signature.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let header = jsonwebtoken::decode_header(raw)
            .map_err(|e| TokenError::Malformed(e.to_string()))?;

        let mut parts = raw.split('.');
        let (Some(_), Some(payload), Some(_), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed(
                "expected three dot-separated segments".to_string(),
            ));
        };

        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| TokenError::Malformed(format!("payload is not base64url: {e}")))?;

        let claims = match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(TokenError::Malformed(
                    "payload is not a JSON object".to_string(),
                ));
            }
            Err(e) => return Err(TokenError::Malformed(format!("payload is not JSON: {e}"))),
        };

        Ok(Self {
            raw: raw.to_string(),
            header,
            claims,
        })
    }

    /// The token exactly as presented.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Decoded header.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// `iss` claim, if it is a non-empty string.
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.string_claim("iss")
    }

    /// `sub` claim, if it is a non-empty string.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.string_claim("sub")
    }

    fn string_claim(&self, name: &str) -> Option<&str> {
        self.claims
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Validation options for a consumer: only `alg` is accepted, `exp` is
/// required, `nbf` is checked when present and both get `grace_period`
/// seconds of leeway. Audience is not checked.
#[must_use]
pub fn default_validation(alg: Algorithm, grace_period: u64) -> Validation {
    let mut validation = Validation::new(alg.to_jwt());
    validation.leeway = grace_period;
    validation.validate_nbf = true;
    validation.validate_aud = false;
    validation
}

/// Check the signature and time claims of `token`.
pub fn verify(
    token: &JwtObject,
    key: &DecodingKey,
    validation: &Validation,
) -> Result<Claims, TokenError> {
    jsonwebtoken::decode::<Claims>(token.raw(), key, validation)
        .map(|data| data.claims)
        .map_err(TokenError::Verification)
}

/// Sign `claims` with `alg`.
pub fn sign(key: &EncodingKey, alg: Algorithm, claims: &Claims) -> Result<String, TokenError> {
    let header = Header::new(alg.to_jwt());
    jsonwebtoken::encode(&header, claims, key).map_err(TokenError::Signing)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const RSA_PRIVATE: &str = include_str!("../../tests/fixtures/rsa_private.pem");
    const RSA_PUBLIC: &str = include_str!("../../tests/fixtures/rsa_public.pem");

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            .try_into()
            .unwrap()
    }

    fn claims(value: Value) -> Claims {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn parse_exposes_iss_and_sub() {
        let key = EncodingKey::from_secret(b"s3cret");
        let raw = sign(
            &key,
            Algorithm::HS256,
            &claims(json!({ "iss": "k1", "sub": "u1", "exp": now() + 60 })),
        )
        .unwrap();

        let token = JwtObject::parse(&raw).unwrap();
        assert_eq!(token.issuer(), Some("k1"));
        assert_eq!(token.subject(), Some("u1"));
        assert_eq!(token.raw(), raw);
        assert_eq!(token.header().alg, jsonwebtoken::Algorithm::HS256);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            JwtObject::parse("not-a-jwt"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            JwtObject::parse("a.b.c.d"),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn parse_treats_empty_iss_as_absent() {
        let key = EncodingKey::from_secret(b"s3cret");
        let raw = sign(&key, Algorithm::HS256, &claims(json!({ "iss": "", "exp": 1 }))).unwrap();
        assert_eq!(JwtObject::parse(&raw).unwrap().issuer(), None);
    }

    #[test]
    fn verify_accepts_valid_hs256() {
        let raw = sign(
            &EncodingKey::from_secret(b"s3cret"),
            Algorithm::HS256,
            &claims(json!({ "iss": "k1", "exp": now() + 60 })),
        )
        .unwrap();
        let token = JwtObject::parse(&raw).unwrap();

        let verified = verify(
            &token,
            &DecodingKey::from_secret(b"s3cret"),
            &default_validation(Algorithm::HS256, 0),
        )
        .unwrap();
        assert_eq!(verified["iss"], "k1");
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let raw = sign(
            &EncodingKey::from_secret(b"s3cret"),
            Algorithm::HS256,
            &claims(json!({ "iss": "k1", "exp": now() + 60 })),
        )
        .unwrap();
        let token = JwtObject::parse(&raw).unwrap();

        let err = verify(
            &token,
            &DecodingKey::from_secret(b"other"),
            &default_validation(Algorithm::HS256, 0),
        )
        .unwrap_err();
        assert!(matches!(err, TokenError::Verification(_)));
    }

    #[test]
    fn grace_period_extends_expiry() {
        // GIVEN: a token that expired 30 seconds ago
        let raw = sign(
            &EncodingKey::from_secret(b"s3cret"),
            Algorithm::HS256,
            &claims(json!({ "iss": "k1", "exp": now() - 30 })),
        )
        .unwrap();
        let token = JwtObject::parse(&raw).unwrap();
        let key = DecodingKey::from_secret(b"s3cret");

        // THEN: rejected without grace, accepted with 120s grace
        assert!(verify(&token, &key, &default_validation(Algorithm::HS256, 0)).is_err());
        assert!(verify(&token, &key, &default_validation(Algorithm::HS256, 120)).is_ok());
    }

    #[test]
    fn header_algorithm_cannot_override_configured_one() {
        // GIVEN: an HS512 token checked under an HS256 consumer
        let raw = sign(
            &EncodingKey::from_secret(b"s3cret"),
            Algorithm::HS512,
            &claims(json!({ "iss": "k1", "exp": now() + 60 })),
        )
        .unwrap();
        let token = JwtObject::parse(&raw).unwrap();

        // THEN: rejected even though the secret matches
        assert!(
            verify(
                &token,
                &DecodingKey::from_secret(b"s3cret"),
                &default_validation(Algorithm::HS256, 0),
            )
            .is_err()
        );
    }

    #[test]
    fn rs256_sign_and_verify() {
        let raw = sign(
            &EncodingKey::from_rsa_pem(RSA_PRIVATE.as_bytes()).unwrap(),
            Algorithm::RS256,
            &claims(json!({ "iss": "rsa", "exp": now() + 60 })),
        )
        .unwrap();
        let token = JwtObject::parse(&raw).unwrap();

        assert!(
            verify(
                &token,
                &DecodingKey::from_rsa_pem(RSA_PUBLIC.as_bytes()).unwrap(),
                &default_validation(Algorithm::RS256, 0),
            )
            .is_ok()
        );
    }
}
