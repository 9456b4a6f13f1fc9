//! Verification of the signed assertions IAP attaches to every request.

use std::{collections::HashMap, sync::Arc};

use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header, errors::ErrorKind,
    get_current_timestamp,
    jwk::{AlgorithmParameters, Jwk},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jwks::{KeySetError, KeySetProvider};

/// Header IAP uses to forward its signed assertion.
pub const IAP_JWT_HEADER: &str = "x-goog-iap-jwt-assertion";

/// Signing algorithms accepted for IAP assertions.
const ALLOWED_ALGORITHMS: [Algorithm; 2] = [Algorithm::ES256, Algorithm::RS256];

/// Claims carried by an IAP assertion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IapClaims {
    // Registered claims default so that a missing one is reported by the
    // claim checks rather than as a decoding failure.
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub aud: String,
    /// Stable user identifier, e.g. `accounts.google.com:1234`.
    #[serde(default)]
    pub sub: String,
    pub email: Option<String>,
    /// Hosted domain of the signed-in account.
    pub hd: Option<String>,
    pub iat: Option<u64>,
    #[serde(default)]
    pub exp: u64,
    pub nbf: Option<u64>,
    /// Everything else lands here
    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("no IAP assertion in the request")]
    MissingToken,
    #[error("assertion is not a well-formed JWT: {0}")]
    MalformedToken(#[source] jsonwebtoken::errors::Error),
    #[error("no usable trusted key for kid {kid:?}")]
    UnknownKey { kid: Option<String> },
    #[error("assertion signature does not verify")]
    BadSignature,
    #[error("claim `{claim}` rejected")]
    ClaimRejected { claim: String },
    #[error("unable to fetch IAP public keys: {0}")]
    KeyFetchFailure(#[from] KeySetError),
}

impl ValidationError {
    fn claim(claim: &str) -> Self {
        ValidationError::ClaimRejected {
            claim: claim.to_string(),
        }
    }

    /// Errors that may mean the key set changed since it was fetched.
    fn suggests_rotation(&self) -> bool {
        matches!(
            self,
            ValidationError::UnknownKey { .. } | ValidationError::BadSignature
        )
    }
}

pub type ValidationResult = Result<IapClaims, ValidationError>;

/// What an assertion must satisfy, fixed at startup.
#[derive(Clone, Debug)]
pub struct ValidationPolicy {
    /// `/projects/<PROJECT_NUMBER>/apps/<PROJECT_ID>`
    pub expected_audience: String,
    pub issuer: String,
    /// Seconds of clock skew tolerated on `exp`, `nbf` and `iat`.
    pub clock_skew: u64,
}

/// Verifies IAP assertions against the provider's current keys.
pub struct IapValidator {
    keys: Arc<dyn KeySetProvider>,
    policy: ValidationPolicy,
}

impl IapValidator {
    pub fn new(keys: Arc<dyn KeySetProvider>, policy: ValidationPolicy) -> Self {
        Self { keys, policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validates a raw assertion. Fails closed: any problem, including an
    /// unreachable key endpoint, is an error.
    #[tracing::instrument(skip_all)]
    pub async fn validate(&self, raw_token: Option<&str>) -> ValidationResult {
        let token = match raw_token.map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => return Err(ValidationError::MissingToken),
        };

        let result = self.verify(token).await;
        if let Err(ref err) = result
            && err.suggests_rotation()
        {
            self.keys.invalidate().await;
        }
        result
    }

    async fn verify(&self, token: &str) -> ValidationResult {
        let keys = self.keys.fetch_public_keys().await?;

        let header = decode_header(token).map_err(ValidationError::MalformedToken)?;
        tracing::debug!(kid = ?header.kid, alg = ?header.alg, "validating IAP assertion");

        let jwk = header
            .kid
            .as_deref()
            .and_then(|kid| keys.get(kid))
            .ok_or_else(|| ValidationError::UnknownKey {
                kid: header.kid.clone(),
            })?;
        if matches!(jwk.algorithm, AlgorithmParameters::OctetKey(_)) {
            return Err(ValidationError::UnknownKey { kid: header.kid });
        }
        let decoding_key =
            DecodingKey::from_jwk(jwk).map_err(|_| ValidationError::UnknownKey {
                kid: header.kid.clone(),
            })?;

        if !ALLOWED_ALGORITHMS.contains(&header.alg) || !key_accepts(jwk, header.alg) {
            return Err(ValidationError::BadSignature);
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.policy.clock_skew;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.policy.issuer]);
        validation.set_audience(&[&self.policy.expected_audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let claims = decode::<IapClaims>(token, &decoding_key, &validation)
            .map_err(classify)?
            .claims;

        if claims.aud != self.policy.expected_audience {
            return Err(ValidationError::claim("aud"));
        }
        if claims
            .iat
            .is_some_and(|iat| iat > get_current_timestamp() + self.policy.clock_skew)
        {
            return Err(ValidationError::claim("iat"));
        }

        Ok(claims)
    }
}

/// Whether `alg` belongs to the key's family.
fn key_accepts(jwk: &Jwk, alg: Algorithm) -> bool {
    match jwk.algorithm {
        AlgorithmParameters::EllipticCurve(_) => alg == Algorithm::ES256,
        AlgorithmParameters::RSA(_) => alg == Algorithm::RS256,
        _ => false,
    }
}

fn classify(err: jsonwebtoken::errors::Error) -> ValidationError {
    let rejected = match err.kind() {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
            Some(ValidationError::BadSignature)
        }
        ErrorKind::ExpiredSignature => Some(ValidationError::claim("exp")),
        ErrorKind::ImmatureSignature => Some(ValidationError::claim("nbf")),
        ErrorKind::InvalidIssuer => Some(ValidationError::claim("iss")),
        ErrorKind::InvalidAudience => Some(ValidationError::claim("aud")),
        ErrorKind::MissingRequiredClaim(claim) => Some(ValidationError::claim(claim)),
        _ => None,
    };
    rejected.unwrap_or_else(|| ValidationError::MalformedToken(err))
}
