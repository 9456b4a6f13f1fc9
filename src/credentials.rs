//! Outbound credentials for the Healthcare API.
//!
//! The gateway authenticates as a service account: it signs a JWT assertion
//! with the account's private key and exchanges it at the account's token
//! endpoint for a short-lived OAuth access token (RFC 7523 JWT bearer grant).

use std::{
    fmt,
    path::Path,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode, get_current_timestamp};
use moka::{Expiry, future::Cache};
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::DecodePrivateKey;
use serde::{Deserialize, Serialize};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Lifetime requested for each signed assertion. Google caps it at one hour.
const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// An access token for exactly one downstream call (or, when cached, until
/// shortly before it expires).
#[derive(Clone)]
pub struct OutboundCredential {
    access_token: String,
    expires_in: Duration,
}

impl OutboundCredential {
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_in(&self) -> Duration {
        self.expires_in
    }
}

#[cfg(test)]
pub(crate) fn test_credential(access_token: &str) -> OutboundCredential {
    OutboundCredential {
        access_token: access_token.to_string(),
        expires_in: Duration::from_secs(3600),
    }
}

impl fmt::Debug for OutboundCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCredential")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("unable to read service account key file: {0}")]
    KeyFile(#[from] std::io::Error),
    #[error("service account key file is not valid JSON: {0}")]
    KeyFormat(#[from] serde_json::Error),
    #[error("service account private key is not an RSA key")]
    PrivateKey,
    #[error("unable to sign token assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error("token endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("token endpoint rejected the assertion with HTTP {status}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    Shared(std::sync::Arc<CredentialError>),
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn access_token(&self) -> Result<OutboundCredential, CredentialError>;
}

/// The fields of a Google service account JSON key the exchange needs.
#[derive(Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Claims of the self-signed assertion sent to the token endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssertionClaims {
    /// Service account email.
    pub iss: String,
    /// Space-separated OAuth scopes.
    pub scope: String,
    /// The token endpoint.
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// Exchanges a service account key for access tokens, one exchange per call.
pub struct ServiceAccountCredentials {
    client: reqwest::Client,
    client_email: String,
    key_id: Option<String>,
    token_uri: String,
    scope: String,
    signing_key: EncodingKey,
}

impl ServiceAccountCredentials {
    /// Loads the key file once; the private key is parsed up front so a bad
    /// file fails startup instead of the first request.
    #[tracing::instrument(skip(client))]
    pub fn from_file(
        path: &Path,
        scope: &str,
        client: reqwest::Client,
    ) -> Result<Self, CredentialError> {
        let raw = std::fs::read_to_string(path)?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)?;
        Self::from_key(key, scope, client)
    }

    pub fn from_key(
        key: ServiceAccountKey,
        scope: &str,
        client: reqwest::Client,
    ) -> Result<Self, CredentialError> {
        // Key files carry PKCS#8; normalize to PKCS#1 DER for signing.
        let private_key = RsaPrivateKey::from_pkcs8_pem(&key.private_key)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&key.private_key))
            .map_err(|_| CredentialError::PrivateKey)?;
        let der = private_key
            .to_pkcs1_der()
            .map_err(|_| CredentialError::PrivateKey)?;

        tracing::info!(client_email = %key.client_email, "loaded service account key");
        Ok(Self {
            client,
            client_email: key.client_email,
            key_id: key.private_key_id,
            token_uri: key.token_uri,
            scope: scope.to_string(),
            signing_key: EncodingKey::from_rsa_der(der.as_bytes()),
        })
    }

    fn assertion_claims(&self) -> AssertionClaims {
        let now = get_current_timestamp();
        AssertionClaims {
            iss: self.client_email.clone(),
            scope: self.scope.clone(),
            aud: self.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        }
    }

    fn signed_assertion(&self) -> Result<String, CredentialError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();
        Ok(encode(&header, &self.assertion_claims(), &self.signing_key)?)
    }
}

#[async_trait]
impl CredentialSource for ServiceAccountCredentials {
    #[tracing::instrument(skip(self), fields(scope = %self.scope))]
    async fn access_token(&self) -> Result<OutboundCredential, CredentialError> {
        let assertion = self.signed_assertion()?;

        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|err| {
                tracing::debug!(error = %err, "failed to read token endpoint error body");
                String::new()
            });
            tracing::warn!(status = status.as_u16(), %body, "token endpoint rejected assertion");
            return Err(CredentialError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        tracing::debug!(expires_in = token.expires_in, "obtained access token");
        Ok(OutboundCredential {
            access_token: token.access_token,
            expires_in: Duration::from_secs(token.expires_in),
        })
    }
}

/// Evicts a cached credential `skew` before the provider says it expires.
struct RefreshBeforeExpiry {
    skew: Duration,
}

impl Expiry<(), OutboundCredential> for RefreshBeforeExpiry {
    fn expire_after_create(
        &self,
        _key: &(),
        value: &OutboundCredential,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_in().saturating_sub(self.skew))
    }
}

/// Reuses access tokens until shortly before expiry.
pub struct CachingCredentialSource<C> {
    inner: C,
    cache: Cache<(), OutboundCredential>,
}

impl<C: CredentialSource> CachingCredentialSource<C> {
    pub fn new(inner: C, refresh_skew: Duration) -> Self {
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(1)
                .expire_after(RefreshBeforeExpiry { skew: refresh_skew })
                .build(),
        }
    }
}

#[async_trait]
impl<C: CredentialSource> CredentialSource for CachingCredentialSource<C> {
    async fn access_token(&self) -> Result<OutboundCredential, CredentialError> {
        self.cache
            .try_get_with((), self.inner.access_token())
            .await
            .map_err(CredentialError::Shared)
    }
}
