//! IAP public signing keys.
//!
//! [`HttpKeySetProvider`] fetches the JSON Web Key Set on every call.
//! [`CachingKeySetProvider`] can wrap it to reuse a fetched set for a fixed
//! time, dropping it early when the validator reports a key it cannot use.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use moka::future::Cache;

/// Verification keys indexed by key id.
#[derive(Clone, Debug, Default)]
pub struct KeySet {
    keys: HashMap<String, Jwk>,
}

impl KeySet {
    pub fn get(&self, kid: &str) -> Option<&Jwk> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl From<JwkSet> for KeySet {
    /// Keys without a `kid` can never be selected and are dropped.
    fn from(set: JwkSet) -> Self {
        let keys = set
            .keys
            .into_iter()
            .filter_map(|jwk| jwk.common.key_id.clone().map(|kid| (kid, jwk)))
            .collect();
        Self { keys }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeySetError {
    #[error("key endpoint unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("key endpoint returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("key endpoint returned an invalid JWK set: {0}")]
    Malformed(#[source] reqwest::Error),
    #[error(transparent)]
    Shared(Arc<KeySetError>),
}

#[async_trait]
pub trait KeySetProvider: Send + Sync {
    /// Returns the current trusted keys. An empty set is not an error.
    async fn fetch_public_keys(&self) -> Result<Arc<KeySet>, KeySetError>;

    /// Signals that the last set could not verify a token.
    async fn invalidate(&self) {}
}

/// Fetches the key set from a JWK endpoint, one request per call.
#[derive(Clone)]
pub struct HttpKeySetProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySetProvider {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl KeySetProvider for HttpKeySetProvider {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn fetch_public_keys(&self) -> Result<Arc<KeySet>, KeySetError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(KeySetError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeySetError::Status(status));
        }

        let set: JwkSet = response.json().await.map_err(KeySetError::Malformed)?;
        let keys = KeySet::from(set);
        if keys.is_empty() {
            tracing::warn!("key endpoint returned no usable keys");
        } else {
            tracing::debug!(count = keys.len(), "fetched IAP public keys");
        }
        Ok(Arc::new(keys))
    }
}

/// Reuses a fetched key set for `ttl`. Concurrent misses share one fetch.
pub struct CachingKeySetProvider<P> {
    inner: P,
    cache: Cache<(), Arc<KeySet>>,
}

impl<P: KeySetProvider> CachingKeySetProvider<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            cache: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
        }
    }
}

#[async_trait]
impl<P: KeySetProvider> KeySetProvider for CachingKeySetProvider<P> {
    async fn fetch_public_keys(&self) -> Result<Arc<KeySet>, KeySetError> {
        self.cache
            .try_get_with((), self.inner.fetch_public_keys())
            .await
            .map_err(KeySetError::Shared)
    }

    async fn invalidate(&self) {
        tracing::debug!("dropping cached IAP public keys");
        self.cache.invalidate(&()).await;
        self.inner.invalidate().await;
    }
}
