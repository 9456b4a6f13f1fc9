//! Request pipeline assembly.
//!
//! Stages, outermost first:
//! 1. [`TraceParentLayer`]: request span and context
//! 2. [`IapGateLayer`]: identity gate, short-circuits with 401
//! 3. routes: `POST /analyzeDocument`, everything else from the static directory

use std::{path::Path, sync::Arc, time::Duration};

use axum::{Router, routing::post};
use tower_http::services::ServeDir;

use crate::analyze::{self, AnalyzeClient};
use crate::config::{IapSettings, Settings};
use crate::credentials::{
    CachingCredentialSource, CredentialError, CredentialSource, ServiceAccountCredentials,
};
use crate::gate::IapGateLayer;
use crate::iap::{IapValidator, ValidationPolicy};
use crate::jwks::{CachingKeySetProvider, HttpKeySetProvider, KeySetProvider};
use crate::middleware::TraceParentLayer;

/// Read-only state shared by all requests.
#[derive(Clone)]
pub struct AppState {
    pub analyzer: AnalyzeClient,
}

pub fn key_provider(iap: &IapSettings, client: reqwest::Client) -> Arc<dyn KeySetProvider> {
    let provider = HttpKeySetProvider::new(client, iap.jwks_url.clone());
    if iap.key_cache_ttl_secs == 0 {
        return Arc::new(provider);
    }
    Arc::new(CachingKeySetProvider::new(
        provider,
        Duration::from_secs(iap.key_cache_ttl_secs),
    ))
}

pub fn validator(settings: &Settings, client: reqwest::Client) -> IapValidator {
    IapValidator::new(
        key_provider(&settings.iap, client),
        ValidationPolicy {
            expected_audience: settings.expected_audience(),
            issuer: settings.iap.issuer.clone(),
            clock_skew: settings.iap.clock_skew_secs,
        },
    )
}

pub fn credential_source(
    settings: &Settings,
    client: reqwest::Client,
) -> Result<Arc<dyn CredentialSource>, CredentialError> {
    let credentials =
        ServiceAccountCredentials::from_file(&settings.key_path, &settings.analyzer.scope, client)?;
    if !settings.analyzer.cache_credentials {
        return Ok(Arc::new(credentials));
    }
    Ok(Arc::new(CachingCredentialSource::new(
        credentials,
        Duration::from_secs(settings.analyzer.token_refresh_skew_secs),
    )))
}

pub fn router(state: AppState, validator: Arc<IapValidator>, static_dir: &Path) -> Router {
    Router::new()
        .route("/analyzeDocument", post(analyze::analyze_document))
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
        .layer(IapGateLayer::new(validator))
        .layer(TraceParentLayer::new())
}

/// Builds the whole application. Fails only if the service account key
/// cannot be loaded.
pub fn from_settings(settings: &Settings) -> Result<Router, CredentialError> {
    let client = reqwest::Client::new();

    let credentials = credential_source(settings, client.clone())?;
    let endpoint = analyze::analyze_entities_url(&settings.analyzer, &settings.project_number);
    let analyzer = AnalyzeClient::new(client.clone(), endpoint, credentials);
    tracing::info!(endpoint = %analyzer.endpoint(), "analysis requests will be proxied");

    let validator = validator(settings, client);
    tracing::info!(
        audience = %validator.policy().expected_audience,
        "accepting IAP assertions"
    );

    Ok(router(
        AppState { analyzer },
        Arc::new(validator),
        &settings.static_dir,
    ))
}
