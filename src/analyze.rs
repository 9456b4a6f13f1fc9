//! `POST /analyzeDocument`: forwards document text to the Healthcare NLP
//! `analyzeEntities` API under the gateway's service account.

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{FromRequest, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::app::AppState;
use crate::config::AnalyzerSettings;
use crate::credentials::{CredentialError, CredentialSource};

pub const NO_INPUT_MESSAGE: &str = "No input text provided.";

/// Inbound body, as JSON or as a URL-encoded form.
#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub text: Option<String>,
}

#[derive(Serialize)]
struct AnalyzeEntitiesRequest<'a> {
    document_content: &'a str,
}

/// The document text, if the request carried any.
///
/// Never rejects: an unreadable body counts as no input.
pub struct DocumentInput(pub Option<String>);

impl<S: Send + Sync> FromRequest<S> for DocumentInput {
    type Rejection = std::convert::Infallible;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        let body = if is_form {
            Form::<AnalyzeRequest>::from_request(req, state)
                .await
                .map(|Form(body)| body)
                .ok()
        } else {
            Json::<AnalyzeRequest>::from_request(req, state)
                .await
                .map(|Json(body)| body)
                .ok()
        };

        Ok(DocumentInput(
            body.and_then(|body| body.text).filter(|text| !text.is_empty()),
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unable to obtain an access token: {0}")]
    Credential(#[from] CredentialError),
    #[error("analysis service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("analysis service returned HTTP {status}")]
    Downstream { status: u16, body: String },
}

impl IntoResponse for ProxyError {
    /// Every failure is reported as 401. A downstream error response is
    /// relayed in the body; local failures get a fixed message.
    fn into_response(self) -> Response {
        match self {
            ProxyError::Downstream { status, body } => {
                let body = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "status": status, "body": body })),
                )
                    .into_response()
            }
            err => {
                tracing::error!(error = %err, "analysis request failed");
                (StatusCode::UNAUTHORIZED, "Downstream request failed").into_response()
            }
        }
    }
}

/// Client for the `analyzeEntities` endpoint of one project.
#[derive(Clone)]
pub struct AnalyzeClient {
    client: reqwest::Client,
    endpoint: String,
    credentials: Arc<dyn CredentialSource>,
}

impl AnalyzeClient {
    pub fn new(
        client: reqwest::Client,
        endpoint: String,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            client,
            endpoint,
            credentials,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends `document_text` for entity analysis and returns the response
    /// body untouched. One attempt, fresh credential unless the source caches.
    #[tracing::instrument(skip_all, fields(endpoint = %self.endpoint, len = document_text.len()))]
    pub async fn analyze(&self, document_text: &str) -> Result<Bytes, ProxyError> {
        let credential = self.credentials.access_token().await?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(credential.access_token())
            .json(&AnalyzeEntitiesRequest {
                document_content: document_text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|err| {
                tracing::debug!(error = %err, "failed to read analysis error body");
                String::new()
            });
            tracing::warn!(status = status.as_u16(), "analysis service returned an error");
            return Err(ProxyError::Downstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.bytes().await?)
    }
}

/// `{api_base}/{api_version}/projects/{number}/locations/{region}/services/nlp:analyzeEntities`
pub fn analyze_entities_url(analyzer: &AnalyzerSettings, project_number: &str) -> String {
    format!(
        "{}/{}/projects/{}/locations/{}/services/nlp:analyzeEntities",
        analyzer.api_base.trim_end_matches('/'),
        analyzer.api_version,
        project_number,
        analyzer.region,
    )
}

/// Handler for `POST /analyzeDocument`.
#[tracing::instrument(skip_all)]
pub async fn analyze_document(
    State(state): State<AppState>,
    DocumentInput(text): DocumentInput,
) -> Result<Response, ProxyError> {
    let Some(text) = text else {
        tracing::info!("request carried no document text");
        return Ok((StatusCode::ACCEPTED, NO_INPUT_MESSAGE).into_response());
    };

    let body = state.analyzer.analyze(&text).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}
