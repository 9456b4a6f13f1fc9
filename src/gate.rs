//! Identity gate run in front of every route.
//!
//! Requests without a valid IAP assertion are answered with a uniform 401
//! before any handler or static file lookup runs. The decoded [`IapClaims`]
//! are attached to the request extensions of accepted requests.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    extract::Request,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use tower::{Layer, Service};

use crate::audit;
use crate::iap::{IAP_JWT_HEADER, IapClaims, IapValidator};

pub const REJECTION_BODY: &str = "IAP rejected this request";

fn rejection() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        REJECTION_BODY,
    )
        .into_response()
}

#[derive(Clone)]
pub struct IapGateService<S> {
    inner: S,
    validator: Arc<IapValidator>,
}

impl<S> Service<Request> for IapGateService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        // The readied service goes with this request; keep a fresh clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let validator = self.validator.clone();

        Box::pin(async move {
            let token = req
                .headers()
                .get(IAP_JWT_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);

            match validator.validate(token.as_deref()).await {
                Ok(claims) => {
                    tracing::debug!(sub = %claims.sub, "IAP assertion accepted");
                    req.extensions_mut().insert::<IapClaims>(claims);
                    inner.call(req).await
                }
                Err(err) => {
                    audit!(outcome = "rejected", reason = %err, "IAP rejected request");
                    Ok(rejection())
                }
            }
        })
    }
}

#[derive(Clone)]
pub struct IapGateLayer {
    validator: Arc<IapValidator>,
}

impl IapGateLayer {
    pub fn new(validator: Arc<IapValidator>) -> Self {
        IapGateLayer { validator }
    }
}

impl<S> Layer<S> for IapGateLayer {
    type Service = IapGateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IapGateService {
            inner,
            validator: self.validator.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iap::ValidationPolicy;
    use crate::jwks::HttpKeySetProvider;
    use crate::test_support::*;
    use axum::{Extension, Router, body::Body, routing::get};
    use tower::ServiceExt;
    use wiremock::MockServer;

    fn gated_app(server: &MockServer) -> Router {
        let validator = IapValidator::new(
            Arc::new(HttpKeySetProvider::new(reqwest::Client::new(), jwks_url(server))),
            ValidationPolicy {
                expected_audience: TEST_AUDIENCE.to_string(),
                issuer: TEST_ISSUER.to_string(),
                clock_skew: 30,
            },
        );
        Router::new()
            .route(
                "/me",
                get(|Extension(claims): Extension<IapClaims>| async move {
                    claims.email.unwrap_or_default()
                }),
            )
            .layer(IapGateLayer::new(Arc::new(validator)))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_accepted_request_sees_claims() {
        let server = MockServer::start().await;
        mount_jwks(&server).await;

        let request = Request::builder()
            .uri("/me")
            .header("X-Goog-IAP-JWT-Assertion", valid_token())
            .body(Body::empty())
            .unwrap();
        let response = gated_app(&server).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "doctor@example.com");
    }

    #[tokio::test]
    async fn test_accepts_es256_assertion() {
        let server = MockServer::start().await;
        mount_jwks(&server).await;
        let token = sign_ec(EC_SIGNING_KEY, Some(EC_KID), &iap_claims(TEST_AUDIENCE));

        let request = Request::builder()
            .uri("/me")
            .header(IAP_JWT_HEADER, token)
            .body(Body::empty())
            .unwrap();
        let response = gated_app(&server).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "doctor@example.com");
    }

    #[tokio::test]
    async fn test_rejections_are_uniform() {
        let server = MockServer::start().await;
        mount_jwks(&server).await;
        let forged = sign(&ROGUE_KEY, Some(TEST_KID), &iap_claims(TEST_AUDIENCE));
        let foreign = sign(
            &SIGNING_KEY,
            Some(TEST_KID),
            &iap_claims("/projects/1/apps/other"),
        );
        let forged_ec = sign_ec(EC_ROGUE_KEY, Some(EC_KID), &iap_claims(TEST_AUDIENCE));

        let mut bodies = Vec::new();
        for token in [
            None,
            Some("not-a-real-token".to_string()),
            Some(forged),
            Some(foreign),
            Some(forged_ec),
        ] {
            let mut builder = Request::builder().uri("/me");
            if let Some(token) = token {
                builder = builder.header(IAP_JWT_HEADER, token);
            }
            let response = gated_app(&server)
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            bodies.push(body_string(response).await);
        }

        assert!(bodies.iter().all(|body| body == REJECTION_BODY));
    }
}
