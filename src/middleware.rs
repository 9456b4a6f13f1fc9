//! Outermost request stage: opens the request span, joins the caller's W3C
//! trace context and scopes a [`RequestContext`] around the rest of the
//! pipeline so audit events can name the request they belong to.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use axum::{extract::Request, http::HeaderMap, response::Response};
use opentelemetry::propagation::Extractor;
use tower::{Layer, Service};
use tracing::{Instrument, debug, info_span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    pub static REQUEST_CONTEXT: RequestContext;
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub endpoint: String,
    pub host: String,
    pub method: String,
    pub request_id: String,
}

/// Runs `f` with the current request's context, or an empty one outside a request.
pub fn with_request_info<F, R>(f: F) -> R
where
    F: Fn(&RequestContext) -> R,
{
    REQUEST_CONTEXT.try_with(|r| f(r)).unwrap_or_else(|_| {
        static EMPTY: RequestContext = RequestContext {
            endpoint: String::new(),
            host: String::new(),
            method: String::new(),
            request_id: String::new(),
        };
        f(&EMPTY)
    })
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|header| header.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|h| h.as_str()).collect()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

#[derive(Debug, Clone)]
pub struct TraceParentService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TraceParentService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let headers = req.headers();
        let parent_context = opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(headers))
        });

        let ctx = RequestContext {
            endpoint: req.uri().path().to_string(),
            method: req.method().to_string(),
            host: header_str(headers, "x-forwarded-host")
                .or_else(|| header_str(headers, "host"))
                .unwrap_or_default()
                .to_string(),
            request_id: header_str(headers, REQUEST_ID_HEADER)
                .unwrap_or_default()
                .to_string(),
        };

        let span = info_span!(
            "request",
            method = %ctx.method,
            endpoint = %ctx.endpoint,
            request_id = %ctx.request_id,
        );
        if let Err(err) = span.set_parent(parent_context) {
            debug!(error = ?err, "no usable trace parent, starting a new trace");
        }

        let started = Instant::now();
        let fut = self.inner.call(req);
        Box::pin(REQUEST_CONTEXT.scope(ctx, async move {
            let response = fut.instrument(span).await;

            if let Ok(ref res) = response {
                let status = res.status().as_u16();
                with_request_info(|ctx| {
                    tracing::info!(
                        endpoint = %ctx.endpoint,
                        httpMethod = %ctx.method,
                        status,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "request to {} finished",
                        ctx.endpoint
                    );
                });
            }

            response
        }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceParentLayer;

impl TraceParentLayer {
    pub fn new() -> Self {
        TraceParentLayer
    }
}

impl<S> Layer<S> for TraceParentLayer {
    type Service = TraceParentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceParentService { inner }
    }
}
