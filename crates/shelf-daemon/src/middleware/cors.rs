//! CORS decoration and uniform pre-flight handling.
//!
//! Every response leaving the router carries the allow-origin, allow-headers
//! and allow-methods headers. `OPTIONS` requests never reach routing: they are
//! answered here with `200` and an empty body, whatever the path.

use std::{convert::Infallible, sync::Arc};

use axum::{
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::warn;

const ALLOW_HEADERS: &str = "*";
const ALLOW_METHODS: &str = "GET,POST,OPTIONS";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

impl AllowedOrigins {
    /// Parses `*` or a comma-separated origin list. Blank input means `*`.
    pub fn parse(raw: &str) -> Self {
        let origins: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();

        if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
            AllowedOrigins::Any
        } else {
            AllowedOrigins::List(origins)
        }
    }
}

impl Default for AllowedOrigins {
    fn default() -> Self {
        AllowedOrigins::Any
    }
}

#[derive(Clone, Debug, Default)]
pub struct CorsPolicy {
    origins: Vec<HeaderValue>,
}

impl CorsPolicy {
    pub fn new(allowed: &AllowedOrigins) -> Self {
        let origins = match allowed {
            AllowedOrigins::Any => Vec::new(),
            AllowedOrigins::List(list) => list
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!(%origin, "ignoring allowed origin that is not a valid header value");
                        None
                    }
                })
                .collect(),
        };
        Self { origins }
    }

    fn allow_origin(&self, request_origin: Option<&HeaderValue>) -> HeaderValue {
        let Some(first) = self.origins.first() else {
            return HeaderValue::from_static("*");
        };
        request_origin
            .filter(|origin| self.origins.contains(origin))
            .unwrap_or(first)
            .clone()
    }

    fn apply(&self, request_origin: Option<&HeaderValue>, headers: &mut HeaderMap) {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            self.allow_origin(request_origin),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        if !self.origins.is_empty() {
            headers.append(header::VARY, HeaderValue::from_static("origin"));
        }
    }
}

#[derive(Clone)]
pub struct CorsLayer {
    policy: Arc<CorsPolicy>,
}

pub fn cors_layer(policy: CorsPolicy) -> CorsLayer {
    CorsLayer {
        policy: Arc::new(policy),
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = CorsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorsService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CorsService<S> {
    inner: S,
    policy: Arc<CorsPolicy>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for CorsService<S>
where
    S: Service<Request<ReqBody>, Error = Infallible> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let policy = self.policy.clone();

        Box::pin(async move {
            let origin = request.headers().get(header::ORIGIN).cloned();
            let mut response = if request.method() == Method::OPTIONS {
                StatusCode::OK.into_response()
            } else {
                inner.call(request).await?.into_response()
            };
            policy.apply(origin.as_ref(), response.headers_mut());
            Ok(response)
        })
    }
}
