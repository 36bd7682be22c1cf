//! Request throttling middleware.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, error, instrument, warn};

use crate::error::Result;
use crate::ratelimit::{
    FailurePolicy, RateLimiter, RateLimitingConfig, RateRule, RuleResolver, Signature,
    SignatureResolver,
};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Body of a rejected request.
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub status: u8,
    pub code: i64,
    pub msg: String,
}

/// Outcome of the quota check for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Admission {
    Allowed,
    Blocked {
        remaining: u64,
        retry_after: Option<u64>,
    },
}

/// Throttles requests by the signature of their requester.
///
/// Each request resolves a [`RateRule`] and a [`Signature`], is rejected when
/// the signature has used up its window, and otherwise counts one hit before
/// being forwarded. Quota headers are attached either way.
pub struct Throttle {
    limiter: RateLimiter,
    rules: RuleResolver,
    signatures: SignatureResolver,
    config: Arc<RateLimitingConfig>,
}

impl Throttle {
    pub fn new(limiter: RateLimiter, config: Arc<RateLimitingConfig>) -> Self {
        Self {
            rules: RuleResolver::new(config.clone()),
            signatures: SignatureResolver::new(config.default.udid_name.clone())
                .with_trusted_proxies(config.trusted_proxies.iter().copied()),
            limiter,
            config,
        }
    }

    /// The limiter behind this middleware.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Throttle a single request.
    #[instrument(
        skip_all,
        fields(method = %request.method(), path = %request.uri().path())
    )]
    pub async fn handle(&self, request: Request, next: Next) -> Response {
        let (parts, body) = request.into_parts();

        let (rule, signature) = {
            let method = parts.method.as_str();
            let path = parts.uri.path();
            let rule = self.rules.resolve(method, path);
            let requester = self.signatures.requester(&parts);
            let signature = self.signatures.signature(method, path, rule.level, &requester);
            (rule, signature)
        };

        match self.admit(&signature, &rule).await {
            Ok(Admission::Allowed) => {}
            Ok(Admission::Blocked {
                remaining,
                retry_after,
            }) => {
                debug!(
                    signature = %signature,
                    api = %rule.api_name,
                    max_attempts = rule.max_attempts,
                    retry_after = ?retry_after,
                    "Rate limit exceeded"
                );
                return self.reject(&parts, &rule, remaining, retry_after);
            }
            Err(err) => match self.config.store_failure_policy {
                FailurePolicy::Open => {
                    warn!(error = %err, "Store unavailable, letting request through");
                    return next.run(Request::from_parts(parts, body)).await;
                }
                FailurePolicy::Closed => {
                    error!(error = %err, "Store unavailable, rejecting request");
                    return self.unavailable(&parts);
                }
            },
        }

        let mut response = next.run(Request::from_parts(parts, body)).await;

        if is_decoratable(&response) {
            match self.limiter.retries_left(&signature, rule.max_attempts).await {
                Ok(left) => {
                    add_headers(response.headers_mut(), rule.max_attempts, left.max(0) as u64, None)
                }
                Err(err) => warn!(error = %err, "Store unavailable, omitting quota headers"),
            }
        }

        response
    }

    /// Check the quota and, when admitted, count the request.
    ///
    /// Once a requester is known to be blocked, store errors while reading the
    /// header values only degrade the headers.
    async fn admit(&self, signature: &Signature, rule: &RateRule) -> Result<Admission> {
        if self
            .limiter
            .too_many_attempts(signature, rule.max_attempts)
            .await?
        {
            let remaining = match self.limiter.retries_left(signature, rule.max_attempts).await {
                Ok(left) => left.max(0) as u64,
                Err(err) => {
                    warn!(error = %err, "Store unavailable, reporting no retries left");
                    0
                }
            };
            let retry_after = match self.limiter.available_in(signature).await {
                Ok(secs) => Some(secs),
                Err(err) => {
                    warn!(error = %err, "Store unavailable, omitting Retry-After");
                    None
                }
            };
            return Ok(Admission::Blocked {
                remaining,
                retry_after,
            });
        }

        self.limiter.hit(signature, rule.window_seconds).await?;
        Ok(Admission::Allowed)
    }

    fn rejection_body(&self) -> Rejection {
        Rejection {
            status: 0,
            code: self.config.error_code,
            msg: self.config.error_message.clone(),
        }
    }

    fn reject(
        &self,
        parts: &Parts,
        rule: &RateRule,
        remaining: u64,
        retry_after: Option<u64>,
    ) -> Response {
        let status = StatusCode::from_u16(self.config.rejection_status).unwrap_or(StatusCode::OK);
        let mut response = (status, Json(self.rejection_body())).into_response();

        copy_authorization(parts, response.headers_mut());
        add_headers(
            response.headers_mut(),
            rule.max_attempts,
            remaining,
            retry_after,
        );
        response
    }

    fn unavailable(&self, parts: &Parts) -> Response {
        let mut response =
            (StatusCode::SERVICE_UNAVAILABLE, Json(self.rejection_body())).into_response();
        copy_authorization(parts, response.headers_mut());
        response
    }
}

/// Middleware entry point for `axum::middleware::from_fn_with_state`.
pub async fn throttle(
    State(throttle): State<Arc<Throttle>>,
    request: Request,
    next: Next,
) -> Response {
    throttle.handle(request, next).await
}

/// Informational responses (e.g. protocol switches) are passed through untouched.
fn is_decoratable(response: &Response) -> bool {
    !response.status().is_informational()
}

fn copy_authorization(parts: &Parts, headers: &mut HeaderMap) {
    if let Some(token) = parts.headers.get(AUTHORIZATION) {
        headers.insert(AUTHORIZATION, token.clone());
    }
}

fn add_headers(headers: &mut HeaderMap, limit: u64, remaining: u64, retry_after: Option<u64>) {
    headers.insert(HEADER_LIMIT, HeaderValue::from(limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(remaining));
    if let Some(secs) = retry_after {
        headers.insert(HEADER_RETRY_AFTER, HeaderValue::from(secs));
    }
}
