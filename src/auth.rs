use crate::app::AppState;
use crate::config::OriginConfig;
use crate::error::AppError;
use crate::verifier::{AuthorizationContext, CredentialVerifier, VerifiedToken};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

pub const TOKEN_HEADER: HeaderName = HeaderName::from_static("x-cognito-token");
pub const POOL_ID_HEADER: HeaderName = HeaderName::from_static("x-env-user-pool-id");
pub const CLIENT_ID_HEADER: HeaderName = HeaderName::from_static("x-env-client-id");

pub const PREFLIGHT_ALLOW_HEADERS: &str = "Content-Type,X-Amz-Content-Sha256,X-Cognito-Token";

/// Outcome of running the edge check on one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeDecision {
    PreflightHandled,
    /// The token or a trusted header was missing.
    Unauthenticated,
    Authorized(VerifiedToken),
    Rejected,
}

#[derive(Clone)]
pub struct AuthState {
    verifier: Arc<dyn CredentialVerifier>,
}

impl AuthState {
    pub fn new(verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self { verifier }
    }

    pub async fn authorize(&self, method: &Method, headers: &HeaderMap) -> EdgeDecision {
        if method == Method::OPTIONS {
            return EdgeDecision::PreflightHandled;
        }
        let Some(ctx) = extract_context(headers) else {
            return EdgeDecision::Unauthenticated;
        };
        match self.verifier.verify(&ctx).await {
            Ok(token) => EdgeDecision::Authorized(token),
            Err(err) => {
                tracing::info!(
                    reason = err.reason(),
                    pool_id = %ctx.pool_id,
                    error = %err,
                    "token verification failed"
                );
                EdgeDecision::Rejected
            }
        }
    }
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn extract_context(headers: &HeaderMap) -> Option<AuthorizationContext> {
    Some(AuthorizationContext {
        pool_id: header_str(headers, &POOL_ID_HEADER)?,
        client_id: header_str(headers, &CLIENT_ID_HEADER)?,
        token: header_str(headers, &TOKEN_HEADER)?,
    })
}

pub fn preflight_response() -> Response {
    (
        StatusCode::OK,
        [
            ("access-control-allow-origin", "*"),
            ("access-control-allow-methods", "*"),
            ("access-control-allow-headers", PREFLIGHT_ALLOW_HEADERS),
        ],
    )
        .into_response()
}

/// Gate in front of every origin route. Requests only reach a handler after
/// an `Authorized` decision; the request itself is forwarded untouched.
pub async fn edge_authorizer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match state.auth.authorize(req.method(), req.headers()).await {
        EdgeDecision::PreflightHandled => preflight_response(),
        EdgeDecision::Unauthenticated => {
            metrics::counter!("chat_relay_auth_rejections_total", "reason" => "missing_credentials")
                .increment(1);
            AppError::unauthorized("missing_credentials", "token or trusted headers missing")
                .into_response()
        }
        EdgeDecision::Rejected => {
            metrics::counter!("chat_relay_auth_rejections_total", "reason" => "invalid_token")
                .increment(1);
            AppError::unauthorized("invalid_token", "token verification failed").into_response()
        }
        EdgeDecision::Authorized(token) => {
            tracing::debug!(subject = ?token.subject, path = %req.uri().path(), "request authorized");
            next.run(req).await
        }
    }
}

/// Stands in for the routing layer: client-supplied copies of the trusted
/// headers are dropped and the configured origin values attached instead.
pub async fn inject_origin_headers(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    apply_origin_headers(req.headers_mut(), &state.runtime.origin);
    next.run(req).await
}

pub fn apply_origin_headers(headers: &mut HeaderMap, origin: &OriginConfig) {
    let dropped_pool = headers.remove(&POOL_ID_HEADER).is_some();
    let dropped_client = headers.remove(&CLIENT_ID_HEADER).is_some();
    if dropped_pool || dropped_client {
        tracing::debug!("dropped client-supplied trusted header");
    }
    for (name, value) in [
        (&POOL_ID_HEADER, origin.user_pool_id.as_deref()),
        (&CLIENT_ID_HEADER, origin.client_id.as_deref()),
    ] {
        if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(name.clone(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::VerifyError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedVerifier {
        accept: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialVerifier for FixedVerifier {
        async fn verify(&self, ctx: &AuthorizationContext) -> Result<VerifiedToken, VerifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                Ok(VerifiedToken {
                    subject: Some(ctx.token.clone()),
                })
            } else {
                Err(VerifyError::Claims("nope".to_string()))
            }
        }
    }

    fn state(accept: bool) -> (AuthState, Arc<FixedVerifier>) {
        let verifier = Arc::new(FixedVerifier {
            accept,
            calls: AtomicUsize::new(0),
        });
        (AuthState::new(verifier.clone()), verifier)
    }

    fn full_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(POOL_ID_HEADER, HeaderValue::from_static("us-east-1_pool"));
        headers.insert(CLIENT_ID_HEADER, HeaderValue::from_static("client"));
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("tok"));
        headers
    }

    #[tokio::test]
    async fn preflight_short_circuits_without_verification() {
        let (auth, verifier) = state(false);
        let decision = auth.authorize(&Method::OPTIONS, &HeaderMap::new()).await;
        assert_eq!(decision, EdgeDecision::PreflightHandled);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn any_missing_value_is_unauthenticated() {
        let (auth, verifier) = state(true);
        for missing in [&POOL_ID_HEADER, &CLIENT_ID_HEADER, &TOKEN_HEADER] {
            let mut headers = full_headers();
            headers.remove(missing);
            let decision = auth.authorize(&Method::POST, &headers).await;
            assert_eq!(decision, EdgeDecision::Unauthenticated);
        }
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn verifier_result_decides() {
        let (auth, _) = state(true);
        let decision = auth.authorize(&Method::POST, &full_headers()).await;
        assert!(matches!(decision, EdgeDecision::Authorized(_)));

        let (auth, verifier) = state(false);
        let decision = auth.authorize(&Method::POST, &full_headers()).await;
        assert_eq!(decision, EdgeDecision::Rejected);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn origin_values_replace_client_supplied_ones() {
        let mut headers = full_headers();
        apply_origin_headers(
            &mut headers,
            &OriginConfig {
                user_pool_id: Some("us-east-1_real".to_string()),
                client_id: None,
            },
        );
        assert_eq!(headers.get(&POOL_ID_HEADER).unwrap(), "us-east-1_real");
        assert!(headers.get(&CLIENT_ID_HEADER).is_none());
        assert_eq!(headers.get(&TOKEN_HEADER).unwrap(), "tok");
    }
}
