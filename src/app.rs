use crate::auth::{AuthState, edge_authorizer, inject_origin_headers};
use crate::backend::{BackendConfig, Backends};
use crate::config::{
    IdentityConfig, OriginConfig, UpstreamConfig, default_issuer_base, default_stream_buffer,
    parse_algorithms, parse_auth_type,
};
use crate::error::{AppError, AppResult, ErrorKind};
use crate::upstream::MessagesProvider;
use crate::verifier::{CredentialVerifier, JwksVerifier};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue};
use axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::str::FromStr;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Largest accepted chat body. Inline `data:` attachments make these large.
pub const MAX_BODY_BYTES: usize = 6 * 1024 * 1024;

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub backends: Backends,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub origin: OriginConfig,
    pub identity: IdentityConfig,
    pub upstream: UpstreamConfig,
    pub stream_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            origin: OriginConfig::default(),
            identity: IdentityConfig::default(),
            upstream: UpstreamConfig::default(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parsed<T: FromStr>(name: &str, default: T) -> T {
    match env_value(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable value");
            default
        }),
        None => default,
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let listen = env_value("CHAT_RELAY_LISTEN").unwrap_or(defaults.listen);
        let metrics_path = env_value("CHAT_RELAY_METRICS_PATH")
            .map(|p| {
                if p.starts_with('/') {
                    p
                } else {
                    format!("/{p}")
                }
            })
            .unwrap_or(defaults.metrics_path);
        let origin = OriginConfig {
            user_pool_id: env_value("CHAT_RELAY_USER_POOL_ID"),
            client_id: env_value("CHAT_RELAY_CLIENT_ID"),
        };
        let identity = IdentityConfig {
            issuer_base: env_value("CHAT_RELAY_ISSUER_BASE").unwrap_or_else(default_issuer_base),
            algorithms: env_value("CHAT_RELAY_JWT_ALGORITHMS")
                .map(|raw| parse_algorithms(&raw))
                .unwrap_or(defaults.identity.algorithms),
            jwks_ttl_secs: env_parsed("CHAT_RELAY_JWKS_TTL_SECS", defaults.identity.jwks_ttl_secs),
            jwks_refetch_cooldown_secs: env_parsed(
                "CHAT_RELAY_JWKS_REFETCH_COOLDOWN_SECS",
                defaults.identity.jwks_refetch_cooldown_secs,
            ),
        };
        let upstream = UpstreamConfig {
            base_url: env_value("CHAT_RELAY_UPSTREAM_BASE_URL")
                .unwrap_or(defaults.upstream.base_url),
            api_key: env_value("CHAT_RELAY_UPSTREAM_API_KEY"),
            auth: env_value("CHAT_RELAY_UPSTREAM_AUTH")
                .map(|raw| parse_auth_type(&raw))
                .unwrap_or(defaults.upstream.auth),
            timeout_ms: env_parsed(
                "CHAT_RELAY_UPSTREAM_TIMEOUT_MS",
                defaults.upstream.timeout_ms,
            ),
            max_tokens: env_parsed("CHAT_RELAY_MAX_TOKENS", defaults.upstream.max_tokens),
        };
        let stream_buffer = env_parsed("CHAT_RELAY_STREAM_BUFFER", defaults.stream_buffer);
        Self {
            listen,
            metrics_path,
            origin,
            identity,
            upstream,
            stream_buffer,
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("chat-relay/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                ErrorKind::UpstreamFailure,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let verifier = Arc::new(JwksVerifier::new(http.clone(), runtime.identity.clone()));
    let provider = Arc::new(MessagesProvider::new(http, runtime.upstream.clone()));
    let backends = Backends::from_provider(
        provider,
        BackendConfig::from_upstream(&runtime.upstream, runtime.stream_buffer),
    );
    if runtime.origin.user_pool_id.is_none() {
        tracing::warn!("no user pool configured; every chat request will be rejected");
    }
    if runtime.upstream.api_key.is_none() {
        tracing::warn!("no upstream api key configured");
    }
    AppState::from_parts(runtime, verifier, backends)
}

impl AppState {
    /// Assembles state from already built collaborators.
    pub fn from_parts(
        runtime: RuntimeConfig,
        verifier: Arc<dyn CredentialVerifier>,
        backends: Backends,
    ) -> AppResult<Self> {
        let metrics = init_metrics()?;
        Ok(Self {
            runtime: Arc::new(runtime),
            auth: AuthState::new(verifier),
            backends,
            metrics,
        })
    }
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    ErrorKind::UpstreamFailure,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            ErrorKind::UpstreamFailure,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route(&metrics_path, get(crate::handlers::metrics))
        .merge(build_chat_router(&state))
        .with_state(state)
        .layer(SetResponseHeaderLayer::if_not_present(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(PropagateRequestIdLayer::new(REQUEST_ID_HEADER))
        .layer(SetRequestIdLayer::new(REQUEST_ID_HEADER, MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
}

/// Origin routes. Every request, including unknown paths, passes the origin
/// header injection and then the edge authorizer.
fn build_chat_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/ai", post(crate::handlers::chat_ai))
        .route("/langchain", post(crate::handlers::chat_langchain))
        .route("/chat", post(crate::handlers::chat))
        .fallback(crate::handlers::not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(from_fn_with_state(state.clone(), edge_authorizer))
        .layer(from_fn_with_state(state.clone(), inject_origin_headers))
}
