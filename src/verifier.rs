use crate::config::IdentityConfig;
use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Credentials gathered for one request. Never cached.
#[derive(Clone)]
pub struct AuthorizationContext {
    pub pool_id: String,
    pub client_id: String,
    pub token: String,
}

impl std::fmt::Debug for AuthorizationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationContext")
            .field("pool_id", &self.pool_id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("invalid user pool id: {0}")]
    InvalidPool(String),
    #[error("key set unavailable: {0}")]
    KeySet(String),
    #[error("no key matches kid {0}")]
    UnknownKey(String),
    #[error("algorithm not allowed: {0}")]
    Algorithm(String),
    #[error("claim check failed: {0}")]
    Claims(String),
    #[error("jwt rejected: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl VerifyError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::InvalidPool(_) => "invalid_pool",
            Self::KeySet(_) => "key_set",
            Self::UnknownKey(_) => "unknown_key",
            Self::Algorithm(_) => "algorithm",
            Self::Claims(_) => "claims",
            Self::Jwt(_) => "jwt",
        }
    }
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, ctx: &AuthorizationContext) -> Result<VerifiedToken, VerifyError>;
}

#[derive(Clone, Debug, Deserialize)]
pub struct Jwk {
    pub kid: String,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub kty: String,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    #[serde(default)]
    pub k: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Clone)]
struct CachedKeySet {
    keys: HashMap<String, Jwk>,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains(&self, client_id: &str) -> bool {
        match self {
            Self::One(aud) => aud == client_id,
            Self::Many(auds) => auds.iter().any(|aud| aud == client_id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    token_use: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    aud: Option<Audience>,
}

/// Verifies user-pool access tokens against the pool's published key set.
///
/// Key sets are cached per issuer. The cache is the only state shared between
/// requests; refreshes are idempotent and a concurrent double fetch simply
/// stores the same set twice. Refetches forced by an unknown `kid` are rate
/// limited per issuer.
pub struct JwksVerifier {
    http: reqwest::Client,
    config: IdentityConfig,
    cache: Arc<DashMap<String, CachedKeySet>>,
    forced_refetches: DashMap<String, Instant>,
}

impl JwksVerifier {
    pub fn new(http: reqwest::Client, config: IdentityConfig) -> Self {
        Self {
            http,
            config,
            cache: Arc::new(DashMap::new()),
            forced_refetches: DashMap::new(),
        }
    }

    pub fn issuer_for_pool(&self, pool_id: &str) -> Result<String, VerifyError> {
        let base = self.config.issuer_base.trim_end_matches('/');
        let base = if base.contains("{region}") {
            let region = pool_id
                .split_once('_')
                .map(|(region, _)| region)
                .filter(|region| !region.is_empty())
                .ok_or_else(|| VerifyError::InvalidPool(pool_id.to_string()))?;
            base.replace("{region}", region)
        } else {
            base.to_string()
        };
        Ok(format!("{base}/{pool_id}"))
    }

    async fn fetch_key_set(&self, issuer: &str) -> Result<CachedKeySet, VerifyError> {
        let url = format!("{issuer}/.well-known/jwks.json");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| VerifyError::KeySet(format!("fetch {url}: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(VerifyError::KeySet(format!("fetch {url}: status {status}")));
        }
        let ttl = resp
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or_else(|| self.config.jwks_ttl());
        let set: JwkSet = resp
            .json()
            .await
            .map_err(|err| VerifyError::KeySet(format!("decode {url}: {err}")))?;
        tracing::debug!(issuer, keys = set.keys.len(), ttl_secs = ttl.as_secs(), "key set fetched");
        let cached = CachedKeySet {
            keys: set.keys.into_iter().map(|k| (k.kid.clone(), k)).collect(),
            expires_at: Instant::now() + ttl,
        };
        self.cache.insert(issuer.to_string(), cached.clone());
        Ok(cached)
    }

    async fn key_for(&self, issuer: &str, kid: &str) -> Result<Jwk, VerifyError> {
        // Clone out of the map so no shard guard lives across the fetch below.
        let cached = self
            .cache
            .get(issuer)
            .map(|entry| entry.value().clone())
            .filter(|set| set.expires_at > Instant::now());
        let fresh_fetch = cached.is_none();
        let set = match cached {
            Some(set) => set,
            None => self.fetch_key_set(issuer).await?,
        };
        if let Some(jwk) = set.keys.get(kid) {
            return Ok(jwk.clone());
        }
        if fresh_fetch || !self.claim_forced_refetch(issuer) {
            return Err(VerifyError::UnknownKey(kid.to_string()));
        }
        // The provider may have rotated keys since the set was cached.
        let set = self.fetch_key_set(issuer).await?;
        set.keys
            .get(kid)
            .cloned()
            .ok_or_else(|| VerifyError::UnknownKey(kid.to_string()))
    }

    /// True when no forced refetch for `issuer` happened within the cooldown;
    /// the caller then owns the refetch.
    fn claim_forced_refetch(&self, issuer: &str) -> bool {
        let now = Instant::now();
        let cooldown = self.config.jwks_refetch_cooldown();
        match self.forced_refetches.entry(issuer.to_string()) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < cooldown {
                    tracing::debug!(issuer, "unknown kid within refetch cooldown");
                    return false;
                }
                last.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    fn select_algorithm(&self, header_alg: Algorithm, jwk: &Jwk) -> Result<Algorithm, VerifyError> {
        if !self.config.algorithms.contains(&header_alg) {
            return Err(VerifyError::Algorithm(format!("{header_alg:?}")));
        }
        if let Some(alg) = jwk.alg.as_deref() {
            let declared = alg
                .parse::<Algorithm>()
                .map_err(|_| VerifyError::Algorithm(alg.to_string()))?;
            if declared != header_alg {
                return Err(VerifyError::Algorithm(format!(
                    "token uses {header_alg:?}, key declares {alg}"
                )));
            }
        }
        Ok(header_alg)
    }

    fn build_validation(&self, alg: Algorithm, issuer: &str) -> Validation {
        let mut validation = Validation::new(alg);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[issuer]);
        // Access tokens carry `client_id` instead of `aud`; checked by hand.
        validation.validate_aud = false;
        validation
    }
}

pub fn decoding_key(jwk: &Jwk) -> Result<DecodingKey, VerifyError> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk
                .n
                .as_deref()
                .ok_or_else(|| VerifyError::KeySet("rsa modulus missing".to_string()))?;
            let e = jwk
                .e
                .as_deref()
                .ok_or_else(|| VerifyError::KeySet("rsa exponent missing".to_string()))?;
            DecodingKey::from_rsa_components(n, e)
                .map_err(|err| VerifyError::KeySet(format!("rsa key: {err}")))
        }
        "oct" => {
            let secret = jwk
                .k
                .as_deref()
                .ok_or_else(|| VerifyError::KeySet("secret missing".to_string()))?;
            let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(secret.trim_end_matches('='))
                .map_err(|err| VerifyError::KeySet(format!("secret decode: {err}")))?;
            Ok(DecodingKey::from_secret(&bytes))
        }
        other => Err(VerifyError::KeySet(format!("unsupported key type {other}"))),
    }
}

/// Extracts `max-age` seconds from a Cache-Control header value.
pub fn parse_max_age(value: &str) -> Option<Duration> {
    value.split(',').find_map(|directive| {
        let (name, secs) = directive.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        secs.trim().trim_matches('"').parse::<u64>().ok().map(Duration::from_secs)
    })
}

#[async_trait]
impl CredentialVerifier for JwksVerifier {
    async fn verify(&self, ctx: &AuthorizationContext) -> Result<VerifiedToken, VerifyError> {
        let header = jsonwebtoken::decode_header(&ctx.token)
            .map_err(|err| VerifyError::Malformed(err.to_string()))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| VerifyError::Malformed("token missing kid".to_string()))?;
        let issuer = self.issuer_for_pool(&ctx.pool_id)?;
        let jwk = self.key_for(&issuer, kid).await?;
        let alg = self.select_algorithm(header.alg, &jwk)?;
        let key = decoding_key(&jwk)?;
        let validation = self.build_validation(alg, &issuer);

        let data = jsonwebtoken::decode::<AccessClaims>(&ctx.token, &key, &validation)?;
        let claims = data.claims;

        if claims.token_use.as_deref() != Some("access") {
            return Err(VerifyError::Claims(format!(
                "token_use is {:?}, expected access",
                claims.token_use
            )));
        }
        let client_matches = claims.client_id.as_deref() == Some(ctx.client_id.as_str())
            || claims
                .aud
                .as_ref()
                .is_some_and(|aud| aud.contains(&ctx.client_id));
        if !client_matches {
            return Err(VerifyError::Claims("client id mismatch".to_string()));
        }

        Ok(VerifiedToken {
            subject: claims.sub,
        })
    }
}
