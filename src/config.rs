use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Values the routing layer attaches to every request bound for an origin.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OriginConfig {
    #[serde(default)]
    pub user_pool_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Issuer prefix; `{region}` is replaced with the pool id's region.
    #[serde(default = "default_issuer_base")]
    pub issuer_base: String,
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<jsonwebtoken::Algorithm>,
    #[serde(default = "default_jwks_ttl_secs")]
    pub jwks_ttl_secs: u64,
    /// Minimum gap between key-set refetches forced by an unknown `kid`.
    #[serde(default = "default_jwks_refetch_cooldown_secs")]
    pub jwks_refetch_cooldown_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            issuer_base: default_issuer_base(),
            algorithms: default_algorithms(),
            jwks_ttl_secs: default_jwks_ttl_secs(),
            jwks_refetch_cooldown_secs: default_jwks_refetch_cooldown_secs(),
        }
    }
}

impl IdentityConfig {
    pub fn jwks_ttl(&self) -> Duration {
        Duration::from_secs(self.jwks_ttl_secs)
    }

    pub fn jwks_refetch_cooldown(&self) -> Duration {
        Duration::from_secs(self.jwks_refetch_cooldown_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderAuthType {
    Bearer,
    Header,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_auth_type")]
    pub auth: ProviderAuthType,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            api_key: None,
            auth: default_auth_type(),
            timeout_ms: default_timeout_ms(),
            max_tokens: default_max_tokens(),
        }
    }
}

pub fn default_issuer_base() -> String {
    "https://cognito-idp.{region}.amazonaws.com".to_string()
}

fn default_algorithms() -> Vec<jsonwebtoken::Algorithm> {
    vec![jsonwebtoken::Algorithm::RS256]
}

fn default_jwks_ttl_secs() -> u64 {
    300
}

fn default_jwks_refetch_cooldown_secs() -> u64 {
    10
}

fn default_upstream_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_auth_type() -> ProviderAuthType {
    ProviderAuthType::Header
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_tokens() -> u32 {
    4096
}

pub fn default_stream_buffer() -> usize {
    16
}

/// Parses a comma separated algorithm list, skipping names jsonwebtoken does
/// not know. An empty result falls back to the default list.
pub fn parse_algorithms(raw: &str) -> Vec<jsonwebtoken::Algorithm> {
    let parsed: Vec<jsonwebtoken::Algorithm> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<jsonwebtoken::Algorithm>() {
            Ok(alg) => Some(alg),
            Err(_) => {
                tracing::warn!(algorithm = s, "ignoring unknown jwt algorithm");
                None
            }
        })
        .collect();
    if parsed.is_empty() {
        default_algorithms()
    } else {
        parsed
    }
}

pub fn parse_auth_type(raw: &str) -> ProviderAuthType {
    match raw.trim() {
        "bearer" => ProviderAuthType::Bearer,
        _ => ProviderAuthType::Header,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::Algorithm;

    #[test]
    fn algorithm_list_skips_unknown_names() {
        assert_eq!(
            parse_algorithms("RS256, HS256,nope"),
            vec![Algorithm::RS256, Algorithm::HS256]
        );
        assert_eq!(parse_algorithms(" , "), vec![Algorithm::RS256]);
    }

    #[test]
    fn upstream_defaults() {
        let cfg = UpstreamConfig::default();
        assert_eq!(cfg.auth, ProviderAuthType::Header);
        assert_eq!(cfg.timeout_ms, 60_000);
        assert!(cfg.api_key.is_none());
    }
}
