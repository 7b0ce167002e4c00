use chat_relay::app::RuntimeConfig;
use chat_relay::config::ProviderAuthType;

#[test]
fn runtime_defaults() {
    let runtime = RuntimeConfig::default();
    assert_eq!(runtime.listen, "0.0.0.0:8080");
    assert_eq!(runtime.metrics_path, "/metrics");
    assert!(runtime.origin.user_pool_id.is_none());
    assert_eq!(
        runtime.identity.issuer_base,
        "https://cognito-idp.{region}.amazonaws.com"
    );
    assert_eq!(runtime.identity.jwks_ttl_secs, 300);
    assert_eq!(runtime.identity.jwks_refetch_cooldown_secs, 10);
    assert_eq!(runtime.upstream.base_url, "https://api.anthropic.com");
    assert_eq!(runtime.upstream.auth, ProviderAuthType::Header);
    assert_eq!(runtime.upstream.max_tokens, 4096);
    assert_eq!(runtime.stream_buffer, 16);
}

#[tokio::test]
async fn state_loads_without_contacting_collaborators() {
    let mut runtime = RuntimeConfig::default();
    runtime.upstream.base_url = "http://127.0.0.1:9".to_string();
    runtime.identity.issuer_base = "http://127.0.0.1:9".to_string();
    let state = chat_relay::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
    assert_eq!(state.runtime.stream_buffer, 16);
    let _router = chat_relay::app::build_app(state);
}
