use std::env;
use std::fs;
use tempfile::TempDir;

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
profiles:
  production:
    access_key: AKIATEST
    secret_key: secrettest
    region: us-west-2
  fips:
    access_key: AKIAFIPS
    secret_key: secretfips
    security_token: session-token
    end_point: s3-fips.us-gov-west-1.amazonaws.com

transfer:
  chunk_size: 16777216
  max_retries: 5
  max_token_refreshes: 2
  concurrency: 8
  use_accelerate_endpoint: true

default_profile: production
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = stagehaul::config::load_from_yaml(&config_path).unwrap();

    assert_eq!(config.profiles.len(), 2);

    let profile = config.profiles.get("production").unwrap();
    assert_eq!(profile.access_key, "AKIATEST");
    assert_eq!(profile.secret_key, "secrettest");
    assert_eq!(profile.region, "us-west-2");
    assert_eq!(profile.security_token, None);

    let fips = config.profiles.get("fips").unwrap();
    assert_eq!(fips.security_token.as_deref(), Some("session-token"));
    assert_eq!(
        fips.end_point.as_deref(),
        Some("s3-fips.us-gov-west-1.amazonaws.com")
    );

    assert_eq!(config.transfer.chunk_size, 16 * 1024 * 1024);
    assert_eq!(config.transfer.max_retries, 5);
    assert_eq!(config.transfer.max_token_refreshes, 2);
    assert_eq!(config.transfer.concurrency, 8);
    assert!(config.transfer.use_accelerate_endpoint);

    assert_eq!(config.default_profile, Some("production".to_string()));
}

/// Test loading configuration from environment variables
#[test]
fn test_load_env_config() {
    // Save original env vars
    let orig_key = env::var("AWS_ACCESS_KEY_ID").ok();
    let orig_secret = env::var("AWS_SECRET_ACCESS_KEY").ok();
    let orig_token = env::var("AWS_SESSION_TOKEN").ok();
    let orig_region = env::var("AWS_REGION").ok();
    let orig_endpoint = env::var("STAGEHAUL_ENDPOINT").ok();
    let orig_chunk = env::var("STAGEHAUL_CHUNK_SIZE").ok();
    let orig_concurrency = env::var("STAGEHAUL_CONCURRENCY").ok();

    env::set_var("AWS_ACCESS_KEY_ID", "test_key");
    env::set_var("AWS_SECRET_ACCESS_KEY", "test_secret");
    env::set_var("AWS_SESSION_TOKEN", "test_token");
    env::set_var("AWS_REGION", "eu-west-1");
    env::set_var("STAGEHAUL_ENDPOINT", "s3.internal.example.com");
    env::set_var("STAGEHAUL_CHUNK_SIZE", "10485760");
    env::set_var("STAGEHAUL_CONCURRENCY", "16");

    let config = stagehaul::config::load_from_env().unwrap();

    let profile = config.get_profile(None).unwrap();
    assert_eq!(profile.access_key, "test_key");
    assert_eq!(profile.secret_key, "test_secret");
    assert_eq!(profile.security_token.as_deref(), Some("test_token"));
    assert_eq!(profile.region, "eu-west-1");
    assert_eq!(profile.end_point.as_deref(), Some("s3.internal.example.com"));

    assert_eq!(config.transfer.chunk_size, 10 * 1024 * 1024);
    assert_eq!(config.transfer.concurrency, 16);

    // Restore original env vars
    cleanup_env("AWS_ACCESS_KEY_ID", orig_key);
    cleanup_env("AWS_SECRET_ACCESS_KEY", orig_secret);
    cleanup_env("AWS_SESSION_TOKEN", orig_token);
    cleanup_env("AWS_REGION", orig_region);
    cleanup_env("STAGEHAUL_ENDPOINT", orig_endpoint);
    cleanup_env("STAGEHAUL_CHUNK_SIZE", orig_chunk);
    cleanup_env("STAGEHAUL_CONCURRENCY", orig_concurrency);
}

/// Test default values
#[test]
fn test_default_values() {
    let yaml = r#"
profiles:
  minimal:
    access_key: key
    secret_key: secret
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = stagehaul::config::load_from_yaml(&config_path).unwrap();

    let profile = config.profiles.get("minimal").unwrap();
    // Should default to us-east-1
    assert_eq!(profile.region, "us-east-1");
    assert_eq!(profile.end_point, None);

    // Should use default transfer settings
    assert_eq!(config.transfer.chunk_size, 8 * 1024 * 1024);
    assert_eq!(config.transfer.max_retries, 4);
    assert_eq!(config.transfer.max_token_refreshes, 3);
    assert_eq!(config.transfer.concurrency, 4);
    assert_eq!(config.transfer.request_timeout, 300);
    assert!(!config.transfer.use_accelerate_endpoint);
    assert!(!config.transfer.use_regional_url);
    assert!(!config.transfer.insecure_tls);
}

/// Test get_profile method
#[test]
fn test_get_profile() {
    let yaml = r#"
profiles:
  prod:
    access_key: prod_key
    secret_key: prod_secret
  dev:
    access_key: dev_key
    secret_key: dev_secret

default_profile: prod
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = stagehaul::config::load_from_yaml(&config_path).unwrap();

    // Get specific profile
    let dev_profile = config.get_profile(Some("dev")).unwrap();
    assert_eq!(dev_profile.access_key, "dev_key");

    // Get default profile (None specified, should use default_profile)
    let default_profile = config.get_profile(None).unwrap();
    assert_eq!(default_profile.access_key, "prod_key");

    // Get non-existent profile
    assert!(config.get_profile(Some("nonexistent")).is_none());
}

/// Requesting a missing profile by name fails loudly
#[test]
fn test_load_config_unknown_profile() {
    let yaml = r#"
profiles:
  only:
    access_key: key
    secret_key: secret
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let result = stagehaul::config::load_config(
        Some(config_path.to_string_lossy().as_ref()),
        Some("missing"),
    );
    assert!(result.is_err());
}

/// Helper function to cleanup environment variables
fn cleanup_env(key: &str, orig_val: Option<String>) {
    match orig_val {
        Some(val) => env::set_var(key, val),
        None => env::remove_var(key),
    }
}
