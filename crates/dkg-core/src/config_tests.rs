//! Config module tests

use std::time::Duration;

use crate::config::{Config, NetworkProfile};
use crate::gateway::BidRange;

#[test]
fn test_config_default() {
    let config = Config::default();

    // Network defaults
    assert_eq!(config.network.environment, "development");
    assert_eq!(config.network.blockchain, "hardhat1:31337");
    assert!(config.network.auth_token.is_none());
    assert_eq!(config.network.node_endpoint(), "http://localhost:8900");

    // Coordinator defaults
    assert_eq!(config.coordinator.default_epochs, 2);
    assert_eq!(config.coordinator.bid_range, BidRange::Low);
    assert!(config.coordinator.auto_raise_allowance);

    // Finalization defaults
    assert_eq!(config.finalization.min_replicas, 3);
    assert_eq!(config.finalization.deadline_secs, 300);

    assert!(config.validate().is_ok());
}

#[test]
fn test_profiles_fill_network_defaults() {
    let config = Config::default();
    assert_eq!(
        config.network.resolved_hub_contract().as_deref(),
        Some("0x5FbDB2315678afecb367f032d93F642f64180aa3")
    );
    assert_eq!(
        config.network.resolved_rpc_url().as_deref(),
        Some("http://localhost:8545")
    );

    let testnet = NetworkProfile::find("testnet", "base:84532").unwrap();
    assert_eq!(testnet.hub_contract, "0xCca0eA14540588A09c85cD6A6Fc53eA3A7010692");
    assert_eq!(NetworkProfile::for_environment("development").count(), 2);
    assert_eq!(NetworkProfile::for_environment("mainnet").count(), 0);
}

#[test]
fn test_overrides_win_over_profile() {
    let mut config = Config::default();
    config.set("network.rpc_url", "http://10.0.0.5:8545").unwrap();
    assert_eq!(
        config.network.resolved_rpc_url().as_deref(),
        Some("http://10.0.0.5:8545")
    );

    config.set("network.rpc_url", "").unwrap();
    assert_eq!(
        config.network.resolved_rpc_url().as_deref(),
        Some("http://localhost:8545")
    );
}

#[test]
fn test_unknown_blockchain_needs_explicit_contracts() {
    let mut config = Config::default();
    config.set("network.environment", "mainnet").unwrap();
    config.set("network.blockchain", "base:8453").unwrap();
    assert!(config.validate().is_err());

    config
        .set("network.hub_contract", "0x99aa571fd5e681c2d27ee08a7b7989db02541d13")
        .unwrap();
    config.set("network.rpc_url", "https://mainnet.base.org").unwrap();
    assert!(config.validate().is_ok());
}

#[test]
fn test_get_and_set_by_key() {
    let mut config = Config::default();

    config.set("coordinator.bid_range", "high").unwrap();
    assert_eq!(config.get("coordinator.bid_range").unwrap(), "high");

    config.set("coordinator.default_epochs", "5").unwrap();
    assert_eq!(config.coordinator.default_epochs, 5);

    config.set("network.node_port", "").unwrap();
    assert_eq!(config.get("network.node_port").unwrap(), "(none)");
    assert_eq!(config.network.node_endpoint(), "http://localhost");

    config
        .set("network.asset_contract", "0x5CAC41237127F94C2D21DAE0B14BFEFA99880630")
        .unwrap();
    assert_eq!(
        config.get("network.asset_contract").unwrap(),
        "0x5cac41237127f94c2d21dae0b14bfefa99880630"
    );
}

#[test]
fn test_set_rejects_bad_values() {
    let mut config = Config::default();

    assert!(config.set("network.environment", "staging").is_err());
    assert!(config.set("coordinator.bid_range", "all").is_err());
    assert!(config.set("coordinator.default_epochs", "0").is_err());
    assert!(config.set("coordinator.read_retries", "many").is_err());
    assert!(config.set("network.hub_contract", "0x1234").is_err());
    assert!(config.set("network.auth_token", "secret").is_err());
    assert!(config.set("no.such.key", "1").is_err());
    assert!(config.get("no.such.key").is_err());
}

#[test]
fn test_auth_token_is_never_stored() {
    let mut config = Config::default();
    config.network.auth_token = Some("secret".to_string());
    assert!(config.validate().is_err());
}

#[test]
fn test_list_covers_every_key() {
    let config = Config::default();
    let entries = config.list().unwrap();

    assert_eq!(entries.len(), 20);
    for (key, value) in &entries {
        assert_eq!(&config.get(key).unwrap(), value);
    }
}

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.set("network.environment", "testnet").unwrap();
    config.set("network.blockchain", "base:84532").unwrap();
    config.set("finalization.min_replicas", "5").unwrap();
    config.save_to(&path).unwrap();

    let loaded = Config::load_from(&path).unwrap();
    assert_eq!(loaded.network.environment, "testnet");
    assert_eq!(loaded.finalization.min_replicas, 5);
    assert_eq!(
        loaded.network.resolved_rpc_url().as_deref(),
        Some("https://sepolia.base.org")
    );
}

#[test]
fn test_missing_file_loads_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
    assert_eq!(config.network.environment, "development");
}

#[test]
fn test_invalid_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "network = 5").unwrap();

    let error = Config::load_from(&path).unwrap_err();
    assert!(error.to_string().contains("Failed to parse config file"));
}

#[test]
fn test_runtime_settings() {
    let mut config = Config::default();
    config.set("coordinator.write_timeout_secs", "10").unwrap();
    config.set("coordinator.read_retries", "4").unwrap();
    config.set("finalization.poll_initial_ms", "250").unwrap();
    config.set("finalization.poll_max_ms", "2000").unwrap();

    let coordinator = config.coordinator_config();
    assert_eq!(coordinator.write_timeout, Duration::from_secs(10));
    assert_eq!(coordinator.read_retry.max_attempts, 4);

    let finalization = config.finalization_config();
    assert_eq!(finalization.backoff.initial, Duration::from_millis(250));
    assert_eq!(finalization.backoff.max, Duration::from_millis(2000));
    assert_eq!(finalization.deadline, Duration::from_secs(300));
}

#[test]
fn test_http_node_gateway_needs_asset_contract() {
    let mut config = Config::default();
    assert!(config.http_node_gateway().is_err());

    config
        .set("network.asset_contract", "0x5cac41237127f94c2d21dae0b14bfefa99880630")
        .unwrap();
    let gateway = config.http_node_gateway().unwrap();
    assert_eq!(gateway.base_url(), "http://localhost:8900");
}
