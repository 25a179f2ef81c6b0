//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::finalization::{Backoff, FinalizationConfig};
use crate::gateway::http::HttpNodeGateway;
use crate::gateway::{BidRange, ReadRetryPolicy};
use crate::ual::Address;

/// Known deployment of the protocol contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkProfile {
    pub environment: &'static str,
    pub blockchain: &'static str,
    pub hub_contract: &'static str,
    pub rpc_url: &'static str,
}

const PROFILES: &[NetworkProfile] = &[
    NetworkProfile {
        environment: "development",
        blockchain: "hardhat1:31337",
        hub_contract: "0x5FbDB2315678afecb367f032d93F642f64180aa3",
        rpc_url: "http://localhost:8545",
    },
    NetworkProfile {
        environment: "development",
        blockchain: "hardhat2:31337",
        hub_contract: "0x5FbDB2315678afecb367f032d93F642f64180aa3",
        rpc_url: "http://localhost:9545",
    },
    NetworkProfile {
        environment: "devnet",
        blockchain: "base:84532",
        hub_contract: "0xaA849CAC4FA86f6b7484503f3c7a314772AED6d4",
        rpc_url: "https://sepolia.base.org",
    },
    NetworkProfile {
        environment: "testnet",
        blockchain: "base:84532",
        hub_contract: "0xCca0eA14540588A09c85cD6A6Fc53eA3A7010692",
        rpc_url: "https://sepolia.base.org",
    },
];

pub const ENVIRONMENTS: [&str; 4] = ["development", "devnet", "testnet", "mainnet"];

impl NetworkProfile {
    /// Profile for a blockchain in an environment
    pub fn find(environment: &str, blockchain: &str) -> Option<&'static NetworkProfile> {
        PROFILES
            .iter()
            .find(|p| p.environment == environment && p.blockchain == blockchain)
    }

    /// All profiles of an environment
    pub fn for_environment(environment: &str) -> impl Iterator<Item = &'static NetworkProfile> + '_ {
        PROFILES.iter().filter(move |p| p.environment == environment)
    }
}

/// DKG client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub coordinator: CoordinatorSettings,
    pub finalization: FinalizationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub environment: String,
    /// `name` or `name:chain_id`
    pub blockchain: String,
    /// Overrides the profile's RPC URL
    pub rpc_url: Option<String>,
    /// Overrides the profile's hub contract
    pub hub_contract: Option<String>,
    /// Contract whose token ids appear in UALs
    pub asset_contract: Option<String>,
    pub node_url: String,
    pub node_port: Option<u16>,
    #[serde(skip)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    pub default_epochs: u64,
    pub bid_range: BidRange,
    pub auto_raise_allowance: bool,
    pub write_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    pub read_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationSettings {
    pub required_confirmations: u64,
    pub min_replicas: u32,
    pub deadline_secs: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub backoff_factor: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                environment: "development".to_string(),
                blockchain: "hardhat1:31337".to_string(),
                rpc_url: None,
                hub_contract: None,
                asset_contract: None,
                node_url: "http://localhost".to_string(),
                node_port: Some(8900),
                auth_token: None,
            },
            coordinator: CoordinatorSettings {
                default_epochs: 2,
                bid_range: BidRange::Low,
                auto_raise_allowance: true,
                write_timeout_secs: 60,
                lock_timeout_secs: 5,
                read_retries: 3,
            },
            finalization: FinalizationSettings {
                required_confirmations: 1,
                min_replicas: 3,
                deadline_secs: 300,
                poll_initial_ms: 1000,
                poll_max_ms: 16_000,
                backoff_factor: 2,
            },
        }
    }
}

impl NetworkConfig {
    /// Node auth token, read from the environment only
    pub fn resolved_auth_token(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;
        Ok(env::var("DKG_NODE_AUTH_TOKEN").ok())
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.auth_token.is_some() {
            return Err(anyhow!(
                "Node auth tokens must be provided via the DKG_NODE_AUTH_TOKEN environment variable, not stored in configuration"
            ));
        }
        Ok(())
    }

    pub fn profile(&self) -> Option<&'static NetworkProfile> {
        NetworkProfile::find(&self.environment, &self.blockchain)
    }

    /// Configured RPC URL, or the profile's
    pub fn resolved_rpc_url(&self) -> Option<String> {
        self.rpc_url
            .clone()
            .or_else(|| self.profile().map(|p| p.rpc_url.to_string()))
    }

    /// Configured hub contract, or the profile's
    pub fn resolved_hub_contract(&self) -> Option<String> {
        self.hub_contract
            .clone()
            .or_else(|| self.profile().map(|p| p.hub_contract.to_string()))
    }

    /// Full node endpoint including the port
    pub fn node_endpoint(&self) -> String {
        let url = self.node_url.trim_end_matches('/');
        match self.node_port {
            Some(port) => format!("{}:{}", url, port),
            None => url.to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("DKG_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("dkg")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let network = &self.network;
        network.enforce_env_only()?;

        if !ENVIRONMENTS.contains(&network.environment.as_str()) {
            return Err(anyhow!(
                "Unknown environment: {}. Valid options: {}",
                network.environment,
                ENVIRONMENTS.join(", ")
            ));
        }
        if network.profile().is_none()
            && (network.hub_contract.is_none() || network.rpc_url.is_none())
        {
            return Err(anyhow!(
                "No built-in profile for blockchain {} in {}; set network.hub_contract and network.rpc_url",
                network.blockchain,
                network.environment
            ));
        }
        for (key, value) in [
            ("network.hub_contract", &network.hub_contract),
            ("network.asset_contract", &network.asset_contract),
        ] {
            if let Some(value) = value {
                Address::parse(value).map_err(|e| anyhow!("Invalid {}: {}", key, e))?;
            }
        }
        if !network.node_url.starts_with("http://") && !network.node_url.starts_with("https://") {
            return Err(anyhow!(
                "network.node_url must start with http:// or https://, got {}",
                network.node_url
            ));
        }

        if self.coordinator.default_epochs == 0 {
            return Err(anyhow!("coordinator.default_epochs must be at least 1"));
        }
        if self.coordinator.read_retries == 0 {
            return Err(anyhow!("coordinator.read_retries must be at least 1"));
        }

        let finalization = &self.finalization;
        if finalization.deadline_secs == 0 {
            return Err(anyhow!("finalization.deadline_secs must be positive"));
        }
        if finalization.poll_initial_ms == 0 || finalization.poll_initial_ms > finalization.poll_max_ms {
            return Err(anyhow!(
                "finalization.poll_initial_ms must be positive and at most poll_max_ms"
            ));
        }
        if finalization.backoff_factor == 0 {
            return Err(anyhow!("finalization.backoff_factor must be at least 1"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "(profile default)".to_string());
        match key {
            // Network settings
            "network.environment" => Ok(self.network.environment.clone()),
            "network.blockchain" => Ok(self.network.blockchain.clone()),
            "network.rpc_url" => Ok(optional(&self.network.rpc_url)),
            "network.hub_contract" => Ok(optional(&self.network.hub_contract)),
            "network.asset_contract" => Ok(self
                .network
                .asset_contract
                .clone()
                .unwrap_or_else(|| "(not set)".to_string())),
            "network.node_url" => Ok(self.network.node_url.clone()),
            "network.node_port" => Ok(self
                .network
                .node_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "(none)".to_string())),
            "network.auth_token" => match self.network.resolved_auth_token()? {
                Some(_) => Ok("***".to_string()),
                None => Ok("(not set - use DKG_NODE_AUTH_TOKEN env var)".to_string()),
            },

            // Coordinator settings
            "coordinator.default_epochs" => Ok(self.coordinator.default_epochs.to_string()),
            "coordinator.bid_range" => Ok(self.coordinator.bid_range.to_string()),
            "coordinator.auto_raise_allowance" => Ok(self.coordinator.auto_raise_allowance.to_string()),
            "coordinator.write_timeout_secs" => Ok(self.coordinator.write_timeout_secs.to_string()),
            "coordinator.lock_timeout_secs" => Ok(self.coordinator.lock_timeout_secs.to_string()),
            "coordinator.read_retries" => Ok(self.coordinator.read_retries.to_string()),

            // Finalization settings
            "finalization.required_confirmations" => {
                Ok(self.finalization.required_confirmations.to_string())
            }
            "finalization.min_replicas" => Ok(self.finalization.min_replicas.to_string()),
            "finalization.deadline_secs" => Ok(self.finalization.deadline_secs.to_string()),
            "finalization.poll_initial_ms" => Ok(self.finalization.poll_initial_ms.to_string()),
            "finalization.poll_max_ms" => Ok(self.finalization.poll_max_ms.to_string()),
            "finalization.backoff_factor" => Ok(self.finalization.backoff_factor.to_string()),

            _ => Err(anyhow!("Unknown configuration key: {}", key)),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let optional = |value: &str| {
            let value = value.trim();
            if value.is_empty() { None } else { Some(value.to_string()) }
        };
        match key {
            // Network settings
            "network.environment" => {
                if !ENVIRONMENTS.contains(&value) {
                    return Err(anyhow!(
                        "Invalid environment: {}. Valid options: {}",
                        value,
                        ENVIRONMENTS.join(", ")
                    ));
                }
                self.network.environment = value.to_string();
            }
            "network.blockchain" => {
                self.network.blockchain = value.to_string();
            }
            "network.rpc_url" => {
                self.network.rpc_url = optional(value);
            }
            "network.hub_contract" | "network.asset_contract" => {
                let parsed = match optional(value) {
                    Some(v) => Some(
                        Address::parse(&v)
                            .map_err(|e| anyhow!("Invalid {}: {}", key, e))?
                            .to_string(),
                    ),
                    None => None,
                };
                if key == "network.hub_contract" {
                    self.network.hub_contract = parsed;
                } else {
                    self.network.asset_contract = parsed;
                }
            }
            "network.node_url" => {
                self.network.node_url = value.trim_end_matches('/').to_string();
            }
            "network.node_port" => {
                self.network.node_port = match optional(value) {
                    Some(v) => Some(
                        v.parse()
                            .with_context(|| format!("Invalid node_port value: {}", value))?,
                    ),
                    None => None,
                };
            }

            // Coordinator settings
            "coordinator.default_epochs" => {
                let epochs: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid default_epochs value: {}", value))?;
                if epochs == 0 {
                    return Err(anyhow!("Default epochs must be at least 1"));
                }
                self.coordinator.default_epochs = epochs;
            }
            "coordinator.bid_range" => {
                self.coordinator.bid_range = BidRange::from_str(value).ok_or_else(|| {
                    anyhow!("Invalid bid range: {}. Valid options: low, medium, high", value)
                })?;
            }
            "coordinator.auto_raise_allowance" => {
                self.coordinator.auto_raise_allowance = value
                    .parse()
                    .with_context(|| format!("Invalid auto_raise_allowance value: {}", value))?;
            }
            "coordinator.write_timeout_secs" => {
                self.coordinator.write_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid write_timeout_secs value: {}", value))?;
            }
            "coordinator.lock_timeout_secs" => {
                self.coordinator.lock_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid lock_timeout_secs value: {}", value))?;
            }
            "coordinator.read_retries" => {
                let retries: u32 = value
                    .parse()
                    .with_context(|| format!("Invalid read_retries value: {}", value))?;
                if retries == 0 {
                    return Err(anyhow!("Read retries must be at least 1"));
                }
                self.coordinator.read_retries = retries;
            }

            // Finalization settings
            "finalization.required_confirmations" => {
                self.finalization.required_confirmations = value
                    .parse()
                    .with_context(|| format!("Invalid required_confirmations value: {}", value))?;
            }
            "finalization.min_replicas" => {
                self.finalization.min_replicas = value
                    .parse()
                    .with_context(|| format!("Invalid min_replicas value: {}", value))?;
            }
            "finalization.deadline_secs" => {
                self.finalization.deadline_secs = value
                    .parse()
                    .with_context(|| format!("Invalid deadline_secs value: {}", value))?;
            }
            "finalization.poll_initial_ms" => {
                self.finalization.poll_initial_ms = value
                    .parse()
                    .with_context(|| format!("Invalid poll_initial_ms value: {}", value))?;
            }
            "finalization.poll_max_ms" => {
                self.finalization.poll_max_ms = value
                    .parse()
                    .with_context(|| format!("Invalid poll_max_ms value: {}", value))?;
            }
            "finalization.backoff_factor" => {
                self.finalization.backoff_factor = value
                    .parse()
                    .with_context(|| format!("Invalid backoff_factor value: {}", value))?;
            }

            "network.auth_token" => {
                return Err(anyhow!(
                    "Auth tokens cannot be stored in configuration. \
                     Set the DKG_NODE_AUTH_TOKEN environment variable instead."
                ));
            }

            _ => {
                return Err(anyhow!("Unknown configuration key: {}", key));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = vec![
            "network.environment",
            "network.blockchain",
            "network.rpc_url",
            "network.hub_contract",
            "network.asset_contract",
            "network.node_url",
            "network.node_port",
            "network.auth_token",
            "coordinator.default_epochs",
            "coordinator.bid_range",
            "coordinator.auto_raise_allowance",
            "coordinator.write_timeout_secs",
            "coordinator.lock_timeout_secs",
            "coordinator.read_retries",
            "finalization.required_confirmations",
            "finalization.min_replicas",
            "finalization.deadline_secs",
            "finalization.poll_initial_ms",
            "finalization.poll_max_ms",
            "finalization.backoff_factor",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }

    // ========== Runtime settings ==========

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let settings = &self.coordinator;
        CoordinatorConfig {
            default_epochs: settings.default_epochs,
            default_bid_range: settings.bid_range,
            auto_raise_allowance: settings.auto_raise_allowance,
            write_timeout: Duration::from_secs(settings.write_timeout_secs),
            lock_timeout: Duration::from_secs(settings.lock_timeout_secs),
            read_retry: ReadRetryPolicy {
                max_attempts: settings.read_retries,
                ..ReadRetryPolicy::default()
            },
        }
    }

    pub fn finalization_config(&self) -> FinalizationConfig {
        let settings = &self.finalization;
        FinalizationConfig {
            required_confirmations: settings.required_confirmations,
            min_replicas: settings.min_replicas,
            deadline: Duration::from_secs(settings.deadline_secs),
            backoff: Backoff::new(
                Duration::from_millis(settings.poll_initial_ms),
                Duration::from_millis(settings.poll_max_ms),
                settings.backoff_factor,
            ),
            ..FinalizationConfig::default()
        }
    }

    /// HTTP node gateway for the configured node
    pub fn http_node_gateway(&self) -> anyhow::Result<HttpNodeGateway> {
        let contract = self
            .network
            .asset_contract
            .as_deref()
            .ok_or_else(|| anyhow!("network.asset_contract must be set to talk to a node"))?;
        let contract = Address::parse(contract).map_err(|e| anyhow!("Invalid network.asset_contract: {}", e))?;

        let mut builder = HttpNodeGateway::builder()
            .base_url(self.network.node_endpoint())
            .blockchain(self.network.blockchain.clone())
            .contract(contract)
            .timeout(Duration::from_secs(self.coordinator.write_timeout_secs));
        if let Some(token) = self.network.resolved_auth_token()? {
            builder = builder.auth_token(token);
        }
        builder
            .build()
            .map_err(|e| anyhow!("Failed to build node gateway: {}", e))
    }
}
