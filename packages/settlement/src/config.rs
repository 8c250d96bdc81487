use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::vaults::{VaultConfig, VaultRegistry};

/// Main configuration for the settlement service
#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreBackend,
    pub database: DatabaseConfig,
    pub xrpl: XrplConfig,
    pub evm: EvmConfig,
    pub attestation: AttestationConfig,
    pub bridge: BridgeConfig,
    pub api: ApiConfig,
    pub vaults: Vec<VaultConfig>,
}

/// Which `Store` implementation backs the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// In-process store for local dry runs; state is lost on restart
    Memory,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// XRPL configuration
#[derive(Debug, Clone)]
pub struct XrplConfig {
    pub rpc_url: String,
    /// Additional JSON-RPC endpoints tried in order when the primary fails
    pub rpc_fallback_urls: Vec<String>,
    pub network: String,
    pub confirm_attempts: u32,
    pub confirm_interval_ms: u64,
}

impl XrplConfig {
    pub fn all_rpc_urls(&self) -> Vec<String> {
        let mut urls = vec![self.rpc_url.clone()];
        urls.extend(self.rpc_fallback_urls.iter().cloned());
        urls
    }

    pub fn confirm_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_interval_ms)
    }
}

/// Execution-chain configuration
#[derive(Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub private_key: String,
    pub asset_manager_address: String,
    pub fdc_hub_address: String,
    pub fdc_fee_config_address: String,
    pub fxrp_address: String,
    /// Agents charging more than this are never selected
    pub max_minting_fee_bps: u32,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("private_key", &"<redacted>")
            .field("asset_manager_address", &self.asset_manager_address)
            .field("fdc_hub_address", &self.fdc_hub_address)
            .field("fdc_fee_config_address", &self.fdc_fee_config_address)
            .field("fxrp_address", &self.fxrp_address)
            .field("max_minting_fee_bps", &self.max_minting_fee_bps)
            .finish()
    }
}

/// Flare Data Connector configuration
#[derive(Clone)]
pub struct AttestationConfig {
    pub verifier_url: String,
    pub verifier_api_key: String,
    pub da_layer_url: String,
    /// `testXRP` on testnets, `XRP` on mainnet
    pub source_id: String,
    pub first_round_start_ts: u64,
    pub round_duration_secs: u64,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

/// Custom Debug that redacts the verifier API key.
impl fmt::Debug for AttestationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestationConfig")
            .field("verifier_url", &self.verifier_url)
            .field("verifier_api_key", &"<redacted>")
            .field("da_layer_url", &self.da_layer_url)
            .field("source_id", &self.source_id)
            .field("first_round_start_ts", &self.first_round_start_ts)
            .field("round_duration_secs", &self.round_duration_secs)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_polls", &self.max_polls)
            .finish()
    }
}

/// State machine timing
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ttl_secs: u64,
    pub cancel_window_secs: u64,
    pub stale_after_secs: u64,
    pub sweep_interval_ms: u64,
    pub worker_concurrency: usize,
}

/// HTTP surface configuration
#[derive(Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    pub admin_api_key: String,
    pub rate_limit_write_per_min: u32,
    pub rate_limit_read_per_min: u32,
}

/// Custom Debug that redacts the admin key.
impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("admin_api_key", &"<redacted>")
            .field("rate_limit_write_per_min", &self.rate_limit_write_per_min)
            .field("rate_limit_read_per_min", &self.rate_limit_read_per_min)
            .finish()
    }
}

/// Default functions
fn default_network() -> String {
    "testnet".to_string()
}

fn default_confirm_attempts() -> u32 {
    15
}

fn default_confirm_interval_ms() -> u64 {
    2000
}

fn default_max_minting_fee_bps() -> u32 {
    100
}

fn default_first_round_start_ts() -> u64 {
    1_658_430_000
}

fn default_round_duration_secs() -> u64 {
    90
}

fn default_fdc_poll_interval_ms() -> u64 {
    10_000
}

fn default_fdc_max_polls() -> u32 {
    60
}

fn default_ttl_secs() -> u64 {
    1800
}

fn default_cancel_window_secs() -> u64 {
    300
}

fn default_stale_after_secs() -> u64 {
    900
}

fn default_sweep_interval_ms() -> u64 {
    15_000
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_api_port() -> u16 {
    8080
}

fn default_rate_limit_write() -> u32 {
    10
}

fn default_rate_limit_read() -> u32 {
    120
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn is_evm_address(value: &str) -> bool {
    value.len() == 42 && value.starts_with("0x") && hex::decode(&value[2..]).is_ok()
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let store = match env::var("STORE").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            Ok("postgres") | Err(_) => StoreBackend::Postgres,
            Ok(other) => return Err(eyre!("STORE must be 'postgres' or 'memory', got {}", other)),
        };

        let database = DatabaseConfig {
            url: match store {
                StoreBackend::Postgres => required("DATABASE_URL")?,
                StoreBackend::Memory => env::var("DATABASE_URL").unwrap_or_default(),
            },
        };

        let xrpl_urls = parse_rpc_urls(&required("XRPL_RPC_URL")?);
        if xrpl_urls.is_empty() {
            return Err(eyre!("XRPL_RPC_URL cannot be empty"));
        }
        let xrpl = XrplConfig {
            rpc_url: xrpl_urls[0].clone(),
            rpc_fallback_urls: xrpl_urls[1..].to_vec(),
            network: env::var("XRPL_NETWORK").unwrap_or_else(|_| default_network()),
            confirm_attempts: optional("XRPL_CONFIRM_ATTEMPTS", default_confirm_attempts()),
            confirm_interval_ms: optional("XRPL_CONFIRM_INTERVAL_MS", default_confirm_interval_ms()),
        };

        let evm = EvmConfig {
            rpc_url: required("EVM_RPC_URL")?,
            chain_id: required("EVM_CHAIN_ID")?
                .parse()
                .wrap_err("EVM_CHAIN_ID must be a valid u64")?,
            private_key: required("EVM_PRIVATE_KEY")?,
            asset_manager_address: required("ASSET_MANAGER_ADDRESS")?,
            fdc_hub_address: required("FDC_HUB_ADDRESS")?,
            fdc_fee_config_address: required("FDC_FEE_CONFIG_ADDRESS")?,
            fxrp_address: required("FXRP_ADDRESS")?,
            max_minting_fee_bps: optional("MAX_MINTING_FEE_BPS", default_max_minting_fee_bps()),
        };

        let attestation = AttestationConfig {
            verifier_url: required("FDC_VERIFIER_URL")?,
            verifier_api_key: required("FDC_VERIFIER_API_KEY")?,
            da_layer_url: required("FDC_DA_LAYER_URL")?,
            source_id: env::var("FDC_SOURCE_ID").unwrap_or_else(|_| {
                if xrpl.network == "mainnet" {
                    "XRP".to_string()
                } else {
                    "testXRP".to_string()
                }
            }),
            first_round_start_ts: optional(
                "FDC_FIRST_ROUND_START_TS",
                default_first_round_start_ts(),
            ),
            round_duration_secs: optional("FDC_ROUND_DURATION_SECS", default_round_duration_secs()),
            poll_interval_ms: optional("FDC_POLL_INTERVAL_MS", default_fdc_poll_interval_ms()),
            max_polls: optional("FDC_MAX_POLLS", default_fdc_max_polls()),
        };

        let bridge = BridgeConfig {
            ttl_secs: optional("BRIDGE_TTL_SECS", default_ttl_secs()),
            cancel_window_secs: optional("CANCEL_WINDOW_SECS", default_cancel_window_secs()),
            stale_after_secs: optional("STALE_AFTER_SECS", default_stale_after_secs()),
            sweep_interval_ms: optional("SWEEP_INTERVAL_MS", default_sweep_interval_ms()),
            worker_concurrency: optional("WORKER_CONCURRENCY", default_worker_concurrency()),
        };

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: optional("API_PORT", default_api_port()),
            admin_api_key: required("ADMIN_API_KEY")?,
            rate_limit_write_per_min: optional("RATE_LIMIT_WRITE_PER_MIN", default_rate_limit_write()),
            rate_limit_read_per_min: optional("RATE_LIMIT_READ_PER_MIN", default_rate_limit_read()),
        };

        let vaults: Vec<VaultConfig> = serde_json::from_str(&required("VAULTS_CONFIG")?)
            .wrap_err("VAULTS_CONFIG must be a JSON array of vault definitions")?;

        let config = Config {
            store,
            database,
            xrpl,
            evm,
            attestation,
            bridge,
            api,
            vaults,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.store == StoreBackend::Postgres && self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.xrpl.rpc_url.is_empty() {
            return Err(eyre!("xrpl.rpc_url cannot be empty"));
        }
        if self.xrpl.network != "mainnet" && self.xrpl.network != "testnet" {
            return Err(eyre!("xrpl.network must be 'mainnet' or 'testnet'"));
        }
        if self.xrpl.confirm_attempts == 0 {
            return Err(eyre!("xrpl.confirm_attempts must be at least 1"));
        }

        if self.evm.rpc_url.is_empty() {
            return Err(eyre!("evm.rpc_url cannot be empty"));
        }
        if self.evm.private_key.len() != 66 || !self.evm.private_key.starts_with("0x") {
            return Err(eyre!("evm.private_key must be 66 chars (0x + 64 hex chars)"));
        }
        for (name, address) in [
            ("evm.asset_manager_address", &self.evm.asset_manager_address),
            ("evm.fdc_hub_address", &self.evm.fdc_hub_address),
            ("evm.fdc_fee_config_address", &self.evm.fdc_fee_config_address),
            ("evm.fxrp_address", &self.evm.fxrp_address),
        ] {
            if !is_evm_address(address) {
                return Err(eyre!(
                    "{} must be a valid hex address (42 chars with 0x prefix)",
                    name
                ));
            }
        }
        if self.evm.max_minting_fee_bps > 10_000 {
            return Err(eyre!("evm.max_minting_fee_bps cannot exceed 10000"));
        }

        if self.attestation.verifier_url.is_empty() || self.attestation.da_layer_url.is_empty() {
            return Err(eyre!("attestation verifier and DA layer URLs cannot be empty"));
        }
        if self.attestation.round_duration_secs == 0 {
            return Err(eyre!("attestation.round_duration_secs must be positive"));
        }

        if self.bridge.cancel_window_secs == 0 {
            return Err(eyre!("bridge.cancel_window_secs must be positive"));
        }
        if self.bridge.ttl_secs == 0 {
            return Err(eyre!("bridge.ttl_secs must be positive"));
        }
        if self.bridge.worker_concurrency == 0 {
            return Err(eyre!("bridge.worker_concurrency must be at least 1"));
        }

        if self.api.admin_api_key.len() < 32 {
            return Err(eyre!("api.admin_api_key must be at least 32 characters"));
        }
        if self.api.rate_limit_write_per_min == 0 || self.api.rate_limit_read_per_min == 0 {
            return Err(eyre!("api rate limits must be positive"));
        }

        VaultRegistry::new(self.vaults.clone()).map_err(|e| eyre!("vaults: {}", e))?;

        Ok(())
    }

    pub fn vault_registry(&self) -> Result<VaultRegistry> {
        VaultRegistry::new(self.vaults.clone()).map_err(|e| eyre!("vaults: {}", e))
    }
}
