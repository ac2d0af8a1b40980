use std::env;

/// The well-known exit use-case tag. Notes carrying this tag on the
/// bridge account are withdrawal requests.
pub const DEFAULT_EXIT_TAG: u16 = 20050;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    // Server
    pub host: String,
    pub port: u16,

    // Zcash side
    pub zcash_rpc_url: String,
    pub zcash_rpc_user: Option<String>,
    pub zcash_rpc_password: Option<String>,
    pub pool_address: String,
    pub zcash_min_confirmations: u32,
    pub zcash_relayer_interval_secs: u64,

    // Miden side
    pub miden_rpc_url: String,
    pub miden_store_path: String,
    pub miden_keystore_path: String,
    pub faucet_id: String,
    pub bridge_account_id: String,
    pub miden_relayer_interval_secs: u64,
    pub exit_tag: u16,

    // Engine policy
    pub max_mint_attempts: u32,
    pub dust_threshold_base: u64,
    pub db_path: String,

    // CORS
    pub allowed_origins: Vec<String>,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let zcash_rpc_url = require_env("ZCASH_RPC_URL")?;
        validate_url(&zcash_rpc_url, "ZCASH_RPC_URL")?;

        let miden_rpc_url = require_env("MIDEN_RPC_URL")?;
        validate_url(&miden_rpc_url, "MIDEN_RPC_URL")?;

        let pool_address = require_env("BRIDGE_POOL_ADDR")?;
        let faucet_id = require_env("FAUCET_ID")?;
        validate_account_id_shape(&faucet_id, "FAUCET_ID")?;
        let bridge_account_id = require_env("BRIDGE_ACCOUNT_ID")?;
        validate_account_id_shape(&bridge_account_id, "BRIDGE_ACCOUNT_ID")?;

        let zcash_relayer_interval_secs: u64 = parse_env_or("ZCASH_RELAYER_INTERVAL_SECS", 5)?;
        if zcash_relayer_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "ZCASH_RELAYER_INTERVAL_SECS".into(),
                "must be > 0".into(),
            ));
        }
        let miden_relayer_interval_secs: u64 = parse_env_or("MIDEN_RELAYER_INTERVAL_SECS", 10)?;
        if miden_relayer_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "MIDEN_RELAYER_INTERVAL_SECS".into(),
                "must be > 0".into(),
            ));
        }

        let max_mint_attempts: u32 = parse_env_or("MAX_MINT_ATTEMPTS", 8)?;
        if max_mint_attempts == 0 {
            return Err(ConfigError::Invalid(
                "MAX_MINT_ATTEMPTS".into(),
                "must be > 0".into(),
            ));
        }

        let allowed_origins = env::var("BRIDGE_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        Ok(Self {
            host: env::var("BRIDGE_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("BRIDGE_PORT")
                .unwrap_or_else(|_| "3090".into())
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid("BRIDGE_PORT".into(), "must be a valid port number".into())
                })?,
            zcash_rpc_url,
            zcash_rpc_user: env::var("ZCASH_RPC_USER").ok().filter(|s| !s.is_empty()),
            zcash_rpc_password: env::var("ZCASH_RPC_PASSWORD").ok().filter(|s| !s.is_empty()),
            pool_address,
            zcash_min_confirmations: parse_env_or("ZCASH_MIN_CONFIRMATIONS", 1)?,
            zcash_relayer_interval_secs,
            miden_rpc_url,
            miden_store_path: env::var("MIDEN_STORE_PATH")
                .unwrap_or_else(|_| "bridge-miden-store.sqlite3".into()),
            miden_keystore_path: env::var("MIDEN_KEYSTORE_PATH")
                .unwrap_or_else(|_| "bridge-keystore".into()),
            faucet_id,
            bridge_account_id,
            miden_relayer_interval_secs,
            exit_tag: parse_env_or("EXIT_TAG", DEFAULT_EXIT_TAG)?,
            max_mint_attempts,
            dust_threshold_base: parse_env_or("DUST_THRESHOLD_BASE", 0)?,
            db_path: env::var("BRIDGE_DB_PATH").unwrap_or_else(|_| "bridge-state.sqlite3".into()),
            allowed_origins,
        })
    }
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .map_err(|_| ConfigError::Missing(name.into()))
        .and_then(|v| {
            if v.is_empty() {
                Err(ConfigError::Missing(name.into()))
            } else {
                Ok(v)
            }
        })
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name.into(), format!("could not parse '{v}'"))),
        _ => Ok(default),
    }
}

fn validate_url(url: &str, name: &str) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if lower.starts_with("https://") {
        return Ok(());
    }
    // Allow http:// only for localhost/dev
    if lower.starts_with("http://") {
        let host_part = lower.trim_start_matches("http://");
        if host_part.starts_with("localhost")
            || host_part.starts_with("127.0.0.1")
            || host_part.starts_with("[::1]")
        {
            return Ok(());
        }
        return Err(ConfigError::Invalid(
            name.into(),
            "must use HTTPS for non-localhost URLs".into(),
        ));
    }
    Err(ConfigError::Invalid(
        name.into(),
        "must start with https:// (or http:// for localhost)".into(),
    ))
}

/// Account ids arrive as bech32 (`mtst1...`) or 0x-hex. Full decoding
/// happens in `derive`; this only rejects obviously broken values early.
fn validate_account_id_shape(value: &str, name: &str) -> Result<(), ConfigError> {
    let looks_bech32 = value.contains('1') && value.chars().all(|c| c.is_ascii_alphanumeric());
    let hex_part = value.strip_prefix("0x").unwrap_or(value);
    let looks_hex = !hex_part.is_empty() && hex_part.chars().all(|c| c.is_ascii_hexdigit());
    if looks_bech32 || looks_hex {
        Ok(())
    } else {
        Err(ConfigError::Invalid(
            name.into(),
            "must be a bech32 or hex account id".into(),
        ))
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(String),
    Invalid(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "missing required env var: {name}"),
            ConfigError::Invalid(name, reason) => {
                write!(f, "invalid env var {name}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
