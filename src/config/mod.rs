//! Configuration and credential loading
//!
//! Everything comes from the process environment (a `.env` file is read
//! at startup). The whole configuration is materialized once into an
//! immutable `Settings` and passed down explicitly; core logic never
//! touches the environment itself.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

use crate::driver::LoginSecrets;

/// The six fixed credential slots, in registration order.
const CREDENTIAL_SLOTS: [&str; 6] = [
    "MARKETDATA1",
    "MARKETDATA2",
    "OPTIONCHAIN",
    "ORDERS",
    "HISTORIC",
    "AI",
];

const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:9515";

/// One credential slot as configured, possibly incomplete. The registry
/// decides what is usable.
#[derive(Debug, Clone)]
pub struct CredentialSlot {
    pub name: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Per-slot override; most slots share the common redirect URI.
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContractsSettings {
    pub uri: Option<String>,
    pub instruments_path: Option<PathBuf>,
}

/// Immutable application configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Redirect URI shared by every credential without an override.
    pub redirect_uri: Option<String>,
    pub credentials: Vec<CredentialSlot>,
    pub login: LoginSecrets,
    /// Path of the persisted token table.
    pub tokens_path: PathBuf,
    pub contracts: ContractsSettings,
    pub webdriver_url: String,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Settings {
    /// Read the environment into a `Settings`. Only the default token
    /// store path can fail (no resolvable home directory).
    pub fn from_env() -> Result<Self> {
        let redirect_uri = env_var("UPSTOX_REDIRECT_URI");

        let credentials = CREDENTIAL_SLOTS
            .iter()
            .enumerate()
            .map(|(index, name)| CredentialSlot {
                name: name.to_string(),
                client_id: env_var(&format!("UPSTOX_CLIENT_ID_{}", index)),
                client_secret: env_var(&format!("UPSTOX_CLIENT_SECRET_{}", index)),
                redirect_uri: env_var(&format!("UPSTOX_REDIRECT_URI_{}", index)),
            })
            .collect();

        let login = LoginSecrets {
            mobile_number: env_var("UPSTOX_MOBILE_NUMBER"),
            totp_secret: env_var("UPSTOX_TOTP"),
            pin: env_var("UPSTOX_PIN"),
        };

        let tokens_path = match env_var("TOKEN_DIR_JSON") {
            Some(path) => PathBuf::from(path),
            None => ProjectDirs::from("com", "upstox-auth", "upstox-auth")
                .context("Could not determine data directory for the token store")?
                .data_dir()
                .join("tokens.json"),
        };

        let contracts = ContractsSettings {
            uri: env_var("CONTRACTS_URI"),
            instruments_path: env_var("INSTRUMENTS_JSON").map(PathBuf::from),
        };

        Ok(Self {
            redirect_uri,
            credentials,
            login,
            tokens_path,
            contracts,
            webdriver_url: env_var("WEBDRIVER_URL")
                .unwrap_or_else(|| DEFAULT_WEBDRIVER_URL.to_string()),
        })
    }

    /// Names of every configured slot, for store cleanup.
    pub fn slot_names(&self) -> Vec<&str> {
        self.credentials.iter().map(|s| s.name.as_str()).collect()
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            redirect_uri: None,
            credentials: Vec::new(),
            login: LoginSecrets::default(),
            tokens_path: PathBuf::from("tokens.json"),
            contracts: ContractsSettings::default(),
            webdriver_url: DEFAULT_WEBDRIVER_URL.to_string(),
        }
    }
}
