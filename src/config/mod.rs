//! Configuration loading for the basewatch connection service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `BASEWATCH_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "BASEWATCH_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `BASEWATCH_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    /// Browser destination the OAuth callback redirects to with `success`/`error`.
    #[serde(default = "default_settings_url")]
    pub settings_url: String,
    #[serde(default)]
    pub airtable: AirtableConfig,
    #[serde(default)]
    pub oauth_state: OAuthStateConfig,
}

/// Airtable OAuth client and API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AirtableConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    /// Authorization endpoint the user's browser is sent to
    #[serde(default = "default_airtable_authorize_url")]
    pub authorize_url: String,
    /// Token endpoint for code exchange and refresh
    #[serde(default = "default_airtable_token_url")]
    pub token_url: String,
    /// Base URL of the Airtable Web API (`/meta/*` lives under it)
    #[serde(default = "default_airtable_api_base")]
    pub api_base: String,
    #[serde(default = "default_airtable_scopes")]
    pub scopes: Vec<String>,
    /// Timeout applied to every outbound Airtable request (default: 30)
    #[serde(default = "default_airtable_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

/// OAuth state lifetime and sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OAuthStateConfig {
    /// Minutes an authorization attempt stays valid (default: 10)
    #[serde(default = "default_oauth_state_ttl_minutes")]
    pub ttl_minutes: i64,
    /// Interval of the expired-state sweep in seconds (default: 300)
    #[serde(default = "default_oauth_state_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            crypto_key: None,
            settings_url: default_settings_url(),
            airtable: AirtableConfig::default(),
            oauth_state: OAuthStateConfig::default(),
        }
    }
}

impl Default for AirtableConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            authorize_url: default_airtable_authorize_url(),
            token_url: default_airtable_token_url(),
            api_base: default_airtable_api_base(),
            scopes: default_airtable_scopes(),
            http_timeout_seconds: default_airtable_http_timeout_seconds(),
        }
    }
}

impl Default for OAuthStateConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_oauth_state_ttl_minutes(),
            sweep_interval_seconds: default_oauth_state_sweep_interval_seconds(),
        }
    }
}

impl AirtableConfig {
    /// Validate endpoint URLs, scopes and timeout bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("AIRTABLE_AUTHORIZE_URL", &self.authorize_url),
            ("AIRTABLE_TOKEN_URL", &self.token_url),
            ("AIRTABLE_API_BASE", &self.api_base),
        ] {
            Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
                field: field.to_string(),
                value: value.clone(),
                source,
            })?;
        }

        if let Some(redirect_uri) = &self.redirect_uri {
            Url::parse(redirect_uri).map_err(|source| ConfigError::InvalidUrl {
                field: "AIRTABLE_REDIRECT_URI".to_string(),
                value: redirect_uri.clone(),
                source,
            })?;
        }

        if self.scopes.is_empty() {
            return Err(ConfigError::EmptyAirtableScopes);
        }

        if self.http_timeout_seconds == 0 || self.http_timeout_seconds > 120 {
            return Err(ConfigError::InvalidAirtableTimeout {
                value: self.http_timeout_seconds,
            });
        }

        Ok(())
    }

    /// Space-separated scope string as sent on the authorization URL.
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }
}

impl OAuthStateConfig {
    /// Validate state lifetime and sweep bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=60).contains(&self.ttl_minutes) {
            return Err(ConfigError::InvalidOAuthStateTtl {
                value: self.ttl_minutes,
            });
        }

        if self.sweep_interval_seconds < 30 {
            return Err(ConfigError::InvalidOAuthStateSweepInterval {
                value: self.sweep_interval_seconds,
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// True for the `local` and `test` profiles, which tolerate missing Airtable credentials.
    pub fn is_development(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        if config.crypto_key.is_some() {
            config.crypto_key = Some(REDACTED.as_bytes().to_vec());
        }
        if config.airtable.client_id.is_some() {
            config.airtable.client_id = Some(REDACTED.to_string());
        }
        if config.airtable.client_secret.is_some() {
            config.airtable.client_secret = Some(REDACTED.to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        // Airtable credentials are only optional for local development and tests
        if !self.is_development() {
            if self.airtable.client_id.is_none() {
                return Err(ConfigError::MissingAirtableSetting {
                    key: "AIRTABLE_CLIENT_ID",
                });
            }
            if self.airtable.client_secret.is_none() {
                return Err(ConfigError::MissingAirtableSetting {
                    key: "AIRTABLE_CLIENT_SECRET",
                });
            }
            if self.airtable.redirect_uri.is_none() {
                return Err(ConfigError::MissingAirtableSetting {
                    key: "AIRTABLE_REDIRECT_URI",
                });
            }
        }

        Url::parse(&self.settings_url).map_err(|source| ConfigError::InvalidUrl {
            field: "SETTINGS_URL".to_string(),
            value: self.settings_url.clone(),
            source,
        })?;

        self.airtable.validate()?;
        self.oauth_state.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://basewatch.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_settings_url() -> String {
    "http://localhost:3000/settings/connections".to_string()
}

fn default_airtable_authorize_url() -> String {
    "https://airtable.com/oauth2/v1/authorize".to_string()
}

fn default_airtable_token_url() -> String {
    "https://airtable.com/oauth2/v1/token".to_string()
}

fn default_airtable_api_base() -> String {
    "https://api.airtable.com/v0".to_string()
}

fn default_airtable_scopes() -> Vec<String> {
    [
        "data.records:read",
        "data.recordComments:read",
        "schema.bases:read",
        "user.email:read",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_airtable_http_timeout_seconds() -> u64 {
    30
}

fn default_oauth_state_ttl_minutes() -> i64 {
    10
}

fn default_oauth_state_sweep_interval_seconds() -> u64 {
    300
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set BASEWATCH_OPERATOR_TOKEN or BASEWATCH_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("crypto key is missing; set BASEWATCH_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("{key} is missing; set BASEWATCH_{key} environment variable")]
    MissingAirtableSetting { key: &'static str },
    #[error("{field} is not a valid URL '{value}': {source}")]
    InvalidUrl {
        field: String,
        value: String,
        source: url::ParseError,
    },
    #[error("at least one Airtable OAuth scope must be configured")]
    EmptyAirtableScopes,
    #[error("Airtable HTTP timeout must be between 1 and 120 seconds, got {value}")]
    InvalidAirtableTimeout { value: u64 },
    #[error("OAuth state TTL must be between 1 and 60 minutes, got {value}")]
    InvalidOAuthStateTtl { value: i64 },
    #[error("OAuth state sweep interval must be at least 30 seconds, got {value}")]
    InvalidOAuthStateSweepInterval { value: u64 },
}

/// Loads configuration using layered `.env` files and `BASEWATCH_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_non_empty(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_non_empty(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_non_empty(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_non_empty(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_non_empty(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Support both a single token and a comma-separated list
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            split_list(&tokens, ',')
        } else if let Some(token) = take_non_empty(&mut layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let crypto_key = match layered.remove("CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let settings_url =
            take_non_empty(&mut layered, "SETTINGS_URL").unwrap_or_else(default_settings_url);

        let airtable = AirtableConfig {
            client_id: take_non_empty(&mut layered, "AIRTABLE_CLIENT_ID"),
            client_secret: take_non_empty(&mut layered, "AIRTABLE_CLIENT_SECRET"),
            redirect_uri: take_non_empty(&mut layered, "AIRTABLE_REDIRECT_URI"),
            authorize_url: take_non_empty(&mut layered, "AIRTABLE_AUTHORIZE_URL")
                .unwrap_or_else(default_airtable_authorize_url),
            token_url: take_non_empty(&mut layered, "AIRTABLE_TOKEN_URL")
                .unwrap_or_else(default_airtable_token_url),
            api_base: take_non_empty(&mut layered, "AIRTABLE_API_BASE")
                .unwrap_or_else(default_airtable_api_base),
            scopes: take_non_empty(&mut layered, "AIRTABLE_SCOPES")
                .map(|scopes| split_list(&scopes, ' '))
                .unwrap_or_else(default_airtable_scopes),
            http_timeout_seconds: layered
                .remove("AIRTABLE_HTTP_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_airtable_http_timeout_seconds),
        };

        let oauth_state = OAuthStateConfig {
            ttl_minutes: layered
                .remove("OAUTH_STATE_TTL_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_oauth_state_ttl_minutes),
            sweep_interval_seconds: layered
                .remove("OAUTH_STATE_SWEEP_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_oauth_state_sweep_interval_seconds),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            crypto_key,
            settings_url,
            airtable,
            oauth_state,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_non_empty(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
