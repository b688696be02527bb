//! Configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// External reputation API.
    #[serde(default)]
    pub api: ApiConfig,

    /// Static exemptions applied before any lookup.
    #[serde(default)]
    pub exemptions: ExemptionConfig,

    /// Country allow/deny policy.
    #[serde(default)]
    pub countries: CountryPolicy,

    /// Reactive commands dispatched on a blocked connection.
    #[serde(default)]
    pub commands: CommandConfig,

    /// Staff alerting.
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Durable storage backend.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Webhook notifications.
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Master enable/disable switch.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Persist classified responses to the storage backend.
    #[serde(default = "default_true")]
    pub cache_results: bool,

    /// Disconnect principals whose check came back blocking.
    #[serde(default = "default_true")]
    pub kick_blocked: bool,

    /// Disconnect reason for VPN/proxy denials.
    #[serde(default = "default_kick_message")]
    pub kick_message: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_results: true,
            kick_blocked: true,
            kick_message: default_kick_message(),
        }
    }
}

fn default_kick_message() -> String {
    "Proxies are not allowed on our server".to_string()
}

/// External reputation API settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Lookup endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// License key sent with each lookup (supports ${ENV_VAR} syntax).
    #[serde(default)]
    pub license: String,

    /// Connect/read timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            license: String::new(),
            timeout_ms: default_timeout(),
        }
    }
}

fn default_endpoint() -> String {
    "https://funkemunky.cc/vpn".to_string()
}

fn default_timeout() -> u64 {
    5000
}

/// Static exemptions.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExemptionConfig {
    /// Principals whose name starts with one of these prefixes skip checks
    /// entirely. Used for crossplay accounts that share egress addresses.
    #[serde(default)]
    pub name_prefixes: Vec<String>,
}

/// Country allow/deny policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CountryPolicy {
    /// ISO country codes the policy applies to. Empty disables the policy.
    #[serde(default)]
    pub list: Vec<String>,

    /// When true the list is an allow list; when false it is a deny list.
    #[serde(default = "default_true")]
    pub whitelist_mode: bool,

    /// Disconnect reason for country denials.
    #[serde(default = "default_country_kick_reason")]
    pub kick_reason: String,

    /// Commands dispatched on a country denial.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl Default for CountryPolicy {
    fn default() -> Self {
        Self {
            list: Vec::new(),
            whitelist_mode: true,
            kick_reason: default_country_kick_reason(),
            commands: Vec::new(),
        }
    }
}

fn default_country_kick_reason() -> String {
    "Sorry, but our server does not allow connections from %country%".to_string()
}

/// Reactive commands dispatched through the host runtime on a blocked check.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Commands dispatched on a VPN/proxy denial.
    #[serde(default = "default_proxy_commands")]
    pub on_proxy: Vec<String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            on_proxy: default_proxy_commands(),
        }
    }
}

fn default_proxy_commands() -> Vec<String> {
    vec!["kick %player% VPNs are not allowed on our server!".to_string()]
}

/// Staff alerting.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Message sent to connected principals with alerts enabled.
    #[serde(default = "default_alert_message")]
    pub message: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            message: default_alert_message(),
        }
    }
}

fn default_alert_message() -> String {
    "%player% has joined on a VPN/proxy (%reason%) in location (%city%, %country%)".to_string()
}

/// Durable storage backend selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Backend kind.
    #[serde(default)]
    pub kind: DatabaseKind,

    /// Database file path for the embedded backend.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_database_host")]
    pub host: String,

    /// Server port. -1 selects the default port for the backend kind.
    #[serde(default = "default_database_port")]
    pub port: i32,

    #[serde(default = "default_database_name")]
    pub name: String,

    #[serde(default = "default_database_user")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Whether the server requires credentials.
    #[serde(default = "default_true")]
    pub use_credentials: bool,

    /// Full connection URL for the document backend. Overrides host/port.
    #[serde(default)]
    pub mongo_url: String,

    /// Cached responses older than this many seconds are dropped on read.
    #[serde(default = "default_response_retention")]
    pub response_retention_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: DatabaseKind::default(),
            path: default_database_path(),
            host: default_database_host(),
            port: default_database_port(),
            name: default_database_name(),
            username: default_database_user(),
            password: String::new(),
            use_credentials: true,
            mongo_url: String::new(),
            response_retention_secs: default_response_retention(),
        }
    }
}

impl DatabaseConfig {
    /// Resolved port, substituting the backend kind's default for -1.
    pub fn port(&self) -> u16 {
        if self.port == -1 {
            match self.kind {
                DatabaseKind::Sqlite => 0,
                DatabaseKind::Mysql => 3306,
                DatabaseKind::Mongodb => 27017,
            }
        } else {
            self.port as u16
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("proxyward.db")
}

fn default_database_host() -> String {
    "localhost".to_string()
}

fn default_database_port() -> i32 {
    -1
}

fn default_database_name() -> String {
    "proxyward".to_string()
}

fn default_database_user() -> String {
    "root".to_string()
}

fn default_response_retention() -> u64 {
    3600
}

/// Storage backend kind.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// Embedded SQL database.
    #[default]
    Sqlite,
    /// Networked SQL server.
    Mysql,
    /// Document database.
    Mongodb,
}

/// Webhook notification settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub url: String,

    /// Payload format.
    #[serde(default)]
    pub format: WebhookFormat,

    #[serde(default)]
    pub use_auth: bool,

    /// Bearer token (supports ${ENV_VAR} syntax).
    #[serde(default)]
    pub auth_token: String,

    /// Request timeout in seconds.
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            format: WebhookFormat::default(),
            use_auth: false,
            auth_token: String::new(),
            timeout_secs: default_webhook_timeout(),
        }
    }
}

fn default_webhook_timeout() -> u64 {
    5
}

/// Webhook payload format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WebhookFormat {
    #[default]
    Discord,
    Slack,
    Generic,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.webhook.enabled && self.webhook.url.trim().is_empty() {
            anyhow::bail!("webhook is enabled but no url is configured");
        }

        if self.webhook.use_auth && self.webhook.auth_token.trim().is_empty() {
            anyhow::bail!("webhook authentication is enabled but auth_token is empty");
        }

        if self.database.enabled
            && self.database.kind != DatabaseKind::Sqlite
            && self.database.port < -1
        {
            anyhow::bail!("database port {} is invalid", self.database.port);
        }

        for code in &self.countries.list {
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_uppercase()) {
                anyhow::bail!("country list entry {:?} is not an ISO country code", code);
            }
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Proxyward Configuration

settings:
  enabled: true
  cache_results: true              # Persist classified responses to the backend
  kick_blocked: true
  kick_message: "Proxies are not allowed on our server"

# External reputation API
api:
  endpoint: "https://funkemunky.cc/vpn"
  license: "${PROXYWARD_LICENSE}"  # Use environment variable
  timeout_ms: 5000

# Static exemptions applied before any cache or network interaction
exemptions:
  name_prefixes:
    - "."                          # Crossplay accounts

# Country policy. Empty list disables the check.
countries:
  list: []                         # ISO codes, e.g. ["US", "CA"]
  whitelist_mode: true             # true = allow list, false = deny list
  kick_reason: "Sorry, but our server does not allow connections from %country%"
  commands: []

# Reactive commands dispatched through the host runtime
commands:
  enabled: false
  on_proxy:
    - "kick %player% VPNs are not allowed on our server!"

# Staff alerting
alerts:
  enabled: true
  message: "%player% has joined on a VPN/proxy (%reason%) in location (%city%, %country%)"

# Durable storage backend (optional)
database:
  enabled: false
  kind: sqlite                     # sqlite, mysql or mongodb
  path: "proxyward.db"             # sqlite only
  host: "localhost"
  port: -1                         # -1 = default port for the kind
  name: "proxyward"
  username: "root"
  password: "password"
  use_credentials: true
  mongo_url: ""                    # mongodb only, overrides host/port
  response_retention_secs: 3600

# Webhook notifications (optional)
webhook:
  enabled: false
  url: ""
  format: discord                  # discord, slack or generic
  use_auth: false
  auth_token: ""
  timeout_secs: 5
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.enabled);
        assert!(settings.cache_results);
        assert!(settings.kick_blocked);
    }

    #[test]
    fn test_default_country_policy_is_disabled() {
        let policy = CountryPolicy::default();
        assert!(policy.list.is_empty());
        assert!(policy.whitelist_mode);
    }

    #[test]
    fn test_database_default_ports() {
        let mut db = DatabaseConfig::default();
        db.kind = DatabaseKind::Mysql;
        assert_eq!(db.port(), 3306);

        db.kind = DatabaseKind::Mongodb;
        assert_eq!(db.port(), 27017);

        db.port = 3307;
        assert_eq!(db.port(), 3307);
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("PROXYWARD_TEST_LICENSE", "secret123");
        let input = "license: \"${PROXYWARD_TEST_LICENSE}\"";
        let result = expand_env_vars(input);
        assert_eq!(result, "license: \"secret123\"");
        std::env::remove_var("PROXYWARD_TEST_LICENSE");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let input = "license: \"${PROXYWARD_NONEXISTENT_VAR}\"";
        let result = expand_env_vars(input);
        assert_eq!(result, "license: \"\"");
    }

    #[test]
    fn test_parse_config_yaml() {
        let yaml = r#"
settings:
  enabled: true
  kick_blocked: false

countries:
  list: ["US", "CA"]
  whitelist_mode: false

database:
  enabled: true
  kind: mysql
  host: "db.example.net"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.settings.enabled);
        assert!(!config.settings.kick_blocked);
        assert_eq!(config.countries.list, vec!["US", "CA"]);
        assert!(!config.countries.whitelist_mode);
        assert_eq!(config.database.kind, DatabaseKind::Mysql);
        assert_eq!(config.database.host, "db.example.net");
    }

    #[test]
    fn test_example_config_parses_and_validates() {
        let config: Config = serde_yaml::from_str(&Config::example()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.database.kind, DatabaseKind::Sqlite);
    }

    #[test]
    fn test_validate_webhook_requires_url() {
        let mut config: Config = serde_yaml::from_str("{}").unwrap();
        config.webhook.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_country_codes() {
        let mut config: Config = serde_yaml::from_str("{}").unwrap();
        config.countries.list = vec!["usa".to_string()];
        assert!(config.validate().is_err());

        config.countries.list = vec!["US".to_string()];
        assert!(config.validate().is_ok());
    }
}
