//! SFU controller configuration.
//!
//! Configuration is loaded from environment variables once at startup and
//! shared as `Arc<Config>` with every connection, publisher and subscriber.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default lower bound of the media port range.
pub const DEFAULT_MIN_PORT: u16 = 30000;

/// Default upper bound of the media port range.
pub const DEFAULT_MAX_PORT: u16 = 40000;

/// Default codec configuration blob name.
pub const DEFAULT_MEDIA_CONFIGURATION: &str = "default";

/// Default bandwidth sampling period for adaptation.
pub const DEFAULT_ADAPTATION_SAMPLE_INTERVAL_MS: u64 = 1000;

/// Default number of consecutive low samples before declaring insufficient bandwidth.
pub const DEFAULT_ADAPTATION_TICS_PER_TRANSITION: u32 = 10;

/// Default registration attempts before giving up for the process lifetime.
pub const DEFAULT_REGISTRATION_MAX_ATTEMPTS: u32 = 10;

/// Default spacing between registration attempts.
pub const DEFAULT_REGISTRATION_RETRY_DELAY_MS: u64 = 1000;

/// Default timeout for a statistics request.
pub const DEFAULT_STATS_TIMEOUT_MS: u64 = 5000;

/// Default agent ID prefix.
pub const DEFAULT_AGENT_ID_PREFIX: &str = "sfu";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Rewrites private addresses to a public one.
#[derive(Debug, Clone)]
pub struct AddressTranslation {
    pattern: Regex,
    public_ip: String,
}

impl AddressTranslation {
    /// Compile a translation rule.
    pub fn new(private_pattern: &str, public_ip: impl Into<String>) -> Result<Self, ConfigError> {
        let pattern = Regex::new(private_pattern).map_err(|e| {
            ConfigError::InvalidValue(format!("invalid private address pattern: {e}"))
        })?;
        Ok(Self {
            pattern,
            public_ip: public_ip.into(),
        })
    }

    /// Replace every private address match in `text` with the public address.
    #[must_use]
    pub fn apply(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, self.public_ip.as_str())
            .into_owned()
    }

    #[must_use]
    pub fn public_ip(&self) -> &str {
        &self.public_ip
    }
}

/// Raw interface entry as found in `SFU_NETWORK_INTERFACES`.
#[derive(Debug, Deserialize)]
struct RawInterface {
    name: String,
    #[serde(default)]
    private_pattern: Option<String>,
    #[serde(default)]
    public_ip: Option<String>,
}

/// A network interface the Media Engine may bind to.
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    /// Address translation applied to descriptions and candidates, if any.
    pub translation: Option<AddressTranslation>,
}

impl NetworkInterface {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            translation: None,
        }
    }

    #[must_use]
    pub fn with_translation(mut self, translation: AddressTranslation) -> Self {
        self.translation = Some(translation);
        self
    }
}

/// SFU controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this controller instance.
    pub agent_id: String,

    /// Media port range handed to the engine.
    pub min_port: u16,
    pub max_port: u16,

    /// Interfaces available for transports. The first entry is the default.
    pub network_interfaces: Vec<NetworkInterface>,

    /// Codec configuration blob used when a node does not ask for one.
    pub media_configuration: String,

    /// Whether transports take the ICE-controlling role.
    pub ice_controlling: bool,

    /// Whether transports encrypt media (DTLS-SRTP).
    pub encrypt: bool,

    /// Bandwidth sampling period for adaptation.
    pub adaptation_sample_interval: Duration,

    /// Consecutive low samples needed to declare insufficient bandwidth.
    pub adaptation_tics_per_transition: u32,

    /// Tear down a publisher/subscriber after its transport fails.
    pub teardown_on_failure: bool,

    /// Registration attempts before giving up.
    pub registration_max_attempts: u32,

    /// Spacing between registration attempts.
    pub registration_retry_delay: Duration,

    /// Timeout for statistics requests.
    pub stats_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: format!("{DEFAULT_AGENT_ID_PREFIX}-local"),
            min_port: DEFAULT_MIN_PORT,
            max_port: DEFAULT_MAX_PORT,
            network_interfaces: Vec::new(),
            media_configuration: DEFAULT_MEDIA_CONFIGURATION.to_string(),
            ice_controlling: false,
            encrypt: true,
            adaptation_sample_interval: Duration::from_millis(
                DEFAULT_ADAPTATION_SAMPLE_INTERVAL_MS,
            ),
            adaptation_tics_per_transition: DEFAULT_ADAPTATION_TICS_PER_TRANSITION,
            teardown_on_failure: true,
            registration_max_attempts: DEFAULT_REGISTRATION_MAX_ATTEMPTS,
            registration_retry_delay: Duration::from_millis(DEFAULT_REGISTRATION_RETRY_DELAY_MS),
            stats_timeout: Duration::from_millis(DEFAULT_STATS_TIMEOUT_MS),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let min_port = parse_or(vars, "SFU_MIN_PORT", DEFAULT_MIN_PORT)?;
        let max_port = parse_or(vars, "SFU_MAX_PORT", DEFAULT_MAX_PORT)?;
        if min_port > max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_MIN_PORT ({min_port}) exceeds SFU_MAX_PORT ({max_port})"
            )));
        }

        let network_interfaces = match vars.get("SFU_NETWORK_INTERFACES") {
            Some(raw) => parse_interfaces(raw)?,
            None => Vec::new(),
        };

        let media_configuration = vars
            .get("SFU_MEDIA_CONFIGURATION")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MEDIA_CONFIGURATION.to_string());

        let ice_controlling = parse_or(vars, "SFU_ICE_CONTROLLING", false)?;
        let encrypt = parse_or(vars, "SFU_ENCRYPT", true)?;
        let teardown_on_failure = parse_or(vars, "SFU_TEARDOWN_ON_FAILURE", true)?;

        let adaptation_sample_interval = Duration::from_millis(parse_or(
            vars,
            "SFU_ADAPTATION_SAMPLE_INTERVAL_MS",
            DEFAULT_ADAPTATION_SAMPLE_INTERVAL_MS,
        )?);
        if adaptation_sample_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SFU_ADAPTATION_SAMPLE_INTERVAL_MS must be positive".to_string(),
            ));
        }

        let adaptation_tics_per_transition = parse_or(
            vars,
            "SFU_ADAPTATION_TICS_PER_TRANSITION",
            DEFAULT_ADAPTATION_TICS_PER_TRANSITION,
        )?;

        let registration_max_attempts = parse_or(
            vars,
            "SFU_REGISTRATION_MAX_ATTEMPTS",
            DEFAULT_REGISTRATION_MAX_ATTEMPTS,
        )?;
        let registration_retry_delay = Duration::from_millis(parse_or(
            vars,
            "SFU_REGISTRATION_RETRY_DELAY_MS",
            DEFAULT_REGISTRATION_RETRY_DELAY_MS,
        )?);

        let stats_timeout = Duration::from_millis(parse_or(
            vars,
            "SFU_STATS_TIMEOUT_MS",
            DEFAULT_STATS_TIMEOUT_MS,
        )?);

        // Generate agent ID
        let agent_id = vars.get("SFU_AGENT_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_AGENT_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            agent_id,
            min_port,
            max_port,
            network_interfaces,
            media_configuration,
            ice_controlling,
            encrypt,
            adaptation_sample_interval,
            adaptation_tics_per_transition,
            teardown_on_failure,
            registration_max_attempts,
            registration_retry_delay,
            stats_timeout,
        })
    }

    /// Find the interface a connection asked for, falling back to the default.
    #[must_use]
    pub fn interface(&self, name: Option<&str>) -> Option<&NetworkInterface> {
        match name {
            Some(name) => self
                .network_interfaces
                .iter()
                .find(|iface| iface.name == name)
                .or_else(|| self.network_interfaces.first()),
            None => self.network_interfaces.first(),
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

fn parse_interfaces(raw: &str) -> Result<Vec<NetworkInterface>, ConfigError> {
    let entries: Vec<RawInterface> = serde_json::from_str(raw)
        .map_err(|e| ConfigError::InvalidValue(format!("SFU_NETWORK_INTERFACES: {e}")))?;

    entries
        .into_iter()
        .map(|entry| {
            let translation = match (entry.private_pattern, entry.public_ip) {
                (Some(pattern), Some(public_ip)) => {
                    Some(AddressTranslation::new(&pattern, public_ip)?)
                }
                (None, None) => None,
                _ => {
                    return Err(ConfigError::InvalidValue(format!(
                        "interface {} needs both private_pattern and public_ip",
                        entry.name
                    )))
                }
            };
            Ok(NetworkInterface {
                name: entry.name,
                translation,
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.min_port, DEFAULT_MIN_PORT);
        assert_eq!(config.max_port, DEFAULT_MAX_PORT);
        assert!(config.network_interfaces.is_empty());
        assert_eq!(config.media_configuration, DEFAULT_MEDIA_CONFIGURATION);
        assert!(!config.ice_controlling);
        assert!(config.encrypt);
        assert!(config.teardown_on_failure);
        assert_eq!(config.adaptation_sample_interval, Duration::from_secs(1));
        assert_eq!(config.adaptation_tics_per_transition, 10);
        assert_eq!(config.registration_max_attempts, 10);
        assert_eq!(config.registration_retry_delay, Duration::from_secs(1));
        assert!(config.agent_id.starts_with("sfu-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("SFU_AGENT_ID".to_string(), "sfu-custom-001".to_string()),
            ("SFU_MIN_PORT".to_string(), "50000".to_string()),
            ("SFU_MAX_PORT".to_string(), "50100".to_string()),
            ("SFU_MEDIA_CONFIGURATION".to_string(), "vp8-only".to_string()),
            ("SFU_ICE_CONTROLLING".to_string(), "true".to_string()),
            ("SFU_ENCRYPT".to_string(), "false".to_string()),
            ("SFU_TEARDOWN_ON_FAILURE".to_string(), "false".to_string()),
            (
                "SFU_ADAPTATION_SAMPLE_INTERVAL_MS".to_string(),
                "500".to_string(),
            ),
            (
                "SFU_REGISTRATION_MAX_ATTEMPTS".to_string(),
                "3".to_string(),
            ),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.agent_id, "sfu-custom-001");
        assert_eq!(config.min_port, 50000);
        assert_eq!(config.max_port, 50100);
        assert_eq!(config.media_configuration, "vp8-only");
        assert!(config.ice_controlling);
        assert!(!config.encrypt);
        assert!(!config.teardown_on_failure);
        assert_eq!(config.adaptation_sample_interval, Duration::from_millis(500));
        assert_eq!(config.registration_max_attempts, 3);
    }

    #[test]
    fn test_invalid_port_range_rejected() {
        let vars = HashMap::from([
            ("SFU_MIN_PORT".to_string(), "41000".to_string()),
            ("SFU_MAX_PORT".to_string(), "40000".to_string()),
        ]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_malformed_number_rejected() {
        let vars = HashMap::from([("SFU_MIN_PORT".to_string(), "lots".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("SFU_MIN_PORT")));
    }

    #[test]
    fn test_network_interfaces_with_translation() {
        let vars = HashMap::from([(
            "SFU_NETWORK_INTERFACES".to_string(),
            r#"[{"name":"eth0","private_pattern":"10\\.0\\.0\\.\\d+","public_ip":"203.0.113.5"},{"name":"eth1"}]"#
                .to_string(),
        )]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");
        assert_eq!(config.network_interfaces.len(), 2);

        let eth0 = config.interface(Some("eth0")).unwrap();
        let translation = eth0.translation.as_ref().unwrap();
        assert_eq!(
            translation.apply("c=IN IP4 10.0.0.12"),
            "c=IN IP4 203.0.113.5"
        );

        let eth1 = config.interface(Some("eth1")).unwrap();
        assert!(eth1.translation.is_none());

        // Unknown names fall back to the default interface
        assert_eq!(config.interface(Some("wlan9")).unwrap().name, "eth0");
        assert_eq!(config.interface(None).unwrap().name, "eth0");
    }

    #[test]
    fn test_interface_needs_both_translation_fields() {
        let vars = HashMap::from([(
            "SFU_NETWORK_INTERFACES".to_string(),
            r#"[{"name":"eth0","public_ip":"203.0.113.5"}]"#.to_string(),
        )]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
