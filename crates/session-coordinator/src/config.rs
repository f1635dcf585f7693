//! Session coordinator configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::quality::QualitySettings;
use crate::registry::RegistrySettings;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:8443";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default media engine request timeout in milliseconds.
pub const DEFAULT_MEDIA_ENGINE_TIMEOUT_MS: u64 = 5000;

/// Default maximum concurrent rooms.
pub const DEFAULT_MAX_ROOMS: usize = 1000;

/// Default per-room participant cap when the class record sets none.
pub const DEFAULT_MAX_PARTICIPANTS_PER_ROOM: usize = 500;

/// Default periodic producer list interval in seconds.
pub const DEFAULT_PRODUCER_LIST_INTERVAL_SECONDS: u64 = 10;

/// Default lifetime of a recently-closed producer marker in seconds.
pub const DEFAULT_RECENTLY_CLOSED_TTL_SECONDS: u64 = 10;

/// Default quality sampling interval in seconds.
pub const DEFAULT_QUALITY_SAMPLE_INTERVAL_SECONDS: u64 = 5;

/// Default cooldown before an auto-paused consumer is resumed, in seconds.
pub const DEFAULT_CONSUMER_PAUSE_COOLDOWN_SECONDS: u64 = 10;

/// Default packet loss fraction that marks a consumer link as degraded.
pub const DEFAULT_PACKET_LOSS_THRESHOLD: f64 = 0.05;

/// Default jitter that marks a consumer link as degraded, in milliseconds.
pub const DEFAULT_JITTER_THRESHOLD_MS: f64 = 30.0;

/// Default coordinator instance ID prefix.
pub const DEFAULT_COORDINATOR_ID_PREFIX: &str = "sc";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidValue(format!(
                "SC_LOG_FORMAT must be 'text' or 'json', got '{other}'"
            ))),
        }
    }
}

/// Room actor timing and capacity settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Participant cap applied when the class record sets none.
    pub max_participants: usize,
    /// Whether rooms without a class record require approval.
    pub approval_required_default: bool,
    /// Periodic authoritative producer list interval.
    pub producer_list_interval: Duration,
    /// Lifetime of a recently-closed producer marker.
    pub recently_closed_ttl: Duration,
}

/// Session coordinator configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Signaling WebSocket bind address (default: "0.0.0.0:8443").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Base URL of the media engine sidecar.
    pub media_engine_url: String,

    /// Per-request media engine timeout.
    pub media_engine_timeout_ms: u64,

    /// Redis connection URL for class records and room projections.
    /// `None` selects the in-memory store.
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: Option<SecretString>,

    /// Unique identifier for this coordinator instance.
    pub coordinator_id: String,

    /// Maximum concurrent rooms.
    pub max_rooms: usize,

    /// Per-room participant cap when the class record sets none.
    pub max_participants_per_room: usize,

    /// Approval requirement for rooms without a class record.
    pub approval_required_default: bool,

    pub producer_list_interval_seconds: u64,

    pub recently_closed_ttl_seconds: u64,

    pub quality_sample_interval_seconds: u64,

    pub consumer_pause_cooldown_seconds: u64,

    /// Packet loss fraction in (0, 1] above which a consumer is paused.
    pub packet_loss_threshold: f64,

    /// Jitter in milliseconds above which a consumer is paused.
    pub jitter_threshold_ms: f64,

    pub log_format: LogFormat,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("media_engine_url", &self.media_engine_url)
            .field("media_engine_timeout_ms", &self.media_engine_timeout_ms)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("coordinator_id", &self.coordinator_id)
            .field("max_rooms", &self.max_rooms)
            .field("max_participants_per_room", &self.max_participants_per_room)
            .field("approval_required_default", &self.approval_required_default)
            .field(
                "producer_list_interval_seconds",
                &self.producer_list_interval_seconds,
            )
            .field(
                "recently_closed_ttl_seconds",
                &self.recently_closed_ttl_seconds,
            )
            .field(
                "quality_sample_interval_seconds",
                &self.quality_sample_interval_seconds,
            )
            .field(
                "consumer_pause_cooldown_seconds",
                &self.consumer_pause_cooldown_seconds,
            )
            .field("packet_loss_threshold", &self.packet_loss_threshold)
            .field("jitter_threshold_ms", &self.jitter_threshold_ms)
            .field("log_format", &self.log_format)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, falling back to `default` when unset.
///
/// A set but unparsable value is an error rather than a silent default.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{name} has an unparsable value '{raw}'"))
        }),
    }
}

fn parse_interval(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let value = parse_var(vars, name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let media_engine_url = vars
            .get("SC_MEDIA_ENGINE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("SC_MEDIA_ENGINE_URL".to_string()))?
            .trim()
            .to_string();
        if !(media_engine_url.starts_with("http://") || media_engine_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidValue(
                "SC_MEDIA_ENGINE_URL must be an http(s) URL".to_string(),
            ));
        }

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| SecretString::from(url.clone()));

        let signaling_bind_address = vars
            .get("SC_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let media_engine_timeout_ms = parse_interval(
            vars,
            "SC_MEDIA_ENGINE_TIMEOUT_MS",
            DEFAULT_MEDIA_ENGINE_TIMEOUT_MS,
        )?;

        // Capacity limits
        let max_rooms = parse_var(vars, "SC_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;
        let max_participants_per_room = parse_var(
            vars,
            "SC_MAX_PARTICIPANTS_PER_ROOM",
            DEFAULT_MAX_PARTICIPANTS_PER_ROOM,
        )?;
        if max_rooms == 0 || max_participants_per_room == 0 {
            return Err(ConfigError::InvalidValue(
                "capacity limits must be greater than zero".to_string(),
            ));
        }

        let approval_required_default = parse_var(vars, "SC_APPROVAL_REQUIRED_DEFAULT", true)?;

        // Room and quality timing
        let producer_list_interval_seconds = parse_interval(
            vars,
            "SC_PRODUCER_LIST_INTERVAL_SECONDS",
            DEFAULT_PRODUCER_LIST_INTERVAL_SECONDS,
        )?;
        let recently_closed_ttl_seconds = parse_interval(
            vars,
            "SC_RECENTLY_CLOSED_TTL_SECONDS",
            DEFAULT_RECENTLY_CLOSED_TTL_SECONDS,
        )?;
        let quality_sample_interval_seconds = parse_interval(
            vars,
            "SC_QUALITY_SAMPLE_INTERVAL_SECONDS",
            DEFAULT_QUALITY_SAMPLE_INTERVAL_SECONDS,
        )?;
        let consumer_pause_cooldown_seconds = parse_interval(
            vars,
            "SC_CONSUMER_PAUSE_COOLDOWN_SECONDS",
            DEFAULT_CONSUMER_PAUSE_COOLDOWN_SECONDS,
        )?;

        let packet_loss_threshold = parse_var(
            vars,
            "SC_PACKET_LOSS_THRESHOLD",
            DEFAULT_PACKET_LOSS_THRESHOLD,
        )?;
        if !(packet_loss_threshold > 0.0 && packet_loss_threshold <= 1.0) {
            return Err(ConfigError::InvalidValue(format!(
                "SC_PACKET_LOSS_THRESHOLD must be in (0, 1], got {packet_loss_threshold}"
            )));
        }

        let jitter_threshold_ms =
            parse_var(vars, "SC_JITTER_THRESHOLD_MS", DEFAULT_JITTER_THRESHOLD_MS)?;
        if !(jitter_threshold_ms.is_finite() && jitter_threshold_ms > 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "SC_JITTER_THRESHOLD_MS must be positive, got {jitter_threshold_ms}"
            )));
        }

        let log_format = match vars.get("SC_LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => LogFormat::default(),
        };

        // Generate coordinator instance ID
        let coordinator_id = vars.get("SC_COORDINATOR_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_COORDINATOR_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            media_engine_url,
            media_engine_timeout_ms,
            redis_url,
            coordinator_id,
            max_rooms,
            max_participants_per_room,
            approval_required_default,
            producer_list_interval_seconds,
            recently_closed_ttl_seconds,
            quality_sample_interval_seconds,
            consumer_pause_cooldown_seconds,
            packet_loss_threshold,
            jitter_threshold_ms,
            log_format,
        })
    }

    /// Settings handed to every room actor.
    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            max_participants: self.max_participants_per_room,
            approval_required_default: self.approval_required_default,
            producer_list_interval: Duration::from_secs(self.producer_list_interval_seconds),
            recently_closed_ttl: Duration::from_secs(self.recently_closed_ttl_seconds),
        }
    }

    /// Settings handed to every quality adapter.
    pub fn quality_settings(&self) -> QualitySettings {
        QualitySettings {
            sample_interval: Duration::from_secs(self.quality_sample_interval_seconds),
            pause_cooldown: Duration::from_secs(self.consumer_pause_cooldown_seconds),
            packet_loss_threshold: self.packet_loss_threshold,
            jitter_threshold_ms: self.jitter_threshold_ms,
        }
    }

    /// Settings for the room registry.
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            max_rooms: self.max_rooms,
            room: self.room_settings(),
            quality: self.quality_settings(),
        }
    }

    /// Media engine request timeout.
    pub fn media_engine_timeout(&self) -> Duration {
        Duration::from_millis(self.media_engine_timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "SC_MEDIA_ENGINE_URL".to_string(),
            "http://media-engine:3000".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = base_vars();

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.media_engine_url, "http://media-engine:3000");
        assert_eq!(config.media_engine_timeout_ms, DEFAULT_MEDIA_ENGINE_TIMEOUT_MS);
        assert!(config.redis_url.is_none());
        assert_eq!(config.max_rooms, DEFAULT_MAX_ROOMS);
        assert_eq!(
            config.max_participants_per_room,
            DEFAULT_MAX_PARTICIPANTS_PER_ROOM
        );
        assert!(config.approval_required_default);
        assert_eq!(config.producer_list_interval_seconds, 10);
        assert_eq!(config.recently_closed_ttl_seconds, 10);
        assert_eq!(config.quality_sample_interval_seconds, 5);
        assert_eq!(config.consumer_pause_cooldown_seconds, 10);
        assert!((config.packet_loss_threshold - 0.05).abs() < f64::EPSILON);
        assert!((config.jitter_threshold_ms - 30.0).abs() < f64::EPSILON);
        assert_eq!(config.log_format, LogFormat::Text);
        // Coordinator ID should be auto-generated
        assert!(config.coordinator_id.starts_with("sc-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "SC_SIGNALING_BIND_ADDRESS".to_string(),
            "127.0.0.1:9443".to_string(),
        );
        vars.insert("REDIS_URL".to_string(), "redis://cache:6379".to_string());
        vars.insert("SC_MAX_ROOMS".to_string(), "20".to_string());
        vars.insert("SC_MAX_PARTICIPANTS_PER_ROOM".to_string(), "300".to_string());
        vars.insert("SC_APPROVAL_REQUIRED_DEFAULT".to_string(), "false".to_string());
        vars.insert("SC_PACKET_LOSS_THRESHOLD".to_string(), "0.1".to_string());
        vars.insert("SC_LOG_FORMAT".to_string(), "JSON".to_string());
        vars.insert("SC_COORDINATOR_ID".to_string(), "sc-custom-001".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:9443");
        assert_eq!(
            config.redis_url.as_ref().map(|u| u.expose_secret().to_string()),
            Some("redis://cache:6379".to_string())
        );
        assert_eq!(config.max_rooms, 20);
        assert_eq!(config.max_participants_per_room, 300);
        assert!(!config.approval_required_default);
        assert!((config.packet_loss_threshold - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.coordinator_id, "sc-custom-001");
    }

    #[test]
    fn test_from_vars_missing_media_engine_url() {
        let result = Config::from_vars(&HashMap::new());
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "SC_MEDIA_ENGINE_URL")
        );
    }

    #[test]
    fn test_rejects_non_http_media_engine_url() {
        let mut vars = base_vars();
        vars.insert(
            "SC_MEDIA_ENGINE_URL".to_string(),
            "media-engine:3000".to_string(),
        );
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_rejects_unparsable_and_zero_values() {
        let cases = [
            ("SC_MAX_ROOMS", "lots"),
            ("SC_PRODUCER_LIST_INTERVAL_SECONDS", "0"),
            ("SC_QUALITY_SAMPLE_INTERVAL_SECONDS", "-5"),
            ("SC_APPROVAL_REQUIRED_DEFAULT", "maybe"),
            ("SC_PACKET_LOSS_THRESHOLD", "1.5"),
            ("SC_PACKET_LOSS_THRESHOLD", "0"),
            ("SC_JITTER_THRESHOLD_MS", "-1"),
            ("SC_LOG_FORMAT", "xml"),
        ];

        for (name, value) in cases {
            let mut vars = base_vars();
            vars.insert(name.to_string(), value.to_string());
            assert!(
                matches!(Config::from_vars(&vars), Err(ConfigError::InvalidValue(_))),
                "{name}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_derived_settings() {
        let mut vars = base_vars();
        vars.insert("SC_RECENTLY_CLOSED_TTL_SECONDS".to_string(), "15".to_string());
        vars.insert("SC_CONSUMER_PAUSE_COOLDOWN_SECONDS".to_string(), "20".to_string());
        let config = Config::from_vars(&vars).unwrap();

        let room = config.room_settings();
        assert_eq!(room.recently_closed_ttl, Duration::from_secs(15));
        assert_eq!(room.producer_list_interval, Duration::from_secs(10));

        let quality = config.quality_settings();
        assert_eq!(quality.pause_cooldown, Duration::from_secs(20));
        assert_eq!(quality.sample_interval, Duration::from_secs(5));
        assert_eq!(config.media_engine_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let mut vars = base_vars();
        vars.insert(
            "REDIS_URL".to_string(),
            "redis://:hunter2@cache:6379".to_string(),
        );
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
    }
}
