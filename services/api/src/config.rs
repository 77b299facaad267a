use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Settings of the remote recognition engine.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub api_key: String,
    pub url: String,
    pub model: String,
    pub language: String,
    pub sample_rate: u32,
}

/// Limits and deadlines applied to every client connection.
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub max_frame_bytes: usize,
    pub outbound_queue: usize,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: 512 * 1024,
            outbound_queue: 256,
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub jwt_secret: String,
    pub engine: EngineSettings,
    pub connection: ConnectionSettings,
    pub speech_init_timeout: Duration,
    pub metrics_interval: Duration,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_secs(name: &str, default: u64) -> Result<Duration, ConfigError> {
    let secs = parse_var(name, default)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
}

fn required_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let jwt_secret = required_var("AUTH_JWT_SECRET")?;

        let engine = EngineSettings {
            api_key: required_var("DEEPGRAM_API_KEY")?,
            url: std::env::var("DEEPGRAM_URL")
                .unwrap_or_else(|_| "wss://api.deepgram.com/v1/listen".to_string()),
            model: std::env::var("ASR_MODEL").unwrap_or_else(|_| "nova-2".to_string()),
            language: std::env::var("ASR_LANGUAGE").unwrap_or_else(|_| "en-US".to_string()),
            sample_rate: parse_var("ASR_SAMPLE_RATE", 16000u32)?,
        };

        let defaults = ConnectionSettings::default();
        let connection = ConnectionSettings {
            max_frame_bytes: parse_var("WS_MAX_FRAME_BYTES", defaults.max_frame_bytes)?,
            outbound_queue: parse_var("WS_OUTBOUND_QUEUE", defaults.outbound_queue)?,
            write_timeout: parse_secs("WS_WRITE_TIMEOUT_SECS", 10)?,
            ping_interval: parse_secs("WS_PING_INTERVAL_SECS", 54)?,
            pong_wait: parse_secs("WS_PONG_WAIT_SECS", 60)?,
        };
        if connection.outbound_queue == 0 {
            return Err(ConfigError::InvalidValue(
                "WS_OUTBOUND_QUEUE".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if connection.pong_wait <= connection.ping_interval {
            return Err(ConfigError::InvalidValue(
                "WS_PONG_WAIT_SECS".to_string(),
                "must be longer than WS_PING_INTERVAL_SECS".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            log_level,
            jwt_secret,
            engine,
            connection,
            speech_init_timeout: parse_secs("SPEECH_INIT_TIMEOUT_SECS", 5)?,
            metrics_interval: parse_secs("METRICS_INTERVAL_SECS", 15)?,
        })
    }
}
