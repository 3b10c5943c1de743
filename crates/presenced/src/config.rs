use chrono::NaiveTime;
use presence_core::ledger::Cutoffs;
use presence_core::{GateMode, ServiceSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which D-Bus bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(ConfigError::Invalid(format!("unknown bus {other:?}"))),
        }
    }
}

/// On-disk form. Every key is optional; unset keys fall through to the
/// environment and then to defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    media_root: Option<PathBuf>,
    tolerance: Option<f64>,
    extract_timeout_secs: Option<u64>,
    extractor_command: Option<Vec<String>>,
    on_time_cutoff: Option<String>,
    late_cutoff: Option<String>,
    token_ttl_hours: Option<i64>,
    dev_mode: Option<bool>,
    admin_pin: Option<String>,
    bus: Option<BusKind>,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root of the image tree (`temp/`, `uploads/`, `subjects/`).
    pub media_root: PathBuf,
    /// Maximum Euclidean distance still counted as a match.
    pub tolerance: f64,
    /// Timeout in seconds for one extractor run.
    pub extract_timeout_secs: u64,
    /// Extractor program followed by its fixed arguments.
    pub extractor_command: Vec<String>,
    pub cutoffs: Cutoffs,
    pub token_ttl_hours: i64,
    /// Accept admin requests that carry no token at all.
    pub dev_mode: bool,
    pub admin_pin: Option<String>,
    pub bus: BusKind,
}

impl Config {
    /// Load `PRESENCE_CONFIG` (if set), then apply `PRESENCE_*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let data_dir = env("PRESENCE_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        let db_path = env("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("presence.db"));

        let media_root = env("PRESENCE_MEDIA_ROOT")
            .map(PathBuf::from)
            .or(file.media_root)
            .unwrap_or_else(|| data_dir.join("media"));

        let extractor_command = env("PRESENCE_EXTRACTOR")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .or(file.extractor_command)
            .unwrap_or_else(|| vec!["presence-extract".to_string()]);

        let on_time = env("PRESENCE_ON_TIME_CUTOFF")
            .or(file.on_time_cutoff)
            .map(|v| parse_time("on-time cutoff", &v))
            .transpose()?;
        let late = env("PRESENCE_LATE_CUTOFF")
            .or(file.late_cutoff)
            .map(|v| parse_time("late cutoff", &v))
            .transpose()?;
        let defaults = Cutoffs::default();
        let cutoffs = Cutoffs::new(
            on_time.unwrap_or(defaults.on_time),
            late.unwrap_or(defaults.late),
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let bus = match env("PRESENCE_BUS") {
            Some(v) => v.parse()?,
            None => file.bus.unwrap_or_default(),
        };

        let dev_mode = match env("PRESENCE_DEV_MODE") {
            Some(v) => parse_switch("PRESENCE_DEV_MODE", &v)?,
            None => file.dev_mode.unwrap_or(false),
        };

        let config = Self {
            db_path,
            media_root,
            tolerance: env_parse(&env, "PRESENCE_TOLERANCE")
                .or(file.tolerance)
                .unwrap_or(presence_core::matcher::DEFAULT_TOLERANCE),
            extract_timeout_secs: env_parse(&env, "PRESENCE_EXTRACT_TIMEOUT_SECS")
                .or(file.extract_timeout_secs)
                .unwrap_or(10),
            extractor_command,
            cutoffs,
            token_ttl_hours: env_parse(&env, "PRESENCE_TOKEN_TTL_HOURS")
                .or(file.token_ttl_hours)
                .unwrap_or(presence_core::session::DEFAULT_TOKEN_TTL_HOURS),
            dev_mode,
            admin_pin: env("PRESENCE_ADMIN_PIN")
                .or(file.admin_pin)
                .filter(|p| !p.is_empty()),
            bus,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.extract_timeout_secs == 0 {
            return Err(ConfigError::Invalid("extraction timeout must be at least 1s".into()));
        }
        if self.token_ttl_hours <= 0 {
            return Err(ConfigError::Invalid("token TTL must be positive".into()));
        }
        if self.extractor_command.is_empty() {
            return Err(ConfigError::Invalid("extractor command is empty".into()));
        }
        Ok(())
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn gate_mode(&self) -> GateMode {
        if self.dev_mode {
            GateMode::Development
        } else {
            GateMode::Enforcing
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        let mut settings = ServiceSettings::new(&self.media_root);
        settings.cutoffs = self.cutoffs;
        settings.tolerance = self.tolerance;
        settings.extract_timeout = self.extract_timeout();
        settings.gate_mode = self.gate_mode();
        settings.token_ttl = chrono::Duration::hours(self.token_ttl_hours);
        settings.admin_pin = self.admin_pin.clone();
        settings
    }
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Strict boolean: anything but an explicit on/off spelling is an error.
fn parse_switch(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!(
            "{key} must be one of 1/true/yes/on or 0/false/no/off, got {value:?}"
        ))),
    }
}

fn parse_time(what: &str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ConfigError::Invalid(format!("{what} {value:?} is not HH:MM")))
}
