use crate::error::ConfigError;
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const MILLIS_PER_HOUR: i64 = 60 * 60 * 1000;
pub const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// Retry backoff after a failed submission: 3 hours.
pub const DEFAULT_RETRY_INTERVAL_MS: i64 = 3 * MILLIS_PER_HOUR;

fn default_timeframe_days() -> i64 {
    1
}

fn default_retry_interval_ms() -> i64 {
    DEFAULT_RETRY_INTERVAL_MS
}

fn default_opt_out_marker() -> PathBuf {
    // Lives outside the agent's private state dir so it survives a data wipe.
    PathBuf::from("/var/lib/.romstats/optout")
}

// ── Build properties / agent config ───────────────────────────────

/// Read-only build configuration for the reporting agent.
///
/// Mirrors the build-time properties a distribution ships: where to report,
/// what the ROM calls itself, and the reporting cadence. An absent or empty
/// `endpoint_url` permanently disables reporting for this build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// State directory - computed from home, not serialized
    #[serde(skip)]
    pub state_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Base URL of the collection endpoint. Empty/absent disables reporting.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// ROM name as shipped in the build properties.
    #[serde(default)]
    pub rom_name: String,

    /// ROM build version string.
    #[serde(default)]
    pub rom_version: String,

    /// Days between checkins once reporting is active.
    #[serde(default = "default_timeframe_days")]
    pub timeframe_days: i64,

    /// Backoff after a failed submission, in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: i64,

    /// Durable opt-out marker path, outside the private state dir.
    #[serde(default = "default_opt_out_marker")]
    pub opt_out_marker: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::new(),
            config_path: PathBuf::new(),
            endpoint_url: None,
            rom_name: String::new(),
            rom_version: String::new(),
            timeframe_days: default_timeframe_days(),
            retry_interval_ms: default_retry_interval_ms(),
            opt_out_marker: default_opt_out_marker(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self, ConfigError> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .ok_or_else(|| ConfigError::Load("could not find home directory".into()))?;
        let stats_dir = home.join(".romstats");
        Self::load_or_init_at(&stats_dir)
    }

    pub fn load_or_init_at(stats_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = stats_dir.join("config.toml");

        if !stats_dir.exists() {
            fs::create_dir_all(stats_dir)?;
        }

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)?;
            let mut config: Config = toml::from_str(&contents)
                .map_err(|e| ConfigError::Load(format!("{}: {e}", config_path.display())))?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path;
            config.state_dir = stats_dir.to_path_buf();
            Ok(config)
        } else {
            let config = Self {
                config_path: config_path.clone(),
                state_dir: stats_dir.to_path_buf(),
                ..Self::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Save(format!("serialize: {e}")))?;
        fs::write(&self.config_path, contents)?;
        Ok(())
    }

    /// Normalized endpoint base: guaranteed trailing `/`, `None` when the
    /// build is not configured for statistics.
    pub fn endpoint_base(&self) -> Option<String> {
        let url = self.endpoint_url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }
        if url.ends_with('/') {
            Some(url.to_string())
        } else {
            Some(format!("{url}/"))
        }
    }

    /// Digest of the currently running ROM version, compared against the
    /// last-reported hash to detect an out-of-cycle update.
    pub fn rom_version_hash(&self) -> String {
        crate::fingerprint::digest(&format!("{}{}", self.rom_name, self.rom_version))
    }

    pub fn update_interval_ms(&self) -> i64 {
        self.timeframe_days.max(1) * MILLIS_PER_DAY
    }
}
