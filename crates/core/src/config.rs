//! Bootstrap configuration
//!
//! The configuration is a TOML document; every field has a default so an empty
//! file (or no file at all) yields a working configuration for the stock
//! Ubuntu visualization instance.
//!
//! Discovery order used by [`ConfigLoader::discover`]:
//! 1. an explicit path (`--config`)
//! 2. the `FIRSTBOOT_CONFIG` environment variable
//! 3. `/etc/firstboot/config.toml` when it exists
//! 4. built-in defaults

use crate::errors::{BootstrapError, ConfigError, Result};
use crate::retry::{BackoffStrategy, JitterStrategy, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "FIRSTBOOT_CONFIG";

/// Environment variable overriding the session password
pub const PASSWORD_ENV: &str = "FIRSTBOOT_PASSWORD";

/// Default system-wide configuration location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/firstboot/config.toml";

/// Top-level bootstrap configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Directory holding one completion marker per step
    pub state_dir: PathBuf,
    /// Timestamped detail log
    pub log_file: PathBuf,
    /// One-line-per-step summary log
    pub summary_file: PathBuf,
    /// Interactive desktop user
    pub user: String,
    /// Shared secret for the desktop user and the remote session
    pub password: Option<String>,
    /// Minutes before the scheduled finalizing restart
    pub restart_delay_minutes: u32,
    /// Retry policy for transient commands
    pub retry: RetrySettings,
    /// Environment manager and simulation stack
    pub runtime: RuntimeSettings,
    /// Optional shared network filesystem to mount
    pub shared_filesystem: Option<SharedFilesystem>,
    /// Session watcher behavior
    pub watcher: WatcherSettings,
    /// Path the configuration was loaded from, if any
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/firstboot/markers"),
            log_file: PathBuf::from("/var/log/dcv-bootstrap.log"),
            summary_file: PathBuf::from("/var/log/dcv-bootstrap.summary"),
            user: "ubuntu".to_string(),
            password: None,
            restart_delay_minutes: 1,
            retry: RetrySettings::default(),
            runtime: RuntimeSettings::default(),
            shared_filesystem: None,
            watcher: WatcherSettings::default(),
            source: None,
        }
    }
}

/// Retry settings for transient operations (package index refresh, downloads)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after a failed attempt
    pub delay_secs: u64,
    /// Constant or exponential spacing between attempts
    pub backoff: BackoffStrategy,
    /// Cap for exponential backoff
    pub max_delay_secs: u64,
    /// Randomization applied to each delay
    pub jitter: JitterStrategy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_secs: 10,
            backoff: BackoffStrategy::Constant,
            max_delay_secs: 120,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetrySettings {
    /// Build the retry policy used by step actions
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.max_attempts,
            Duration::from_secs(self.delay_secs),
            Duration::from_secs(self.max_delay_secs),
            self.backoff,
            self.jitter,
        )
    }
}

/// Environment manager, isolated environment and simulation stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Installation prefix of the environment manager
    pub conda_prefix: PathBuf,
    /// Name of the isolated runtime environment
    pub env_name: String,
    /// Python version of the isolated environment
    pub python_version: String,
    /// Simulation framework package specifier
    pub isaac_sim_package: String,
    /// Robotics extension repository
    pub isaac_lab_repo: String,
    /// Robotics extension git ref
    pub isaac_lab_ref: String,
    /// Directory the robotics extension is cloned into, `<user home>/IsaacLab` when unset
    pub isaac_lab_dir: Option<PathBuf>,
    /// Asset archive downloaded next to the robotics extension
    pub assets_url: Option<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            conda_prefix: PathBuf::from("/opt/miniconda3"),
            env_name: "isaac".to_string(),
            python_version: "3.10".to_string(),
            isaac_sim_package: "isaacsim[all,extscache]==4.5.0".to_string(),
            isaac_lab_repo: "https://github.com/isaac-sim/IsaacLab.git".to_string(),
            isaac_lab_ref: "v2.1.0".to_string(),
            isaac_lab_dir: None,
            assets_url: None,
        }
    }
}

/// Shared network filesystem mounted after the main pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedFilesystem {
    /// Filesystem identifier (e.g. `fs-0123456789abcdef0`)
    pub file_system_id: String,
    /// Local mount point
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,
}

fn default_mount_point() -> PathBuf {
    PathBuf::from("/mnt/efs")
}

/// Session watcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    /// Systemd service whose active state gates session creation
    pub service: String,
    /// Well-known session identifier
    pub session_id: String,
    /// Session owner; defaults to the bootstrap user
    pub owner: Option<String>,
    /// First poll interval while waiting for the service
    pub poll_interval_secs: u64,
    /// Upper bound for the backed-off poll interval
    pub max_poll_interval_secs: u64,
    /// Give up waiting after this many seconds; 0 waits forever
    pub timeout_secs: u64,
    /// Where the watcher's systemd unit is written
    pub unit_path: PathBuf,
    /// Binary invoked by the unit; defaults to the running executable
    pub binary: Option<PathBuf>,
    /// Best-effort desktop preferences applied after session creation
    pub preferences: Vec<Preference>,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            service: "dcvserver".to_string(),
            session_id: "console".to_string(),
            owner: None,
            poll_interval_secs: 5,
            max_poll_interval_secs: 60,
            timeout_secs: 1800,
            unit_path: PathBuf::from("/etc/systemd/system/dcv-session-watcher.service"),
            binary: None,
            preferences: default_preferences(),
        }
    }
}

impl WatcherSettings {
    /// Poll interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Maximum poll interval as a Duration
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs(self.max_poll_interval_secs)
    }

    /// Wait timeout, `None` when waiting is unbounded
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// A single desktop preference (`gsettings set <schema> <key> <value>`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preference {
    pub schema: String,
    pub key: String,
    pub value: String,
}

impl Preference {
    pub fn new(schema: &str, key: &str, value: &str) -> Self {
        Self {
            schema: schema.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    /// `schema.key` label used in logs and reports
    pub fn label(&self) -> String {
        format!("{}.{}", self.schema, self.key)
    }
}

fn default_preferences() -> Vec<Preference> {
    vec![
        Preference::new("org.gnome.desktop.screensaver", "lock-enabled", "false"),
        Preference::new("org.gnome.desktop.session", "idle-delay", "uint32 0"),
        Preference::new("org.gnome.desktop.lockdown", "disable-lock-screen", "true"),
        Preference::new("org.gnome.desktop.interface", "enable-animations", "false"),
        Preference::new(
            "org.gnome.settings-daemon.plugins.power",
            "sleep-inactive-ac-type",
            "'nothing'",
        ),
    ]
}

impl BootstrapConfig {
    /// Effective session owner
    pub fn session_owner(&self) -> &str {
        self.watcher.owner.as_deref().unwrap_or(&self.user)
    }

    /// Home directory of the bootstrap user
    pub fn user_home(&self) -> PathBuf {
        if self.user == "root" {
            PathBuf::from("/root")
        } else {
            PathBuf::from("/home").join(&self.user)
        }
    }

    /// Directory the robotics extension is cloned into
    pub fn isaac_lab_dir(&self) -> PathBuf {
        self.runtime
            .isaac_lab_dir
            .clone()
            .unwrap_or_else(|| self.user_home().join("IsaacLab"))
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| -> Result<()> {
            Err(BootstrapError::Config(ConfigError::Validation {
                message: message.to_string(),
            }))
        };

        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        if self.user.trim().is_empty() {
            return fail("user must not be empty");
        }
        if self.watcher.session_id.trim().is_empty() {
            return fail("watcher.session_id must not be empty");
        }
        if self.watcher.poll_interval_secs == 0 {
            return fail("watcher.poll_interval_secs must be at least 1");
        }
        if self.watcher.max_poll_interval_secs < self.watcher.poll_interval_secs {
            return fail("watcher.max_poll_interval_secs must not be below poll_interval_secs");
        }
        if let Some(fs) = &self.shared_filesystem {
            if fs.file_system_id.trim().is_empty() {
                return fail("shared_filesystem.file_system_id must not be empty");
            }
        }
        Ok(())
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<BootstrapConfig> {
        let config: BootstrapConfig = toml::from_str(content).map_err(|e| {
            BootstrapError::Config(ConfigError::Parsing {
                message: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path
    #[instrument(fields(path = %path.display()))]
    pub fn load_from_path(path: &Path) -> Result<BootstrapConfig> {
        debug!("Loading bootstrap configuration from {}", path.display());

        if !path.exists() {
            return Err(BootstrapError::Config(ConfigError::NotFound {
                path: path.display().to_string(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            debug!("Failed to read configuration file: {}", e);
            BootstrapError::Config(ConfigError::Io(e))
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Resolve the configuration following the discovery order, then apply
    /// environment overrides.
    pub fn discover(explicit: Option<&Path>) -> Result<BootstrapConfig> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let default_path = Path::new(DEFAULT_CONFIG_PATH);

        let mut config = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::load_from_path(&path)?,
            None if default_path.exists() => Self::load_from_path(default_path)?,
            None => {
                debug!("No configuration file found, using built-in defaults");
                BootstrapConfig::default()
            }
        };

        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.is_empty() {
                debug!("Session password overridden from {}", PASSWORD_ENV);
                config.password = Some(password);
            }
        }

        config.validate()?;
        Ok(config)
    }
}
