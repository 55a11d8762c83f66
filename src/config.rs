//! Server Configuration
//!
//! Plain structs with defaults. The binary fills them from command-line
//! flags through [`ServerConfig::set`], which takes option names without the
//! leading dashes (`port`, `appendfsync`, ...).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Descriptors reserved on top of `maxclients` for listeners, log files and
/// rewrite pipes.
pub const RESERVED_FDS: usize = 128;

/// Errors produced while applying configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("invalid value '{value}' for '{option}'")]
    InvalidValue { option: String, value: String },
}

/// When the append-only log is fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// After every flush, synchronously. Failures are fatal.
    Always,
    /// At most once per second, on the background pool.
    #[default]
    EverySec,
    /// Left to the operating system.
    No,
}

impl FromStr for FsyncPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "no" => Ok(FsyncPolicy::No),
            _ => Err(()),
        }
    }
}

impl fmt::Display for FsyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsyncPolicy::Always => "always",
            FsyncPolicy::EverySec => "everysec",
            FsyncPolicy::No => "no",
        };
        f.write_str(name)
    }
}

/// Append-only log settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AofConfig {
    pub enabled: bool,
    pub filename: String,
    pub fsync: FsyncPolicy,
    /// Skip fsyncs while a rewrite child is alive.
    pub no_fsync_on_rewrite: bool,
    /// Truncate an incomplete trailing record on load instead of failing.
    pub load_truncated: bool,
    /// Capacity of one rewrite-buffer block.
    pub rewrite_block_size: usize,
    /// Maximum elements emitted per reconstruction command.
    pub rewrite_items_per_cmd: usize,
    pub auto_rewrite_percentage: u64,
    pub auto_rewrite_min_size: u64,
    /// Fsync the rewrite temp file every 32 MiB written.
    pub rewrite_incremental_fsync: bool,
    /// Start rewritten logs with a snapshot blob.
    pub use_snapshot_preamble: bool,
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            filename: "appendonly.aof".to_string(),
            fsync: FsyncPolicy::EverySec,
            no_fsync_on_rewrite: false,
            load_truncated: true,
            rewrite_block_size: 10 * 1024 * 1024,
            rewrite_items_per_cmd: 64,
            auto_rewrite_percentage: 100,
            auto_rewrite_min_size: 64 * 1024 * 1024,
            rewrite_incremental_fsync: true,
            use_snapshot_preamble: false,
        }
    }
}

/// Top-level server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub databases: usize,
    /// Cron frequency in calls per second.
    pub hz: u32,
    pub maxclients: usize,
    /// Working directory for the append-only log and rewrite temp files.
    pub dir: PathBuf,
    pub activerehashing: bool,
    pub aof: AofConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            databases: 16,
            hz: 10,
            maxclients: 10_000,
            dir: PathBuf::from("."),
            activerehashing: true,
            aof: AofConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Descriptor capacity handed to the reactor.
    pub fn setsize(&self) -> usize {
        self.maxclients + RESERVED_FDS
    }

    /// Milliseconds between cron runs.
    pub fn cron_period_ms(&self) -> u64 {
        1000 / u64::from(self.hz.clamp(1, 500))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Path of the active append-only log.
    pub fn aof_path(&self) -> PathBuf {
        self.dir.join(&self.aof.filename)
    }

    /// Applies one option by name.
    ///
    /// # Example
    ///
    /// ```
    /// use emberkv::config::{FsyncPolicy, ServerConfig};
    ///
    /// let mut config = ServerConfig::default();
    /// config.set("appendfsync", "always").unwrap();
    /// config.set("port", "7000").unwrap();
    /// assert_eq!(config.aof.fsync, FsyncPolicy::Always);
    /// assert_eq!(config.port, 7000);
    /// assert!(config.set("port", "seventy").is_err());
    /// ```
    pub fn set(&mut self, option: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            option: option.to_string(),
            value: value.to_string(),
        };

        match option.to_ascii_lowercase().as_str() {
            "host" => self.host = value.to_string(),
            "port" => self.port = value.parse().map_err(|_| invalid())?,
            "dir" => self.dir = PathBuf::from(value),
            "databases" => {
                self.databases = value.parse().ok().filter(|&n| n > 0).ok_or_else(invalid)?;
            }
            "hz" => self.hz = value.parse().ok().filter(|&n| n > 0).ok_or_else(invalid)?,
            "maxclients" => {
                self.maxclients = value.parse().ok().filter(|&n| n > 0).ok_or_else(invalid)?;
            }
            "activerehashing" => self.activerehashing = parse_yes_no(value).ok_or_else(invalid)?,
            "appendonly" => self.aof.enabled = parse_yes_no(value).ok_or_else(invalid)?,
            "appendfilename" => {
                if value.is_empty() || value.contains('/') {
                    return Err(invalid());
                }
                self.aof.filename = value.to_string();
            }
            "appendfsync" => self.aof.fsync = value.parse().map_err(|_| invalid())?,
            "no-appendfsync-on-rewrite" => {
                self.aof.no_fsync_on_rewrite = parse_yes_no(value).ok_or_else(invalid)?;
            }
            "aof-load-truncated" => self.aof.load_truncated = parse_yes_no(value).ok_or_else(invalid)?,
            "auto-aof-rewrite-percentage" => {
                self.aof.auto_rewrite_percentage = value.parse().map_err(|_| invalid())?;
            }
            "auto-aof-rewrite-min-size" => {
                self.aof.auto_rewrite_min_size = value.parse().map_err(|_| invalid())?;
            }
            "aof-rewrite-incremental-fsync" => {
                self.aof.rewrite_incremental_fsync = parse_yes_no(value).ok_or_else(invalid)?;
            }
            "aof-rewrite-block-size" => {
                self.aof.rewrite_block_size = value.parse().ok().filter(|&n| n > 0).ok_or_else(invalid)?;
            }
            "aof-rewrite-items-per-cmd" => {
                self.aof.rewrite_items_per_cmd = value.parse().ok().filter(|&n| n > 0).ok_or_else(invalid)?;
            }
            _ => return Err(ConfigError::UnknownOption(option.to_string())),
        }
        Ok(())
    }
}

/// Parses `yes`/`no`, case-insensitively.
pub fn parse_yes_no(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if value.eq_ignore_ascii_case("no") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 6379);
        assert_eq!(config.databases, 16);
        assert_eq!(config.setsize(), 10_128);
        assert_eq!(config.cron_period_ms(), 100);
        assert!(!config.aof.enabled);
        assert_eq!(config.aof.fsync, FsyncPolicy::EverySec);
        assert_eq!(config.aof.rewrite_block_size, 10 * 1024 * 1024);
        assert_eq!(config.aof.rewrite_items_per_cmd, 64);
        assert_eq!(config.aof_path(), PathBuf::from("./appendonly.aof"));
    }

    #[test]
    fn test_set_aof_options() {
        let mut config = ServerConfig::default();
        config.set("appendonly", "yes").unwrap();
        config.set("appendfsync", "NO").unwrap();
        config.set("aof-load-truncated", "no").unwrap();
        config.set("no-appendfsync-on-rewrite", "yes").unwrap();
        config.set("appendfilename", "log.aof").unwrap();

        assert!(config.aof.enabled);
        assert_eq!(config.aof.fsync, FsyncPolicy::No);
        assert!(!config.aof.load_truncated);
        assert!(config.aof.no_fsync_on_rewrite);
        assert_eq!(config.aof.filename, "log.aof");
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = ServerConfig::default();
        assert!(matches!(
            config.set("appendonly", "maybe"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(config.set("hz", "0").is_err());
        assert!(config.set("appendfilename", "../escape.aof").is_err());
        assert_eq!(
            config.set("bogus", "1"),
            Err(ConfigError::UnknownOption("bogus".to_string()))
        );
    }

    #[test]
    fn test_fsync_policy_display_roundtrip() {
        for policy in [FsyncPolicy::Always, FsyncPolicy::EverySec, FsyncPolicy::No] {
            assert_eq!(policy.to_string().parse::<FsyncPolicy>(), Ok(policy));
        }
    }
}
