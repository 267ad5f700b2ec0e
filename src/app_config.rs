//! Application configuration.
//!
//! Settings come from a TOML file with CLI overrides layered on top.
//! Server identity (`account`/`container`/`cloud-suffix`) is validated
//! against the endpoint naming rules before anything touches the network.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use bytesize::ByteSize;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::fs::client::{ClientConfig, LookupCachePolicy};
use crate::term;

/// A `PathBuf` that expands `~` to the user's home directory during
/// deserialization, so every path loaded from configuration is already
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ExpandedPathBuf(PathBuf);

impl<'de> Deserialize<'de> for ExpandedPathBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let expanded = shellexpand::tilde(&raw);
        Ok(Self(PathBuf::from(expanded.into_owned())))
    }
}

impl ExpandedPathBuf {
    /// Wrap an already-resolved path without expansion.
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }
}

impl std::ops::Deref for ExpandedPathBuf {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for ExpandedPathBuf {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for ExpandedPathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.display().fmt(f)
    }
}

fn runtime_dir() -> Option<PathBuf> {
    if let Some(path) = dirs::runtime_dir() {
        return Some(path.join("nfs-fs"));
    }
    dirs::home_dir().map(|p| p.join(".local").join("share").join("nfs-fs"))
}

fn default_pid_file() -> ExpandedPathBuf {
    ExpandedPathBuf::new(runtime_dir().map_or_else(
        || PathBuf::from("/var/run/nfs-fs.pid"),
        |rd| rd.join("nfs-fs.pid"),
    ))
}

fn default_mount_point() -> ExpandedPathBuf {
    ExpandedPathBuf::new(
        runtime_dir().map_or_else(|| PathBuf::from("/tmp/nfs-fs/mnt"), |rd| rd.join("mnt")),
    )
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

/// Where daemon logs should be written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogTarget {
    /// Write logs to stdout (default for foreground mode).
    #[default]
    Stdout,
    /// Write logs to stderr.
    Stderr,
    /// Write logs to a file at the given path.
    File(PathBuf),
}

impl LogTarget {
    /// Opens the log file for the daemon, if this target is [`LogTarget::File`].
    pub fn open_log_file(&self) -> Result<Option<std::fs::File>, std::io::Error> {
        match self {
            Self::Stdout | Self::Stderr => Ok(None),
            Self::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Ok(Some(file))
            }
        }
    }
}

/// Controls whether ANSI color codes are included in log output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorMode {
    /// Auto-detect: enable color for terminals, disable for files and pipes.
    #[default]
    Auto,
    /// Always include ANSI color codes.
    Always,
    /// Never include ANSI color codes.
    Never,
}

/// Logging configuration for the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogConfig {
    /// Where to write log output.
    pub target: LogTarget,

    /// Whether to include ANSI color in log output.
    pub color: ColorMode,
}

impl LogConfig {
    /// Whether ANSI color codes should be used for the configured target.
    pub fn should_use_color(&self) -> bool {
        match self.color {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => match self.target {
                LogTarget::Stdout => term::should_use_color(&std::io::stdout()),
                LogTarget::Stderr => term::should_use_color(&std::io::stderr()),
                LogTarget::File(_) => false,
            },
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// PID file path.
    #[serde(default = "default_pid_file")]
    pub pid_file: ExpandedPathBuf,

    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log: LogConfig::default(),
        }
    }
}

/// DNLC policy mount option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookupCache {
    /// Cache positive and negative lookups.
    #[default]
    All,
    /// Cache nothing.
    None,
    /// Cache only positive lookups.
    Pos,
    /// Alias of `pos`.
    Positive,
}

impl From<LookupCache> for LookupCachePolicy {
    fn from(l: LookupCache) -> Self {
        match l {
            LookupCache::All => Self::All,
            LookupCache::None => Self::Off,
            LookupCache::Pos | LookupCache::Positive => Self::Positive,
        }
    }
}

/// Attribute-revalidation aggressiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Consistency {
    /// This client is the only writer; cached state is trusted for long.
    Solowriter,
    /// Close-to-open consistency as regular NFS clients provide.
    #[default]
    Standardnfs,
    /// Multiple parallel accessors; cache barely.
    Azurempa,
}

impl Consistency {
    /// Default attribute timeout, used when `actimeo` is not set.
    fn default_actimeo(self) -> u64 {
        match self {
            Self::Solowriter => 3600,
            Self::Standardnfs => 60,
            Self::Azurempa => 1,
        }
    }
}

fn default_nconnect() -> u32 {
    1
}

fn default_readahead_kb() -> u64 {
    16384
}

fn default_port() -> u16 {
    2049
}

fn default_cloud_suffix() -> String {
    "blob.core.windows.net".to_owned()
}

fn default_dircache_max() -> ByteSize {
    ByteSize::gib(1)
}

/// Application configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Storage account name.
    pub account: String,

    /// Container (the export) under the account.
    pub container: String,

    /// Endpoint suffix of the cloud the account lives in.
    #[serde(default = "default_cloud_suffix")]
    pub cloud_suffix: String,

    /// NFS port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of parallel RPC connections.
    #[serde(default = "default_nconnect")]
    pub nconnect: u32,

    /// Per-file readahead window in KiB.
    #[serde(default = "default_readahead_kb")]
    pub readahead_kb: u64,

    /// Attribute and directory-cache timeout in seconds. Defaults follow
    /// the consistency mode.
    #[serde(default)]
    pub actimeo: Option<u64>,

    /// DNLC policy.
    #[serde(default)]
    pub lookupcache: LookupCache,

    /// Attribute-revalidation aggressiveness.
    #[serde(default)]
    pub consistency: Consistency,

    /// Optional directory for surrounding components' disk cache. The
    /// client core does not interpret it.
    #[serde(default)]
    pub cachedir: Option<ExpandedPathBuf>,

    /// Soft cap on each directory's entry cache.
    #[serde(default = "default_dircache_max")]
    pub dircache_max_size: ByteSize,

    /// Where to mount the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: ExpandedPathBuf,

    /// User to mount as. Defaults to the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// Group to mount as. Defaults to the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,

    /// Daemon configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "no configuration file found and no account/container given on the command line; \
         tried {0:?}"
    )]
    NoConfigFound(Vec<PathBuf>),
}

#[expect(clippy::expect_used, reason = "patterns are literals")]
fn account_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]{3,24}$").expect("valid regex"))
}

#[expect(clippy::expect_used, reason = "patterns are literals")]
fn container_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]{1,61}[a-z0-9]$").expect("valid regex"))
}

#[expect(clippy::expect_used, reason = "patterns are literals")]
fn cloud_suffix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(z[0-9]+\.)?(privatelink\.)?blob(\.preprod)?\.core\.(windows\.net|usgovcloudapi\.net|chinacloudapi\.cn)$",
        )
        .expect("valid regex")
    })
}

/// Account names are lowercase alphanumeric, 3-24 characters.
pub fn is_valid_account(account: &str) -> bool {
    account_regex().is_match(account)
}

/// Container names are lowercase alphanumeric with interior dashes, 3-63
/// characters, and never contain a dash run.
pub fn is_valid_container(container: &str) -> bool {
    container_regex().is_match(container) && !container.contains("--")
}

/// Endpoint suffixes must match one of the known cloud patterns.
pub fn is_valid_cloud_suffix(suffix: &str) -> bool {
    cloud_suffix_regex().is_match(suffix)
}

/// A cachedir must exist, be a directory, and admit a probe file.
pub fn is_valid_cachedir(cachedir: &Path) -> bool {
    if !cachedir.is_dir() {
        return false;
    }
    let probe = cachedir.join(".probe");
    match std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

impl Config {
    /// Host half of the NFS endpoint.
    pub fn server(&self) -> String {
        format!("{}.{}", self.account, self.cloud_suffix)
    }

    /// Export path for the MOUNT call.
    pub fn export(&self) -> String {
        format!("/{}/{}", self.account, self.container)
    }

    /// Effective attribute timeout: explicit `actimeo`, otherwise the
    /// consistency-mode default.
    pub fn effective_actimeo(&self) -> Duration {
        Duration::from_secs(
            self.actimeo
                .unwrap_or_else(|| self.consistency.default_actimeo()),
        )
    }

    /// The client-core tunables derived from this configuration.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            actimeo: self.effective_actimeo(),
            readahead_kib: self.readahead_kb,
            lookup_cache: self.lookupcache.into(),
            dircache_max_bytes: self.dircache_max_size.as_u64(),
        }
    }

    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !is_valid_account(&self.account) {
            errors.push(format!(
                "account '{}' must be 3-24 lowercase alphanumeric characters",
                self.account
            ));
        }
        if !is_valid_container(&self.container) {
            errors.push(format!(
                "container '{}' must be 3-63 lowercase alphanumeric-with-dashes characters \
                 without '--'",
                self.container
            ));
        }
        if !is_valid_cloud_suffix(&self.cloud_suffix) {
            errors.push(format!("unrecognized cloud suffix '{}'", self.cloud_suffix));
        }
        if !(1..=16).contains(&self.nconnect) {
            errors.push(format!("nconnect {} outside 1..=16", self.nconnect));
        }
        if !(128..=1024 * 1024).contains(&self.readahead_kb) {
            errors.push(format!(
                "readahead-kb {} outside 128..=1048576",
                self.readahead_kb
            ));
        }
        if let Some(cachedir) = &self.cachedir {
            if !is_valid_cachedir(cachedir) {
                errors.push(format!("cachedir '{cachedir}' is not a writable directory"));
            }
        }
        if self.daemon.pid_file.parent().is_none() {
            errors.push(format!(
                "PID file path '{}' has no parent directory",
                self.daemon.pid_file
            ));
        }
        if let LogTarget::File(path) = &self.daemon.log.target {
            if path.as_os_str().is_empty() {
                errors.push("log file path must not be empty".to_owned());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Config file paths in descending priority order.
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("nfs-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("nfs-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/nfs-fs/config.toml"));
        paths
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "loading configuration file");
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load from the explicit path if given, otherwise the first search
    /// path that exists. `fallback` builds a config from CLI arguments
    /// alone when no file is found.
    pub fn load(
        external_config_path: Option<&Path>,
        fallback: impl FnOnce() -> Option<Self>,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = external_config_path {
            let config = Self::load_from_file(path)?;
            info!(path = %path.display(), "loaded config file");
            return Ok(config);
        }

        let search_paths = Self::config_search_paths();
        if let Some(path) = search_paths.iter().find(|p| p.exists()) {
            let config = Self::load_from_file(path)?;
            info!(path = %path.display(), "loaded config file");
            return Ok(config);
        }

        fallback().ok_or(ConfigError::NoConfigFound(search_paths))
    }
}
