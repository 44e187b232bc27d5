//! Configuration file loading.
//!
//! The file is a flat `key = value` list with `#` comments. Strings are
//! double-quoted, integers and booleans are bare. Per-library policies live
//! under `[library.<name>]` headers:
//!
//! ```text
//! output_dir = "manuscripts"
//! global_max_concurrent = 8
//! failure_mode = "best_effort"
//! manifest_cache_ttl_secs = 86400
//!
//! [library.gallica]
//! max_concurrent = 2
//! timeout_multiplier = 1.5
//! split_max_mb = 200
//! ```

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::assemble::ArtifactFormat;
use crate::download::{BackoffPolicy, MIN_PAGE_BYTES};
use crate::engine::{EngineSettings, MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::library::{LibraryPolicy, PolicyTable};
use crate::queue::FailureMode;

/// Directory name under the user config directory.
pub const CONFIG_DIR_NAME: &str = "manuscript-downloader";

/// File name of the default config file.
pub const CONFIG_FILE_NAME: &str = "config.toml";

const MAX_RETRY_LIMIT: u32 = 20;
const MAX_TIMEOUT_SECS: u64 = 3600;
const MAX_BACKOFF_MS: u64 = 3_600_000;
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Errors from reading or validating a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}\n  Suggestion: Check the path passed to --config")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("invalid `{key}` value on line {line}: {message}")]
    InvalidValue {
        key: String,
        line: usize,
        message: String,
    },

    #[error("unknown configuration key '{key}' on line {line}")]
    UnknownKey { key: String, line: usize },

    #[error("invalid config value for `{key}`: {value}. Expected range: {range}")]
    OutOfRange {
        key: String,
        value: String,
        range: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, line: usize, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            line,
            message: message.into(),
        }
    }

    fn out_of_range(key: &str, value: impl ToString, range: &str) -> Self {
        Self::OutOfRange {
            key: key.to_string(),
            value: value.to_string(),
            range: range.to_string(),
        }
    }
}

/// Supported `verbosity` labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Verbose => "verbose",
            Self::Quiet => "quiet",
            Self::Debug => "debug",
        }
    }

    /// `tracing` filter directive for this setting.
    #[must_use]
    pub fn filter_directive(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose => "debug",
            Self::Quiet => "error",
            Self::Debug => "trace",
        }
    }
}

impl FromStr for VerbositySetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "verbose" => Ok(Self::Verbose),
            "quiet" => Ok(Self::Quiet),
            "debug" => Ok(Self::Debug),
            _ => Err(format!("invalid verbosity: {s}")),
        }
    }
}

/// Overrides from one `[library.<name>]` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LibraryConfig {
    pub max_concurrent: Option<usize>,
    pub timeout_multiplier: Option<f64>,
    pub retry_limit: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    /// Artifact size threshold in MiB; 0 disables splitting for the library.
    pub split_max_mb: Option<u64>,
}

impl LibraryConfig {
    /// Applies the overrides on top of `base`.
    #[must_use]
    pub fn apply(&self, base: &LibraryPolicy) -> LibraryPolicy {
        let mut policy = base.clone();
        if let Some(max_concurrent) = self.max_concurrent {
            policy.max_concurrent = max_concurrent;
        }
        if let Some(multiplier) = self.timeout_multiplier {
            policy.timeout_multiplier = multiplier;
        }
        if let Some(retry_limit) = self.retry_limit {
            policy.retry_limit = retry_limit;
        }
        policy.backoff = merge_backoff(policy.backoff, self.backoff_base_ms, self.backoff_max_ms);
        if let Some(mb) = self.split_max_mb {
            policy.split_max_bytes = Some(mb.saturating_mul(BYTES_PER_MB));
        }
        policy
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let key = |field: &str| format!("library.{name}.{field}");
        if let Some(value) = self.max_concurrent
            && !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value)
        {
            return Err(ConfigError::out_of_range(
                &key("max_concurrent"),
                value,
                &format!("{MIN_CONCURRENCY}..={MAX_CONCURRENCY}"),
            ));
        }
        if let Some(value) = self.timeout_multiplier
            && !(value.is_finite() && value > 0.0 && value <= 100.0)
        {
            return Err(ConfigError::out_of_range(
                &key("timeout_multiplier"),
                value,
                "greater than 0 and at most 100",
            ));
        }
        validate_retry_limit(&key("retry_limit"), self.retry_limit)?;
        validate_backoff(&key("backoff"), self.backoff_base_ms, self.backoff_max_ms)
    }
}

/// Values read from a config file; `None` means "keep the default".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub global_max_concurrent: Option<usize>,
    pub worker_count: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub retry_limit: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    /// Pages per artifact; 0 means unlimited.
    pub split_max_pages: Option<usize>,
    /// Artifact size threshold in MiB; 0 means unlimited.
    pub split_max_mb: Option<u64>,
    pub min_page_bytes: Option<u64>,
    pub max_page_bytes: Option<u64>,
    pub failure_mode: Option<FailureMode>,
    pub artifact_format: Option<ArtifactFormat>,
    pub progress_interval_ms: Option<u64>,
    pub verbosity: Option<VerbositySetting>,
    /// Reuse resolved manifests across runs; on unless set to `false`.
    pub manifest_cache: Option<bool>,
    /// Age after which a cached manifest is resolved again; unset keeps it forever.
    pub manifest_cache_ttl_secs: Option<u64>,
    /// Library sections keyed by the name in the header.
    pub libraries: BTreeMap<String, LibraryConfig>,
}

impl FileConfig {
    /// Checks every value against the ranges the engine accepts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_concurrency("global_max_concurrent", self.global_max_concurrent)?;
        validate_concurrency("worker_count", self.worker_count)?;
        if let Some(value) = self.request_timeout_secs
            && !(1..=MAX_TIMEOUT_SECS).contains(&value)
        {
            return Err(ConfigError::out_of_range(
                "request_timeout_secs",
                value,
                &format!("1..={MAX_TIMEOUT_SECS}"),
            ));
        }
        validate_retry_limit("retry_limit", self.retry_limit)?;
        validate_backoff("backoff", self.backoff_base_ms, self.backoff_max_ms)?;
        if let Some(max) = self.max_page_bytes {
            let min = self.min_page_bytes.unwrap_or(MIN_PAGE_BYTES).max(1);
            if max < min {
                return Err(ConfigError::out_of_range(
                    "max_page_bytes",
                    max,
                    &format!("at least min_page_bytes ({min})"),
                ));
            }
        }
        if let Some(value) = self.progress_interval_ms
            && !(10..=60_000).contains(&value)
        {
            return Err(ConfigError::out_of_range(
                "progress_interval_ms",
                value,
                "10..=60000",
            ));
        }
        for (name, library) in &self.libraries {
            library.validate(name)?;
        }
        Ok(())
    }

    /// Copies file values into `settings`.
    pub fn apply_to(&self, settings: &mut EngineSettings) {
        if let Some(output_dir) = &self.output_dir {
            settings.output_dir.clone_from(output_dir);
        }
        if let Some(value) = self.global_max_concurrent {
            settings.global_max_concurrent = value;
        }
        if let Some(value) = self.worker_count {
            settings.worker_count = value;
        }
        if let Some(secs) = self.request_timeout_secs {
            settings.request_timeout = Duration::from_secs(secs);
        }
        if let Some(pages) = self.split_max_pages {
            settings.split = settings.split.with_max_pages(pages);
        }
        if let Some(mb) = self.split_max_mb {
            settings.split = settings.split.with_max_bytes(mb.saturating_mul(BYTES_PER_MB));
        }
        if let Some(value) = self.min_page_bytes {
            settings.min_page_bytes = value;
        }
        if let Some(value) = self.max_page_bytes {
            settings.max_page_bytes = value;
        }
        if let Some(mode) = self.failure_mode {
            settings.failure_mode = mode;
        }
        if let Some(format) = self.artifact_format {
            settings.artifact_format = format;
        }
        if let Some(ms) = self.progress_interval_ms {
            settings.progress_interval = Duration::from_millis(ms);
        }
    }

    /// Whether resolved manifests are cached.
    #[must_use]
    pub fn manifest_cache_enabled(&self) -> bool {
        self.manifest_cache.unwrap_or(true)
    }

    #[must_use]
    pub fn manifest_cache_ttl(&self) -> Option<Duration> {
        self.manifest_cache_ttl_secs.map(Duration::from_secs)
    }

    /// Default policy from the global retry/backoff keys, plus one entry per
    /// library section layered on top of it.
    #[must_use]
    pub fn policy_table(&self) -> PolicyTable {
        let mut default = LibraryPolicy::default();
        if let Some(retry_limit) = self.retry_limit {
            default.retry_limit = retry_limit;
        }
        default.backoff = merge_backoff(default.backoff, self.backoff_base_ms, self.backoff_max_ms);

        let mut table = PolicyTable::new(default.clone());
        for (name, library) in &self.libraries {
            table.insert(name, library.apply(&default));
        }
        table
    }
}

/// Result of looking for a config file.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Path that was read or looked for.
    pub path: Option<PathBuf>,
    pub config: FileConfig,
    pub loaded_from_file: bool,
}

/// Default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/manuscript-downloader/config.toml`
/// 2. `$HOME/.config/manuscript-downloader/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    config_path_from(env_var_non_empty_os("XDG_CONFIG_HOME"), env_var_non_empty_os("HOME"))
}

fn config_path_from(xdg_config_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    if let Some(xdg) = xdg_config_home {
        return Some(PathBuf::from(xdg).join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME));
    }
    let home = home?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit` if given (it must exist), else the default path if a
/// file is there, else defaults.
///
/// # Errors
///
/// Returns [`ConfigError`] when a file exists but cannot be read or parsed,
/// or when `explicit` does not exist.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config,
            loaded_from_file: true,
        });
    }

    let path = resolve_default_config_path();
    match path.as_deref() {
        Some(default_path) if default_path.exists() => {
            let config = load_file_config(default_path)?;
            Ok(LoadedConfig {
                path,
                config,
                loaded_from_file: true,
            })
        }
        _ => Ok(LoadedConfig {
            path,
            config: FileConfig::default(),
            loaded_from_file: false,
        }),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config_str(&raw)?;
    debug!(path = %path.display(), libraries = config.libraries.len(), "config loaded");
    Ok(config)
}

/// Parses and validates config text.
///
/// # Errors
///
/// Returns [`ConfigError`] naming the offending line or key.
pub fn parse_config_str(raw: &str) -> Result<FileConfig, ConfigError> {
    let mut cfg = FileConfig::default();
    let mut section: Option<String> = None;

    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') {
            let name = parse_section_header(line, line_no)?;
            cfg.libraries.entry(name.clone()).or_default();
            section = Some(name);
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax {
                line: line_no,
                message: "expected key = value".to_string(),
            });
        };
        let key = raw_key.trim();
        let value = raw_value.trim();

        match &section {
            None => apply_global_key(&mut cfg, key, value, line_no)?,
            Some(name) => {
                let library = cfg.libraries.entry(name.clone()).or_default();
                apply_library_key(library, key, value, line_no)?;
            }
        }
    }

    cfg.validate()?;
    Ok(cfg)
}

fn apply_global_key(
    cfg: &mut FileConfig,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigError> {
    match key {
        "output_dir" => cfg.output_dir = Some(PathBuf::from(parse_string_literal(key, value, line)?)),
        "state_dir" => cfg.state_dir = Some(PathBuf::from(parse_string_literal(key, value, line)?)),
        "global_max_concurrent" => cfg.global_max_concurrent = Some(parse_usize(key, value, line)?),
        "worker_count" => cfg.worker_count = Some(parse_usize(key, value, line)?),
        "request_timeout_secs" => cfg.request_timeout_secs = Some(parse_integer_u64(key, value, line)?),
        "retry_limit" => cfg.retry_limit = Some(parse_u32(key, value, line)?),
        "backoff_base_ms" => cfg.backoff_base_ms = Some(parse_integer_u64(key, value, line)?),
        "backoff_max_ms" => cfg.backoff_max_ms = Some(parse_integer_u64(key, value, line)?),
        "split_max_pages" => cfg.split_max_pages = Some(parse_usize(key, value, line)?),
        "split_max_mb" => cfg.split_max_mb = Some(parse_integer_u64(key, value, line)?),
        "min_page_bytes" => cfg.min_page_bytes = Some(parse_integer_u64(key, value, line)?),
        "max_page_bytes" => cfg.max_page_bytes = Some(parse_integer_u64(key, value, line)?),
        "failure_mode" => cfg.failure_mode = Some(parse_labeled(key, value, line)?),
        "artifact_format" => cfg.artifact_format = Some(parse_labeled(key, value, line)?),
        "progress_interval_ms" => cfg.progress_interval_ms = Some(parse_integer_u64(key, value, line)?),
        "verbosity" => cfg.verbosity = Some(parse_labeled(key, value, line)?),
        "manifest_cache" => cfg.manifest_cache = Some(parse_bool(key, value, line)?),
        "manifest_cache_ttl_secs" => {
            cfg.manifest_cache_ttl_secs = Some(parse_integer_u64(key, value, line)?);
        }
        unknown => {
            return Err(ConfigError::UnknownKey {
                key: unknown.to_string(),
                line,
            });
        }
    }
    Ok(())
}

fn apply_library_key(
    library: &mut LibraryConfig,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigError> {
    match key {
        "max_concurrent" => library.max_concurrent = Some(parse_usize(key, value, line)?),
        "timeout_multiplier" => library.timeout_multiplier = Some(parse_float(key, value, line)?),
        "retry_limit" => library.retry_limit = Some(parse_u32(key, value, line)?),
        "backoff_base_ms" => library.backoff_base_ms = Some(parse_integer_u64(key, value, line)?),
        "backoff_max_ms" => library.backoff_max_ms = Some(parse_integer_u64(key, value, line)?),
        "split_max_mb" => library.split_max_mb = Some(parse_integer_u64(key, value, line)?),
        unknown => {
            return Err(ConfigError::UnknownKey {
                key: unknown.to_string(),
                line,
            });
        }
    }
    Ok(())
}

/// `[library.name]` or `[library."Some Name"]`.
fn parse_section_header(line: &str, line_no: usize) -> Result<String, ConfigError> {
    let syntax = |message: &str| ConfigError::Syntax {
        line: line_no,
        message: message.to_string(),
    };

    let inner = line
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| syntax("unterminated section header"))?
        .trim();
    let name = inner
        .strip_prefix("library.")
        .ok_or_else(|| syntax("only [library.<name>] sections are supported"))?
        .trim();
    let name = name
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(name)
        .trim();
    if name.is_empty() {
        return Err(syntax("library section needs a name"));
    }
    Ok(name.to_string())
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(key: &str, raw_value: &str, line: usize) -> Result<String, ConfigError> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        return Err(ConfigError::invalid(key, line, "expected double-quoted string"));
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(key: &str, raw_value: &str, line: usize) -> Result<u64, ConfigError> {
    let token = raw_value.trim();
    if token.is_empty() {
        return Err(ConfigError::invalid(key, line, "expected integer value"));
    }
    let value = token
        .parse::<i128>()
        .map_err(|e| ConfigError::invalid(key, line, e.to_string()))?;
    if value < 0 {
        return Err(ConfigError::invalid(key, line, "expected non-negative integer"));
    }
    u64::try_from(value).map_err(|_| ConfigError::invalid(key, line, "integer out of range for u64"))
}

fn parse_u32(key: &str, raw_value: &str, line: usize) -> Result<u32, ConfigError> {
    let value = parse_integer_u64(key, raw_value, line)?;
    u32::try_from(value).map_err(|_| ConfigError::invalid(key, line, "integer out of range for u32"))
}

fn parse_usize(key: &str, raw_value: &str, line: usize) -> Result<usize, ConfigError> {
    let value = parse_integer_u64(key, raw_value, line)?;
    usize::try_from(value).map_err(|_| ConfigError::invalid(key, line, "integer out of range"))
}

fn parse_bool(key: &str, raw_value: &str, line: usize) -> Result<bool, ConfigError> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::invalid(key, line, "expected true or false")),
    }
}

fn parse_float(key: &str, raw_value: &str, line: usize) -> Result<f64, ConfigError> {
    raw_value
        .trim()
        .parse::<f64>()
        .map_err(|e| ConfigError::invalid(key, line, e.to_string()))
}

/// Quoted label parsed through the type's `FromStr`.
fn parse_labeled<T>(key: &str, raw_value: &str, line: usize) -> Result<T, ConfigError>
where
    T: FromStr<Err = String>,
{
    let label = parse_string_literal(key, raw_value, line)?;
    label
        .parse::<T>()
        .map_err(|message| ConfigError::invalid(key, line, message))
}

fn validate_concurrency(key: &str, value: Option<usize>) -> Result<(), ConfigError> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value) {
        return Err(ConfigError::out_of_range(
            key,
            value,
            &format!("{MIN_CONCURRENCY}..={MAX_CONCURRENCY}"),
        ));
    }
    Ok(())
}

fn validate_retry_limit(key: &str, value: Option<u32>) -> Result<(), ConfigError> {
    let Some(value) = value else {
        return Ok(());
    };
    if value > MAX_RETRY_LIMIT {
        return Err(ConfigError::out_of_range(
            key,
            value,
            &format!("0..={MAX_RETRY_LIMIT}"),
        ));
    }
    Ok(())
}

fn validate_backoff(key: &str, base_ms: Option<u64>, max_ms: Option<u64>) -> Result<(), ConfigError> {
    for (suffix, value) in [("base_ms", base_ms), ("max_ms", max_ms)] {
        if let Some(value) = value
            && value > MAX_BACKOFF_MS
        {
            return Err(ConfigError::out_of_range(
                &format!("{key}_{suffix}"),
                value,
                &format!("0..={MAX_BACKOFF_MS}"),
            ));
        }
    }
    if let (Some(base), Some(max)) = (base_ms, max_ms)
        && max < base
    {
        return Err(ConfigError::out_of_range(
            &format!("{key}_max_ms"),
            max,
            &format!("at least {key}_base_ms ({base})"),
        ));
    }
    Ok(())
}

fn merge_backoff(backoff: BackoffPolicy, base_ms: Option<u64>, max_ms: Option<u64>) -> BackoffPolicy {
    let base = base_ms.map_or(backoff.base(), Duration::from_millis);
    let max = max_ms.map_or(backoff.max(), Duration::from_millis);
    BackoffPolicy::new(base, max)
}
