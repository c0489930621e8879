//! Run configuration: config file loading and merging with CLI arguments.
//!
//! Precedence: command line, then config file, then built-in defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use harvester_core::fetch::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS, FetcherOptions};
use harvester_core::scheduler::{
    DEFAULT_CONCURRENCY, DEFAULT_DELAY, DEFAULT_MIRROR_DELAY, MAX_CONCURRENCY, MIN_CONCURRENCY,
    MirrorMode, SchedulerConfig,
};
use harvester_core::verify::{ContentPolicy, VerifyThresholds};
use url::Url;

use crate::cli::Args;

/// Default state database name under the output root.
pub const DEFAULT_STATE_FILE: &str = "harvest_state.db";

/// Upper bound accepted for pacing delays, in seconds.
const MAX_DELAY_SECS: f64 = 3600.0;

/// File configuration for harvester defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub max_concurrent: Option<u8>,
    /// Seconds between one worker's Direct route starts.
    pub delay: Option<f64>,
    /// Seconds between one worker's mirror route starts.
    pub mirror_delay: Option<f64>,
    pub disable_mirror_fallback: Option<bool>,
    pub mirror_only: Option<bool>,
    pub verify_content: Option<bool>,
    pub check_content_type: Option<bool>,
    /// Mirror base URLs in priority order.
    pub mirrors: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u64>,
    pub min_pdf_bytes: Option<u64>,
    pub min_markup_bytes: Option<u64>,
    pub min_text_bytes: Option<u64>,
    pub min_markup_text_chars: Option<u64>,
    pub max_body_bytes: Option<u64>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(max_concurrent) = self.max_concurrent
            && !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&usize::from(max_concurrent))
        {
            bail!(
                "Invalid config value for `max_concurrent`: {max_concurrent}. Expected range: 1..=100"
            );
        }
        validate_seconds("delay", self.delay)?;
        validate_seconds("mirror_delay", self.mirror_delay)?;
        if let Some(timeout) = self.timeout_secs
            && !(1..=3600).contains(&timeout)
        {
            bail!("Invalid config value for `timeout_secs`: {timeout}. Expected range: 1..=3600");
        }
        if let Some(max_attempts) = self.max_attempts
            && !(1..=10).contains(&max_attempts)
        {
            bail!("Invalid config value for `max_attempts`: {max_attempts}. Expected range: 1..=10");
        }
        if let Some(max_body_bytes) = self.max_body_bytes
            && max_body_bytes == 0
        {
            bail!("Invalid config value for `max_body_bytes`: must be positive");
        }
        if self.mirror_only == Some(true) && self.disable_mirror_fallback == Some(true) {
            bail!("`mirror_only` and `disable_mirror_fallback` are mutually exclusive");
        }
        Ok(())
    }
}

fn validate_seconds(field: &str, value: Option<f64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !value.is_finite() || !(0.0..=MAX_DELAY_SECS).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 0..=3600 seconds");
    }
    Ok(())
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/harvester/config.toml`
/// 2. `$HOME/.config/harvester/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("harvester")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("harvester")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file named on the command line, or the default one when
/// it exists. An explicit path that cannot be read is an error.
pub fn load_file_config_for(explicit: Option<&Path>) -> Result<Option<FileConfig>> {
    if let Some(path) = explicit {
        return load_file_config(path).map(Some);
    }
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path).map(Some),
        _ => Ok(None),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let line_no = line_index + 1;
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "state_file" => {
                cfg.state_file = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "max_concurrent" => {
                cfg.max_concurrent = Some(parse_integer_u8(value).with_context(invalid)?);
            }
            "delay" => cfg.delay = Some(parse_seconds(value).with_context(invalid)?),
            "mirror_delay" => {
                cfg.mirror_delay = Some(parse_seconds(value).with_context(invalid)?);
            }
            "disable_mirror_fallback" => {
                cfg.disable_mirror_fallback = Some(parse_boolean(value).with_context(invalid)?);
            }
            "mirror_only" => cfg.mirror_only = Some(parse_boolean(value).with_context(invalid)?),
            "verify_content" => {
                cfg.verify_content = Some(parse_boolean(value).with_context(invalid)?);
            }
            "check_content_type" => {
                cfg.check_content_type = Some(parse_boolean(value).with_context(invalid)?);
            }
            "mirrors" => cfg.mirrors = Some(parse_string_array(value).with_context(invalid)?),
            "timeout_secs" => {
                cfg.timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "max_attempts" => {
                cfg.max_attempts = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "min_pdf_bytes" => {
                cfg.min_pdf_bytes = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "min_markup_bytes" => {
                cfg.min_markup_bytes = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "min_text_bytes" => {
                cfg.min_text_bytes = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "min_markup_text_chars" => {
                cfg.min_markup_text_chars = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "max_body_bytes" => {
                cfg.max_body_bytes = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
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

fn parse_string_literal(raw_value: &str) -> Result<String> {
    let raw_value = raw_value.trim();
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_string_array(raw_value: &str) -> Result<Vec<String>> {
    let Some(inner) = raw_value
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        bail!("Expected an array of double-quoted strings");
    };

    let mut items = Vec::new();
    let mut in_string = false;
    let mut start = 0;
    for (index, ch) in inner.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            ',' if !in_string => {
                items.push(parse_string_literal(&inner[start..index])?);
                start = index + 1;
            }
            _ => {}
        }
    }
    let tail = inner[start..].trim();
    if !tail.is_empty() {
        items.push(parse_string_literal(tail)?);
    }
    Ok(items)
}

fn parse_integer_u8(raw_value: &str) -> Result<u8> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<u16>()?;
    u8::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u8"))
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_seconds(raw_value: &str) -> Result<f64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected a number of seconds");
    }
    Ok(token.parse::<f64>()?)
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub work_list: PathBuf,
    pub output_dir: PathBuf,
    pub state_file: PathBuf,
    pub scheduler: SchedulerConfig,
    pub fetcher: FetcherOptions,
    pub max_attempts: u32,
    pub mirrors: Vec<Url>,
}

impl RunSettings {
    /// Merges CLI arguments over file values over defaults and validates the result.
    pub fn resolve(args: &Args, file: Option<&FileConfig>) -> Result<Self> {
        let empty = FileConfig::default();
        let file = file.unwrap_or(&empty);

        let output_dir = args
            .output_dir
            .clone()
            .or_else(|| file.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        let state_file = args
            .state_file
            .clone()
            .or_else(|| file.state_file.clone())
            .unwrap_or_else(|| output_dir.join(DEFAULT_STATE_FILE));

        let mirror_only = args.mirror_only || file.mirror_only.unwrap_or(false);
        let mirrors_disabled =
            args.disable_mirror_fallback || file.disable_mirror_fallback.unwrap_or(false);
        if mirror_only && mirrors_disabled {
            bail!("--mirror-only and --disable-mirror-fallback are mutually exclusive");
        }
        let mirror_mode = if mirror_only {
            MirrorMode::Only
        } else if mirrors_disabled {
            MirrorMode::Disabled
        } else {
            MirrorMode::Fallback
        };

        let raw_mirrors = if args.mirrors.is_empty() {
            file.mirrors.clone().unwrap_or_default()
        } else {
            args.mirrors.clone()
        };
        let mirrors = raw_mirrors
            .iter()
            .map(|raw| parse_mirror_url(raw))
            .collect::<Result<Vec<_>>>()?;
        if mirror_mode == MirrorMode::Only && mirrors.is_empty() {
            bail!("--mirror-only requires at least one --mirror base URL");
        }

        let max_concurrent = args
            .max_concurrent
            .or(file.max_concurrent)
            .map_or(DEFAULT_CONCURRENCY, usize::from);
        let delay = seconds("delay", args.delay.or(file.delay), DEFAULT_DELAY)?;
        let mirror_delay = seconds(
            "mirror delay",
            args.mirror_delay.or(file.mirror_delay),
            DEFAULT_MIRROR_DELAY,
        )?;
        let timeout_secs = args
            .timeout
            .or(file.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let max_attempts = match args.max_attempts {
            Some(value) => u32::from(value),
            None => file
                .max_attempts
                .map_or(Ok(DEFAULT_MAX_ATTEMPTS), u32::try_from)
                .context("max_attempts out of range")?,
        };

        let defaults = VerifyThresholds::default();
        let thresholds = VerifyThresholds {
            min_pdf_bytes: to_usize(file.min_pdf_bytes, defaults.min_pdf_bytes)?,
            min_markup_bytes: to_usize(file.min_markup_bytes, defaults.min_markup_bytes)?,
            min_text_bytes: to_usize(file.min_text_bytes, defaults.min_text_bytes)?,
            min_markup_text_chars: to_usize(
                file.min_markup_text_chars,
                defaults.min_markup_text_chars,
            )?,
        };
        let verify = !args.no_verify && file.verify_content.unwrap_or(true);

        let mut fetcher = FetcherOptions {
            timeout: Duration::from_secs(timeout_secs),
            ..FetcherOptions::default()
        };
        if let Some(max_body_bytes) = file.max_body_bytes {
            fetcher.max_body_bytes = max_body_bytes;
        }

        Ok(Self {
            work_list: args.work_list.clone(),
            output_dir,
            state_file,
            scheduler: SchedulerConfig {
                max_concurrent,
                delay,
                mirror_delay,
                mirror_mode,
                check_content_type: args.check_content_type
                    || file.check_content_type.unwrap_or(false),
                content_policy: ContentPolicy {
                    enabled: verify,
                    thresholds,
                },
            },
            fetcher,
            max_attempts,
            mirrors,
        })
    }
}

fn parse_mirror_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("Invalid mirror URL '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("Mirror URL '{raw}' must use http or https");
    }
    if url.host_str().is_none() {
        bail!("Mirror URL '{raw}' has no host");
    }
    Ok(url)
}

fn seconds(field: &str, value: Option<f64>, default: Duration) -> Result<Duration> {
    value.map_or(Ok(default), |value| {
        Duration::try_from_secs_f64(value)
            .with_context(|| format!("Invalid {field}: {value} seconds"))
    })
}

fn to_usize(value: Option<u64>, default: usize) -> Result<usize> {
    value.map_or(Ok(default), |value| {
        usize::try_from(value).context("threshold out of range for this platform")
    })
}
