//! Configuration module for cdnprobe.
//!
//! Loads the probe identity and targets from an INI file, then applies
//! environment variable overrides to the probing settings.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use config::{Config, File, FileFormat, Value};
use thiserror::Error;

use crate::models::Target;
use crate::output::OutputFormat;
use crate::probe::{ProbeOptions, TransportKind};

pub const PROBE_ID_SECTION: &str = "PROBE-ID";
pub const PROBE_ID_KEY: &str = "probe-id";
pub const TARGETS_SECTION: &str = "TARGETS";
pub const SETTINGS_SECTION: &str = "SETTINGS";

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.ini";

/// Echo sequence numbers are 16 bits wide.
pub const MAX_COUNT: u32 = u16::MAX as u32;

/// Configuration error types. All of them abort the run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("no {0} section found in configuration")]
    MissingSection(&'static str),
    #[error("no {key} value found in {section} section")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },
    #[error("no targets configured in TARGETS section")]
    NoTargets,
    #[error("target {0} has an empty hostname")]
    EmptyHostname(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Application configuration for one collection run.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Identity tag stamped on every record.
    pub probe_id: String,
    /// Targets ordered by name.
    pub targets: Vec<Target>,
    pub probe: ProbeOptions,
    pub transport: TransportKind,
    /// Deadline for probing one target (default: none).
    pub target_timeout: Option<Duration>,
    pub output: OutputFormat,
}

impl AppConfig {
    /// Load configuration from the config file and environment.
    ///
    /// Environment variables:
    /// - `CDNPROBE_CONFIG`: config file path (default: "config.ini")
    /// - `CDNPROBE_PROBE_ID`: probe identity
    /// - `CDNPROBE_COUNT`: echoes per address
    /// - `CDNPROBE_TIMEOUT`: reply timeout in seconds
    /// - `CDNPROBE_PRIVILEGED`: use RAW sockets
    /// - `CDNPROBE_TRANSPORT`: auto, icmp or command
    /// - `CDNPROBE_OUTPUT`: text or json
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            env::var("CDNPROBE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::from_file(&path)?;
        cfg.apply_overrides(|key| env::var(key).ok());
        Ok(cfg)
    }

    /// Load configuration from an INI file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_ini_str(&text)
    }

    /// Parse configuration from INI text.
    ///
    /// Trailing `;` and `#` comments are allowed after section headers and values.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let text = strip_inline_comments(text);
        let source = Config::builder()
            .add_source(File::from_str(&text, FileFormat::Ini))
            .build()?;
        Self::from_source(source)
    }

    fn from_source(source: Config) -> Result<Self, ConfigError> {
        let sections: HashMap<String, Value> = source.try_deserialize()?;

        let identity = find_section(&sections, PROBE_ID_SECTION)?
            .ok_or(ConfigError::MissingSection(PROBE_ID_SECTION))?;
        let probe_id = lookup(&identity, PROBE_ID_KEY)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingKey {
                section: PROBE_ID_SECTION,
                key: PROBE_ID_KEY,
            })?
            .to_string();

        let targets = find_section(&sections, TARGETS_SECTION)?
            .ok_or(ConfigError::MissingSection(TARGETS_SECTION))?;
        let targets = parse_targets(targets)?;

        let mut cfg = Self {
            probe_id,
            targets,
            probe: ProbeOptions::default(),
            transport: TransportKind::default(),
            target_timeout: None,
            output: OutputFormat::default(),
        };

        if let Some(settings) = find_section(&sections, SETTINGS_SECTION)? {
            for (key, value) in &settings {
                cfg.apply_setting(key, value)?;
            }
        }

        Ok(cfg)
    }

    /// Apply one `[SETTINGS]` entry.
    fn apply_setting(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let value = value.trim();

        match key.to_ascii_lowercase().as_str() {
            "count" => {
                self.probe.count = value
                    .parse::<u32>()
                    .ok()
                    .filter(|n| (1..=MAX_COUNT).contains(n))
                    .ok_or_else(invalid)?;
            }
            "interval" => self.probe.interval = parse_seconds(value, true).ok_or_else(invalid)?,
            "timeout" => self.probe.timeout = parse_seconds(value, false).ok_or_else(invalid)?,
            "privileged" => self.probe.privileged = parse_bool(value).ok_or_else(invalid)?,
            "concurrency" => {
                self.probe.concurrency = value
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(invalid)?;
            }
            "transport" => self.transport = value.parse().map_err(|_| invalid())?,
            "target_timeout" => {
                self.target_timeout = Some(parse_seconds(value, false).ok_or_else(invalid)?);
            }
            "output" => self.output = value.parse().map_err(|_| invalid())?,
            other => tracing::warn!(key = other, "Ignoring unknown setting"),
        }
        Ok(())
    }

    /// Apply environment overrides. Unparsable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("CDNPROBE_PROBE_ID").filter(|s| !s.trim().is_empty()) {
            self.probe_id = id.trim().to_string();
        }

        let overrides = [
            ("CDNPROBE_COUNT", "count"),
            ("CDNPROBE_TIMEOUT", "timeout"),
            ("CDNPROBE_PRIVILEGED", "privileged"),
            ("CDNPROBE_TRANSPORT", "transport"),
            ("CDNPROBE_OUTPUT", "output"),
        ];
        for (var, key) in overrides {
            if let Some(value) = lookup(var) {
                if let Err(e) = self.apply_setting(key, &value) {
                    tracing::warn!(variable = var, error = %e, "Ignoring environment override");
                }
            }
        }
    }
}

/// Drop `;` and `#` comments that follow whitespace on a line.
///
/// A marker glued to preceding text (`host#1`) is kept as part of the value.
fn strip_inline_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let mut end = line.len();
        let mut prev_blank = true;
        for (i, c) in line.char_indices() {
            if (c == ';' || c == '#') && prev_blank {
                end = i;
                break;
            }
            prev_blank = c.is_whitespace();
        }
        out.push_str(line[..end].trim_end());
        out.push('\n');
    }
    out
}

/// Find a section by case-insensitive name and flatten it to strings.
fn find_section(
    sections: &HashMap<String, Value>,
    name: &'static str,
) -> Result<Option<BTreeMap<String, String>>, ConfigError> {
    let Some(value) = sections
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
    else {
        return Ok(None);
    };

    let table = value.into_table().map_err(|_| ConfigError::MissingSection(name))?;
    let mut entries = BTreeMap::new();
    for (key, value) in table {
        let text = value.into_string().map_err(|_| ConfigError::InvalidValue {
            key: format!("{}.{}", name, key),
            value: "<table>".to_string(),
        })?;
        entries.insert(key, text);
    }
    Ok(Some(entries))
}

fn lookup<'a>(section: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    section
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

fn parse_targets(section: BTreeMap<String, String>) -> Result<Vec<Target>, ConfigError> {
    if section.is_empty() {
        return Err(ConfigError::NoTargets);
    }

    section
        .into_iter()
        .map(|(name, hostname)| {
            let hostname = hostname.trim();
            if hostname.is_empty() {
                return Err(ConfigError::EmptyHostname(name));
            }
            Ok(Target::new(name.trim(), hostname))
        })
        .collect()
}

fn parse_seconds(value: &str, allow_zero: bool) -> Option<Duration> {
    let secs: f64 = value.parse().ok()?;
    if secs < 0.0 || (!allow_zero && secs == 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}
