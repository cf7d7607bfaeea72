//! Agent options, parsed from the `-agentpath:libheapster.so=<options>` string.
//!
//! ```text
//! -agentpath:libheapster.so=format=json,output=/tmp/allocs.json,track_live,top=50
//! ```

use crate::error::{Error, Result};
use log::LevelFilter;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_MAX_SITES: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

impl ReportFormat {
    fn default_path(self) -> &'static str {
        match self {
            ReportFormat::Text => "heapster.txt",
            ReportFormat::Json => "heapster.json",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            other => Err(Error::Config(format!("format must be `text` or `json`, got `{other}`"))),
        }
    }
}

/// Where the report goes at VM death.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Stderr,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub output: Output,
    pub format: ReportFormat,
    pub track_live: bool,
    pub max_sites: usize,
    /// Report only the N busiest sites; 0 keeps all of them.
    pub top: usize,
    pub log_level: LevelFilter,
    pub bootclasspath: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output: Output::File(PathBuf::from(ReportFormat::Text.default_path())),
            format: ReportFormat::Text,
            track_live: false,
            max_sites: DEFAULT_MAX_SITES,
            top: 0,
            log_level: LevelFilter::Warn,
            bootclasspath: None,
        }
    }
}

impl Config {
    /// Parses a comma-separated `key=value` list. A bare key means `true`.
    pub fn parse(options: &str) -> Result<Self> {
        let mut config = Config::default();
        let mut output = None;

        for item in options.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = match item.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (item, None),
            };
            match key {
                "output" => output = Some(required(key, value)?.to_owned()),
                "format" => config.format = required(key, value)?.parse()?,
                "track_live" => config.track_live = parse_bool(key, value)?,
                "max_sites" => {
                    config.max_sites = parse_number(key, value)?;
                    if config.max_sites == 0 {
                        return Err(Error::Config("max_sites must be at least 1".into()));
                    }
                }
                "top" => config.top = parse_number(key, value)?,
                "log" => {
                    let level = required(key, value)?;
                    config.log_level = level
                        .parse()
                        .map_err(|_| Error::Config(format!("unknown log level `{level}`")))?;
                }
                "bootclasspath" => config.bootclasspath = Some(required(key, value)?.to_owned()),
                _ => return Err(Error::Config(format!("unknown option `{key}`"))),
            }
        }

        config.output = match output.as_deref() {
            Some("-") => Output::Stderr,
            Some(path) => Output::File(PathBuf::from(path)),
            None => Output::File(PathBuf::from(config.format.default_path())),
        };
        Ok(config)
    }
}

fn required<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Config(format!("option `{key}` needs a value"))),
    }
}

fn parse_bool(key: &str, value: Option<&str>) -> Result<bool> {
    match value {
        None | Some("true") | Some("yes") | Some("1") => Ok(true),
        Some("false") | Some("no") | Some("0") => Ok(false),
        Some(other) => Err(Error::Config(format!("option `{key}` expects a boolean, got `{other}`"))),
    }
}

fn parse_number(key: &str, value: Option<&str>) -> Result<usize> {
    let value = required(key, value)?;
    value
        .parse()
        .map_err(|_| Error::Config(format!("option `{key}` expects a number, got `{value}`")))
}
