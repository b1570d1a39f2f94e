extern crate ini;
use self::ini::Ini;

use crate::protocol::DTU_PORT;
use crate::session::EncryptionConfig;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "hoymiles-exporter.conf";
pub const DEFAULT_EXPORTER_PORT: u16 = 12212;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const PRESHARED_KEY_LEN: usize = 16; //bytes

#[derive(Parser, Debug, Default)]
#[command(
    name = "hoymiles-exporter",
    version,
    about = "Poll a Hoymiles DTU and expose Prometheus metrics"
)]
pub struct Args {
    /// Configuration file (defaults to hoymiles-exporter.conf when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP address or host name of the Hoymiles DTU
    #[arg(long = "dtu-ip")]
    pub dtu_ip: Option<String>,

    /// Preshared encryption key (32 hex digits)
    #[arg(long)]
    pub key: Option<String>,

    /// Port for the metrics endpoint
    #[arg(long)]
    pub port: Option<u16>,

    /// Network timeout, e.g. "60s" or "1m"
    #[arg(long)]
    pub timeout: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load config file {path}: {reason}")]
    File { path: String, reason: String },
    #[error("missing DTU host: set [dtu] host or pass --dtu-ip")]
    MissingHost,
    #[error("invalid value for {key}: {value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid preshared key: {0}")]
    InvalidKey(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAddress {
    pub host: String,
    pub dtu_port: u16,
    pub timeout: Duration,
    pub exporter_port: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub address: DeviceAddress,
    pub encryption: EncryptionConfig,
    pub poll_interval: Duration,
    pub max_soft_misses: u32,
    pub log: Option<String>,
}

fn get(conf: Option<&Ini>, section: &str, key: &str) -> Option<String> {
    conf.and_then(|c| c.section(Some(section.to_owned())))
        .and_then(|s| s.get(key).cloned())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason,
    };
    //plain numbers are seconds
    let duration = match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => humantime::parse_duration(value).map_err(|e| invalid(e.to_string()))?,
    };
    if duration == Duration::from_secs(0) {
        return Err(invalid("must be greater than zero".into()));
    }
    Ok(duration)
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Decodes a preshared key given as hex digits. The key length is fixed.
pub fn decode_key(hex: &str) -> Result<Vec<u8>, ConfigError> {
    let hex = hex.trim();
    if hex.len() != PRESHARED_KEY_LEN * 2 {
        return Err(ConfigError::InvalidKey(format!(
            "expected {} hex digits, got {}",
            PRESHARED_KEY_LEN * 2,
            hex.len()
        )));
    }
    let nibble = |c: u8| (c as char).to_digit(16).map(|d| d as u8);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| Some(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| ConfigError::InvalidKey("not a hex string".into()))
}

fn load_file(path: &Path) -> Result<Ini, ConfigError> {
    Ini::load_from_file(path).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        reason: format!("{:?}", e),
    })
}

/// Reads the config file named on the command line, or the default one if it exists.
pub fn load_ini(args: &Args) -> Result<Option<Ini>, ConfigError> {
    match &args.config {
        Some(path) => load_file(path).map(Some),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.exists() {
                load_file(default).map(Some)
            } else {
                Ok(None)
            }
        }
    }
}

/// Log file location, needed before the rest of the configuration is validated.
pub fn log_location(args: &Args) -> Option<String> {
    load_ini(args)
        .ok()
        .flatten()
        .and_then(|conf| get(Some(&conf), "general", "log"))
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let conf = load_ini(args)?;
        Config::from_sources(conf.as_ref(), args)
    }

    /// Merges the config file with command line arguments, the latter take precedence.
    pub fn from_sources(conf: Option<&Ini>, args: &Args) -> Result<Self, ConfigError> {
        let host = args
            .dtu_ip
            .clone()
            .or_else(|| get(conf, "dtu", "host"))
            .ok_or(ConfigError::MissingHost)?;

        let dtu_port = match get(conf, "dtu", "port") {
            Some(v) => parse_number("dtu.port", &v)?,
            None => DTU_PORT,
        };

        let timeout = match args.timeout.clone().or_else(|| get(conf, "dtu", "timeout")) {
            Some(v) => parse_duration("dtu.timeout", &v)?,
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        let exporter_port = match args.port {
            Some(p) => p,
            None => match get(conf, "exporter", "port") {
                Some(v) => parse_number("exporter.port", &v)?,
                None => DEFAULT_EXPORTER_PORT,
            },
        };

        let poll_interval = match get(conf, "exporter", "poll_interval") {
            Some(v) => parse_duration("exporter.poll_interval", &v)?,
            None => Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        };

        let max_soft_misses = match get(conf, "exporter", "max_soft_misses") {
            Some(v) => parse_number("exporter.max_soft_misses", &v)?,
            None => 0,
        };

        let key = args.key.clone().or_else(|| get(conf, "dtu", "key"));
        let mode = get(conf, "dtu", "encryption").map(|m| m.to_lowercase());
        let encryption = match (key, mode.as_deref()) {
            (Some(_), Some("none")) => {
                return Err(ConfigError::InvalidKey(
                    "a key cannot be combined with encryption = none".into(),
                ))
            }
            (Some(key), _) => EncryptionConfig::PresharedKey(decode_key(&key)?),
            (None, Some("preshared")) => {
                return Err(ConfigError::InvalidKey(
                    "preshared encryption selected but no key given".into(),
                ))
            }
            (None, Some("none")) => EncryptionConfig::NoEncryption,
            (None, Some("auto")) | (None, None) => EncryptionConfig::AutoNegotiate,
            (None, Some(other)) => {
                return Err(ConfigError::InvalidValue {
                    key: "dtu.encryption",
                    value: other.to_string(),
                    reason: "expected auto, none or preshared".into(),
                })
            }
        };

        Ok(Config {
            address: DeviceAddress {
                host,
                dtu_port,
                timeout,
                exporter_port,
            },
            encryption,
            poll_interval,
            max_soft_misses,
            log: get(conf, "general", "log"),
        })
    }
}
