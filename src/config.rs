//! Configuration — every knob the client honours, loaded from TOML.
//!
//! Unknown keys are rejected.  `chunk_size` accepts a bare byte count or
//! a string with a k/m suffix.  `md_dir` gets `~` expanded.  `polltype`
//! is accepted for compatibility and recorded; the blocking transport
//! has no pluggable event backend.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::compress::CompFamily;
use crate::crypto::{CryptoError, Keys};
use crate::trans::{QUEUE_DEPTH, QUEUE_DEPTH_MAX};
use crate::wire::CHUNK_MAX;

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
pub const DEFAULT_PORT: u16 = 4433;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("bad value for {key}: {reason}")]
    BadValue { key: &'static str, reason: String },
    #[error("key derivation failed: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host:                String,
    pub port:                u16,
    pub ca_cert:             Option<PathBuf>,
    pub cert:                Option<PathBuf>,
    pub key:                 Option<PathBuf>,
    pub password:            Option<String>,
    pub password_file:       Option<PathBuf>,
    pub crypto_secret:       Option<String>,
    #[serde(deserialize_with = "de_size")]
    pub chunk_size:          usize,
    pub compression:         String,
    pub queue_depth:         usize,
    pub md_dir:              PathBuf,
    pub polltype:            Option<String>,
    pub verbose:             u8,
    pub multilevel_allfiles: bool,
    pub max_differentials:   i32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host:                String::new(),
            port:                DEFAULT_PORT,
            ca_cert:             None,
            cert:                None,
            key:                 None,
            password:            None,
            password_file:       None,
            crypto_secret:       None,
            chunk_size:          DEFAULT_CHUNK_SIZE,
            compression:         "zstd".into(),
            queue_depth:         QUEUE_DEPTH,
            md_dir:              PathBuf::from("~/.chunkvault"),
            polltype:            None,
            verbose:             0,
            multilevel_allfiles: false,
            max_differentials:   0,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut cfg: Config = toml::from_str(&text)?;
        cfg.md_dir = expand_tilde(&cfg.md_dir);
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > CHUNK_MAX {
            return Err(ConfigError::BadValue {
                key:    "chunk_size",
                reason: format!("{} outside 1..={CHUNK_MAX}", self.chunk_size),
            });
        }
        if self.queue_depth == 0 || self.queue_depth > QUEUE_DEPTH_MAX {
            return Err(ConfigError::BadValue {
                key:    "queue_depth",
                reason: format!("{} outside 1..={QUEUE_DEPTH_MAX}", self.queue_depth),
            });
        }
        if CompFamily::from_name(&self.compression).is_none() {
            return Err(ConfigError::BadValue {
                key:    "compression",
                reason: format!("unknown family '{}'", self.compression),
            });
        }
        Ok(())
    }

    pub fn comp_family(&self) -> CompFamily {
        CompFamily::from_name(&self.compression).unwrap_or(CompFamily::Zstd)
    }

    /// Account password: inline value wins, otherwise the first line of
    /// `password_file`.
    pub fn account_password(&self) -> Result<Option<String>, ConfigError> {
        if let Some(p) = &self.password {
            return Ok(Some(p.clone()));
        }
        match &self.password_file {
            Some(path) => {
                let text = fs::read_to_string(path)?;
                Ok(text.lines().next().map(str::to_owned))
            }
            None => Ok(None),
        }
    }

    /// Chunk keys, when file-level crypto is configured.
    pub fn keys(&self) -> Result<Option<Keys>, ConfigError> {
        match &self.crypto_secret {
            Some(secret) => Ok(Some(Keys::derive(secret.as_bytes())?)),
            None => Ok(None),
        }
    }

    pub fn endpoint(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else { return path.to_path_buf() };
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn de_size<'de, D>(de: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Str(String),
    }
    match Raw::deserialize(de)? {
        Raw::Int(n) => Ok(n as usize),
        Raw::Str(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a size with an optional k/m suffix: "262144", "256k", "1m".
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (num, mult) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    num.trim()
        .parse::<usize>()
        .map(|n| n * mult)
        .map_err(|e| format!("'{s}': {e}"))
}

// ── Tests ────────────────────────────────────────────────────────────────────
