//! Runtime configuration
//!
//! Read once from the environment when a [`crate::Dynarec`] is built. Tests
//! and embedders pass an explicit lookup function instead.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynarecConfig {
    /// Block on the mutation lock instead of giving up when it is taken
    pub wait: bool,
    /// Big-block continuation: 0 off, 1 exact targets, 2 also across padding
    pub bigblock: u8,
    /// Instruction cap per block
    pub max_insts: usize,
    /// Guest range never translated, `[start, end)`
    pub nodynarec: Option<(u64, u64)>,
    /// Log a full instruction dump for every compiled block
    pub dump: bool,
    /// Use the shared code cache
    pub cs2c: bool,
    /// Only blocks longer than this many guest bytes go through the cache
    pub cs2c_mark: u64,
    /// Hydrate a whole module from the cache on its first request
    pub cs2c_preload: bool,
    /// Recompile cache hits and report any difference
    pub cs2c_test: bool,
    /// Cache server address
    pub cs2c_server: Option<String>,
    pub attach_backoff_ms: u64,
}

impl Default for DynarecConfig {
    fn default() -> Self {
        Self {
            wait: true,
            bigblock: 1,
            max_insts: 1024,
            nodynarec: None,
            dump: false,
            cs2c: false,
            cs2c_mark: 0,
            cs2c_preload: false,
            cs2c_test: false,
            cs2c_server: None,
            attach_backoff_ms: 1000,
        }
    }
}

impl DynarecConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from defaults overridden by whatever `lookup` returns
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = lookup("DYNAREC_WAIT") {
            cfg.wait = parse_bool("DYNAREC_WAIT", &v)?;
        }
        if let Some(v) = lookup("DYNAREC_BIGBLOCK") {
            cfg.bigblock = match parse_u64("DYNAREC_BIGBLOCK", &v)? {
                n @ 0..=2 => n as u8,
                _ => return Err(invalid("DYNAREC_BIGBLOCK", &v, "expected 0, 1 or 2")),
            };
        }
        if let Some(v) = lookup("DYNAREC_MAX_INSTS") {
            cfg.max_insts = match parse_u64("DYNAREC_MAX_INSTS", &v)? {
                0 => return Err(invalid("DYNAREC_MAX_INSTS", &v, "must be positive")),
                n => n as usize,
            };
        }
        if let Some(v) = lookup("DYNAREC_NODYNAREC") {
            cfg.nodynarec = Some(parse_range("DYNAREC_NODYNAREC", &v)?);
        }
        if let Some(v) = lookup("DYNAREC_DUMP") {
            cfg.dump = parse_bool("DYNAREC_DUMP", &v)?;
        }
        if let Some(v) = lookup("CS2C") {
            cfg.cs2c = parse_bool("CS2C", &v)?;
        }
        if let Some(v) = lookup("CS2C_MARK") {
            cfg.cs2c_mark = parse_u64("CS2C_MARK", &v)?;
        }
        if let Some(v) = lookup("CS2C_PRELOAD") {
            cfg.cs2c_preload = parse_bool("CS2C_PRELOAD", &v)?;
        }
        if let Some(v) = lookup("CS2C_TEST") {
            cfg.cs2c_test = parse_bool("CS2C_TEST", &v)?;
        }
        if let Some(v) = lookup("CS2C_SERVER") {
            cfg.cs2c_server = Some(v);
        }
        if let Some(v) = lookup("CS2C_ATTACH_BACKOFF_MS") {
            cfg.attach_backoff_ms = parse_u64("CS2C_ATTACH_BACKOFF_MS", &v)?;
        }
        Ok(cfg)
    }

    /// Address is in the never-translate range
    pub fn is_nodynarec(&self, addr: u64) -> bool {
        matches!(self.nodynarec, Some((start, end)) if addr >= start && addr < end)
    }
}

fn invalid(var: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    }
}

fn parse_bool(var: &'static str, v: &str) -> Result<bool, ConfigError> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(var, v, "expected a boolean")),
    }
}

fn parse_u64(var: &'static str, v: &str) -> Result<u64, ConfigError> {
    let v = v.trim();
    let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => v.parse(),
    };
    parsed.map_err(|_| invalid(var, v, "expected an integer"))
}

fn parse_range(var: &'static str, v: &str) -> Result<(u64, u64), ConfigError> {
    let (start, end) = v.split_once('-').ok_or_else(|| invalid(var, v, "expected START-END"))?;
    let start = parse_u64(var, start)?;
    let end = parse_u64(var, end)?;
    if end <= start {
        return Err(invalid(var, v, "empty range"));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<DynarecConfig, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        DynarecConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = from(&[]).unwrap();
        assert_eq!(cfg, DynarecConfig::default());
        assert!(cfg.wait);
        assert_eq!(cfg.bigblock, 1);
    }

    #[test]
    fn test_overrides() {
        let cfg = from(&[
            ("CS2C", "1"),
            ("CS2C_MARK", "0x20"),
            ("DYNAREC_NODYNAREC", "0x1000-0x2000"),
            ("DYNAREC_WAIT", "no"),
            ("CS2C_SERVER", "127.0.0.1:7000"),
        ])
        .unwrap();
        assert!(cfg.cs2c && !cfg.wait);
        assert_eq!(cfg.cs2c_mark, 0x20);
        assert!(cfg.is_nodynarec(0x1000));
        assert!(!cfg.is_nodynarec(0x2000));
        assert_eq!(cfg.cs2c_server.as_deref(), Some("127.0.0.1:7000"));
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = from(&[("DYNAREC_BIGBLOCK", "3")]).unwrap_err();
        assert!(err.to_string().starts_with("DYNAREC_BIGBLOCK"));
        assert!(from(&[("CS2C", "maybe")]).is_err());
        assert!(from(&[("DYNAREC_NODYNAREC", "0x2000-0x1000")]).is_err());
        assert!(from(&[("DYNAREC_MAX_INSTS", "0")]).is_err());
    }
}
