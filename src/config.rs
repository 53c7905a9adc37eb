use std::fmt;
use std::path::PathBuf;

/// Process-level settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Keep everything in memory and never touch `data_dir`.
    pub in_memory: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            in_memory: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<bool>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ConfigError { var, value }),
        },
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their defaults;
    /// set but unparseable ones are an error rather than silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(port) = parsed(&lookup, "SALONBOOK_PORT")? {
            cfg.port = port;
        }
        if let Some(bind) = lookup("SALONBOOK_BIND") {
            cfg.bind = bind;
        }
        if let Some(dir) = lookup("SALONBOOK_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(max) = parsed(&lookup, "SALONBOOK_MAX_CONNECTIONS")? {
            if max == 0 {
                return Err(ConfigError {
                    var: "SALONBOOK_MAX_CONNECTIONS",
                    value: "0".into(),
                });
            }
            cfg.max_connections = max;
        }
        if let Some(threshold) = parsed(&lookup, "SALONBOOK_COMPACT_THRESHOLD")? {
            cfg.compact_threshold = threshold;
        }
        cfg.metrics_port = parsed(&lookup, "SALONBOOK_METRICS_PORT")?;
        if let Some(in_memory) = flag(&lookup, "SALONBOOK_IN_MEMORY")? {
            cfg.in_memory = in_memory;
        }
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.listen_addr(), "0.0.0.0:7433");
    }

    #[test]
    fn overrides_apply() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("SALONBOOK_PORT", "9000"),
            ("SALONBOOK_BIND", "127.0.0.1"),
            ("SALONBOOK_DATA_DIR", "/var/lib/salonbook"),
            ("SALONBOOK_MAX_CONNECTIONS", "8"),
            ("SALONBOOK_COMPACT_THRESHOLD", "50"),
            ("SALONBOOK_METRICS_PORT", "9100"),
            ("SALONBOOK_IN_MEMORY", "true"),
        ]))
        .unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:9000");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/salonbook"));
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert!(cfg.in_memory);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("SALONBOOK_PORT", "seventy")])).unwrap_err();
        assert_eq!(err.var, "SALONBOOK_PORT");
        assert!(ServerConfig::from_lookup(lookup(&[("SALONBOOK_IN_MEMORY", "maybe")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("SALONBOOK_MAX_CONNECTIONS", "0")])).is_err());
    }
}
