use slp_protocol::DEFAULT_PORT;
use slp_protocol::DEFAULT_SCOPE;
use std::collections::HashMap;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIGURATION_FILE_VARIABLE: &str = "SLP_CONF";

const DEFAULT_CONFIGURATION_FILE: &str = "/etc/slp.conf";

const DEFAULT_TIMEOUTS: &str = "500,750,1000,1500,2000,3000";

const DEFAULTS: &[(&str, &str)] = &[
    ("net.slp.locale", "en"),
    ("net.slp.useScopes", DEFAULT_SCOPE),
    ("net.slp.DAAddresses", ""),
    ("net.slp.port", "427"),
    ("net.slp.multicastTTL", "255"),
    ("net.slp.MTU", "1400"),
    ("net.slp.multicastMaximumWait", "15000"),
    ("net.slp.multicastTimeouts", DEFAULT_TIMEOUTS),
    ("net.slp.unicastMaximumWait", "15000"),
    ("net.slp.unicastTimeouts", DEFAULT_TIMEOUTS),
    ("net.slp.isBroadcastOnly", "false"),
    ("net.slp.minRefreshInterval", "0"),
];

#[derive(Error, Debug)]
pub enum PropertyError {
    #[error("Failed to read the configuration file")]
    Io(#[from] std::io::Error),

    #[error("Line {0} is not a `name = value` assignment")]
    Syntax(usize),
}

/// Read-only `net.slp.*` configuration.
///
/// Property names are matched case-insensitively.
#[derive(Debug, Clone)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            values: DEFAULTS
                .iter()
                .map(|(name, value)| (normalize(name), value.to_string()))
                .collect(),
        }
    }
}

impl Properties {
    /// The process-wide store, loaded on first use.
    pub fn global() -> &'static Properties {
        static GLOBAL: OnceLock<Properties> = OnceLock::new();
        GLOBAL.get_or_init(Self::load_process_configuration)
    }

    fn load_process_configuration() -> Self {
        let path: PathBuf = std::env::var_os(CONFIGURATION_FILE_VARIABLE)
            .map(Into::into)
            .unwrap_or_else(|| DEFAULT_CONFIGURATION_FILE.into());
        let path: &Path = &path;
        if !path.is_file() {
            log::debug!("No SLP configuration at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::from_file(path) {
            Ok(properties) => {
                log::info!("Loaded SLP configuration from {}", path.display());
                properties
            }
            Err(e) => {
                log::warn!(
                    "Ignoring SLP configuration at {}: {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PropertyError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Parses `name = value` lines on top of the defaults.
    ///
    /// Blank lines and lines starting with `#` or `;` are skipped.
    pub fn parse(text: &str) -> Result<Self, PropertyError> {
        let mut properties = Self::default();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let (name, value) = line
                .split_once('=')
                .ok_or(PropertyError::Syntax(index + 1))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(PropertyError::Syntax(index + 1));
            }
            properties
                .values
                .insert(normalize(name), value.trim().to_string());
        }
        Ok(properties)
    }

    /// Returns a copy with one property replaced.
    ///
    /// This builds a configuration before any handle uses it; it is not a
    /// way to change a live configuration.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(normalize(name), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values.get(&normalize(name)).cloned()
    }

    /// Accepted and ignored: configuration is fixed when the process starts.
    pub fn set(&self, name: &str, value: &str) {
        log::debug!(
            "Ignoring assignment of property {} to {:?}, properties are read-only",
            name,
            value
        );
    }

    pub fn locale(&self) -> String {
        self.get("net.slp.locale")
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "en".into())
    }

    /// Scopes a handle uses when an operation does not name any.
    pub fn scopes(&self) -> Vec<String> {
        let scopes = split_list(&self.get("net.slp.useScopes").unwrap_or_default());
        if scopes.is_empty() {
            vec![DEFAULT_SCOPE.into()]
        } else {
            scopes
        }
    }

    /// Statically configured Directory Agents.
    ///
    /// Entries are IP addresses with an optional port. Host names are not
    /// resolved and are skipped.
    pub fn directory_agents(&self) -> Vec<SocketAddr> {
        let port = self.port();
        split_list(&self.get("net.slp.DAAddresses").unwrap_or_default())
            .into_iter()
            .filter_map(|entry| {
                if let Ok(address) = entry.parse::<SocketAddr>() {
                    return Some(address);
                }
                if let Ok(ip) = entry.parse::<IpAddr>() {
                    return Some(SocketAddr::new(ip, port));
                }
                log::warn!("Skipping Directory Agent address {:?}", entry);
                None
            })
            .collect()
    }

    pub fn port(&self) -> u16 {
        self.parse_or("net.slp.port", DEFAULT_PORT)
    }

    pub fn multicast_ttl(&self) -> u32 {
        self.parse_or("net.slp.multicastTTL", 255)
    }

    pub fn mtu(&self) -> usize {
        self.parse_or("net.slp.MTU", 1400)
    }

    pub fn multicast_maximum_wait(&self) -> Duration {
        Duration::from_millis(self.parse_or("net.slp.multicastMaximumWait", 15000))
    }

    pub fn multicast_timeouts(&self) -> Vec<Duration> {
        self.durations("net.slp.multicastTimeouts")
    }

    pub fn unicast_maximum_wait(&self) -> Duration {
        Duration::from_millis(self.parse_or("net.slp.unicastMaximumWait", 15000))
    }

    pub fn unicast_timeouts(&self) -> Vec<Duration> {
        self.durations("net.slp.unicastTimeouts")
    }

    pub fn is_broadcast_only(&self) -> bool {
        self.parse_or("net.slp.isBroadcastOnly", false)
    }

    pub fn min_refresh_interval(&self) -> u32 {
        self.parse_or("net.slp.minRefreshInterval", 0)
    }

    fn parse_or<T: FromStr>(&self, name: &str, default: T) -> T {
        let Some(value) = self.get(name) else {
            return default;
        };
        match value.trim().to_ascii_lowercase().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::debug!("Malformed value {:?} for property {}", value, name);
                default
            }
        }
    }

    fn durations(&self, name: &str) -> Vec<Duration> {
        let parsed: Result<Vec<u64>, _> = split_list(&self.get(name).unwrap_or_default())
            .iter()
            .map(|t| t.parse())
            .collect();
        let millis = match parsed {
            Ok(millis) if !millis.is_empty() && !millis.contains(&0) => millis,
            _ => {
                log::debug!("Malformed timeouts for property {}", name);
                split_list(DEFAULT_TIMEOUTS)
                    .iter()
                    .filter_map(|t| t.parse().ok())
                    .collect()
            }
        };
        millis.into_iter().map(Duration::from_millis).collect()
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Into::into)
        .collect()
}
