//! # Configuration Module
//!
//! This module turns a declarative configuration document into an immutable, validated
//! [`Config`] snapshot. Loading is a three-step pipeline:
//!
//! 1. **Parse** the raw bytes into a [`ConfigDocument`] (TOML by default, YAML or JSON
//!    selected by file extension).
//! 2. **Resolve** every textual duration into a [`Duration`] (absent or empty means the
//!    documented default), parse algorithm and path-match tags, compile regex patterns and
//!    header rules, and parse listen addresses.
//! 3. **Validate** the cross-section invariants in a fixed order (upstreams, then locations,
//!    then servers), stopping at the first violation.
//!
//! Any failure aborts the whole load. There is no partially applied configuration.
//!
//! ## Key Features
//! - TOML/YAML/JSON parsing with serde
//! - Named sections keep document order, so routing tie-breaks follow the file
//! - Environment variable override for the log level
//! - Error messages name the offending section, entry and field

use http::header::{HeaderName, HeaderValue};
use http::Method;
use regex::Regex;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_PLUGIN_PRIORITY: i32 = 100;
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Environment variable that overrides `basic.log_level`
pub const LOG_LEVEL_ENV: &str = "GATEHOUSE_LOG_LEVEL";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Serialization format of a configuration document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension, defaulting to TOML
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("yaml") | Some("yml") => Self::Yaml,
            Some("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

/// A map of named sections that remembers document order.
///
/// Router tie-breaking depends on the order locations appear in the file, which a
/// `HashMap` would lose. Duplicate names are rejected while deserializing.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedSections<T>(Vec<(String, T)>);

impl<T> Default for NamedSections<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> NamedSections<T> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> FromIterator<(String, T)> for NamedSections<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for NamedSections<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SectionsVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for SectionsVisitor<T> {
            type Value = NamedSections<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of named sections")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(NamedSections::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, T)> =
                    Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, value)) = map.next_entry::<String, T>()? {
                    if entries.iter().any(|(existing, _)| existing == &name) {
                        return Err(de::Error::custom(format!(
                            "duplicate section name '{}'",
                            name
                        )));
                    }
                    entries.push((name, value));
                }
                Ok(NamedSections(entries))
            }
        }

        deserializer.deserialize_map(SectionsVisitor(PhantomData))
    }
}

// ---------------------------------------------------------------------------
// Raw document
// ---------------------------------------------------------------------------

/// The configuration document exactly as written by the operator
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
    pub basic: BasicSection,
    pub upstreams: NamedSections<UpstreamSection>,
    pub locations: NamedSections<LocationSection>,
    pub servers: NamedSections<ServerSection>,
    pub plugins: NamedSections<PluginSection>,
    pub metrics: MetricsSection,
    pub tracing: TracingSection,
    pub admin: AdminSection,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BasicSection {
    pub name: Option<String>,
    pub threads: usize,
    pub grace_period: Option<String>,
    pub pid_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub addrs: Vec<String>,
    pub weights: Vec<u32>,
    pub algorithm: Option<String>,
    pub health_check: Option<String>,
    pub health_check_interval: Option<String>,
    pub connection_timeout: Option<String>,
    pub read_timeout: Option<String>,
    pub write_timeout: Option<String>,
    pub idle_timeout: Option<String>,
    pub max_idle_conns_per_host: usize,
    pub tls_verify: Option<bool>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub sni: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocationSection {
    pub upstream: String,
    pub path: String,
    pub path_type: Option<String>,
    pub host: Option<String>,
    pub methods: Vec<String>,
    pub rewrite: Option<String>,
    pub priority: i32,
    pub plugins: Vec<String>,
    pub proxy_set_headers: BTreeMap<String, String>,
    pub proxy_add_headers: Vec<String>,
    pub proxy_remove_headers: Vec<String>,
    pub headers_set: BTreeMap<String, String>,
    pub headers_add: Vec<String>,
    pub headers_remove: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub addr: String,
    pub locations: Vec<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub enable_http2: bool,
    pub enable_websocket: bool,
    pub read_timeout: Option<String>,
    pub write_timeout: Option<String>,
    pub idle_timeout: Option<String>,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PluginSection {
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub enabled: bool,
    pub priority: i32,
    pub config: serde_json::Value,
}

impl Default for PluginSection {
    fn default() -> Self {
        Self {
            plugin_type: String::new(),
            enabled: true,
            priority: DEFAULT_PLUGIN_PRIORITY,
            config: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
    pub addr: Option<String>,
    pub path: Option<String>,
}

/// Distributed tracing settings; parsed and carried, not acted upon
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TracingSection {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub service_name: Option<String>,
    pub sample_rate: Option<f64>,
}

/// Admin API settings; parsed and carried, not acted upon
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    pub enabled: bool,
    pub addr: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Validated, immutable configuration snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub basic: BasicConfig,
    pub upstreams: Vec<UpstreamConfig>,
    pub locations: Vec<LocationConfig>,
    pub servers: Vec<ServerConfig>,
    pub plugins: Vec<PluginConfig>,
    pub metrics: MetricsConfig,
    pub tracing: TracingSection,
    pub admin: AdminSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicConfig {
    pub name: String,
    pub threads: usize,
    pub grace_period: Duration,
    pub pid_file: Option<PathBuf>,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Backend selection discipline of an upstream pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    IpHash,
    LeastConn,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::IpHash => "ip_hash",
            Self::LeastConn => "least_conn",
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "round_robin" => Ok(Self::RoundRobin),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            "ip_hash" => Ok(Self::IpHash),
            "least_conn" => Ok(Self::LeastConn),
            other => Err(format!(
                "unknown algorithm '{}' (expected round_robin, least_conn, ip_hash or weighted_round_robin)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    pub name: String,
    pub addrs: Vec<String>,
    pub weights: Vec<u32>,
    pub algorithm: Algorithm,
    pub health_check: Option<String>,
    pub health_check_interval: Duration,
    pub connection_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_idle_conns_per_host: usize,
    pub tls_verify: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub sni: Option<String>,
}

impl UpstreamConfig {
    /// Static weight of the backend at `index`; 1 when weights are absent
    pub fn weight_of(&self, index: usize) -> u32 {
        self.weights.get(index).copied().unwrap_or(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathType {
    Exact,
    #[default]
    Prefix,
    Regex,
}

impl FromStr for PathType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "" | "prefix" => Ok(Self::Prefix),
            "regex" => Ok(Self::Regex),
            other => Err(format!(
                "invalid path_type '{}' (expected exact, prefix or regex)",
                other
            )),
        }
    }
}

/// A regex compiled at load time. Two patterns are equal when their source is.
#[derive(Debug, Clone)]
pub struct CompiledPattern(pub Regex);

impl PartialEq for CompiledPattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

/// Header edits applied in a fixed order: remove, then set, then add
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderRules {
    pub remove: Vec<HeaderName>,
    pub set: Vec<(HeaderName, HeaderValue)>,
    pub add: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderRules {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.set.is_empty() && self.add.is_empty()
    }

    pub fn apply(&self, headers: &mut http::HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.add {
            headers.append(name.clone(), value.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationConfig {
    pub name: String,
    pub upstream: String,
    pub path: String,
    pub path_type: PathType,
    pub pattern: Option<CompiledPattern>,
    pub host: Option<String>,
    pub methods: Vec<Method>,
    pub rewrite: Option<String>,
    pub priority: i32,
    pub plugins: Vec<String>,
    pub request_headers: HeaderRules,
    pub response_headers: HeaderRules,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    pub addr: SocketAddr,
    pub locations: Vec<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub enable_http2: bool,
    pub enable_websocket: bool,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_header_bytes: usize,
    /// Largest request body buffered for forwarding
    pub max_body_bytes: usize,
}

impl ServerConfig {
    /// Certificate and key paths when TLS termination is configured
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginConfig {
    pub name: String,
    pub plugin_type: String,
    pub enabled: bool,
    pub priority: i32,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub addr: SocketAddr,
    pub path: String,
}

impl Config {
    /// Load, resolve and validate a configuration file.
    ///
    /// The format follows the file extension (`.yaml`/`.yml`, `.json`, anything else is TOML).
    pub fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|e| {
            GatewayError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::from_bytes_with_format(&content, ConfigFormat::from_path(path))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Resolve and validate a TOML document held in memory
    pub fn from_bytes(bytes: &[u8]) -> GatewayResult<Self> {
        Self::from_bytes_with_format(bytes, ConfigFormat::Toml)
    }

    pub fn from_bytes_with_format(bytes: &[u8], format: ConfigFormat) -> GatewayResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| GatewayError::config(format!("config is not valid UTF-8: {}", e)))?;
        Self::from_str_with_format(text, format)
    }

    pub fn from_str_with_format(text: &str, format: ConfigFormat) -> GatewayResult<Self> {
        let document: ConfigDocument = match format {
            ConfigFormat::Toml => toml::from_str(text)?,
            ConfigFormat::Yaml => serde_yaml::from_str(text)?,
            ConfigFormat::Json => serde_json::from_str(text)?,
        };
        Self::from_document(document)
    }

    /// Resolve a parsed document and check every invariant
    pub fn from_document(document: ConfigDocument) -> GatewayResult<Self> {
        let config = document.resolve()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            self.override_log_level(&level)?;
        }
        Ok(())
    }

    fn override_log_level(&mut self, level: &str) -> GatewayResult<()> {
        let level = level.trim().to_ascii_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(GatewayError::config(format!(
                "Invalid {}: {}",
                LOG_LEVEL_ENV, level
            )));
        }
        self.basic.log_level = level;
        Ok(())
    }

    /// Check the cross-section invariants, returning the first violation.
    ///
    /// Order is fixed: upstreams, then locations, then servers, each in document order.
    pub fn validate(&self) -> GatewayResult<()> {
        for upstream in &self.upstreams {
            if upstream.addrs.is_empty() {
                return Err(invalid("upstream", &upstream.name, "addrs", "at least one address is required"));
            }
            if upstream.addrs.iter().any(|addr| addr.trim().is_empty()) {
                return Err(invalid("upstream", &upstream.name, "addrs", "addresses must not be empty"));
            }
            if upstream.algorithm == Algorithm::WeightedRoundRobin
                && upstream.weights.len() != upstream.addrs.len()
            {
                return Err(invalid(
                    "upstream",
                    &upstream.name,
                    "weights",
                    &format!(
                        "weighted_round_robin needs one weight per address ({} weights for {} addrs)",
                        upstream.weights.len(),
                        upstream.addrs.len()
                    ),
                ));
            }
            if upstream.weights.iter().any(|w| *w == 0) {
                return Err(invalid("upstream", &upstream.name, "weights", "weights must be at least 1"));
            }
            if upstream.tls_cert.is_some() != upstream.tls_key.is_some() {
                return Err(invalid(
                    "upstream",
                    &upstream.name,
                    "tls_cert",
                    "tls_cert and tls_key must be set together",
                ));
            }
            if let Some(target) = upstream.health_check.as_deref() {
                validate_health_url(&upstream.name, target)?;
            }
            for (field, value) in [
                ("health_check_interval", upstream.health_check_interval),
                ("connection_timeout", upstream.connection_timeout),
                ("write_timeout", upstream.write_timeout),
            ] {
                if value.is_zero() {
                    return Err(invalid("upstream", &upstream.name, field, "must be greater than zero"));
                }
            }
        }

        for location in &self.locations {
            if location.upstream.is_empty() {
                return Err(invalid("location", &location.name, "upstream", "upstream is required"));
            }
            if self.upstream(&location.upstream).is_none() {
                return Err(invalid(
                    "location",
                    &location.name,
                    "upstream",
                    &format!("unknown upstream '{}'", location.upstream),
                ));
            }
            if let Some(missing) = location
                .plugins
                .iter()
                .find(|name| self.plugin(name).is_none())
            {
                return Err(invalid(
                    "location",
                    &location.name,
                    "plugins",
                    &format!("unknown plugin '{}'", missing),
                ));
            }
        }

        for server in &self.servers {
            if server.locations.is_empty() {
                return Err(invalid("server", &server.name, "locations", "at least one location is required"));
            }
            if let Some(missing) = server
                .locations
                .iter()
                .find(|name| self.location(name).is_none())
            {
                return Err(invalid(
                    "server",
                    &server.name,
                    "locations",
                    &format!("unknown location '{}'", missing),
                ));
            }
            if server.tls_cert.is_some() != server.tls_key.is_some() {
                return Err(invalid(
                    "server",
                    &server.name,
                    "tls_cert",
                    "tls_cert and tls_key must be set together",
                ));
            }
            if server.read_timeout.is_zero() {
                return Err(invalid("server", &server.name, "read_timeout", "must be greater than zero"));
            }
        }

        for plugin in &self.plugins {
            if plugin.plugin_type.trim().is_empty() {
                return Err(invalid("plugin", &plugin.name, "type", "type is required"));
            }
        }

        Ok(())
    }

    pub fn upstream(&self, name: &str) -> Option<&UpstreamConfig> {
        self.upstreams.iter().find(|u| u.name == name)
    }

    pub fn location(&self, name: &str) -> Option<&LocationConfig> {
        self.locations.iter().find(|l| l.name == name)
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.iter().find(|p| p.name == name)
    }

    /// Locations served by `server`, in the order the server lists them
    pub fn locations_for(&self, server: &ServerConfig) -> Vec<LocationConfig> {
        server
            .locations
            .iter()
            .filter_map(|name| self.location(name).cloned())
            .collect()
    }
}

/// Full-URL health targets must parse once `{addr}` is filled in
fn validate_health_url(upstream: &str, target: &str) -> GatewayResult<()> {
    if !(target.starts_with("http://") || target.starts_with("https://")) {
        return Ok(());
    }
    let sample = target.replace("{addr}", "127.0.0.1:80");
    match url::Url::parse(&sample) {
        Ok(parsed) if parsed.host().is_some() => Ok(()),
        Ok(_) => Err(invalid("upstream", upstream, "health_check", "health check URL has no host")),
        Err(e) => Err(invalid(
            "upstream",
            upstream,
            "health_check",
            &format!("invalid health check URL '{}': {}", target, e),
        )),
    }
}

fn invalid(section: &str, name: &str, field: &str, reason: &str) -> GatewayError {
    GatewayError::config(format!("{} '{}': {}: {}", section, name, field, reason))
}

fn resolve_duration(
    value: &Option<String>,
    default: Duration,
    section: &str,
    name: &str,
    field: &str,
) -> GatewayResult<Duration> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(text) => humantime::parse_duration(text).map_err(|e| {
            invalid(section, name, field, &format!("invalid duration '{}': {}", text, e))
        }),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, String> {
    let addr = addr.trim();
    // ":8080" listens on every interface
    let candidate = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    candidate
        .parse()
        .map_err(|e| format!("invalid address '{}': {}", addr, e))
}

fn parse_header_name(raw: &str) -> Result<HeaderName, String> {
    HeaderName::from_bytes(raw.trim().as_bytes())
        .map_err(|_| format!("invalid header name '{}'", raw.trim()))
}

fn parse_header_value(raw: &str) -> Result<HeaderValue, String> {
    HeaderValue::from_str(raw.trim()).map_err(|_| format!("invalid header value '{}'", raw.trim()))
}

/// Parse `"Name: value"` entries
fn parse_header_lines(lines: &[String]) -> Result<Vec<(HeaderName, HeaderValue)>, String> {
    lines
        .iter()
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| format!("expected 'Name: value', got '{}'", line))?;
            Ok((parse_header_name(name)?, parse_header_value(value)?))
        })
        .collect()
}

fn parse_header_map(map: &BTreeMap<String, String>) -> Result<Vec<(HeaderName, HeaderValue)>, String> {
    map.iter()
        .map(|(name, value)| Ok((parse_header_name(name)?, parse_header_value(value)?)))
        .collect()
}

fn parse_header_names(names: &[String]) -> Result<Vec<HeaderName>, String> {
    names.iter().map(|name| parse_header_name(name)).collect()
}

impl ConfigDocument {
    /// Convert durations, tags, patterns, header rules and addresses into typed values
    pub fn resolve(self) -> GatewayResult<Config> {
        let basic = self.basic.resolve()?;

        let upstreams = self
            .upstreams
            .iter()
            .map(|(name, section)| section.resolve(name))
            .collect::<GatewayResult<Vec<_>>>()?;

        let locations = self
            .locations
            .iter()
            .map(|(name, section)| section.resolve(name))
            .collect::<GatewayResult<Vec<_>>>()?;

        let servers = self
            .servers
            .iter()
            .map(|(name, section)| section.resolve(name))
            .collect::<GatewayResult<Vec<_>>>()?;

        let plugins = self
            .plugins
            .iter()
            .map(|(name, section)| PluginConfig {
                name: name.to_string(),
                plugin_type: section.plugin_type.trim().to_string(),
                enabled: section.enabled,
                priority: section.priority,
                config: section.config.clone(),
            })
            .collect();

        let metrics = MetricsConfig {
            enabled: self.metrics.enabled,
            addr: match non_empty(&self.metrics.addr) {
                Some(addr) => parse_listen_addr(&addr)
                    .map_err(|reason| invalid("metrics", "metrics", "addr", &reason))?,
                None => SocketAddr::from(([127, 0, 0, 1], 9090)),
            },
            path: non_empty(&self.metrics.path).unwrap_or_else(|| "/metrics".to_string()),
        };

        Ok(Config {
            basic,
            upstreams,
            locations,
            servers,
            plugins,
            metrics,
            tracing: self.tracing,
            admin: self.admin,
        })
    }
}

impl BasicSection {
    fn resolve(&self) -> GatewayResult<BasicConfig> {
        let log_level = non_empty(&self.log_level)
            .unwrap_or_else(|| "info".to_string())
            .to_ascii_lowercase();
        if !VALID_LOG_LEVELS.contains(&log_level.as_str()) {
            return Err(invalid(
                "basic",
                "basic",
                "log_level",
                &format!("invalid log level '{}'", log_level),
            ));
        }

        let log_format = match non_empty(&self.log_format).as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(invalid(
                    "basic",
                    "basic",
                    "log_format",
                    &format!("invalid log format '{}' (expected text or json)", other),
                ))
            }
        };

        Ok(BasicConfig {
            name: non_empty(&self.name).unwrap_or_else(|| "gatehouse".to_string()),
            threads: self.threads,
            grace_period: resolve_duration(
                &self.grace_period,
                DEFAULT_GRACE_PERIOD,
                "basic",
                "basic",
                "grace_period",
            )?,
            pid_file: self.pid_file.clone(),
            log_level,
            log_format,
        })
    }
}

impl UpstreamSection {
    fn resolve(&self, name: &str) -> GatewayResult<UpstreamConfig> {
        let section = "upstream";
        let algorithm = self
            .algorithm
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .parse::<Algorithm>()
            .map_err(|reason| invalid(section, name, "algorithm", &reason))?;

        Ok(UpstreamConfig {
            name: name.to_string(),
            addrs: self.addrs.iter().map(|a| a.trim().to_string()).collect(),
            weights: self.weights.clone(),
            algorithm,
            health_check: non_empty(&self.health_check),
            health_check_interval: resolve_duration(
                &self.health_check_interval,
                DEFAULT_HEALTH_CHECK_INTERVAL,
                section,
                name,
                "health_check_interval",
            )?,
            connection_timeout: resolve_duration(
                &self.connection_timeout,
                DEFAULT_CONNECTION_TIMEOUT,
                section,
                name,
                "connection_timeout",
            )?,
            read_timeout: resolve_duration(&self.read_timeout, DEFAULT_READ_TIMEOUT, section, name, "read_timeout")?,
            write_timeout: resolve_duration(&self.write_timeout, DEFAULT_WRITE_TIMEOUT, section, name, "write_timeout")?,
            idle_timeout: resolve_duration(&self.idle_timeout, DEFAULT_IDLE_TIMEOUT, section, name, "idle_timeout")?,
            max_idle_conns_per_host: self.max_idle_conns_per_host,
            tls_verify: self.tls_verify.unwrap_or(true),
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            sni: non_empty(&self.sni),
        })
    }
}

impl LocationSection {
    fn resolve(&self, name: &str) -> GatewayResult<LocationConfig> {
        let section = "location";
        let path_type = self
            .path_type
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .parse::<PathType>()
            .map_err(|reason| invalid(section, name, "path_type", &reason))?;

        let pattern = match path_type {
            PathType::Regex => Some(CompiledPattern(Regex::new(&self.path).map_err(|e| {
                invalid(section, name, "path", &format!("invalid regex '{}': {}", self.path, e))
            })?)),
            _ => None,
        };

        let methods = self
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                    .map_err(|_| invalid(section, name, "methods", &format!("invalid method '{}'", m)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let request_headers = HeaderRules {
            remove: parse_header_names(&self.proxy_remove_headers)
                .map_err(|r| invalid(section, name, "proxy_remove_headers", &r))?,
            set: parse_header_map(&self.proxy_set_headers)
                .map_err(|r| invalid(section, name, "proxy_set_headers", &r))?,
            add: parse_header_lines(&self.proxy_add_headers)
                .map_err(|r| invalid(section, name, "proxy_add_headers", &r))?,
        };

        let response_headers = HeaderRules {
            remove: parse_header_names(&self.headers_remove)
                .map_err(|r| invalid(section, name, "headers_remove", &r))?,
            set: parse_header_map(&self.headers_set)
                .map_err(|r| invalid(section, name, "headers_set", &r))?,
            add: parse_header_lines(&self.headers_add)
                .map_err(|r| invalid(section, name, "headers_add", &r))?,
        };

        Ok(LocationConfig {
            name: name.to_string(),
            upstream: self.upstream.trim().to_string(),
            path: self.path.clone(),
            path_type,
            pattern,
            host: non_empty(&self.host),
            methods,
            rewrite: self.rewrite.clone().filter(|r| !r.is_empty()),
            priority: self.priority,
            plugins: self.plugins.clone(),
            request_headers,
            response_headers,
        })
    }
}

impl ServerSection {
    fn resolve(&self, name: &str) -> GatewayResult<ServerConfig> {
        let section = "server";
        if self.addr.trim().is_empty() {
            return Err(invalid(section, name, "addr", "addr is required"));
        }
        let addr = parse_listen_addr(&self.addr).map_err(|reason| invalid(section, name, "addr", &reason))?;

        Ok(ServerConfig {
            name: name.to_string(),
            addr,
            locations: self.locations.clone(),
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            enable_http2: self.enable_http2,
            enable_websocket: self.enable_websocket,
            read_timeout: resolve_duration(&self.read_timeout, DEFAULT_READ_TIMEOUT, section, name, "read_timeout")?,
            write_timeout: resolve_duration(&self.write_timeout, DEFAULT_WRITE_TIMEOUT, section, name, "write_timeout")?,
            idle_timeout: resolve_duration(&self.idle_timeout, DEFAULT_IDLE_TIMEOUT, section, name, "idle_timeout")?,
            max_header_bytes: self.max_header_bytes,
            max_body_bytes: match self.max_body_bytes {
                0 => DEFAULT_MAX_BODY_BYTES,
                limit => limit,
            },
        })
    }
}
