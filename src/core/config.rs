//! Layered server configuration
//!
//! A `ServerConfig` is assembled once at startup from four layers, lowest
//! precedence first:
//!
//! 1. built-in defaults (and each module parameter's declared default)
//! 2. the persisted JSON file, if present
//! 3. environment variables (`AIO_MCP_PORT`, `AIO_MCP_TRANSPORT`,
//!    `AIO_MCP_SHUTDOWN_TIMEOUT`)
//! 4. explicit overrides supplied by the caller, usually from the command line
//!
//! The persisted file is a flat JSON object:
//! ```json
//! { "port": 8080, "transport": "sse", "greeting": "Hello" }
//! ```
//! Module parameters sit next to `port` and `transport` as top-level keys.
//! The file is only written when `save` is called explicitly.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::core::error::{Result, ServerError};

pub const ENV_PORT: &str = "AIO_MCP_PORT";
pub const ENV_TRANSPORT: &str = "AIO_MCP_TRANSPORT";
pub const ENV_SHUTDOWN_TIMEOUT: &str = "AIO_MCP_SHUTDOWN_TIMEOUT";

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport selected for the server loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-delimited JSON-RPC over stdin/stdout
    Stdio,
    /// HTTP server with a server-sent-events stream per client
    #[default]
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "sse" => Ok(TransportKind::Sse),
            other => Err(ServerError::Config(format!(
                "transport must be 'stdio' or 'sse', got '{other}'"
            ))),
        }
    }
}

/// Declared type of a module parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Int,
    Str,
    Float,
    Bool,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Int => "int",
            ParamType::Str => "str",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
        }
    }

    /// JSON Schema type name used when describing the parameter
    fn schema_type(&self) -> &'static str {
        match self {
            ParamType::Int => "integer",
            ParamType::Str => "string",
            ParamType::Float => "number",
            ParamType::Bool => "boolean",
        }
    }

    /// Convert a raw string (CLI flag, environment) into a typed value.
    ///
    /// Booleans accept `yes`, `true`, `t` and `1` (case-insensitive) as true;
    /// every other string is false.
    pub fn coerce(&self, name: &str, raw: &str) -> Result<Value> {
        let mismatch = || {
            ServerError::Config(format!(
                "module parameter '{name}' expects {}, got '{raw}'",
                self.as_str()
            ))
        };

        match self {
            ParamType::Str => Ok(Value::String(raw.to_string())),
            ParamType::Int => raw.trim().parse::<i64>().map(Value::from).map_err(|_| mismatch()),
            ParamType::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(mismatch),
            ParamType::Bool => Ok(Value::Bool(matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "yes" | "true" | "t" | "1"
            ))),
        }
    }

    /// Accept a JSON value that already has the right shape, or coerce a string.
    fn coerce_value(&self, name: &str, value: &Value) -> Result<Value> {
        match (self, value) {
            (_, Value::String(raw)) => self.coerce(name, raw),
            (ParamType::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            (ParamType::Float, Value::Number(_)) => Ok(value.clone()),
            (ParamType::Bool, Value::Bool(_)) => Ok(value.clone()),
            (ParamType::Str, Value::Number(_) | Value::Bool(_)) => {
                Ok(Value::String(value.to_string()))
            }
            _ => Err(ServerError::Config(format!(
                "module parameter '{name}' expects {}, got {value}",
                self.as_str()
            ))),
        }
    }
}

/// Descriptor of a module-specific parameter: `{type, help, default}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleParameter {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub help: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ModuleParameter {
    pub fn new(param_type: ParamType, help: impl Into<String>) -> Self {
        Self {
            param_type,
            help: help.into(),
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Resolved module parameter values handed to `ModuleManager::initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModuleParams(BTreeMap<String, Value>);

impl ModuleParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ModuleParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Highest-precedence configuration layer, usually parsed from the CLI.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub transport: Option<TransportKind>,
    pub shutdown_timeout: Option<Duration>,
    pub workers: Option<usize>,
    /// Raw `name -> value` strings, coerced with the parameter's declared type
    pub params: BTreeMap<String, String>,
}

/// Server configuration. Built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub github: String,
    /// Bind address for the SSE transport
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    /// Upper bound on how long shutdown waits for in-flight tool calls
    pub shutdown_timeout: Duration,
    /// HTTP worker threads for the SSE transport
    pub workers: usize,
    pub module_parameters: BTreeMap<String, ModuleParameter>,
    pub module_params: ModuleParams,
    /// File the persisted layer was read from (and `save` writes to by default)
    pub config_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> ServerConfigBuilder {
        ServerConfigBuilder::new(name, version)
    }

    /// Path of `config.json` next to the running executable.
    pub fn default_config_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(CONFIG_FILE_NAME)))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
    }

    /// Check the invariants the server loop relies on.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ServerError::Config("server name must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ServerError::Config(
                "port must be a positive integer, got 0".into(),
            ));
        }
        if self.workers == 0 {
            return Err(ServerError::Config("worker count must be at least 1".into()));
        }
        Ok(())
    }

    /// Persist port, transport and module parameter values as flat JSON.
    ///
    /// Never called implicitly while serving; the CLI calls it for
    /// `--save-config` and the project generator for a starter file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut doc = Map::new();
        doc.insert("port".into(), Value::from(self.port));
        doc.insert("transport".into(), Value::from(self.transport.as_str()));
        for (name, value) in self.module_params.iter() {
            doc.insert(name.clone(), value.clone());
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&Value::Object(doc))?)?;
        debug!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    /// Machine-readable description of how to launch this server.
    ///
    /// Mirrors the JSON-RPC `help` document launchers use to discover the
    /// transports and module parameters a server accepts.
    pub fn describe(&self) -> Value {
        let mut properties = Map::new();
        properties.insert(
            "transport".into(),
            serde_json::json!({
                "type": "string",
                "enum": ["stdio", "sse"],
                "description": "Transport type",
                "default": TransportKind::default().as_str()
            }),
        );
        properties.insert(
            "port".into(),
            serde_json::json!({
                "type": "integer",
                "description": "Server port (only used when transport=sse)",
                "default": DEFAULT_PORT
            }),
        );
        for (name, param) in &self.module_parameters {
            properties.insert(
                name.clone(),
                serde_json::json!({
                    "type": param.param_type.schema_type(),
                    "description": param.help,
                    "default": param.default.clone().unwrap_or(Value::String(String::new()))
                }),
            );
        }

        serde_json::json!({
            "type": "mcp",
            "name": self.name,
            "description": self.description,
            "author": self.author,
            "version": self.version,
            "github": self.github,
            "transport": ["stdio", "sse"],
            "methods": [
                { "name": "help", "description": "Show this help document." },
                {
                    "name": "start",
                    "description": "Start the server",
                    "inputSchema": { "type": "object", "properties": properties }
                }
            ]
        })
    }
}

/// Collects server metadata and parameter descriptors, then resolves the
/// configuration layers.
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    name: String,
    version: String,
    description: String,
    author: String,
    github: String,
    module_parameters: BTreeMap<String, ModuleParameter>,
    config_path: Option<PathBuf>,
    overrides: ConfigOverrides,
}

impl ServerConfigBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            github: String::new(),
            module_parameters: BTreeMap::new(),
            config_path: None,
            overrides: ConfigOverrides::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn github(mut self, github: impl Into<String>) -> Self {
        self.github = github.into();
        self
    }

    pub fn module_parameter(mut self, name: impl Into<String>, param: ModuleParameter) -> Self {
        self.module_parameters.insert(name.into(), param);
        self
    }

    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Resolve all layers against the process environment.
    pub fn build(self) -> Result<ServerConfig> {
        self.build_with_env(|key| std::env::var(key).ok())
    }

    /// Resolve all layers using `env` for variable lookups.
    pub fn build_with_env<F>(self, env: F) -> Result<ServerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut module_params = ModuleParams::new();
        for (name, param) in &self.module_parameters {
            if let Some(default) = &param.default {
                module_params.insert(name.clone(), param.param_type.coerce_value(name, default)?);
            }
        }

        let mut config = ServerConfig {
            name: self.name,
            version: self.version,
            description: self.description,
            author: self.author,
            github: self.github,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            transport: TransportKind::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            workers: default_workers(),
            module_parameters: self.module_parameters,
            module_params,
            config_path: self.config_path,
        };

        if let Some(doc) = config.config_path.as_deref().and_then(read_persisted) {
            apply_persisted(&mut config, &doc)?;
        }

        if let Some(raw) = env(ENV_PORT) {
            config.port = parse_port(&raw, ENV_PORT)?;
        }
        if let Some(raw) = env(ENV_TRANSPORT) {
            config.transport = raw.parse()?;
        }
        if let Some(raw) = env(ENV_SHUTDOWN_TIMEOUT) {
            let secs = raw.trim().parse::<u64>().map_err(|_| {
                ServerError::Config(format!(
                    "{ENV_SHUTDOWN_TIMEOUT} must be a number of seconds, got '{raw}'"
                ))
            })?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        apply_overrides(&mut config, self.overrides)?;
        config.validate()?;
        Ok(config)
    }
}

/// Default HTTP worker count: one per CPU, capped at 16.
fn default_workers() -> usize {
    num_cpus::get().clamp(1, 16)
}

fn parse_port(raw: &str, source: &str) -> Result<u16> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|port| *port > 0)
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| {
            ServerError::Config(format!("{source}: port must be a positive integer, got '{raw}'"))
        })
}

/// Read the persisted layer. A missing, unreadable or malformed file is skipped.
fn read_persisted(path: &Path) -> Option<Map<String, Value>> {
    if !path.exists() {
        return None;
    }
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read config file, ignoring it");
            return None;
        }
    };
    match serde_json::from_str::<Value>(text.trim_start_matches('\u{feff}')) {
        Ok(Value::Object(doc)) => Some(doc),
        Ok(_) => {
            warn!(path = %path.display(), "Config file is not a JSON object, ignoring it");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Malformed config file, ignoring it");
            None
        }
    }
}

fn apply_persisted(config: &mut ServerConfig, doc: &Map<String, Value>) -> Result<()> {
    for (key, value) in doc {
        match key.as_str() {
            // stdio runs used to persist a null port
            "port" if value.is_null() => {}
            "port" => {
                config.port = parse_port(&value_as_raw(value), "config file")?;
            }
            "transport" => {
                config.transport = value_as_raw(value).parse()?;
            }
            name => match config.module_parameters.get(name) {
                Some(param) => {
                    let value = param.param_type.coerce_value(name, value)?;
                    config.module_params.insert(name, value);
                }
                None => debug!(key = name, "Ignoring unknown key in config file"),
            },
        }
    }
    Ok(())
}

fn apply_overrides(config: &mut ServerConfig, overrides: ConfigOverrides) -> Result<()> {
    if let Some(host) = overrides.host {
        config.host = host;
    }
    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(transport) = overrides.transport {
        config.transport = transport;
    }
    if let Some(timeout) = overrides.shutdown_timeout {
        config.shutdown_timeout = timeout;
    }
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    for (name, raw) in overrides.params {
        let param = config
            .module_parameters
            .get(&name)
            .ok_or_else(|| ServerError::Config(format!("unknown module parameter '{name}'")))?;
        let value = param.param_type.coerce(&name, &raw)?;
        config.module_params.insert(name, value);
    }
    Ok(())
}

fn value_as_raw(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
