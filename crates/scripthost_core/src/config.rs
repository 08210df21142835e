//! Interpreter host configuration resolution.
//!
//! # Responsibility
//! - Resolve interpreter home, module search path and execution limits.
//! - Build the isolated property snapshot handed to a session.
//!
//! # Invariants
//! - Precedence is explicit argument > environment variable > property.
//! - A missing interpreter home disables scripting; it is never fatal.
//! - Transport-security properties never reach the session snapshot.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Environment variable naming the interpreter home directory.
pub const ENV_SCRIPT_HOME: &str = "SCRIPT_HOME";
/// Environment variable naming the custom module search path.
pub const ENV_SCRIPT_PATH: &str = "SCRIPT_PATH";
/// Property naming the interpreter home directory.
pub const PROPERTY_SCRIPT_HOME: &str = "script.home";
/// Property naming the custom module search path.
pub const PROPERTY_SCRIPT_PATH: &str = "script.path";
/// Session-private class path, always pinned to `.`.
pub const PROPERTY_CLASS_PATH: &str = "script.class.path";
/// Session-private native library path, always pinned to empty.
pub const PROPERTY_LIBRARY_PATH: &str = "script.library.path";

pub const PROPERTY_MAX_OPERATIONS: &str = "script.max_operations";
pub const PROPERTY_MAX_CALL_LEVELS: &str = "script.max_call_levels";
pub const PROPERTY_MAX_EXPR_DEPTH: &str = "script.max_expr_depth";
pub const PROPERTY_MAX_STRING_SIZE: &str = "script.max_string_size";
pub const PROPERTY_MAX_ARRAY_SIZE: &str = "script.max_array_size";
pub const PROPERTY_MAX_MAP_SIZE: &str = "script.max_map_size";

const CACHE_NAMESPACE_DIR: &str = "scripthost";
const CACHE_DIR: &str = "cachedir";
const HOME_LIBRARY_DIR: &str = "lib";

/// Read-only key/value lookup used for environment variables and properties.
pub trait PropertySource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// All entries visible to scripts. Sources that cannot enumerate return
    /// an empty map.
    fn snapshot(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl PropertySource for ProcessEnvironment {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// In-memory system property table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl FromIterator<(String, String)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl PropertySource for Properties {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.clone()
    }
}

/// Configuration inputs of one host process.
#[derive(Clone)]
pub struct HostEnvironment {
    env: Arc<dyn PropertySource>,
    properties: Arc<dyn PropertySource>,
    temp_dir: PathBuf,
}

impl HostEnvironment {
    pub fn new(
        env: impl PropertySource + 'static,
        properties: impl PropertySource + 'static,
    ) -> Self {
        Self {
            env: Arc::new(env),
            properties: Arc::new(properties),
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Real process environment plus the given system properties.
    pub fn from_process(properties: Properties) -> Self {
        Self::new(ProcessEnvironment, properties)
    }

    /// Overrides the host temp directory the cache directory is derived from.
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn temp_dir(&self) -> &PathBuf {
        &self.temp_dir
    }

    fn resolve(&self, explicit: Option<&str>, env_key: &str, property_key: &str) -> Option<String> {
        non_blank(explicit.map(str::to_string))
            .or_else(|| non_blank(self.env.get(env_key)))
            .or_else(|| non_blank(self.properties.get(property_key)))
    }
}

impl Debug for HostEnvironment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEnvironment")
            .field("temp_dir", &self.temp_dir)
            .finish_non_exhaustive()
    }
}

/// Resource ceilings applied to every script evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_string_size: 1024 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

/// Fully resolved interpreter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub home_dir: PathBuf,
    pub module_search_path: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub limits: ExecutionLimits,
    /// Scrubbed property snapshot exposed to scripts.
    pub session_properties: BTreeMap<String, String>,
}

impl HostConfig {
    /// Resolves configuration for one `initialize` call.
    ///
    /// # Errors
    /// - `NotConfigured` when no interpreter home resolves.
    /// - `InvalidLimit` when a limit property is not a number.
    pub fn resolve(
        module_search_path: Option<&str>,
        environment: &HostEnvironment,
    ) -> Result<Self, ConfigurationError> {
        let home = environment
            .resolve(None, ENV_SCRIPT_HOME, PROPERTY_SCRIPT_HOME)
            .ok_or(ConfigurationError::NotConfigured)?;
        let search_path =
            environment.resolve(module_search_path, ENV_SCRIPT_PATH, PROPERTY_SCRIPT_PATH);

        let defaults = ExecutionLimits::default();
        let properties = environment.properties.as_ref();
        let limits = ExecutionLimits {
            max_operations: parse_limit(
                properties,
                PROPERTY_MAX_OPERATIONS,
                defaults.max_operations,
            )?,
            max_call_levels: parse_limit(
                properties,
                PROPERTY_MAX_CALL_LEVELS,
                defaults.max_call_levels,
            )?,
            max_expr_depth: parse_limit(
                properties,
                PROPERTY_MAX_EXPR_DEPTH,
                defaults.max_expr_depth,
            )?,
            max_string_size: parse_limit(
                properties,
                PROPERTY_MAX_STRING_SIZE,
                defaults.max_string_size,
            )?,
            max_array_size: parse_limit(
                properties,
                PROPERTY_MAX_ARRAY_SIZE,
                defaults.max_array_size,
            )?,
            max_map_size: parse_limit(properties, PROPERTY_MAX_MAP_SIZE, defaults.max_map_size)?,
        };

        let mut session_properties = isolated_properties(properties);
        session_properties.insert(PROPERTY_SCRIPT_HOME.to_string(), home.clone());
        if let Some(path) = &search_path {
            session_properties.insert(PROPERTY_SCRIPT_PATH.to_string(), path.clone());
        }

        Ok(Self {
            home_dir: PathBuf::from(home),
            module_search_path: search_path.map(PathBuf::from),
            cache_dir: environment
                .temp_dir
                .join(CACHE_NAMESPACE_DIR)
                .join(CACHE_DIR),
            limits,
            session_properties,
        })
    }

    /// Directories searched by `import`, in lookup order.
    pub fn module_resolution_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(2);
        if let Some(path) = &self.module_search_path {
            paths.push(path.clone());
        }
        paths.push(self.home_dir.join(HOME_LIBRARY_DIR));
        paths
    }
}

/// Returns whether a property carries transport-security material.
pub fn is_transport_security_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.starts_with("javax.net.ssl.")
        || lower.starts_with("ssl.")
        || lower.contains("truststore")
        || lower.contains("keystore")
}

fn isolated_properties(source: &dyn PropertySource) -> BTreeMap<String, String> {
    let mut values = source.snapshot();
    values.retain(|key, _| !is_transport_security_key(key));
    values.insert(PROPERTY_CLASS_PATH.to_string(), ".".to_string());
    values.insert(PROPERTY_LIBRARY_PATH.to_string(), String::new());
    values
}

fn parse_limit<T: FromStr>(
    properties: &dyn PropertySource,
    key: &'static str,
    default: T,
) -> Result<T, ConfigurationError> {
    match non_blank(properties.get(key)) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigurationError::InvalidLimit { key, value: raw }),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

/// Interpreter preconditions that were not met.
#[derive(Debug)]
pub enum ConfigurationError {
    NotConfigured,
    InvalidLimit {
        key: &'static str,
        value: String,
    },
    CacheDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConfigured => write!(
                f,
                "interpreter home is not configured (set {ENV_SCRIPT_HOME} or `{PROPERTY_SCRIPT_HOME}`)"
            ),
            Self::InvalidLimit { key, value } => {
                write!(f, "property `{key}` must be a non-negative integer, got `{value}`")
            }
            Self::CacheDirectory { path, source } => write!(
                f,
                "failed to create cache directory `{}`: {source}",
                path.display()
            ),
        }
    }
}

impl Error for ConfigurationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CacheDirectory { source, .. } => Some(source),
            Self::NotConfigured | Self::InvalidLimit { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        is_transport_security_key, ConfigurationError, HostConfig, HostEnvironment, Properties,
        ENV_SCRIPT_HOME, ENV_SCRIPT_PATH, PROPERTY_CLASS_PATH, PROPERTY_LIBRARY_PATH,
        PROPERTY_MAX_OPERATIONS, PROPERTY_SCRIPT_HOME, PROPERTY_SCRIPT_PATH,
    };
    use std::path::PathBuf;

    fn environment(env: Properties, properties: Properties) -> HostEnvironment {
        HostEnvironment::new(env, properties).with_temp_dir("/tmp/host")
    }

    #[test]
    fn missing_home_is_not_configured() {
        let empty = environment(Properties::new(), Properties::new());
        let err = HostConfig::resolve(Some("/modules"), &empty)
            .expect_err("home is required");
        assert!(matches!(err, ConfigurationError::NotConfigured));
    }

    #[test]
    fn blank_home_is_not_configured() {
        let env = Properties::new().with(ENV_SCRIPT_HOME, "   ");
        let err = HostConfig::resolve(None, &environment(env, Properties::new()))
            .expect_err("blank home is treated as absent");
        assert!(matches!(err, ConfigurationError::NotConfigured));
    }

    #[test]
    fn environment_home_wins_over_property() {
        let env = Properties::new().with(ENV_SCRIPT_HOME, "/opt/env-home");
        let props = Properties::new().with(PROPERTY_SCRIPT_HOME, "/opt/prop-home");
        let config = HostConfig::resolve(None, &environment(env, props)).expect("resolve");
        assert_eq!(config.home_dir, PathBuf::from("/opt/env-home"));
    }

    #[test]
    fn search_path_precedence_is_argument_env_property() {
        let env = Properties::new()
            .with(ENV_SCRIPT_HOME, "/opt/home")
            .with(ENV_SCRIPT_PATH, "/env/modules");
        let props = Properties::new().with(PROPERTY_SCRIPT_PATH, "/prop/modules");
        let environment = environment(env, props.clone());

        let explicit = HostConfig::resolve(Some("/arg/modules"), &environment).expect("resolve");
        assert_eq!(explicit.module_search_path, Some(PathBuf::from("/arg/modules")));

        let from_env = HostConfig::resolve(None, &environment).expect("resolve");
        assert_eq!(from_env.module_search_path, Some(PathBuf::from("/env/modules")));

        let from_props = HostConfig::resolve(
            Some(""),
            &super::HostEnvironment::new(
                Properties::new().with(ENV_SCRIPT_HOME, "/opt/home"),
                props,
            ),
        )
        .expect("resolve");
        assert_eq!(from_props.module_search_path, Some(PathBuf::from("/prop/modules")));
    }

    #[test]
    fn cache_dir_derives_from_temp_dir() {
        let env = Properties::new().with(ENV_SCRIPT_HOME, "/opt/home");
        let config =
            HostConfig::resolve(None, &environment(env, Properties::new())).expect("resolve");
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/host/scripthost/cachedir"));
        assert_eq!(
            config.module_resolution_paths(),
            vec![PathBuf::from("/opt/home/lib")]
        );
    }

    #[test]
    fn session_properties_are_scrubbed_and_pinned() {
        let env = Properties::new().with(ENV_SCRIPT_HOME, "/opt/home");
        let props = Properties::new()
            .with("javax.net.ssl.trustStore", "/etc/pki/cacerts")
            .with("javax.net.ssl.trustStorePassword", "changeit")
            .with("server.keyStore", "/etc/keys.jks")
            .with(PROPERTY_CLASS_PATH, "/opt/app/lib")
            .with("app.name", "oxauth");
        let config = HostConfig::resolve(None, &environment(env, props)).expect("resolve");

        let session = &config.session_properties;
        assert!(!session.keys().any(|key| is_transport_security_key(key)));
        assert_eq!(session.get(PROPERTY_CLASS_PATH).map(String::as_str), Some("."));
        assert_eq!(session.get(PROPERTY_LIBRARY_PATH).map(String::as_str), Some(""));
        assert_eq!(session.get("app.name").map(String::as_str), Some("oxauth"));
        assert_eq!(session.get(PROPERTY_SCRIPT_HOME).map(String::as_str), Some("/opt/home"));
    }

    #[test]
    fn invalid_limit_is_rejected() {
        let env = Properties::new().with(ENV_SCRIPT_HOME, "/opt/home");
        let props = Properties::new().with(PROPERTY_MAX_OPERATIONS, "lots");
        let err = HostConfig::resolve(None, &environment(env, props)).expect_err("bad limit");
        assert!(matches!(
            err,
            ConfigurationError::InvalidLimit { key: PROPERTY_MAX_OPERATIONS, .. }
        ));
    }

    #[test]
    fn recognizes_transport_security_keys() {
        assert!(is_transport_security_key("javax.net.ssl.trustStore"));
        assert!(is_transport_security_key("SSL.cert"));
        assert!(is_transport_security_key("custom.TrustStore.path"));
        assert!(!is_transport_security_key("script.home"));
    }
}
