use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::resolver::ResolutionPolicy;
use crate::lookup::LookupTimeouts;

#[derive(Clone, Debug, Serialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub workflow: WorkflowConfig,
    pub audit: AuditConfig,
    pub directory_cache: DirectoryCacheConfig,
}

#[derive(Clone, Debug, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkflowConfig {
    pub resolution_policy: ResolutionPolicy,
    pub primary_lookup_timeout_ms: u64,
    pub fallback_lookup_timeout_ms: u64,
    pub transient_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl WorkflowConfig {
    pub fn lookup_timeouts(&self) -> LookupTimeouts {
        LookupTimeouts {
            primary: Duration::from_millis(self.primary_lookup_timeout_ms),
            fallback: Duration::from_millis(self.fallback_lookup_timeout_ms),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditConfig {
    pub buffer_capacity: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct DirectoryCacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub resolution_policy: Option<ResolutionPolicy>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://fundflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            workflow: WorkflowConfig {
                resolution_policy: ResolutionPolicy::Strict,
                primary_lookup_timeout_ms: 750,
                fallback_lookup_timeout_ms: 2_000,
                transient_retry_attempts: 3,
                retry_base_delay_ms: 25,
            },
            audit: AuditConfig { buffer_capacity: 1_024 },
            directory_cache: DirectoryCacheConfig { ttl_secs: 60, capacity: 512 },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl std::str::FromStr for ResolutionPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ResolutionPolicy::parse(value).ok_or_else(|| {
            ConfigError::Validation(format!(
                "unsupported resolution policy `{}` (expected strict|lowest_user_id|round_robin)",
                value.trim()
            ))
        })
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("fundflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(workflow) = patch.workflow {
            if let Some(resolution_policy) = workflow.resolution_policy {
                self.workflow.resolution_policy = resolution_policy;
            }
            if let Some(timeout) = workflow.primary_lookup_timeout_ms {
                self.workflow.primary_lookup_timeout_ms = timeout;
            }
            if let Some(timeout) = workflow.fallback_lookup_timeout_ms {
                self.workflow.fallback_lookup_timeout_ms = timeout;
            }
            if let Some(attempts) = workflow.transient_retry_attempts {
                self.workflow.transient_retry_attempts = attempts;
            }
            if let Some(delay) = workflow.retry_base_delay_ms {
                self.workflow.retry_base_delay_ms = delay;
            }
        }

        if let Some(audit) = patch.audit {
            if let Some(buffer_capacity) = audit.buffer_capacity {
                self.audit.buffer_capacity = buffer_capacity;
            }
        }

        if let Some(cache) = patch.directory_cache {
            if let Some(ttl_secs) = cache.ttl_secs {
                self.directory_cache.ttl_secs = ttl_secs;
            }
            if let Some(capacity) = cache.capacity {
                self.directory_cache.capacity = capacity;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("FUNDFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("FUNDFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_num("FUNDFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("FUNDFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_num("FUNDFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FUNDFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("FUNDFLOW_SERVER_PORT") {
            self.server.port = parse_num("FUNDFLOW_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("FUNDFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_num("FUNDFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("FUNDFLOW_LOGGING_LEVEL").or_else(|| read_env("FUNDFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("FUNDFLOW_LOGGING_FORMAT").or_else(|| read_env("FUNDFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        if let Some(value) = read_env("FUNDFLOW_WORKFLOW_RESOLUTION_POLICY") {
            self.workflow.resolution_policy = value.parse()?;
        }
        if let Some(value) = read_env("FUNDFLOW_WORKFLOW_PRIMARY_LOOKUP_TIMEOUT_MS") {
            self.workflow.primary_lookup_timeout_ms =
                parse_num("FUNDFLOW_WORKFLOW_PRIMARY_LOOKUP_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("FUNDFLOW_WORKFLOW_FALLBACK_LOOKUP_TIMEOUT_MS") {
            self.workflow.fallback_lookup_timeout_ms =
                parse_num("FUNDFLOW_WORKFLOW_FALLBACK_LOOKUP_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("FUNDFLOW_WORKFLOW_TRANSIENT_RETRY_ATTEMPTS") {
            self.workflow.transient_retry_attempts =
                parse_num("FUNDFLOW_WORKFLOW_TRANSIENT_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("FUNDFLOW_WORKFLOW_RETRY_BASE_DELAY_MS") {
            self.workflow.retry_base_delay_ms =
                parse_num("FUNDFLOW_WORKFLOW_RETRY_BASE_DELAY_MS", &value)?;
        }

        if let Some(value) = read_env("FUNDFLOW_AUDIT_BUFFER_CAPACITY") {
            self.audit.buffer_capacity = parse_num("FUNDFLOW_AUDIT_BUFFER_CAPACITY", &value)?;
        }

        if let Some(value) = read_env("FUNDFLOW_DIRECTORY_CACHE_TTL_SECS") {
            self.directory_cache.ttl_secs = parse_num("FUNDFLOW_DIRECTORY_CACHE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("FUNDFLOW_DIRECTORY_CACHE_CAPACITY") {
            self.directory_cache.capacity =
                parse_num("FUNDFLOW_DIRECTORY_CACHE_CAPACITY", &value)?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(policy) = overrides.resolution_policy {
            self.workflow.resolution_policy = policy;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_workflow(&self.workflow)?;
        validate_audit(&self.audit)?;
        validate_directory_cache(&self.directory_cache)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("fundflow.toml"), PathBuf::from("config/fundflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_workflow(workflow: &WorkflowConfig) -> Result<(), ConfigError> {
    if workflow.primary_lookup_timeout_ms == 0 || workflow.fallback_lookup_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "workflow lookup timeouts must be greater than zero".to_string(),
        ));
    }

    if workflow.primary_lookup_timeout_ms > workflow.fallback_lookup_timeout_ms {
        return Err(ConfigError::Validation(
            "workflow.primary_lookup_timeout_ms must not exceed fallback_lookup_timeout_ms"
                .to_string(),
        ));
    }

    if workflow.transient_retry_attempts > 10 {
        return Err(ConfigError::Validation(
            "workflow.transient_retry_attempts must be in range 0..=10".to_string(),
        ));
    }

    if workflow.retry_base_delay_ms > 5_000 {
        return Err(ConfigError::Validation(
            "workflow.retry_base_delay_ms must be at most 5000".to_string(),
        ));
    }

    Ok(())
}

fn validate_audit(audit: &AuditConfig) -> Result<(), ConfigError> {
    if audit.buffer_capacity == 0 {
        return Err(ConfigError::Validation(
            "audit.buffer_capacity must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_directory_cache(cache: &DirectoryCacheConfig) -> Result<(), ConfigError> {
    if cache.capacity == 0 {
        return Err(ConfigError::Validation(
            "directory_cache.capacity must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    workflow: Option<WorkflowPatch>,
    audit: Option<AuditPatch>,
    directory_cache: Option<DirectoryCachePatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowPatch {
    resolution_policy: Option<ResolutionPolicy>,
    primary_lookup_timeout_ms: Option<u64>,
    fallback_lookup_timeout_ms: Option<u64>,
    transient_retry_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AuditPatch {
    buffer_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryCachePatch {
    ttl_secs: Option<u64>,
    capacity: Option<usize>,
}
