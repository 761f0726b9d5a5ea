use crate::error::Error;
use ::config::Config;
use std::time::Duration;

pub(crate) const DEFAULT_DISPATCHER_POOL_SIZE: usize = 2;
pub(crate) const DEFAULT_WORKER_POOL_SIZE: usize = 4;
pub(crate) const DEFAULT_READ_BUFFER_PREALLOCATION_SIZE: usize = 65536;
pub(crate) const DEFAULT_READ_BUFFER_MIN_SIZE: usize = 64;
pub(crate) const DEFAULT_POLL_CAPACITY: usize = 256;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

// Missing keys fall back to a default; malformed values are reported.
fn optional<T>(result: Result<T, config::ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// When a TLS-capable connection starts its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStart {
    /// Handshake starts as soon as the connection is registered.
    Eager,
    /// Connection starts in plaintext; the application upgrades it with
    /// [`Connection::activate_secured_mode()`](crate::Connection::activate_secured_mode).
    OnDemand,
}

impl TlsStart {
    fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "eager" => Ok(TlsStart::Eager),
            "on_demand" => Ok(TlsStart::OnDemand),
            other => Err(Error::InvalidTlsStartMode {
                got: other.to_string(),
                valid: vec!["eager".to_string(), "on_demand".to_string()],
            }),
        }
    }
}

/// Immutable runtime settings, read once from a [`Config`].
///
/// # Configuration Keys
///
/// All keys can be namespaced (`name.key` is tried before `key`):
///
/// - `dispatcher_pool_size` (default 2)
/// - `worker_pool_size` (default 4)
/// - `read_buffer_preallocation_size` (default 65536)
/// - `read_buffer_min_size` (default 64)
/// - `poll_capacity` (default 256)
/// - `idle_timeout_ms`, `connection_timeout_ms` (default: never)
/// - `tls_server_cert`, `tls_server_key`, `tls_ca_cert`, `tls_server_name`
/// - `tls_start`: `"eager"` or `"on_demand"`. Unset means TLS (eager) only
///   where certificate material is configured. Once set, a connection whose
///   side lacks that material fails to open.
#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub dispatcher_pool_size: usize,
    pub worker_pool_size: usize,
    pub read_buffer_preallocation_size: usize,
    pub read_buffer_min_size: usize,
    pub poll_capacity: usize,
    pub idle_timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub tls_server_cert: Option<String>,
    pub tls_server_key: Option<String>,
    pub tls_ca_cert: Option<String>,
    pub tls_server_name: Option<String>,
    pub tls_start: Option<TlsStart>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: String::new(),
            dispatcher_pool_size: DEFAULT_DISPATCHER_POOL_SIZE,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            read_buffer_preallocation_size: DEFAULT_READ_BUFFER_PREALLOCATION_SIZE,
            read_buffer_min_size: DEFAULT_READ_BUFFER_MIN_SIZE,
            poll_capacity: DEFAULT_POLL_CAPACITY,
            idle_timeout: None,
            connection_timeout: None,
            tls_server_cert: None,
            tls_server_key: None,
            tls_ca_cert: None,
            tls_server_name: None,
            tls_start: None,
        }
    }
}

impl Settings {
    /// Reads settings from un-namespaced keys.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads settings, preferring keys under the `name.` namespace.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Settings::default();

        let usize_or = |key: &str, default: usize| -> Result<usize, Error> {
            Ok(optional(get_namespaced_usize(config, name, key))?.unwrap_or(default))
        };
        let millis = |key: &str| -> Result<Option<Duration>, Error> {
            Ok(optional(get_namespaced_u64(config, name, key))?.map(Duration::from_millis))
        };
        let string = |key: &str| optional(get_namespaced_string(config, name, key));

        let tls_start = match string("tls_start")? {
            Some(value) => Some(TlsStart::parse(&value)?),
            None => defaults.tls_start,
        };

        Ok(Self {
            name: name.to_string(),
            dispatcher_pool_size: usize_or("dispatcher_pool_size", defaults.dispatcher_pool_size)?
                .max(1),
            worker_pool_size: usize_or("worker_pool_size", defaults.worker_pool_size)?.max(1),
            read_buffer_preallocation_size: usize_or(
                "read_buffer_preallocation_size",
                defaults.read_buffer_preallocation_size,
            )?,
            read_buffer_min_size: usize_or("read_buffer_min_size", defaults.read_buffer_min_size)?,
            poll_capacity: usize_or("poll_capacity", defaults.poll_capacity)?,
            idle_timeout: millis("idle_timeout_ms")?,
            connection_timeout: millis("connection_timeout_ms")?,
            tls_server_cert: string("tls_server_cert")?,
            tls_server_key: string("tls_server_key")?,
            tls_ca_cert: string("tls_ca_cert")?,
            tls_server_name: string("tls_server_name")?,
            tls_start,
        })
    }
}
