//! Runtime configuration: CLI command, `CRIE_*` environment options, and
//! the listen-address arithmetic that assigns each worker slot its private
//! Runtime API port.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const AWS_LAMBDA_RUNTIME_API: &str = "AWS_LAMBDA_RUNTIME_API";
pub const CRIE_MAX_CONCURRENCY: &str = "CRIE_MAX_CONCURRENCY";
pub const CRIE_INITIAL_CONCURRENCY: &str = "CRIE_INITIAL_CONCURRENCY";
pub const CRIE_QUEUE_SIZE: &str = "CRIE_QUEUE_SIZE";
pub const CRIE_WAIT_FOR_QUEUE_CAPACITY: &str = "CRIE_WAIT_FOR_QUEUE_CAPACITY";
pub const CRIE_SERVER_ADDRESS: &str = "CRIE_SERVER_ADDRESS";
pub const CRIE_SERVER_SHUTDOWN_TIMEOUT: &str = "CRIE_SERVER_SHUTDOWN_TIMEOUT";
pub const CRIE_LAMBDA_NAME: &str = "CRIE_LAMBDA_NAME";
pub const CRIE_MAX_HANDLE_ATTEMPTS: &str = "CRIE_MAX_HANDLE_ATTEMPTS";
pub const CRIE_DELAY_BETWEEN_HANDLE_ATTEMPTS: &str = "CRIE_DELAY_BETWEEN_HANDLE_ATTEMPTS";
pub const CRIE_RAPI_SERVER_SHUTDOWN_TIMEOUT: &str = "CRIE_RAPI_SERVER_SHUTDOWN_TIMEOUT";
pub const CRIE_LAMBDA_RUNTIME_DEADLINE: &str = "CRIE_LAMBDA_RUNTIME_DEADLINE";
pub const CRIE_LAMBDA_RUNTIME_INVOKED_FUNCTION_ARN: &str =
    "CRIE_LAMBDA_RUNTIME_INVOKED_FUNCTION_ARN";

const DEFAULT_MAX_CONCURRENCY: u16 = 2;
const DEFAULT_INITIAL_CONCURRENCY: u16 = 1;
const DEFAULT_QUEUE_SIZE: usize = 1000;
const DEFAULT_WAIT_FOR_QUEUE_CAPACITY: Duration = Duration::from_millis(100);
const DEFAULT_SERVER_PORT: u16 = 10000;
const DEFAULT_SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LAMBDA_NAME: &str = "function";
const DEFAULT_MAX_HANDLE_ATTEMPTS: u32 = 100;
const DEFAULT_DELAY_BETWEEN_HANDLE_ATTEMPTS: Duration = Duration::from_millis(100);
const DEFAULT_RAPI_SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(9);
const DEFAULT_LAMBDA_RUNTIME_DEADLINE: Duration = Duration::from_secs(90);
const DEFAULT_INVOKED_FUNCTION_ARN: &str =
    "arn:aws:lambda:us-east-1:000000000000:function:function";

/// Hard AWS ceiling for a single invocation.
const MAX_LAMBDA_RUNTIME_DEADLINE: Duration = Duration::from_secs(900);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("not enough parameters: usage is `crie <command> [args...]`")]
    MissingCommand,

    #[error("unable to parse {key}={value}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Constraint(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A `host:port` listen address; the host part may be empty, meaning all
/// interfaces, as in `:10000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    host: String,
    port: u16,
}

impl ListenAddress {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The address the frontend binds; an empty host binds all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.host.is_empty() {
            format!("0.0.0.0:{}", self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Private Runtime API address for a worker slot: base port offset by
    /// slot index + 1, loopback only.
    pub fn worker_address(&self, slot: usize) -> ListenAddress {
        ListenAddress {
            host: "127.0.0.1".to_string(),
            port: self.port + slot as u16 + 1,
        }
    }

    /// Value advertised to the child in `AWS_LAMBDA_RUNTIME_API`.
    pub fn runtime_api(&self) -> String {
        format!("localhost:{}", self.port)
    }
}

impl Default for ListenAddress {
    /// `:10000`, all interfaces.
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

impl FromStr for ListenAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| "expected host:port".to_string())?;
        let port: u16 = port.parse().map_err(|_| format!("invalid port {port:?}"))?;
        Ok(ListenAddress {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub command: String,
    pub args: Vec<String>,
    /// Set when the emulator itself was launched under a Runtime API, in
    /// which case it delegates instead of emulating.
    pub original_runtime_api: Option<String>,

    pub max_concurrency: u16,
    pub initial_concurrency: u16,
    pub queue_size: usize,
    pub wait_for_queue_capacity: Duration,
    pub server_address: ListenAddress,
    pub server_shutdown_timeout: Duration,
    pub lambda_name: String,
    pub max_handle_attempts: u32,
    pub delay_between_handle_attempts: Duration,
    pub rapi_server_shutdown_timeout: Duration,
    pub lambda_runtime_deadline: Duration,
    pub invoked_function_arn: String,
}

impl Config {
    /// Reads CLI arguments and process environment. `args` includes the
    /// program name at index 0.
    pub fn detect() -> Result<Config> {
        let args: Vec<String> = std::env::args().collect();
        let env: HashMap<String, String> = std::env::vars().collect();
        Config::from_parts(&args, &env)
    }

    /// Environment-map variant of [`Config::detect`], so tests never have
    /// to mutate process state.
    pub fn from_parts(args: &[String], env: &HashMap<String, String>) -> Result<Config> {
        if args.len() < 2 {
            return Err(ConfigError::MissingCommand);
        }

        let cfg = Config {
            command: args[1].clone(),
            args: args[2..].to_vec(),
            original_runtime_api: env.get(AWS_LAMBDA_RUNTIME_API).cloned(),
            max_concurrency: parse(env, CRIE_MAX_CONCURRENCY, DEFAULT_MAX_CONCURRENCY)?,
            initial_concurrency: parse(
                env,
                CRIE_INITIAL_CONCURRENCY,
                DEFAULT_INITIAL_CONCURRENCY,
            )?,
            queue_size: parse(env, CRIE_QUEUE_SIZE, DEFAULT_QUEUE_SIZE)?,
            wait_for_queue_capacity: parse_duration(
                env,
                CRIE_WAIT_FOR_QUEUE_CAPACITY,
                DEFAULT_WAIT_FOR_QUEUE_CAPACITY,
            )?,
            server_address: parse(env, CRIE_SERVER_ADDRESS, ListenAddress::default())?,
            server_shutdown_timeout: parse_duration(
                env,
                CRIE_SERVER_SHUTDOWN_TIMEOUT,
                DEFAULT_SERVER_SHUTDOWN_TIMEOUT,
            )?,
            lambda_name: env
                .get(CRIE_LAMBDA_NAME)
                .cloned()
                .unwrap_or_else(|| DEFAULT_LAMBDA_NAME.to_string()),
            max_handle_attempts: parse(env, CRIE_MAX_HANDLE_ATTEMPTS, DEFAULT_MAX_HANDLE_ATTEMPTS)?,
            delay_between_handle_attempts: parse_duration(
                env,
                CRIE_DELAY_BETWEEN_HANDLE_ATTEMPTS,
                DEFAULT_DELAY_BETWEEN_HANDLE_ATTEMPTS,
            )?,
            rapi_server_shutdown_timeout: parse_duration(
                env,
                CRIE_RAPI_SERVER_SHUTDOWN_TIMEOUT,
                DEFAULT_RAPI_SERVER_SHUTDOWN_TIMEOUT,
            )?,
            lambda_runtime_deadline: parse_duration(
                env,
                CRIE_LAMBDA_RUNTIME_DEADLINE,
                DEFAULT_LAMBDA_RUNTIME_DEADLINE,
            )?,
            invoked_function_arn: env
                .get(CRIE_LAMBDA_RUNTIME_INVOKED_FUNCTION_ARN)
                .cloned()
                .unwrap_or_else(|| DEFAULT_INVOKED_FUNCTION_ARN.to_string()),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Constraint(format!(
                "{CRIE_MAX_CONCURRENCY} must be at least 1"
            )));
        }
        if self.initial_concurrency > self.max_concurrency {
            return Err(ConfigError::Constraint(format!(
                "{CRIE_INITIAL_CONCURRENCY} must not exceed {CRIE_MAX_CONCURRENCY}"
            )));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::Constraint(format!(
                "{CRIE_QUEUE_SIZE} must be at least 1"
            )));
        }
        if self.rapi_server_shutdown_timeout >= self.server_shutdown_timeout {
            return Err(ConfigError::Constraint(format!(
                "{CRIE_RAPI_SERVER_SHUTDOWN_TIMEOUT} must be strictly less than {CRIE_SERVER_SHUTDOWN_TIMEOUT}"
            )));
        }
        if self.lambda_runtime_deadline > MAX_LAMBDA_RUNTIME_DEADLINE {
            return Err(ConfigError::Constraint(format!(
                "{CRIE_LAMBDA_RUNTIME_DEADLINE} must not exceed 900s"
            )));
        }
        let base_port = self.server_address.port() as u32;
        if base_port + self.max_concurrency as u32 >= 65536 {
            return Err(ConfigError::Constraint(format!(
                "worker ports would exceed 65535: base port {base_port} + {CRIE_MAX_CONCURRENCY} {}",
                self.max_concurrency
            )));
        }
        Ok(())
    }

    pub fn delegate_mode(&self) -> bool {
        self.original_runtime_api
            .as_deref()
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }
}

fn parse<T>(env: &HashMap<String, String>, key: &'static str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env.get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: value.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_duration(
    env: &HashMap<String, String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration> {
    match env.get(key) {
        None => Ok(default),
        Some(value) => {
            humantime::parse_duration(value).map_err(|e| ConfigError::InvalidValue {
                key,
                value: value.clone(),
                reason: e.to_string(),
            })
        }
    }
}
