//! Forwarder configuration.
//!
//! Every knob is both a flag and an environment variable; the environment
//! is what the injector wires up. Configuration is read once at startup
//! and immutable afterwards; validation failures are fatal before the
//! listener opens.

use crate::duration::Timeout;
use clap::Parser;
use ctxforge_rules::RuleSet;
use http::uri::Authority;
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;

pub const DEFAULT_PROXY_PORT: u16 = 9090;
pub const DEFAULT_METRICS_PORT: u16 = 9091;

#[derive(Debug, Parser)]
#[clap(name = "ctxforge-forwarder", about = "Header-propagating sidecar proxy")]
pub struct Args {
    /// Comma-separated header names to propagate (legacy input).
    #[clap(long, env = "HEADERS_TO_PROPAGATE")]
    pub headers_to_propagate: Option<String>,

    /// JSON rule array; takes precedence over --headers-to-propagate.
    #[clap(long, env = "HEADER_RULES")]
    pub header_rules: Option<String>,

    /// Application address requests are forwarded to.
    #[clap(long, env = "TARGET_HOST", default_value = "localhost:8080")]
    pub target_host: String,

    /// Port the proxy listens on, for both the reverse- and forward-proxy
    /// roles.
    #[clap(long, env = "PROXY_PORT", default_value_t = DEFAULT_PROXY_PORT)]
    pub proxy_port: u16,

    #[clap(long, env = "METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    #[clap(long, env = "READ_TIMEOUT", default_value = "15s")]
    pub read_timeout: Timeout,

    #[clap(long, env = "WRITE_TIMEOUT", default_value = "15s")]
    pub write_timeout: Timeout,

    #[clap(long, env = "IDLE_TIMEOUT", default_value = "60s")]
    pub idle_timeout: Timeout,

    #[clap(long, env = "READ_HEADER_TIMEOUT", default_value = "5s")]
    pub read_header_timeout: Timeout,

    #[clap(long, env = "TARGET_DIAL_TIMEOUT", default_value = "5s")]
    pub target_dial_timeout: Timeout,

    #[clap(
        long,
        env = "RATE_LIMIT_ENABLED",
        action = clap::ArgAction::Set,
        default_value_t = false
    )]
    pub rate_limit_enabled: bool,

    #[clap(long, env = "RATE_LIMIT_RPS", default_value_t = 1000.0)]
    pub rate_limit_rps: f64,

    #[clap(long, env = "RATE_LIMIT_BURST", default_value_t = 100)]
    pub rate_limit_burst: u64,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[clap(long, env = "LOG_FORMAT", default_value = "console")]
    pub log_format: LogFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Console,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" | "plain" => Ok(Self::Console),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::InvalidLogFormat(s.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Console => "console".fmt(f),
            Self::Json => "json".fmt(f),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("HEADERS_TO_PROPAGATE or HEADER_RULES is required (e.g. HEADERS_TO_PROPAGATE=x-request-id,x-tenant-id)")]
    NoHeaders,

    #[error("invalid HEADER_RULES: {0}")]
    InvalidRules(#[source] ctxforge_rules::ParseError),

    #[error("invalid HEADERS_TO_PROPAGATE: {0}")]
    InvalidHeaderList(#[source] ctxforge_rules::ParseError),

    #[error("invalid TARGET_HOST {0:?}: must be a host:port address")]
    InvalidTargetHost(String),

    #[error("invalid PROXY_PORT: 0 is not a usable port")]
    InvalidProxyPort,

    #[error("invalid METRICS_PORT: 0 is not a usable port")]
    InvalidMetricsPort,

    #[error("PROXY_PORT and METRICS_PORT cannot both be {0}")]
    PortCollision(u16),

    #[error("invalid {name}: timeouts must be positive")]
    NonPositiveTimeout { name: &'static str },

    #[error("invalid LOG_LEVEL {0:?}: must be debug, info, warn, or error")]
    InvalidLogLevel(String),

    #[error("invalid LOG_FORMAT {0:?}: must be console or json")]
    InvalidLogFormat(String),
}

/// Validated process-wide configuration.
#[derive(Debug)]
pub struct Config {
    pub rules: RuleSet,
    pub target_authority: Authority,
    pub proxy_port: u16,
    pub metrics_port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub read_header_timeout: Duration,
    pub target_dial_timeout: Duration,
    pub rate_limit_enabled: bool,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    pub fn try_from_args(args: Args) -> Result<Self, ConfigError> {
        if args.headers_to_propagate.is_none() && args.header_rules.is_none() {
            return Err(ConfigError::NoHeaders);
        }

        let rules = match (&args.header_rules, &args.headers_to_propagate) {
            (Some(json), _) => RuleSet::from_inputs(None, Some(json))
                .map_err(ConfigError::InvalidRules)?,
            (None, Some(list)) => RuleSet::from_inputs(Some(list), None)
                .map_err(ConfigError::InvalidHeaderList)?,
            (None, None) => unreachable!("checked above"),
        };

        let target_authority = args
            .target_host
            .parse::<Authority>()
            .ok()
            .filter(|a| a.port_u16().is_some())
            .ok_or_else(|| ConfigError::InvalidTargetHost(args.target_host.clone()))?;

        if args.proxy_port == 0 {
            return Err(ConfigError::InvalidProxyPort);
        }
        if args.metrics_port == 0 {
            return Err(ConfigError::InvalidMetricsPort);
        }
        if args.proxy_port == args.metrics_port {
            return Err(ConfigError::PortCollision(args.proxy_port));
        }

        for (name, timeout) in [
            ("READ_TIMEOUT", args.read_timeout),
            ("WRITE_TIMEOUT", args.write_timeout),
            ("IDLE_TIMEOUT", args.idle_timeout),
            ("READ_HEADER_TIMEOUT", args.read_header_timeout),
            ("TARGET_DIAL_TIMEOUT", args.target_dial_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::NonPositiveTimeout { name });
            }
        }

        let log_level = args.log_level.to_ascii_lowercase();
        if !matches!(log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::InvalidLogLevel(args.log_level));
        }

        Ok(Self {
            rules,
            target_authority,
            proxy_port: args.proxy_port,
            metrics_port: args.metrics_port,
            read_timeout: args.read_timeout.into(),
            write_timeout: args.write_timeout.into(),
            idle_timeout: args.idle_timeout.into(),
            read_header_timeout: args.read_header_timeout.into(),
            target_dial_timeout: args.target_dial_timeout.into(),
            rate_limit_enabled: args.rate_limit_enabled,
            rate_limit_rps: args.rate_limit_rps,
            rate_limit_burst: args.rate_limit_burst,
            log_level,
            log_format: args.log_format,
        })
    }
}
