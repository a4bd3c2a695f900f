//! Environment variable validation and configuration module for keengate
//!
//! This module provides centralized validation and configuration management
//! for all environment variables used by the proxy.
//!
//! # Supported Environment Variables
//!
//! ## Server Configuration
//! - `KEENGATE_HOST`: Server bind address (default: "0.0.0.0")
//! - `KEENGATE_PORT`: Server port (default: "5000")
//!
//! ## Upstream Configuration
//! - `KEENGATE_UPSTREAM_URL`: Base URL of the analytics API (default: "http://api.keen.io")
//! - `KEENGATE_UPSTREAM_TIMEOUT`: Upstream request timeout in seconds (default: "30")
//!
//! ## Key Configuration
//! - `KEENGATE_PUBLIC_SECRET`: 32-byte secret that scoped keys are issued with (required)
//! - `KEENGATE_MASTER_SECRET`: 32-byte secret trusted by the upstream (required)
//!
//! ## Origin Configuration
//! - `KEENGATE_ALLOWED_ORIGINS`: JSON array or comma separated list of origins
//!
//! ## Cache Configuration
//! - `KEENGATE_CACHE_DB_URL`: Cache database URL, or `memory` (default: "sqlite://keengate.db")
//! - `KEENGATE_CACHE_TTL`: Cached response lifetime in seconds (default: "600")
//! - `KEENGATE_CACHE_PRUNE_INTERVAL`: Seconds between pruning runs (default: "60")
//!
//! ## Logging Configuration
//! - `KEENGATE_LOG_LEVEL`: Log filter, falls back to `RUST_LOG`
//!
//! # Usage
//!
//! ```rust
//! use keengate::env::{validate_environment, get_config};
//!
//! let validation_result = validate_environment();
//! if let Err(errors) = validation_result {
//!     for error in errors {
//!         eprintln!("Environment validation error: {}", error.message);
//!     }
//!     std::process::exit(1);
//! }
//!
//! let config = get_config();
//! println!("Proxy will bind to {}", config.bind_address);
//! ```

use serde_json::Value;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing::{info, warn};

use crate::cache::{DEFAULT_CACHE_TTL, MEMORY_CACHE_URL};
use crate::token::TokenSecret;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_UPSTREAM_URL: &str = "http://api.keen.io";
pub const DEFAULT_CACHE_DB_URL: &str = "sqlite://keengate.db";
pub const DEFAULT_LOG_LEVEL: &str = "keengate=info,tower_http=info";
pub const DEFAULT_CACHE_PRUNE_INTERVAL: u64 = 60;
pub const DEFAULT_UPSTREAM_TIMEOUT: u64 = 30;

/// Environment validation errors
#[derive(Debug, Clone)]
pub struct EnvValidationError {
    pub variable: String,
    pub message: String,
    pub severity: ErrorSeverity,
}

impl EnvValidationError {
    fn new(variable: &str, message: String, severity: ErrorSeverity) -> Self {
        Self {
            variable: variable.to_string(),
            message,
            severity,
        }
    }
}

/// Severity level for environment validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    /// Critical errors that prevent application startup
    Critical,
    /// Warnings about missing optional variables or suboptimal configurations
    Warning,
    /// Informational messages about default values being used
    Info,
}

/// Validated application configuration derived from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Server
    pub bind_address: SocketAddr,

    // Upstream
    pub upstream_url: String,
    pub upstream_timeout: u64,

    // Keys
    pub public_secret: TokenSecret,
    pub master_secret: TokenSecret,

    // Origins
    pub allowed_origins: Vec<String>,

    // Cache
    pub cache_db_url: String,
    pub cache_ttl: u64,
    pub cache_prune_interval: u64,

    // Logging
    pub log_level: String,
}

/// Validate all environment variables and return configuration or errors
pub fn validate_environment() -> Result<AppConfig, Vec<EnvValidationError>> {
    validate_with(|name| env::var(name).ok())
}

/// Validate configuration read through `lookup`
pub fn validate_with<F>(lookup: F) -> Result<AppConfig, Vec<EnvValidationError>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Server configuration
    let host = lookup("KEENGATE_HOST").unwrap_or_else(|| {
        warnings.push(EnvValidationError::new(
            "KEENGATE_HOST",
            format!("Using default host '{}'", DEFAULT_HOST),
            ErrorSeverity::Info,
        ));
        DEFAULT_HOST.to_string()
    });

    let host_ip = match IpAddr::from_str(&host) {
        Ok(ip) => ip,
        Err(_) => {
            errors.push(EnvValidationError::new(
                "KEENGATE_HOST",
                format!("Invalid IP address: {}", host),
                ErrorSeverity::Critical,
            ));
            IpAddr::from([0, 0, 0, 0])
        }
    };

    let port = match lookup("KEENGATE_PORT") {
        Some(port_str) => match port_str.parse::<u16>() {
            Ok(port) => {
                if port < 1024 && port != 0 {
                    warnings.push(EnvValidationError::new(
                        "KEENGATE_PORT",
                        format!("Using privileged port {}, may require root privileges", port),
                        ErrorSeverity::Warning,
                    ));
                }
                port
            }
            Err(_) => {
                errors.push(EnvValidationError::new(
                    "KEENGATE_PORT",
                    format!("Invalid port number: {}", port_str),
                    ErrorSeverity::Critical,
                ));
                DEFAULT_PORT
            }
        },
        None => {
            warnings.push(EnvValidationError::new(
                "KEENGATE_PORT",
                format!("Using default port {}", DEFAULT_PORT),
                ErrorSeverity::Info,
            ));
            DEFAULT_PORT
        }
    };

    let bind_address = SocketAddr::new(host_ip, port);

    // Upstream configuration
    let upstream_url = lookup("KEENGATE_UPSTREAM_URL").unwrap_or_else(|| {
        warnings.push(EnvValidationError::new(
            "KEENGATE_UPSTREAM_URL",
            format!("Using default upstream '{}'", DEFAULT_UPSTREAM_URL),
            ErrorSeverity::Info,
        ));
        DEFAULT_UPSTREAM_URL.to_string()
    });

    match reqwest::Url::parse(&upstream_url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => errors.push(EnvValidationError::new(
            "KEENGATE_UPSTREAM_URL",
            format!("Unsupported scheme '{}', expected http or https", url.scheme()),
            ErrorSeverity::Critical,
        )),
        Err(e) => errors.push(EnvValidationError::new(
            "KEENGATE_UPSTREAM_URL",
            format!("Invalid URL '{}': {}", upstream_url, e),
            ErrorSeverity::Critical,
        )),
    }

    let upstream_timeout = parse_var_with_default(
        &lookup,
        "KEENGATE_UPSTREAM_TIMEOUT",
        DEFAULT_UPSTREAM_TIMEOUT,
        &mut warnings,
    );

    // Key configuration
    let public_secret = parse_secret(&lookup, "KEENGATE_PUBLIC_SECRET", &mut errors);
    let master_secret = parse_secret(&lookup, "KEENGATE_MASTER_SECRET", &mut errors);

    if let (Some(public), Some(master)) = (&public_secret, &master_secret) {
        if public == master {
            warnings.push(EnvValidationError::new(
                "KEENGATE_PUBLIC_SECRET/KEENGATE_MASTER_SECRET",
                "Public and master secrets are identical; scoped keys are then accepted upstream as-is"
                    .to_string(),
                ErrorSeverity::Warning,
            ));
        }
    }

    // Origin configuration
    let allowed_origins = match lookup("KEENGATE_ALLOWED_ORIGINS") {
        Some(raw) => match parse_allowed_origins(&raw) {
            Ok(origins) => origins,
            Err(message) => {
                errors.push(EnvValidationError::new(
                    "KEENGATE_ALLOWED_ORIGINS",
                    message,
                    ErrorSeverity::Critical,
                ));
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    if allowed_origins.is_empty() {
        warnings.push(EnvValidationError::new(
            "KEENGATE_ALLOWED_ORIGINS",
            "No allowed origins configured; every proxied request will be refused".to_string(),
            ErrorSeverity::Warning,
        ));
    }

    // Cache configuration
    let cache_db_url = lookup("KEENGATE_CACHE_DB_URL").unwrap_or_else(|| {
        warnings.push(EnvValidationError::new(
            "KEENGATE_CACHE_DB_URL",
            format!("Using default cache database '{}'", DEFAULT_CACHE_DB_URL),
            ErrorSeverity::Info,
        ));
        DEFAULT_CACHE_DB_URL.to_string()
    });

    if cache_db_url != MEMORY_CACHE_URL && !cache_db_url.starts_with("sqlite:") {
        errors.push(EnvValidationError::new(
            "KEENGATE_CACHE_DB_URL",
            format!(
                "Unsupported cache URL '{}', expected sqlite:... or '{}'",
                cache_db_url, MEMORY_CACHE_URL
            ),
            ErrorSeverity::Critical,
        ));
    }

    let cache_ttl =
        parse_var_with_default(&lookup, "KEENGATE_CACHE_TTL", DEFAULT_CACHE_TTL, &mut warnings);

    let mut cache_prune_interval = parse_var_with_default(
        &lookup,
        "KEENGATE_CACHE_PRUNE_INTERVAL",
        DEFAULT_CACHE_PRUNE_INTERVAL,
        &mut warnings,
    );
    if cache_prune_interval == 0 {
        warnings.push(EnvValidationError::new(
            "KEENGATE_CACHE_PRUNE_INTERVAL",
            format!(
                "Prune interval must be positive. Using default: {}",
                DEFAULT_CACHE_PRUNE_INTERVAL
            ),
            ErrorSeverity::Warning,
        ));
        cache_prune_interval = DEFAULT_CACHE_PRUNE_INTERVAL;
    }

    // Logging configuration
    let log_level = lookup("KEENGATE_LOG_LEVEL")
        .or_else(|| lookup("RUST_LOG"))
        .unwrap_or_else(|| {
            warnings.push(EnvValidationError::new(
                "KEENGATE_LOG_LEVEL/RUST_LOG",
                format!("Using default log level '{}'", DEFAULT_LOG_LEVEL),
                ErrorSeverity::Info,
            ));
            DEFAULT_LOG_LEVEL.to_string()
        });

    // Add all warnings to errors for reporting
    errors.extend(warnings);

    let (Some(public_secret), Some(master_secret)) = (public_secret, master_secret) else {
        return Err(errors);
    };

    if errors.iter().any(|e| e.severity == ErrorSeverity::Critical) {
        return Err(errors);
    }

    // Log non-critical issues
    for error in &errors {
        match error.severity {
            ErrorSeverity::Warning => warn!("{}: {}", error.variable, error.message),
            ErrorSeverity::Info => info!("{}: {}", error.variable, error.message),
            ErrorSeverity::Critical => {}
        }
    }

    Ok(AppConfig {
        bind_address,
        upstream_url,
        upstream_timeout,
        public_secret,
        master_secret,
        allowed_origins,
        cache_db_url,
        cache_ttl,
        cache_prune_interval,
        log_level,
    })
}

/// Get the validated configuration, exiting if validation fails
pub fn get_config() -> AppConfig {
    match validate_environment() {
        Ok(config) => config,
        Err(errors) => {
            eprintln!("Environment validation failed:");
            for error in errors {
                let label = match error.severity {
                    ErrorSeverity::Critical => "CRITICAL",
                    ErrorSeverity::Warning => "WARNING",
                    ErrorSeverity::Info => "INFO",
                };
                eprintln!("{} - {}: {}", label, error.variable, error.message);
            }
            std::process::exit(1);
        }
    }
}

/// Print environment validation results in a user-friendly format
pub fn print_validation_results(result: &Result<AppConfig, Vec<EnvValidationError>>) {
    match result {
        Ok(config) => {
            println!("Environment validation successful");
            println!("Configuration:");
            println!("  Server: {}", config.bind_address);
            println!("  Upstream: {} (timeout: {}s)", config.upstream_url, config.upstream_timeout);
            println!("  Allowed Origins: {}", config.allowed_origins.join(", "));
            println!("  Cache Database: {}", config.cache_db_url);
            println!("  Cache TTL: {}s", config.cache_ttl);
            println!("  Cache Prune Interval: {}s", config.cache_prune_interval);
            println!("  Log Level: {}", config.log_level);
        }
        Err(errors) => {
            let count = |severity: ErrorSeverity| errors.iter().filter(|e| e.severity == severity).count();
            let critical_count = count(ErrorSeverity::Critical);
            let warning_count = count(ErrorSeverity::Warning);
            let info_count = count(ErrorSeverity::Info);

            if critical_count > 0 {
                eprintln!(
                    "Environment validation failed with {} critical error(s), {} warning(s), {} info message(s):",
                    critical_count, warning_count, info_count
                );
            } else {
                println!(
                    "Environment validation completed with {} warning(s), {} info message(s):",
                    warning_count, info_count
                );
            }

            for error in errors {
                let prefix = match error.severity {
                    ErrorSeverity::Critical => "CRITICAL",
                    ErrorSeverity::Warning => "WARNING",
                    ErrorSeverity::Info => "INFO",
                };
                println!("  {} - {}: {}", prefix, error.variable, error.message);
            }
        }
    }
}

/// Generate example environment configuration file
pub fn generate_env_example() -> String {
    format!(
        r#"# keengate Environment Configuration
# Copy this file to .env and customize the values for your deployment

# =============================================================================
# Server Configuration
# =============================================================================

# Server bind address
# Default: {host}
KEENGATE_HOST={host}

# Server port
# Default: {port}
KEENGATE_PORT={port}

# =============================================================================
# Upstream Configuration
# =============================================================================

# Base URL of the analytics API queries are forwarded to
# Default: {upstream}
KEENGATE_UPSTREAM_URL={upstream}

# Upstream request timeout in seconds
# Default: {timeout}
KEENGATE_UPSTREAM_TIMEOUT={timeout}

# =============================================================================
# Key Configuration (required)
# =============================================================================

# Secret scoped keys are issued with; exactly 32 bytes
# Generate one with: keengate generate-secret
KEENGATE_PUBLIC_SECRET=

# Secret the upstream trusts; exactly 32 bytes, never shared with clients
KEENGATE_MASTER_SECRET=

# =============================================================================
# Origin Configuration
# =============================================================================

# Origins allowed to query through the proxy
# JSON array or comma separated list
# Examples:
#   KEENGATE_ALLOWED_ORIGINS=["https://dashboard.example.com"]
#   KEENGATE_ALLOWED_ORIGINS=https://a.example.com,https://b.example.com
KEENGATE_ALLOWED_ORIGINS=

# =============================================================================
# Cache Configuration
# =============================================================================

# Cache database URL; use "{memory}" for an in-process cache
# Default: {cache_db}
KEENGATE_CACHE_DB_URL={cache_db}

# Lifetime of cached responses in seconds
# Default: {ttl}
KEENGATE_CACHE_TTL={ttl}

# Seconds between removals of expired cache records
# Default: {prune}
KEENGATE_CACHE_PRUNE_INTERVAL={prune}

# =============================================================================
# Logging Configuration
# =============================================================================

# Log filter, falls back to RUST_LOG
# Default: {log}
KEENGATE_LOG_LEVEL={log}
"#,
        host = DEFAULT_HOST,
        port = DEFAULT_PORT,
        upstream = DEFAULT_UPSTREAM_URL,
        timeout = DEFAULT_UPSTREAM_TIMEOUT,
        memory = MEMORY_CACHE_URL,
        cache_db = DEFAULT_CACHE_DB_URL,
        ttl = DEFAULT_CACHE_TTL,
        prune = DEFAULT_CACHE_PRUNE_INTERVAL,
        log = DEFAULT_LOG_LEVEL,
    )
}

/// Parse an origin list given as a JSON array or a comma separated list
pub fn parse_allowed_origins(raw: &str) -> Result<Vec<String>, String> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| format!("Invalid JSON origin list: {}", e))?;
        let Value::Array(items) = value else {
            return Err("Origin list must be a JSON array".to_string());
        };
        return items
            .into_iter()
            .map(|item| match item {
                Value::String(origin) => Ok(origin.trim().to_string()),
                other => Err(format!("Origin list entries must be strings, found {}", other)),
            })
            .filter(|origin| !matches!(origin, Ok(o) if o.is_empty()))
            .collect();
    }

    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_secret<F>(
    lookup: &F,
    var_name: &str,
    errors: &mut Vec<EnvValidationError>,
) -> Option<TokenSecret>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var_name) {
        Some(value) => match TokenSecret::new(&value) {
            Ok(secret) => Some(secret),
            Err(e) => {
                errors.push(EnvValidationError::new(var_name, e.to_string(), ErrorSeverity::Critical));
                None
            }
        },
        None => {
            errors.push(EnvValidationError::new(
                var_name,
                "Required variable is not set".to_string(),
                ErrorSeverity::Critical,
            ));
            None
        }
    }
}

/// Helper function to parse a variable with a default value
fn parse_var_with_default<F, T>(
    lookup: &F,
    var_name: &str,
    default: T,
    warnings: &mut Vec<EnvValidationError>,
) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Clone + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match lookup(var_name) {
        Some(value_str) => match value_str.parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                warnings.push(EnvValidationError::new(
                    var_name,
                    format!("Invalid value '{}': {}. Using default: {}", value_str, e, default),
                    ErrorSeverity::Warning,
                ));
                default
            }
        },
        None => {
            warnings.push(EnvValidationError::new(
                var_name,
                format!("Using default value: {}", default),
                ErrorSeverity::Info,
            ));
            default
        }
    }
}
