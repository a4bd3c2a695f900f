//! # CLI Module
//!
//! Command-line interface for keengate: running the proxy, issuing and
//! inspecting scoped keys, and a few configuration helpers.
//!
//! ## Commands
//!
//! ### Server Operations
//! - `start`: validate the environment and run the proxy
//! - `prune-cache`: delete expired records from the cache database once
//!
//! ### Key Management
//! - `mint-key`: issue a scoped key with the public secret
//! - `inspect-key`: decrypt a scoped key and print its parameters
//! - `generate-secret`: print a random secret for either secret variable
//!
//! ### Configuration
//! - `validate-env`: check the environment and print the resulting configuration
//! - `env-example`: print an example `.env` file
//!
//! ## Usage Example
//!
//! ```bash
//! # Issue a key limited to counts over one app's events
//! KEENGATE_PUBLIC_SECRET=... keengate mint-key --allowed-operations read \
//!   --analysis-type count \
//!   --filters '[{"property_name":"app","operator":"eq","property_value":"web"}]'
//!
//! # Start the proxy
//! keengate start
//! ```

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use crate::cache::{self, DEFAULT_CACHE_TTL, MEMORY_CACHE_URL};
use crate::env::{self, DEFAULT_CACHE_DB_URL};
use crate::filters;
use crate::logging;
use crate::server::{self, ServerError};
use crate::token::{self, ScopedTokenParams, TokenSecret};

///////////////////////////////////////////////////////////////////////////////
//****                        Private Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

#[derive(Parser)]
#[command(name = "keengate")]
#[command(about = "Caching, scoped-key enforcing proxy for analytics queries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

///////////////////////////////////////////////////////////////////////////////
//****                         Private Types                             ****//
///////////////////////////////////////////////////////////////////////////////

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    #[command(name = "start")]
    Start,
    /// Issue a scoped key encrypted with the public secret
    #[command(name = "mint-key")]
    MintKey {
        /// Operations the key grants, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        allowed_operations: Vec<String>,
        /// Restrict the key to one analysis type (last path segment)
        #[arg(long)]
        analysis_type: Option<String>,
        /// JSON array of filters the key enforces
        #[arg(long)]
        filters: Option<String>,
        /// Extra query parameter forced by the key, as key=value (repeatable)
        #[arg(long = "param", value_parser = parse_key_value)]
        params: Vec<(String, Value)>,
        #[arg(long, env = "KEENGATE_PUBLIC_SECRET", hide_env_values = true)]
        secret: String,
    },
    /// Decrypt a scoped key and print its parameters
    #[command(name = "inspect-key")]
    InspectKey {
        key: String,
        #[arg(long, env = "KEENGATE_PUBLIC_SECRET", hide_env_values = true)]
        secret: String,
    },
    /// Print a random secret suitable for KEENGATE_PUBLIC_SECRET or KEENGATE_MASTER_SECRET
    #[command(name = "generate-secret")]
    GenerateSecret,
    /// Validate environment variables and print the configuration
    #[command(name = "validate-env")]
    ValidateEnv,
    /// Print an example environment file
    #[command(name = "env-example")]
    EnvExample,
    /// Delete expired records from the cache database
    #[command(name = "prune-cache")]
    PruneCache {
        #[arg(long, env = "KEENGATE_CACHE_DB_URL", default_value = DEFAULT_CACHE_DB_URL)]
        database_url: String,
        /// Record lifetime in seconds
        #[arg(long, env = "KEENGATE_CACHE_TTL", default_value_t = DEFAULT_CACHE_TTL)]
        ttl: u64,
    },
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Parse command line arguments and run the selected command
pub async fn parse_cli_commands() -> Result<(), ServerError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = env::get_config();
            logging::init_tracing(&config.log_level);
            info!("Starting keengate");
            server::start_server(config).await?;
        }
        Commands::MintKey {
            allowed_operations,
            analysis_type,
            filters,
            params,
            secret,
        } => {
            let secret = TokenSecret::new(&secret)?;
            let mut scoped = ScopedTokenParams::new(allowed_operations);
            for (key, value) in params {
                scoped = scoped.with_param(&key, value)?;
            }
            if let Some(analysis_type) = analysis_type {
                scoped = scoped.with_analysis_type(&analysis_type);
            }
            if let Some(raw) = filters {
                scoped = scoped.with_filters(filters::parse_filters(&raw)?);
            }
            println!("{}", token::encode(&secret, &scoped)?);
        }
        Commands::InspectKey { key, secret } => {
            let secret = TokenSecret::new(&secret)?;
            let scoped = token::decode(&secret, &key)?;
            println!("{}", serde_json::to_string_pretty(&scoped)?);
        }
        Commands::GenerateSecret => {
            let (_, text) = TokenSecret::generate();
            println!("{}", text);
        }
        Commands::ValidateEnv => {
            let result = env::validate_environment();
            env::print_validation_results(&result);
            if result.is_err() {
                return Err("environment validation failed".into());
            }
        }
        Commands::EnvExample => {
            print!("{}", env::generate_env_example());
        }
        Commands::PruneCache { database_url, ttl } => {
            logging::init_tracing(&logging::log_level_from_env());
            if database_url == MEMORY_CACHE_URL {
                println!("In-process cache holds nothing between runs; nothing to prune");
                return Ok(());
            }
            let store = cache::open_store(&database_url, Duration::from_secs(ttl)).await?;
            let removed = store.prune().await?;
            println!("Pruned {} expired cache record(s)", removed);
        }
    }

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
//****                        Private Functions                          ****//
///////////////////////////////////////////////////////////////////////////////

/// Parse `key=value`, reading the value as JSON when it is valid JSON
fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
