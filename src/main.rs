//! # keengate
//!
//! A caching reverse proxy for analytics queries. Browser clients send queries
//! carrying a public scoped key; the proxy checks the caller's origin, decrypts
//! the key, enforces the restrictions baked into it, and forwards the rewritten
//! query with a key minted from the master secret. Successful responses are
//! cached for a while so repeated dashboard queries do not hit the upstream.

mod authorizer;
mod cache;
mod cli;
mod cors;
mod env;
mod filters;
mod logging;
mod pipeline;
mod proxy;
mod server;
mod token;

#[cfg(test)]
mod test_server;
#[cfg(test)]
mod tests;

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match cli::parse_cli_commands().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
