//! Binary entrypoint: reads the environment variables recognized by the
//! core (§6), builds a [`hatago_gateway::GatewayConfig`], and runs the
//! gateway to completion.

mod logging;

use std::collections::HashMap;
use std::process::ExitCode;

use clap::Parser;
use hatago_gateway::{Gateway, GatewayConfig};

/// Runs the MCP gateway. Configuration is entirely environment-driven (§6);
/// config file parsing is out of scope for the core and lives in a separate
/// front-end.
#[derive(Debug, Parser)]
#[command(name = "hatago-gateway", version, about)]
struct Cli;

const RECOGNIZED_ENV: &[&str] = &["HATAGO_TRANSPORT", "PORT", "HOSTNAME", "GRACEFUL_TIMEOUT_MS"];

fn overlay_from_process_env() -> HashMap<String, String> {
    RECOGNIZED_ENV
        .iter()
        .filter_map(|&key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect()
}

async fn run() -> anyhow::Result<()> {
    let config = GatewayConfig::default().apply_env_overlay(&overlay_from_process_env());
    let transport_is_http = matches!(config.transport, hatago_gateway::TransportConfig::Http { .. });

    let gateway = Gateway::build(config)
        .await
        .map_err(|err| anyhow::anyhow!("gateway initialization failed: {err}"))?;

    if transport_is_http {
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining");
        };
        gateway.serve_http(shutdown).await?;
    } else {
        gateway.serve_stdio().await?;
    }

    Ok(())
}

fn main() -> ExitCode {
    Cli::parse();
    logging::init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_only_reads_the_six_recognized_variables() {
        // SAFETY: test-only env mutation, single-threaded within this process's
        // test harness for this specific key.
        unsafe {
            std::env::set_var("HATAGO_TRANSPORT", "stdio");
            std::env::set_var("SOME_UNRELATED_VAR", "ignored");
        }
        let overlay = overlay_from_process_env();
        assert_eq!(overlay.get("HATAGO_TRANSPORT").map(String::as_str), Some("stdio"));
        assert!(!overlay.contains_key("SOME_UNRELATED_VAR"));
        unsafe {
            std::env::remove_var("HATAGO_TRANSPORT");
            std::env::remove_var("SOME_UNRELATED_VAR");
        }
    }
}
