use std::process::ExitCode;

use clap::Parser;
use codepush_relay::{AppState, DEFAULT_PASSWORD_COST, serve};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Accounts, push endpoint and device channels for codepush clients.
#[derive(Parser, Debug)]
#[command(name = "codepush-relay", version)]
struct RelayArgs {
    #[arg(long, env = "CODEPUSH_BIND_ADDRESS", default_value = "0.0.0.0:8000")]
    bind_address: String,
    /// bcrypt work factor for newly registered passwords (4-31).
    #[arg(long, default_value_t = DEFAULT_PASSWORD_COST)]
    password_cost: u32,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = RelayArgs::parse();

    let listener = match TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind_address = %args.bind_address, "cannot bind relay socket: {}", err);
            return ExitCode::FAILURE;
        }
    };

    info!(
        bind_address = %args.bind_address,
        password_cost = args.password_cost,
        "codepush relay starting"
    );
    match serve(listener, AppState::with_password_cost(args.password_cost)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("relay server exited: {}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_port_8000_with_default_cost() {
        let args = RelayArgs::try_parse_from(["codepush-relay"]).expect("parse defaults");
        assert_eq!(args.bind_address, "0.0.0.0:8000");
        assert_eq!(args.password_cost, DEFAULT_PASSWORD_COST);
    }

    #[test]
    fn password_cost_is_configurable() {
        let args = RelayArgs::try_parse_from(["codepush-relay", "--password-cost", "10"])
            .expect("parse cost");
        assert_eq!(args.password_cost, 10);
    }
}
