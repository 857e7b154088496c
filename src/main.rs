//! jwt-gate - request-time JWT authentication for an API gateway

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use jwt_gate::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    jwt_auth::{ConsumerSnapshot, KeyResolver, sign},
    Result, setup_tracing,
    vault::{HttpVault, SecretVault},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Sign {
            ref key,
            ref payload,
        }) => run_sign(&cli, key, payload.as_deref()).await,
        Some(Command::Check) => run_check(&cli),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(config) => Some(config),
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Validate configuration and report what was loaded
fn run_check(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    println!("Configuration OK: {} consumer(s)", config.consumers.len());
    for consumer in &config.consumers {
        let auth = &consumer.jwt_auth;
        println!(
            "  {} key={} alg={} supply={:?} store={}:{}/{}",
            consumer.username,
            auth.key,
            auth.algorithm,
            auth.key_supply(),
            auth.store.host,
            auth.store.port,
            auth.store.database,
        );
    }
    ExitCode::SUCCESS
}

/// Sign a token for one consumer and print it
async fn run_sign(cli: &Cli, key: &str, payload: Option<&str>) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    match issue_token(config, key, payload).await {
        Ok(token) => {
            println!("{token}");
            ExitCode::SUCCESS
        }
        Err(e) if e.is_service_error() => {
            error!("Failed to sign token: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn issue_token(config: Config, key: &str, payload: Option<&str>) -> Result<String> {
    let vault = config
        .vault
        .as_ref()
        .map(HttpVault::new)
        .transpose()?
        .map(|v| Arc::new(v) as Arc<dyn SecretVault>);

    let extra = payload
        .map(sign::parse_payload)
        .transpose()?
        .unwrap_or_default();

    let snapshot = ConsumerSnapshot::new(1, config.consumers.into_iter().map(Into::into));
    Ok(sign::sign_for_key(&KeyResolver::new(vault), &snapshot, key, extra).await?)
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let Some(mut config) = load_config(&cli) else {
        return ExitCode::FAILURE;
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        consumers = config.consumers.len(),
        "Starting jwt-gate"
    );

    let gateway = match Gateway::new(config, cli.config.clone()) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
