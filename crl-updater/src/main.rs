// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! crl-updater binary: wires configuration, metrics, the HTTP service
//! clients, and the periodic run loop (or a single tick with `--run-once`).

mod config;

use std::env;
use std::process;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info};
use metrics::UpdaterMetrics;
use rest_source::{HttpCrlGenerator, HttpCrlStorer, HttpStorageAuthority};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use updater_engine::{CrlUpdater, ServiceClients};

use crate::config::{AppConfig, Environment, UnknownEnvironment};

#[derive(Debug, Error)]
enum AppError {
    #[error("usage: crl-updater [--env <dev|prod>] [--config <path>] [--run-once] ({0})")]
    Usage(String),
    #[error("{0}")]
    Environment(#[from] UnknownEnvironment),
    #[error("config error: {0}")]
    Config(#[from] ::config::ConfigError),
    #[error("invalid updater config: {0}")]
    InvalidUpdater(#[from] updater_engine::ConfigError),
    #[error("invalid service url: {0}")]
    Url(#[from] url::ParseError),
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Tick(#[from] updater_engine::TickError),
}

struct CliArgs {
    env: Environment,
    config_path: Option<String>,
    run_once: bool,
}

impl CliArgs {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, AppError> {
        let mut env = Environment::Dev;
        let mut config_path = None;
        let mut run_once = false;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--env" => {
                    let value = args
                        .next()
                        .ok_or_else(|| AppError::Usage("--env needs a value".into()))?;
                    env = value.parse()?;
                }
                "--config" => {
                    config_path = Some(
                        args.next()
                            .ok_or_else(|| AppError::Usage("--config needs a path".into()))?,
                    );
                }
                "--run-once" => run_once = true,
                other => return Err(AppError::Usage(format!("unknown argument {other}"))),
            }
        }
        Ok(Self {
            env,
            config_path,
            run_once,
        })
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        eprintln!("crl-updater failed: {err}");
        process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let args = CliArgs::parse(env::args().skip(1))?;
    let cfg = AppConfig::load(args.env, args.config_path.as_deref())?;
    info!("crl-updater booted in {} mode", args.env.label());

    let metrics = Arc::new(UpdaterMetrics::new()?);
    let listener = TcpListener::bind(cfg.metrics_addr).await?;
    info!("metrics listening on {}", cfg.metrics_addr);
    let exporter = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(err) = exporter.serve(listener).await {
            error!("metrics listener failed: {}", err);
        }
    });

    let client = reqwest::Client::builder()
        .user_agent("crl-updater/0.1")
        .build()?;
    let clients = ServiceClients {
        sa: Arc::new(HttpStorageAuthority::new(client.clone(), &cfg.sa_url)?),
        ca: Arc::new(HttpCrlGenerator::new(client.clone(), &cfg.ca_url)?),
        storer: Arc::new(HttpCrlStorer::new(client, &cfg.storer_url)?),
    };

    let updater = Arc::new(CrlUpdater::new(
        cfg.issuers(),
        cfg.updater.to_updater_config(),
        clients,
        Arc::clone(&metrics),
    )?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    if args.run_once {
        updater.tick(&cancel, Utc::now()).await?;
        return Ok(());
    }

    info!(
        "updating every {:?} across {} shard(s) for {} issuer(s)",
        updater.config().update_period,
        updater.config().num_shards,
        cfg.issuers.len()
    );
    updater.run(cancel).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliArgs, AppError> {
        CliArgs::parse(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn defaults_without_arguments() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.env, Environment::Dev);
        assert!(args.config_path.is_none());
        assert!(!args.run_once);
    }

    #[test]
    fn accepts_env_config_path_and_run_once() {
        let args = parse(&[
            "--env",
            "prod",
            "--config",
            "/etc/crl-updater.toml",
            "--run-once",
        ])
        .unwrap();
        assert_eq!(args.env, Environment::Prod);
        assert_eq!(args.config_path.as_deref(), Some("/etc/crl-updater.toml"));
        assert!(args.run_once);
    }

    #[test]
    fn rejects_unknown_flags_and_environments() {
        assert!(matches!(parse(&["--frequency"]), Err(AppError::Usage(_))));
        assert!(matches!(parse(&["--config"]), Err(AppError::Usage(_))));
        assert!(matches!(parse(&["--env"]), Err(AppError::Usage(_))));
        assert!(matches!(
            parse(&["--env", "staging"]),
            Err(AppError::Environment(_))
        ));
    }
}
