// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! File and environment configuration for the crl-updater binary.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use ::config::{Config, ConfigError, Environment as EnvSource, File};
use core_types::types::{Issuer, IssuerNameID};
use serde::Deserialize;
use thiserror::Error;
use updater_engine::UpdaterConfig;

/// Deployment target for the binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    pub fn label(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }

    /// Config file read when `--config` is not given.
    pub fn default_config_path(&self) -> &'static str {
        match self {
            Environment::Dev => "crl-updater.dev.toml",
            Environment::Prod => "crl-updater.toml",
        }
    }
}

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            other => Err(UnknownEnvironment {
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown environment '{value}' (expected 'dev' or 'prod')")]
pub struct UnknownEnvironment {
    pub value: String,
}

/// Top-level configuration blob, read from a TOML file with
/// `CRL_UPDATER__*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub metrics_addr: SocketAddr,
    pub sa_url: String,
    pub ca_url: String,
    pub storer_url: String,
    pub issuers: Vec<IssuerEntry>,
    pub updater: UpdaterSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuerEntry {
    pub name_id: i64,
    pub common_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdaterSettings {
    pub num_shards: usize,
    pub cert_lifetime_secs: u64,
    pub update_period_secs: u64,
    #[serde(default)]
    pub update_offset_secs: u64,
    #[serde(default)]
    pub max_parallelism: usize,
}

impl AppConfig {
    pub fn load(env: Environment, path: Option<&str>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| env.default_config_path());
        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(EnvSource::with_prefix("CRL_UPDATER").separator("__"))
            .build()?;
        settings.try_deserialize()
    }

    pub fn issuers(&self) -> Vec<Issuer> {
        self.issuers
            .iter()
            .map(|entry| Issuer::new(IssuerNameID(entry.name_id), entry.common_name.clone()))
            .collect()
    }
}

impl UpdaterSettings {
    pub fn to_updater_config(&self) -> UpdaterConfig {
        UpdaterConfig {
            num_shards: self.num_shards,
            cert_lifetime: Duration::from_secs(self.cert_lifetime_secs),
            update_period: Duration::from_secs(self.update_period_secs),
            update_offset: Duration::from_secs(self.update_offset_secs),
            max_parallelism: self.max_parallelism,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::config::FileFormat;

    const SAMPLE: &str = r#"
metrics_addr = "127.0.0.1:9095"
sa_url = "http://sa.internal:8080"
ca_url = "http://ca.internal:8080"
storer_url = "http://storer.internal:8080"

[[issuers]]
name_id = 6911950216300278251
common_name = "int-e1.example.net"

[updater]
num_shards = 128
cert_lifetime_secs = 7776000
update_period_secs = 21600
update_offset_secs = 9600
max_parallelism = 10
"#;

    #[test]
    fn parses_sample_config() {
        let settings = Config::builder()
            .add_source(File::from_str(SAMPLE, FileFormat::Toml))
            .build()
            .unwrap();
        let cfg: AppConfig = settings.try_deserialize().unwrap();

        assert_eq!(cfg.issuers.len(), 1);
        let issuers = cfg.issuers();
        assert_eq!(issuers[0].common_name(), "int-e1.example.net");

        let updater = cfg.updater.to_updater_config();
        assert_eq!(updater.num_shards, 128);
        assert_eq!(updater.cert_lifetime, Duration::from_secs(90 * 24 * 3600));
        assert_eq!(updater.update_period, Duration::from_secs(6 * 3600));
        assert_eq!(updater.update_offset, Duration::from_secs(9600));
        assert_eq!(updater.max_parallelism, 10);
    }

    #[test]
    fn parses_environment_labels() {
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Dev);
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        let err = "staging".parse::<Environment>().unwrap_err();
        assert!(err.to_string().contains("staging"), "got: {err}");
    }

    #[test]
    fn environment_selects_default_config_path() {
        assert_eq!(Environment::Dev.default_config_path(), "crl-updater.dev.toml");
        assert_eq!(Environment::Prod.default_config_path(), "crl-updater.toml");
        assert_eq!(Environment::Dev.label(), "dev");
        assert_eq!(Environment::Prod.label(), "prod");
    }

    #[test]
    fn offset_and_parallelism_default_to_zero() {
        let minimal = r#"
metrics_addr = "127.0.0.1:9095"
sa_url = "http://sa.internal:8080"
ca_url = "http://ca.internal:8080"
storer_url = "http://storer.internal:8080"
issuers = []

[updater]
num_shards = 4
cert_lifetime_secs = 7776000
update_period_secs = 21600
"#;
        let settings = Config::builder()
            .add_source(File::from_str(minimal, FileFormat::Toml))
            .build()
            .unwrap();
        let cfg: AppConfig = settings.try_deserialize().unwrap();
        assert_eq!(cfg.updater.update_offset_secs, 0);
        assert_eq!(cfg.updater.max_parallelism, 0);
    }
}
