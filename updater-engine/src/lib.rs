// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Periodic CRL production. Each tick partitions every issuer's expiration
//! space into stable shards and, per shard, streams the issuer's revocations
//! through the CA-side generator into the storer.

mod boundaries;
mod shard;
#[cfg(test)]
mod testutil;

pub use boundaries::ShardCalendar;
pub use shard::ShardError;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use core_types::types::{unix_nanos, Issuer, IssuerNameID};
use log::{debug, error};
use metrics::{UpdaterMetrics, ISSUER_ALL, RESULT_FAILED, RESULT_SUCCESS};
use parking_lot::Mutex;
use service_api::{CrlGenerator, CrlStorer, StorageAuthority};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// RFC 5280 bounds how stale a CRL may be; updating less often than weekly
/// would violate it.
const MAX_UPDATE_PERIOD: Duration = Duration::from_secs(7 * 24 * 3600);

/// The derived window multiplies the lifetime several times over and must
/// stay within i64 nanoseconds; `std::time::Duration` itself does not.
const MAX_CERT_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Handles to the three collaborating services.
#[derive(Clone)]
pub struct ServiceClients {
    pub sa: Arc<dyn StorageAuthority>,
    pub ca: Arc<dyn CrlGenerator>,
    pub storer: Arc<dyn CrlStorer>,
}

/// Tunables for the updater, validated by [`CrlUpdater::new`].
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub num_shards: usize,
    pub cert_lifetime: Duration,
    pub update_period: Duration,
    pub update_offset: Duration,
    pub max_parallelism: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("must have positive number of shards, got: {num_shards}")]
    NoShards { num_shards: usize },
    #[error("must have positive certificate lifetime")]
    NoLifetime,
    #[error("certificate lifetime must be at most {max:?}, got: {lifetime:?}")]
    LifetimeTooLong { lifetime: Duration, max: Duration },
    #[error("must update CRLs at least every 7 days, got: {period:?}")]
    PeriodTooLong { period: Duration },
    #[error("update offset must be less than period: {offset:?} !< {period:?}")]
    OffsetTooLarge { offset: Duration, period: Duration },
}

/// Failure of one issuer's tick.
#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("updating shard {shard_idx}: {source}")]
    Shard {
        shard_idx: usize,
        #[source]
        source: ShardError,
    },
    #[error("issuer tick cancelled before all shards completed")]
    Cancelled,
    #[error("unknown issuer {0}")]
    UnknownIssuer(IssuerNameID),
}

/// One or more issuers failed during a tick. Details were already logged
/// per issuer; this only carries the tally for callers that need an exit
/// status.
#[derive(Debug, Error)]
#[error("{failed} of {total} issuer ticks failed")]
pub struct TickError {
    pub failed: usize,
    pub total: usize,
}

pub struct CrlUpdater {
    issuers: BTreeMap<IssuerNameID, Issuer>,
    config: UpdaterConfig,
    calendar: ShardCalendar,
    clients: ServiceClients,
    metrics: Arc<UpdaterMetrics>,
    last_success: Mutex<BTreeMap<IssuerNameID, DateTime<Utc>>>,
}

impl std::fmt::Debug for CrlUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrlUpdater")
            .field("issuers", &self.issuers)
            .field("config", &self.config)
            .field("calendar", &self.calendar)
            .finish_non_exhaustive()
    }
}

impl CrlUpdater {
    pub fn new(
        issuers: Vec<Issuer>,
        config: UpdaterConfig,
        clients: ServiceClients,
        metrics: Arc<UpdaterMetrics>,
    ) -> Result<Self, ConfigError> {
        if config.num_shards < 1 {
            return Err(ConfigError::NoShards {
                num_shards: config.num_shards,
            });
        }
        if config.cert_lifetime.is_zero() {
            return Err(ConfigError::NoLifetime);
        }
        if config.cert_lifetime > MAX_CERT_LIFETIME {
            return Err(ConfigError::LifetimeTooLong {
                lifetime: config.cert_lifetime,
                max: MAX_CERT_LIFETIME,
            });
        }
        if config.update_period >= MAX_UPDATE_PERIOD {
            return Err(ConfigError::PeriodTooLong {
                period: config.update_period,
            });
        }
        if config.update_offset >= config.update_period {
            return Err(ConfigError::OffsetTooLarge {
                offset: config.update_offset,
                period: config.update_period,
            });
        }

        let mut config = config;
        config.max_parallelism = config.max_parallelism.max(1);

        let calendar = ShardCalendar::new(
            config.num_shards,
            config.cert_lifetime,
            config.update_period,
        );
        let issuers = issuers
            .into_iter()
            .map(|issuer| (issuer.name_id(), issuer))
            .collect();

        Ok(Self {
            issuers,
            config,
            calendar,
            clients,
            metrics,
            last_success: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn calendar(&self) -> &ShardCalendar {
        &self.calendar
    }

    /// Ticks once at the next wall-clock instant aligned to
    /// `update_offset` modulo `update_period`, then every period until the
    /// token is cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // Tick times must not depend on when the process started.
        let wait = boundaries::initial_wait(
            unix_nanos(Utc::now()),
            self.config.update_period,
            self.config.update_offset,
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = sleep(wait) => {}
        }

        // Create the ticker before the first tick runs so a long first tick
        // does not shift its anchor.
        let mut ticker = interval(self.config.update_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        let _ = self.tick(&cancel, Utc::now()).await;

        loop {
            // A tick overrun can leave both branches ready at once;
            // cancellation must win or we'd run one extra tick after cancel.
            if cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let _ = self.tick(&cancel, Utc::now()).await;
                }
            }
        }
    }

    /// Produces CRLs for every issuer, serially. Issuers are few; shard
    /// level parallelism is enough, so the worker pool stays per-issuer.
    pub async fn tick(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        at_time: DateTime<Utc>,
    ) -> Result<(), TickError> {
        let started = Instant::now();
        let mut failed = 0usize;
        debug!("ticking at time {}", at_time);

        for (id, issuer) in &self.issuers {
            if let Err(err) = self.tick_issuer(cancel, at_time, *id).await {
                error!(
                    "tick for issuer {} at time {} failed: {}",
                    issuer.common_name(),
                    at_time.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    err
                );
                failed += 1;
                self.note_issuer_failure(issuer, at_time);
            } else {
                self.note_issuer_success(issuer, at_time);
            }
        }

        let result = if failed == 0 {
            RESULT_SUCCESS
        } else {
            RESULT_FAILED
        };
        self.metrics
            .observe_tick(ISSUER_ALL, result, started.elapsed().as_secs_f64());

        if failed == 0 {
            Ok(())
        } else {
            Err(TickError {
                failed,
                total: self.issuers.len(),
            })
        }
    }

    /// Runs every shard for one issuer, at most `max_parallelism` pipelines
    /// in flight, returning the first failure received. Shards still in
    /// flight when a failure is returned run to completion in the
    /// background; each pipeline releases its own streams.
    pub async fn tick_issuer(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        at_time: DateTime<Utc>,
        issuer_name_id: IssuerNameID,
    ) -> Result<(), UpdaterError> {
        let issuer = self
            .issuers
            .get(&issuer_name_id)
            .ok_or(UpdaterError::UnknownIssuer(issuer_name_id))?;
        let started = Instant::now();
        debug!("ticking issuer {} at time {}", issuer_name_id, at_time);

        let result = self.run_shard_pool(cancel, at_time, issuer).await;

        let label = if result.is_ok() {
            RESULT_SUCCESS
        } else {
            RESULT_FAILED
        };
        self.metrics.observe_tick(
            &format!("{} (Overall)", issuer.common_name()),
            label,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn run_shard_pool(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        at_time: DateTime<Utc>,
        issuer: &Issuer,
    ) -> Result<(), UpdaterError> {
        let num_shards = self.config.num_shards;
        let (idx_tx, idx_rx) = mpsc::channel::<usize>(num_shards);
        let (result_tx, mut result_rx) =
            mpsc::channel::<(usize, Result<(), ShardError>)>(num_shards);
        let idx_rx = Arc::new(AsyncMutex::new(idx_rx));

        for _ in 0..self.config.max_parallelism {
            let updater = Arc::clone(self);
            let cancel = cancel.clone();
            let idx_rx = Arc::clone(&idx_rx);
            let result_tx = result_tx.clone();
            let issuer = issuer.clone();
            tokio::spawn(async move {
                loop {
                    let idx = idx_rx.lock().await.recv().await;
                    let Some(idx) = idx else {
                        break;
                    };
                    if cancel.is_cancelled() {
                        break;
                    }
                    let res = updater.observed_tick_shard(&cancel, at_time, &issuer, idx).await;
                    if result_tx.send((idx, res)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for idx in 0..num_shards {
            // Capacity num_shards: these sends never block.
            if idx_tx.send(idx).await.is_err() {
                break;
            }
        }
        drop(idx_tx);

        let mut remaining = num_shards;
        while remaining > 0 {
            match result_rx.recv().await {
                Some((shard_idx, Err(source))) => {
                    return Err(UpdaterError::Shard { shard_idx, source });
                }
                Some((_, Ok(()))) => remaining -= 1,
                // Every worker exited without reporting: cancellation
                // emptied the pool before all shards ran.
                None => return Err(UpdaterError::Cancelled),
            }
        }
        Ok(())
    }

    async fn observed_tick_shard(
        &self,
        cancel: &CancellationToken,
        at_time: DateTime<Utc>,
        issuer: &Issuer,
        shard_idx: usize,
    ) -> Result<(), ShardError> {
        let started = Instant::now();
        let result = shard::tick_shard(
            cancel,
            &self.clients,
            &self.calendar,
            at_time,
            issuer.name_id(),
            shard_idx,
        )
        .await;

        let label = if result.is_ok() {
            RESULT_SUCCESS
        } else {
            RESULT_FAILED
        };
        self.metrics
            .observe_tick(issuer.common_name(), label, started.elapsed().as_secs_f64());
        self.metrics.inc_generated(label);
        result.map(|_| ())
    }

    fn note_issuer_success(&self, issuer: &Issuer, at_time: DateTime<Utc>) {
        self.last_success.lock().insert(issuer.name_id(), at_time);
        self.metrics
            .set_seconds_since_success(issuer.common_name(), 0.0);
    }

    fn note_issuer_failure(&self, issuer: &Issuer, at_time: DateTime<Utc>) {
        let last = self.last_success.lock().get(&issuer.name_id()).copied();
        if let Some(last) = last {
            let age = (at_time - last).num_milliseconds().max(0) as f64 / 1000.0;
            self.metrics
                .set_seconds_since_success(issuer.common_name(), age);
        }
    }
}
