// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Prometheus metrics for the CRL updater. hyper v1.+

use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper::Response;
use hyper_util::rt::TokioIo;
use log::error;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_FAILED: &str = "failed";

/// Issuer label used for whole-tick observations.
pub const ISSUER_ALL: &str = "all";

const TICK_BUCKETS: &[f64] = &[
    0.01, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0,
];

pub struct UpdaterMetrics {
    registry: Registry,
    tick_histogram: HistogramVec,
    updated_counter: IntCounterVec,
    seconds_since_success: GaugeVec,
}

impl UpdaterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::register_on(Registry::new())
    }

    /// Creates the updater's instruments and registers them on `registry`.
    pub fn register_on(registry: Registry) -> Result<Self, prometheus::Error> {
        let tick_histogram = HistogramVec::new(
            HistogramOpts::new(
                "crl_updater_ticks",
                "A histogram of crl-updater tick latencies labeled by issuer and result",
            )
            .buckets(TICK_BUCKETS.to_vec()),
            &["issuer", "result"],
        )?;
        registry.register(Box::new(tick_histogram.clone()))?;

        let updated_counter = IntCounterVec::new(
            Opts::new(
                "crl_updater_generated",
                "A counter of CRL generation calls labeled by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(updated_counter.clone()))?;

        let seconds_since_success = GaugeVec::new(
            Opts::new(
                "crl_updater_secs_since_success",
                "The number of seconds since crl-updater last succeeded labeled by issuer",
            ),
            &["issuer"],
        )?;
        registry.register(Box::new(seconds_since_success.clone()))?;

        Ok(Self {
            registry,
            tick_histogram,
            updated_counter,
            seconds_since_success,
        })
    }

    pub fn observe_tick(&self, issuer: &str, result: &str, seconds: f64) {
        self.tick_histogram
            .with_label_values(&[issuer, result])
            .observe(seconds);
    }

    pub fn inc_generated(&self, result: &str) {
        self.updated_counter.with_label_values(&[result]).inc();
    }

    pub fn set_seconds_since_success(&self, issuer: &str, seconds: f64) {
        self.seconds_since_success
            .with_label_values(&[issuer])
            .set(seconds);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    async fn handle_metrics(
        &self,
        _req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            error!("encoding metrics failed: {}", err);
        }
        let response = Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(buffer)))
            .expect("static response parts");
        Ok(response)
    }

    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (socket, _) = listener.accept().await?;
            let io = TokioIo::new(socket);
            let metrics = self.clone();
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                async move { metrics.handle_metrics(req).await }
            });
            tokio::spawn(async move {
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}
