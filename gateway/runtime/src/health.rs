use crate::LeaderCallbacks;
use bytes::Bytes;
use gateway_core::{Error, RoutingRule};
use gateway_http::Upstream;
use gateway_k8s_index as index;
use http::Request;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinSet, time};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Clone, Debug)]
pub struct Options {
    pub interval: Duration,
    pub timeout: Duration,
    pub num_workers: usize,
    pub buffer_size: usize,
}

/// Periodically probes the backend of every routing rule and records the result in the index.
pub struct HealthChecker<U> {
    inner: Arc<Inner<U>>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

struct Inner<U> {
    options: Options,
    index: index::Controller,
    upstream: U,
}

type Jobs = Arc<tokio::sync::Mutex<mpsc::Receiver<RoutingRule>>>;

// === impl HealthChecker ===

impl<U: Upstream> HealthChecker<U> {
    pub fn new(options: Options, index: index::Controller, upstream: U) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                index,
                upstream,
            }),
            tasks: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Spawns the ticker and the probe workers. Does nothing if they are already running.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }

        let options = &self.inner.options;
        let (jobs_tx, jobs_rx) = mpsc::channel(options.buffer_size.max(1));
        let jobs_rx: Jobs = Arc::new(tokio::sync::Mutex::new(jobs_rx));

        let mut set = JoinSet::new();
        for worker in 0..options.num_workers.max(1) {
            set.spawn(
                self.inner
                    .clone()
                    .work(jobs_rx.clone())
                    .instrument(info_span!("health_worker", worker)),
            );
        }
        set.spawn(
            self.inner
                .clone()
                .tick(jobs_tx)
                .instrument(info_span!("health_check")),
        );
        *tasks = Some(set);
        info!(interval = ?options.interval, "Started health checks");
    }

    /// Stops the ticker and the workers, abandoning in-flight probes. Does nothing if they aren't
    /// running.
    pub fn stop(&self) {
        if let Some(mut set) = self.tasks.lock().take() {
            set.abort_all();
            info!("Stopped health checks");
        }
    }
}

// === impl Inner ===

impl<U: Upstream> Inner<U> {
    async fn tick(self: Arc<Self>, jobs: mpsc::Sender<RoutingRule>) {
        let period = self.options.interval;
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            let rules = self.index.list();
            if rules.is_empty() {
                debug!("No ingresses to check");
                continue;
            }
            debug!(rules = rules.len(), "Checking backend health");
            for rule in rules {
                if let Err(mpsc::error::TrySendError::Full(rule)) = jobs.try_send(rule) {
                    warn!(%rule.id, "Health check queue is full; skipping check");
                }
            }
        }
    }

    async fn work(self: Arc<Self>, jobs: Jobs) {
        loop {
            let Some(rule) = jobs.lock().await.recv().await else {
                return;
            };
            let healthy = self.probe(&rule).await;
            match self.index.update_health_status(&rule, healthy) {
                Ok(()) => {}
                Err(error @ (Error::RoutingRuleGone(_) | Error::RoutingRuleStale(_))) => {
                    debug!(%error, "Discarding health check result")
                }
                Err(error) => warn!(%rule.id, %error, "Failed to update backend health"),
            }
        }
    }

    async fn probe(&self, rule: &RoutingRule) -> bool {
        let uri = match rule.health_uri() {
            Ok(uri) => uri,
            Err(error) => {
                warn!(%rule.id, %error, "Invalid health check URI");
                return false;
            }
        };

        let mut req = Request::new(Bytes::new());
        *req.uri_mut() = uri;
        match time::timeout(self.options.timeout, self.upstream.send(req)).await {
            Ok(Ok(rsp)) => {
                let healthy = rsp.status().is_success();
                debug!(%rule.id, status = %rsp.status(), healthy, "Probed backend");
                healthy
            }
            Ok(Err(error)) => {
                debug!(%rule.id, %error, "Health check failed");
                false
            }
            Err(_) => {
                debug!(%rule.id, "Health check timed out");
                false
            }
        }
    }
}

impl<U: Upstream> LeaderCallbacks for HealthChecker<U> {
    fn on_started_leading(&self) {
        self.start();
    }

    fn on_stopped_leading(&self) {
        self.stop();
    }
}
