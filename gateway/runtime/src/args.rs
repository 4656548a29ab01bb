use crate::{
    cache::{self, MemoryStore},
    health::{self, HealthChecker},
    http::{Chain, Gateway, HttpUpstream},
    index,
    k8s::{watcher, Api, IngressHTTP, K8sDuration},
    lease, ElectionConfig, Elector,
};
use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use futures::Stream;
use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "gateway", about = "A cluster-native HTTP gateway")]
pub struct Args {
    #[clap(long, default_value = "gateway=info,warn", env = "GATEWAY_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "GATEWAY_LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:11000", env = "GATEWAY_ADDR")]
    addr: SocketAddr,

    /// Only watch IngressHTTP resources in this namespace. All namespaces are watched by default.
    #[clap(long, env = "GATEWAY_NAMESPACE")]
    namespace: Option<String>,

    /// How often the full set of IngressHTTP resources is listed again.
    #[clap(long, default_value = "30s", env = "GATEWAY_RESYNC_PERIOD")]
    resync_period: K8sDuration,

    /// Bounds each request to a backend.
    #[clap(long, default_value = "5s", env = "GATEWAY_TIMEOUT")]
    gateway_timeout: K8sDuration,

    /// Limits buffered request and response bodies, in bytes.
    #[clap(long, default_value = "10485760", env = "GATEWAY_MAX_BODY_SIZE")]
    max_body_size: usize,

    #[clap(long, env = "GATEWAY_CACHE_ENABLED")]
    cache_enabled: bool,

    #[clap(long, default_value = "10", env = "GATEWAY_CACHE_NUM_WORKERS")]
    cache_num_workers: usize,

    /// The number of pending cache writes. Writes beyond this are dropped.
    #[clap(long, default_value = "10", env = "GATEWAY_CACHE_BUFFER_SIZE")]
    cache_buffer_size: usize,

    /// The TTL of cached responses whose ingress doesn't set one.
    #[clap(long, default_value = "1m", env = "GATEWAY_CACHE_TTL")]
    cache_ttl: K8sDuration,

    #[clap(long, env = "GATEWAY_HEALTH_CHECK_ENABLED")]
    health_check_enabled: bool,

    #[clap(long, default_value = "10s", env = "GATEWAY_HEALTH_CHECK_INTERVAL")]
    health_check_interval: K8sDuration,

    #[clap(long, default_value = "5s", env = "GATEWAY_HEALTH_CHECK_TIMEOUT")]
    health_check_timeout: K8sDuration,

    #[clap(long, default_value = "10", env = "GATEWAY_HEALTH_CHECK_NUM_WORKERS")]
    health_check_num_workers: usize,

    #[clap(long, default_value = "10", env = "GATEWAY_HEALTH_CHECK_BUFFER_SIZE")]
    health_check_buffer_size: usize,

    /// Elects a single replica to run health checks.
    #[clap(long, env = "GATEWAY_HA_ENABLED")]
    ha_enabled: bool,

    /// Identifies this replica in the lease. Defaults to `$HOSTNAME`.
    #[clap(long, env = "GATEWAY_HA_NODE_ID")]
    ha_node_id: Option<String>,

    #[clap(long, default_value = "gateway", env = "GATEWAY_HA_LEASE_NAME")]
    ha_lease_name: String,

    #[clap(long, default_value = "default", env = "GATEWAY_HA_LEASE_NAMESPACE")]
    ha_lease_namespace: String,

    #[clap(long, default_value = "15s", env = "GATEWAY_HA_LEASE_DURATION")]
    ha_lease_duration: K8sDuration,

    #[clap(long, default_value = "10s", env = "GATEWAY_HA_RENEW_DEADLINE")]
    ha_renew_deadline: K8sDuration,

    #[clap(long, default_value = "2s", env = "GATEWAY_HA_RETRY_PERIOD")]
    ha_retry_period: K8sDuration,
}

type Events = Pin<Box<dyn Stream<Item = watcher::Event<IngressHTTP>> + Send>>;

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    /// Rejects periods that timers can't run with.
    fn validate(&self) -> Result<()> {
        for (flag, period) in [
            ("--resync-period", self.resync_period),
            ("--gateway-timeout", self.gateway_timeout),
            ("--health-check-interval", self.health_check_interval),
            ("--health-check-timeout", self.health_check_timeout),
        ] {
            ensure!(!Duration::from(period).is_zero(), "{flag} must be greater than zero");
        }
        ensure!(self.max_body_size > 0, "--max-body-size must be greater than zero");
        Ok(())
    }

    /// Returns the leader election settings, if high availability is enabled.
    fn election(&self) -> Result<Option<ElectionConfig>> {
        if !self.ha_enabled {
            return Ok(None);
        }

        let node_id = match &self.ha_node_id {
            Some(id) => id.clone(),
            None => std::env::var("HOSTNAME")
                .context("--ha-node-id must be set when `HOSTNAME` is not")?,
        };
        let config = ElectionConfig {
            node_id,
            lease_duration: self.ha_lease_duration.into(),
            renew_deadline: self.ha_renew_deadline.into(),
            retry_period: self.ha_retry_period.into(),
        };
        config.validate()?;
        Ok(Some(config))
    }

    pub async fn run(self) -> Result<()> {
        self.validate()?;
        let election = self.election()?;
        let Self {
            log_level,
            log_format,
            client,
            admin,
            addr,
            namespace,
            resync_period,
            gateway_timeout,
            max_body_size,
            cache_enabled,
            cache_num_workers,
            cache_buffer_size,
            cache_ttl,
            health_check_enabled,
            health_check_interval,
            health_check_timeout,
            health_check_num_workers,
            health_check_buffer_size,
            ha_enabled: _,
            ha_node_id: _,
            ha_lease_name,
            ha_lease_namespace,
            ha_lease_duration: _,
            ha_renew_deadline: _,
            ha_retry_period: _,
        } = self;

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder())
            .with_client(client)
            .build()
            .await?;
        let shutdown = runtime.shutdown_handle();

        // Index IngressHTTP resources. Requests aren't served until the initial listing has been
        // indexed.
        let (api, events): (Api<IngressHTTP>, Events) = match &namespace {
            Some(ns) => (
                Api::namespaced(runtime.client(), ns),
                Box::pin(
                    runtime.watch_namespaced::<IngressHTTP>(ns.clone(), watcher::Config::default()),
                ),
            ),
            None => (
                Api::all(runtime.client()),
                Box::pin(runtime.watch_all::<IngressHTTP>(watcher::Config::default())),
            ),
        };
        let ingresses = index::Controller::new(index::Index::shared());
        ingresses.start(events, shutdown.clone()).await?;
        tokio::spawn(
            ingresses
                .clone()
                .resync(api, resync_period.into(), shutdown.clone())
                .instrument(info_span!("resync")),
        );

        let cache = if cache_enabled {
            let cache = cache::Controller::new(
                cache::Options {
                    num_workers: cache_num_workers,
                    buffer_size: cache_buffer_size,
                    default_ttl: cache_ttl.into(),
                },
                MemoryStore::default(),
            );
            cache.start(shutdown.clone());
            Some(cache)
        } else {
            None
        };

        let upstream = HttpUpstream::new(max_body_size);

        if health_check_enabled {
            let checker = HealthChecker::new(
                health::Options {
                    interval: health_check_interval.into(),
                    timeout: health_check_timeout.into(),
                    num_workers: health_check_num_workers,
                    buffer_size: health_check_buffer_size,
                },
                ingresses.clone(),
                upstream.clone(),
            );
            match election {
                Some(config) => {
                    // Renew on every retry once the claim is older than one retry period.
                    let grace = config.lease_duration - config.retry_period;
                    let lock =
                        lease::init(runtime.client(), &ha_lease_namespace, &ha_lease_name, grace)
                            .await?;
                    tokio::spawn(
                        Elector::new(config, lock, checker)
                            .run(shutdown.clone())
                            .instrument(info_span!("leader_election")),
                    );
                }
                None => {
                    checker.start();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let _release = shutdown.signaled().await;
                        checker.stop();
                    });
                }
            }
        } else {
            info!("Health checks are disabled");
        }

        let chain = Chain::build(
            ingresses.clone(),
            cache.clone(),
            upstream,
            Duration::from(gateway_timeout),
        );
        let gateway =
            Arc::new(Gateway::new(chain, ingresses, cache).with_max_body_size(max_body_size));
        let listener = TcpListener::bind(addr).await?;
        tokio::spawn(
            crate::http::serve(listener, gateway, shutdown)
                .instrument(info_span!("gateway", port = %addr.port())),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
