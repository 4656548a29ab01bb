//! Gateway routing index
//!
//! Maintains a local, concurrently readable view of the cluster's `IngressHTTP` resources. The
//! resource watch is applied through [`kubert::index::namespaced`], one event at a time under the
//! index's write lock. A second task periodically lists every resource and replaces the index
//! contents so that missed events cannot leave the view stale for longer than the resync period.
//!
//! Request handling only takes the read side of the lock. The only writes that do not originate
//! from the cluster are health updates, which flip a rule's locally cached health flag and are
//! never persisted back to the resource.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod rule;


use anyhow::{bail, Result};
use futures::prelude::*;
use gateway_core::{Error, ResourceId, RoutingRule};
use gateway_k8s_api::{watcher, Api, IngressHTTP, ListParams};
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::watch, time};
use tracing::{debug, info, info_span, warn, Instrument};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the routing rules, ordered by namespace and name.
#[derive(Debug)]
pub struct Index {
    rules: BTreeMap<ResourceId, RoutingRule>,

    /// Incremented on every write so that readers can detect mutations.
    generation: u64,

    /// Set once the first full listing has been indexed.
    synced: watch::Sender<bool>,
}

/// A handle to the shared routing index.
#[derive(Clone, Debug)]
pub struct Controller {
    index: SharedIndex,
}

// === impl Index ===

impl Default for Index {
    fn default() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            rules: BTreeMap::new(),
            generation: 0,
            synced,
        }
    }
}

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&RoutingRule> {
        self.rules.get(id)
    }

    /// Replaces the index contents with a full listing of the resources.
    ///
    /// Rules that survive the replacement keep their locally cached health.
    pub fn replace(&mut self, resources: Vec<IngressHTTP>) {
        let mut previous = std::mem::take(&mut self.rules);
        for resource in resources {
            let namespace = resource.metadata.namespace.clone().unwrap_or_default();
            let name = resource.metadata.name.clone().unwrap_or_default();
            let healthy = previous
                .remove(&ResourceId::new(&namespace, &name))
                .map(|r| r.healthy);
            match rule::make_rule(resource, healthy) {
                Ok(rule) => {
                    self.rules.insert(rule.id.clone(), rule);
                }
                Err(error) => warn!(%namespace, %name, %error, "Ignoring IngressHTTP"),
            }
        }
        for id in previous.keys() {
            debug!(%id, "Removed IngressHTTP");
        }
        self.generation += 1;
        self.synced.send_replace(true);
    }

    fn set_health(&mut self, rule: &RoutingRule, healthy: bool) -> Result<(), Error> {
        let Some(current) = self.rules.get_mut(&rule.id) else {
            return Err(Error::RoutingRuleGone(rule.id.clone()));
        };
        if current.resource_version != rule.resource_version {
            return Err(Error::RoutingRuleStale(rule.id.clone()));
        }
        if current.healthy != healthy {
            current.healthy = healthy;
            self.generation += 1;
        }
        Ok(())
    }
}

impl IndexNamespacedResource<IngressHTTP> for Index {
    fn apply(&mut self, resource: IngressHTTP) {
        let namespace = resource.metadata.namespace.clone().unwrap_or_default();
        let name = resource.metadata.name.clone().unwrap_or_default();
        let id = ResourceId::new(&namespace, &name);
        let previous = self.rules.get(&id).map(|r| r.healthy);

        let rule = match rule::make_rule(resource, previous) {
            Ok(rule) => rule,
            Err(error) => {
                warn!(%namespace, %name, %error, "Ignoring IngressHTTP");
                // An invalid update must not leave the prior version routing.
                if self.rules.remove(&id).is_some() {
                    self.generation += 1;
                }
                return;
            }
        };

        debug!(%rule.id, "Indexing IngressHTTP");
        self.rules.insert(rule.id.clone(), rule);
        self.generation += 1;
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.rules.remove(&id).is_some() {
            debug!(%id, "Removed IngressHTTP");
            self.generation += 1;
        }
    }

    // A relist carries every live resource, so anything it doesn't name is dropped.
    fn reset(&mut self, resources: Vec<IngressHTTP>, _removed: NamespacedRemoved) {
        self.replace(resources);
    }
}

// === impl Controller ===

impl Controller {
    pub fn new(index: SharedIndex) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    /// Spawns the task that applies watch events to the index and waits until the initial
    /// listing has been indexed.
    ///
    /// Fails if the watch ends or shutdown begins before the initial sync completes; the gateway
    /// must not route with an unsynchronized view.
    pub async fn start<S>(&self, events: S, shutdown: drain::Watch) -> Result<()>
    where
        S: Stream<Item = watcher::Event<IngressHTTP>> + Send + 'static,
    {
        let mut synced = self.index.read().synced.subscribe();
        let mut watch = tokio::spawn(
            kubert::index::namespaced(self.index.clone(), events)
                .instrument(info_span!("ingresshttps")),
        );

        info!("Waiting for IngressHTTP index to sync");
        tokio::select! {
            res = synced.wait_for(|synced| *synced) => {
                if res.is_err() {
                    bail!("IngressHTTP index dropped before the initial sync completed");
                }
            }
            _ = &mut watch => {
                bail!("IngressHTTP watch terminated before the initial sync completed");
            }
            _ = shutdown.signaled() => bail!("shutdown before the initial IngressHTTP sync"),
        }
        info!(rules = self.index.read().len(), "IngressHTTP index synced");
        Ok(())
    }

    /// Periodically replaces the index contents with a full listing from the API server.
    pub async fn resync(
        self,
        api: Api<IngressHTTP>,
        period: time::Duration,
        shutdown: drain::Watch,
    ) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the watch has just performed a full listing.
        interval.tick().await;

        tokio::pin! {
            let shutdown = shutdown.signaled();
        }
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => return,
            }

            match api.list(&ListParams::default()).await {
                Ok(list) => {
                    debug!(resources = list.items.len(), "Resyncing IngressHTTP index");
                    self.index.write().replace(list.items);
                }
                Err(error) => warn!(%error, "Failed to resync IngressHTTP resources"),
            }
        }
    }

    /// Returns a point-in-time snapshot of every rule.
    pub fn list(&self) -> Vec<RoutingRule> {
        self.index.read().rules.values().cloned().collect()
    }

    /// Returns the first rule, in index order, that satisfies `matches`.
    pub fn find(&self, matches: impl Fn(&RoutingRule) -> bool) -> Result<RoutingRule, Error> {
        self.index
            .read()
            .rules
            .values()
            .find(|rule| matches(rule))
            .cloned()
            .ok_or(Error::RoutingRuleNotFound)
    }

    /// Records the health of a rule's backend in the local index.
    ///
    /// This is a no-op when the indexed rule already has the given health, so steady-state
    /// updates never take the write lock. Otherwise the rule is resolved again under the write
    /// lock: [`Error::RoutingRuleGone`] indicates that it was deleted since `rule` was read, and
    /// [`Error::RoutingRuleStale`] that it was replaced by a newer version.
    pub fn update_health_status(&self, rule: &RoutingRule, healthy: bool) -> Result<(), Error> {
        if self.index.read().get(&rule.id).map(|r| r.healthy) == Some(healthy) {
            return Ok(());
        }

        self.index.write().set_health(rule, healthy)?;
        info!(%rule.id, healthy, "Updated backend health");
        Ok(())
    }
}
