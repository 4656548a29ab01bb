//! Leader election over a [`LeaseLock`].
//!
//! An [`Elector`] moves between three states:
//!
//! ```text
//! Follower --(retry period)--> Candidate --(acquired)--> Leader
//!    ^                             |                        |
//!    +--------(not acquired)-------+                        |
//!    +----(lost, renew deadline missed, or shutdown)--------+
//! ```
//!
//! Callbacks are invoked synchronously on every transition into and out of `Leader`.

use anyhow::Result;
use gateway_core::LeaseLock;
use std::time::Duration;
use tokio::{sync::watch, time};
use tracing::{debug, info, warn};

/// Hooks invoked when the elector gains or loses leadership.
pub trait LeaderCallbacks: Send + Sync + 'static {
    fn on_started_leading(&self);
    fn on_stopped_leading(&self);
}

#[derive(Clone, Debug)]
pub struct ElectionConfig {
    pub node_id: String,
    pub lease_duration: Duration,

    /// How long a leader keeps leading without a successful renewal.
    pub renew_deadline: Duration,

    /// The interval between acquisition and renewal attempts.
    pub retry_period: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Follower,
    Candidate,
    Leader,
}

pub struct Elector<L, C> {
    lock: L,
    callbacks: C,
    config: ElectionConfig,
    state: watch::Sender<State>,
}

// === impl ElectionConfig ===

impl ElectionConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.renew_deadline < self.lease_duration,
            "renew deadline ({:?}) must be shorter than the lease duration ({:?})",
            self.renew_deadline,
            self.lease_duration,
        );
        anyhow::ensure!(
            !self.retry_period.is_zero(),
            "retry period must be greater than zero"
        );
        anyhow::ensure!(
            self.retry_period < self.renew_deadline,
            "retry period ({:?}) must be shorter than the renew deadline ({:?})",
            self.retry_period,
            self.renew_deadline,
        );
        Ok(())
    }
}

// === impl Elector ===

impl<L: LeaseLock, C: LeaderCallbacks> Elector<L, C> {
    pub fn new(config: ElectionConfig, lock: L, callbacks: C) -> Self {
        let (state, _) = watch::channel(State::Follower);
        Self {
            lock,
            callbacks,
            config,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Participates in the election until shutdown is signaled. A leader releases the lease
    /// before returning.
    pub async fn run(self, shutdown: drain::Watch) {
        tokio::pin! {
            let shutdown = shutdown.signaled();
        }

        info!(node = %self.config.node_id, lease = %self.lock.name(), "Starting leader election");
        let mut last_renewal = time::Instant::now();
        loop {
            let state = *self.state.borrow();
            match state {
                State::Follower => {
                    tokio::select! {
                        _ = time::sleep(self.config.retry_period) => {}
                        _ = &mut shutdown => return,
                    }
                    self.transition(State::Candidate);
                }

                State::Candidate => match self.try_acquire().await {
                    Ok(true) => {
                        last_renewal = time::Instant::now();
                        info!(node = %self.config.node_id, "Acquired leadership");
                        self.transition(State::Leader);
                    }
                    Ok(false) => {
                        debug!("Lease is held by another node");
                        self.transition(State::Follower);
                    }
                    Err(error) => {
                        warn!(%error, "Failed to acquire lease");
                        self.transition(State::Follower);
                    }
                },

                State::Leader => {
                    tokio::select! {
                        _ = time::sleep(self.config.retry_period) => {}
                        _ = &mut shutdown => {
                            if let Err(error) = self.lock.release(&self.config.node_id).await {
                                warn!(%error, "Failed to release lease");
                            }
                            info!("Released leadership");
                            self.transition(State::Follower);
                            return;
                        }
                    }

                    let deadline = last_renewal + self.config.renew_deadline;
                    let renewed = time::timeout_at(deadline, self.try_acquire()).await;
                    match renewed {
                        Ok(Ok(true)) => last_renewal = time::Instant::now(),
                        Ok(Ok(false)) => {
                            info!("Leadership lost to another node");
                            self.transition(State::Follower);
                        }
                        Ok(Err(error)) if time::Instant::now() < deadline => {
                            warn!(%error, "Failed to renew lease; retrying");
                        }
                        Ok(Err(error)) => {
                            warn!(%error, "Failed to renew lease before the renew deadline");
                            self.transition(State::Follower);
                        }
                        Err(_) => {
                            warn!("Lease renewal timed out");
                            self.transition(State::Follower);
                        }
                    }
                }
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool> {
        self.lock
            .try_acquire_or_renew(&self.config.node_id, self.config.lease_duration)
            .await
    }

    fn transition(&self, next: State) {
        let prev = self.state.send_replace(next);
        debug!(?prev, ?next, "Leader election state changed");
        match (prev, next) {
            (State::Leader, State::Leader) => {}
            (_, State::Leader) => self.callbacks.on_started_leading(),
            (State::Leader, _) => self.callbacks.on_stopped_leading(),
            _ => {}
        }
    }
}
