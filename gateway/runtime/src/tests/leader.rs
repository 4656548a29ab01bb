use crate::{leader::State, ElectionConfig, Elector, LeaderCallbacks};
use anyhow::{bail, Result};
use gateway_core::LeaseLock;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time};

/// A lease held in memory and shared by every elector in a test.
#[derive(Clone, Default)]
struct MemLease {
    claim: Arc<Mutex<Option<(String, time::Instant)>>>,
    fail: Arc<AtomicBool>,
}

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Started,
    Stopped,
}

struct Recorder(mpsc::UnboundedSender<Event>);

fn config(node_id: &str) -> ElectionConfig {
    ElectionConfig {
        node_id: node_id.to_string(),
        lease_duration: Duration::from_secs(15),
        renew_deadline: Duration::from_secs(10),
        retry_period: Duration::from_secs(2),
    }
}

fn spawn_elector(
    node_id: &str,
    lease: &MemLease,
) -> (
    mpsc::UnboundedReceiver<Event>,
    tokio::sync::watch::Receiver<State>,
    drain::Signal,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let elector = Elector::new(config(node_id), lease.clone(), Recorder(tx));
    let state = elector.state();
    let (signal, shutdown) = drain::channel();
    let task = tokio::spawn(elector.run(shutdown));
    (rx, state, signal, task)
}

#[tokio::test(start_paused = true)]
async fn acquires_and_releases_on_shutdown() {
    let lease = MemLease::default();
    let (mut events, state, signal, task) = spawn_elector("node-a", &lease);

    assert_eq!(events.recv().await, Some(Event::Started));
    assert_eq!(*state.borrow(), State::Leader);
    assert_eq!(lease.holder().as_deref(), Some("node-a"));

    // Leadership is kept across many renewals.
    time::sleep(Duration::from_secs(60)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(lease.holder().as_deref(), Some("node-a"));

    signal.drain().await;
    task.await.expect("elector must not panic");
    assert_eq!(events.recv().await, Some(Event::Stopped));
    assert_eq!(*state.borrow(), State::Follower);
    assert_eq!(lease.holder(), None);
}

#[tokio::test(start_paused = true)]
async fn single_leader_with_failover() {
    let lease = MemLease::default();
    let (mut events_a, _state_a, signal_a, task_a) = spawn_elector("node-a", &lease);
    assert_eq!(events_a.recv().await, Some(Event::Started));

    let (mut events_b, state_b, signal_b, task_b) = spawn_elector("node-b", &lease);
    time::sleep(Duration::from_secs(60)).await;
    assert!(events_b.try_recv().is_err());
    assert_ne!(*state_b.borrow(), State::Leader);
    assert_eq!(lease.holder().as_deref(), Some("node-a"));

    signal_a.drain().await;
    task_a.await.expect("elector must not panic");
    assert_eq!(events_a.recv().await, Some(Event::Stopped));

    assert_eq!(events_b.recv().await, Some(Event::Started));
    assert_eq!(lease.holder().as_deref(), Some("node-b"));

    signal_b.drain().await;
    task_b.await.expect("elector must not panic");
}

#[tokio::test(start_paused = true)]
async fn demotes_when_renewals_fail_past_the_deadline() {
    let lease = MemLease::default();
    let (mut events, state, signal, task) = spawn_elector("node-a", &lease);
    assert_eq!(events.recv().await, Some(Event::Started));

    let failed_at = time::Instant::now();
    lease.fail.store(true, Ordering::SeqCst);
    assert_eq!(events.recv().await, Some(Event::Stopped));
    assert_eq!(*state.borrow(), State::Follower);

    // Renewal errors are retried until the renew deadline passes.
    let elapsed = failed_at.elapsed();
    let cfg = config("node-a");
    assert!(elapsed >= cfg.renew_deadline - cfg.retry_period, "{elapsed:?}");
    assert!(elapsed <= cfg.renew_deadline + cfg.retry_period, "{elapsed:?}");

    // Leadership is regained once the lease is reachable again.
    lease.fail.store(false, Ordering::SeqCst);
    assert_eq!(events.recv().await, Some(Event::Started));

    signal.drain().await;
    task.await.expect("elector must not panic");
}

#[tokio::test(start_paused = true)]
async fn demotes_when_the_lease_is_taken() {
    let lease = MemLease::default();
    let (mut events, state, signal, task) = spawn_elector("node-a", &lease);
    assert_eq!(events.recv().await, Some(Event::Started));

    lease.steal("node-b", Duration::from_secs(15));
    assert_eq!(events.recv().await, Some(Event::Stopped));
    assert_eq!(*state.borrow(), State::Follower);
    assert_eq!(lease.holder().as_deref(), Some("node-b"));

    signal.drain().await;
    task.await.expect("elector must not panic");
    // Only the holder's claim may be released.
    assert_eq!(lease.holder().as_deref(), Some("node-b"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_leading_is_quiet() {
    let lease = MemLease::default();
    lease.steal("node-b", Duration::from_secs(600));
    let (mut events, _state, signal, task) = spawn_elector("node-a", &lease);

    time::sleep(Duration::from_secs(10)).await;
    signal.drain().await;
    task.await.expect("elector must not panic");
    assert_eq!(events.recv().await, None);
}

#[test]
fn validates_timings() {
    assert!(config("node-a").validate().is_ok());

    let mut cfg = config("node-a");
    cfg.renew_deadline = cfg.lease_duration;
    assert!(cfg.validate().is_err());

    let mut cfg = config("node-a");
    cfg.retry_period = Duration::ZERO;
    assert!(cfg.validate().is_err());

    let mut cfg = config("node-a");
    cfg.retry_period = cfg.renew_deadline;
    assert!(cfg.validate().is_err());
}

// === impl MemLease ===

impl MemLease {
    fn holder(&self) -> Option<String> {
        let claim = self.claim.lock();
        claim
            .as_ref()
            .filter(|(_, expiry)| *expiry > time::Instant::now())
            .map(|(holder, _)| holder.clone())
    }

    fn steal(&self, node_id: &str, duration: Duration) {
        *self.claim.lock() = Some((node_id.to_string(), time::Instant::now() + duration));
    }
}

#[async_trait::async_trait]
impl LeaseLock for MemLease {
    fn name(&self) -> &str {
        "test"
    }

    async fn try_acquire_or_renew(&self, node_id: &str, duration: Duration) -> Result<bool> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("lease unavailable");
        }

        let now = time::Instant::now();
        let mut claim = self.claim.lock();
        if let Some((holder, expiry)) = &*claim {
            if holder != node_id && *expiry > now {
                return Ok(false);
            }
        }
        *claim = Some((node_id.to_string(), now + duration));
        Ok(true)
    }

    async fn release(&self, node_id: &str) -> Result<()> {
        let mut claim = self.claim.lock();
        if claim.as_ref().map(|(holder, _)| holder == node_id) == Some(true) {
            *claim = None;
        }
        Ok(())
    }
}

// === impl Recorder ===

impl LeaderCallbacks for Recorder {
    fn on_started_leading(&self) {
        let _ = self.0.send(Event::Started);
    }

    fn on_stopped_leading(&self) {
        let _ = self.0.send(Event::Stopped);
    }
}
