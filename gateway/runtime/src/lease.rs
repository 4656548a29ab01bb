use crate::k8s::{self, Api, Lease, ObjectMeta, Patch, PatchParams};
use anyhow::Result;
use gateway_core::LeaseLock;
use kubert::lease::{ClaimParams, LeaseManager};
use std::time::Duration;
use tracing::{debug, info};

const FIELD_MANAGER: &str = "gateway";

/// A [`LeaseLock`] backed by a `coordination.k8s.io/v1` Lease.
pub struct KubeLease {
    name: String,
    manager: LeaseManager,
    renew_grace_period: Duration,
}

/// Creates the named Lease if it doesn't exist yet and returns a lock over it.
///
/// A claim is renewed once less than `renew_grace_period` of it remains.
pub async fn init(
    client: k8s::Client,
    namespace: &str,
    name: &str,
    renew_grace_period: Duration,
) -> Result<KubeLease> {
    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/component".to_string(),
                    "gateway".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = Api::<Lease>::namespaced(client, namespace);
    match api
        .patch(
            name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    };

    let manager = LeaseManager::init(api, name).await?;
    Ok(KubeLease {
        name: name.to_string(),
        manager,
        renew_grace_period,
    })
}

// === impl KubeLease ===

#[async_trait::async_trait]
impl LeaseLock for KubeLease {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire_or_renew(&self, node_id: &str, duration: Duration) -> Result<bool> {
        let params = ClaimParams {
            lease_duration: duration,
            renew_grace_period: self.renew_grace_period.min(duration),
        };
        let claim = self.manager.ensure_claimed(node_id, &params).await?;
        Ok(claim.is_current_for(node_id))
    }

    async fn release(&self, node_id: &str) -> Result<()> {
        if self.manager.vacate(node_id).await? {
            debug!(lease = %self.name, "Vacated lease");
        }
        Ok(())
    }
}
