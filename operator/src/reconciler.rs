use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    runtime::{
        events::EventType,
        reflector::{ObjectRef, Store},
    },
    ResourceExt,
};
use tracing::{debug, info, instrument, warn};

use crate::{cluster::Cluster, error::Result, Error, Mydemo, MydemoStatus, ResourceKey};

/// Work done for one key taken off the queue.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ResourceKey) -> Result<()>;
}

/// Drives the deployment of each Mydemo towards its spec.
pub struct Reconciler<C> {
    cluster: C,
    mydemos: Store<Mydemo>,
}

impl<C: Cluster> Reconciler<C> {
    pub fn new(cluster: C, mydemos: Store<Mydemo>) -> Self {
        Reconciler { cluster, mydemos }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn reconcile_key(&self, key: &ResourceKey) -> Result<()> {
        let ns = key
            .namespace()
            .ok_or_else(|| Error::InvalidKey(key.to_string()))?;
        let Some(mydemo) = self.mydemos.get(&ObjectRef::new(key.name()).within(ns)) else {
            // owned deployments go away through garbage collection
            info!("mydemo no longer exists");
            return Ok(());
        };

        if let Err(err) = mydemo.validate() {
            self.surface(&mydemo, &err).await;
            return Err(err);
        }

        let name = &mydemo.spec.deployment_name;
        let Some(deployment) = self.cluster.get_deployment(ns, name).await? else {
            let manifest = mydemo.deployment_manifest()?;
            let created = self.cluster.create_deployment(ns, &manifest).await?;
            info!(
                deployment = created.name_any(),
                replicas = ?mydemo.spec.replicas,
                "deployment created"
            );
            self.synced(&mydemo).await;
            return Ok(());
        };

        if !mydemo.controls(&deployment) {
            let err = Error::OwnerConflict {
                key: key.clone(),
                deployment: name.clone(),
            };
            self.surface(&mydemo, &err).await;
            return Err(err);
        }

        let (deployment, scaled) = self.scale(&mydemo, deployment).await?;
        self.update_status(&mydemo, &deployment).await?;
        if scaled {
            self.synced(&mydemo).await;
        }
        Ok(())
    }

    /// Bring the deployment to the requested replica count.
    async fn scale(
        &self,
        mydemo: &Mydemo,
        mut deployment: Deployment,
    ) -> Result<(Deployment, bool)> {
        let Some(desired) = mydemo.spec.replicas else {
            return Ok((deployment, false));
        };
        let current = deployment.spec.as_ref().and_then(|spec| spec.replicas);
        if current == Some(desired) {
            debug!(replicas = desired, "deployment already at desired size");
            return Ok((deployment, false));
        }

        info!(
            deployment = deployment.name_any(),
            from = ?current,
            to = desired,
            "scaling deployment"
        );
        deployment.spec.get_or_insert_with(Default::default).replicas = Some(desired);
        let ns = deployment.namespace().unwrap_or_default();
        let updated = self.cluster.update_deployment(&ns, &deployment).await?;
        Ok((updated, true))
    }

    /// Mirror the deployment's available replicas into the Mydemo status.
    async fn update_status(&self, mydemo: &Mydemo, deployment: &Deployment) -> Result<()> {
        let status = MydemoStatus {
            available_replicas: deployment
                .status
                .as_ref()
                .and_then(|status| status.available_replicas)
                .unwrap_or(0),
        };
        if mydemo.status.as_ref() == Some(&status) {
            return Ok(());
        }

        match self.cluster.update_mydemo_status(mydemo, &status).await {
            Ok(_) => {
                debug!(available = status.available_replicas, "status updated");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                info!("mydemo deleted before its status was written");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Attach a terminal error to the resource so users see it.
    async fn surface(&self, mydemo: &Mydemo, err: &Error) {
        warn!(error = %err, "reconcile cannot proceed until the resource changes");
        self.cluster
            .publish_event(mydemo, EventType::Warning, err.reason(), err.to_string())
            .await;
    }

    async fn synced(&self, mydemo: &Mydemo) {
        self.cluster
            .publish_event(
                mydemo,
                EventType::Normal,
                "Synced",
                "Mydemo synced successfully".to_string(),
            )
            .await;
    }
}

#[async_trait]
impl<C: Cluster + 'static> Reconcile for Reconciler<C> {
    async fn reconcile(&self, key: &ResourceKey) -> Result<()> {
        self.reconcile_key(key).await
    }
}
