//! Read and write access to the cluster used by the reconciler.
//!
//! The [`Cluster`] trait keeps the reconcile loop independent of the API
//! server so it can be exercised against mocks.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::PostParams,
    runtime::{
        events::{Event, EventType, Recorder, Reporter},
        reflector::{ObjectRef, Store},
    },
    Api, Client, Resource, ResourceExt,
};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::{error::Result, Mydemo, MydemoStatus};

/// Field manager and event reporter name.
pub static CONTROLLER_NAME: &str = "crddemo-controller";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Look up a deployment, `None` if it does not exist.
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment>;

    /// Replace a deployment. Fails with a version conflict when it changed
    /// since `deployment` was read.
    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment>;

    /// Replace the status sub-resource of `mydemo`.
    async fn update_mydemo_status(&self, mydemo: &Mydemo, status: &MydemoStatus) -> Result<Mydemo>;

    /// Record an event on `mydemo`. Failures are logged, not returned.
    async fn publish_event(&self, mydemo: &Mydemo, type_: EventType, reason: &str, note: String);
}

/// [`Cluster`] backed by the kube API. Deployments are read from the
/// informer cache, writes go to the API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    deployments: Store<Deployment>,
    reporter: Reporter,
}

impl KubeCluster {
    pub fn new(client: Client, deployments: Store<Deployment>) -> Self {
        KubeCluster {
            client,
            deployments,
            reporter: Reporter {
                controller: CONTROLLER_NAME.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    fn deployment_api(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let cached = self.deployments.get(&ObjectRef::new(name).within(namespace));
        Ok(cached.map(|deployment| Deployment::clone(&deployment)))
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let pp = PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..PostParams::default()
        };
        Ok(self.deployment_api(namespace).create(&pp, deployment).await?)
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let pp = PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..PostParams::default()
        };
        Ok(self
            .deployment_api(namespace)
            .replace(&deployment.name_any(), &pp, deployment)
            .await?)
    }

    async fn update_mydemo_status(&self, mydemo: &Mydemo, status: &MydemoStatus) -> Result<Mydemo> {
        let ns = mydemo.namespace().unwrap_or_default();
        let mydemos: Api<Mydemo> = Api::namespaced(self.client.clone(), &ns);

        // carries the cached resourceVersion, a stale copy is rejected with 409
        let mut updated = mydemo.clone();
        updated.status = Some(status.clone());
        let data = serde_json::to_vec(&updated)?;

        Ok(mydemos
            .replace_status(&mydemo.name_any(), &PostParams::default(), data)
            .await?)
    }

    async fn publish_event(&self, mydemo: &Mydemo, type_: EventType, reason: &str, note: String) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            mydemo.object_ref(&()),
        );
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: "Reconciling".into(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            warn!(
                mydemo = %mydemo.key(),
                reason = %reason,
                error = %err,
                "failed to publish event"
            );
        }
    }
}
