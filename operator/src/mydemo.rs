use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
};
use kube::{CustomResource, CustomResourceExt, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{error::Result, Error, ResourceKey};

pub(crate) static DEFAULT_IMAGE: &str = "nginx:latest";

/// Demo resource that keeps one nginx deployment at the requested size.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(kind = "Mydemo", group = "crddemo.k8s.io", version = "v1", namespaced)]
#[kube(status = "MydemoStatus", shortname = "mydemo")]
#[kube(
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentName"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MydemoSpec {
    /// Name of the deployment managed for this resource.
    #[serde(default)]
    pub deployment_name: String,
    /// Desired replica count. Left to the deployment when unset.
    pub replicas: Option<i32>,
    /// Container image, defaults to `nginx:latest`.
    pub image: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MydemoStatus {
    pub available_replicas: i32,
}

impl Mydemo {
    /// Queue key of this resource.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.metadata.namespace.as_deref(), &self.name_any())
    }

    /// Check the fields reconciliation depends on.
    ///
    /// Failures here cannot be fixed by retrying, only by editing the resource.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidSpec {
            key: self.key(),
            reason,
        };

        let name = &self.spec.deployment_name;
        if name.is_empty() {
            return Err(invalid("deploymentName must be specified".to_string()));
        }
        if !is_dns_subdomain(name) {
            return Err(invalid(format!(
                "deploymentName {name:?} is not a valid DNS-1123 subdomain"
            )));
        }
        if let Some(replicas) = self.spec.replicas.filter(|r| *r < 0) {
            return Err(invalid(format!("replicas must not be negative, got {replicas}")));
        }
        Ok(())
    }

    /// Whether `deployment` carries a controller reference to this resource.
    pub fn controls(&self, deployment: &Deployment) -> bool {
        let Some(uid) = self.metadata.uid.as_deref() else {
            return false;
        };
        deployment
            .owner_references()
            .iter()
            .any(|owner| owner.controller == Some(true) && owner.uid == uid)
    }

    /// Labels put on the deployment and its pods.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), "nginx".to_string()),
            ("controller".to_string(), self.name_any()),
        ])
    }

    pub fn deployment_manifest(&self) -> Result<Deployment> {
        let metadata = self.object_metadata()?;
        let spec = self.deployment_spec();

        Ok(Deployment {
            metadata,
            spec: Some(spec),
            ..Deployment::default()
        })
    }

    fn object_metadata(&self) -> Result<ObjectMeta> {
        let api_resource = Mydemo::api_resource();
        let uid = self
            .uid()
            .ok_or_else(|| Error::Transient(format!("{} has no uid yet", self.key())))?;
        let owner_ref = OwnerReference {
            api_version: api_resource.api_version,
            kind: api_resource.kind,
            name: self.name_any(),
            uid,
            block_owner_deletion: Some(true),
            controller: Some(true),
        };

        Ok(ObjectMeta {
            name: Some(self.spec.deployment_name.clone()),
            namespace: self.metadata.namespace.clone(),
            owner_references: Some(vec![owner_ref]),
            labels: Some(self.selector_labels()),
            ..ObjectMeta::default()
        })
    }

    fn deployment_spec(&self) -> DeploymentSpec {
        let labels = self.selector_labels();
        let image = self
            .spec
            .image
            .clone()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        DeploymentSpec {
            replicas: self.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "nginx".to_string(),
                        image: Some(image),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }
    }
}

fn is_dns_subdomain(name: &str) -> bool {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    name.len() <= 253
        && name.starts_with(alnum)
        && name.ends_with(alnum)
        && name.chars().all(|c| alnum(c) || c == '-' || c == '.')
}
