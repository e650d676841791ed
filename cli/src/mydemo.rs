use std::borrow::Cow;

use chrono::{Duration, Utc};

use crddemo_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time, kube::ResourceExt, Mydemo,
};
use tabled::Tabled;

/// Wrapper around [Mydemo], used to implement [Tabled].
pub struct MydemoOut(Mydemo);

impl MydemoOut {
    pub fn new(mydemo: Mydemo) -> Self {
        MydemoOut(mydemo)
    }
}

impl Tabled for MydemoOut {
    const LENGTH: usize = 6;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        let inner = &self.0;
        let namespace = inner.namespace().unwrap_or_default();
        let name = inner.name_any();
        let deployment = inner.spec.deployment_name.clone();
        let replicas = inner
            .spec
            .replicas
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        let available = inner
            .status
            .as_ref()
            .map(|s| s.available_replicas.to_string())
            .unwrap_or_default();
        let age = inner
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| time_ago(t).to_human())
            .unwrap_or_default();

        vec![
            Cow::Owned(namespace),
            Cow::Owned(name),
            Cow::Owned(deployment),
            Cow::Owned(replicas),
            Cow::Owned(available),
            Cow::Owned(age),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        ["NAMESPACE", "NAME", "DEPLOYMENT", "REPLICAS", "AVAILABLE", "AGE"]
            .into_iter()
            .map(Cow::Borrowed)
            .collect()
    }
}

fn time_ago(time: &Time) -> Duration {
    let now = Utc::now();
    now - time.0
}

pub trait HumanReadable {
    fn to_human(&self) -> String;
}

impl HumanReadable for Duration {
    fn to_human(&self) -> String {
        if self.num_days() > 0 {
            format!("{}d", self.num_days())
        } else if self.num_hours() > 0 {
            format!("{}h", self.num_hours())
        } else if self.num_minutes() > 0 {
            format!("{}m", self.num_minutes())
        } else {
            format!("{}s", self.num_seconds())
        }
    }
}
