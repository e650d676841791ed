use std::{fmt, str::FromStr};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::Error;

/// Identifies one object by namespace and name.
///
/// Rendered as `namespace/name`, or just `name` for cluster scoped objects.
/// This is the unit the work queue deduplicates on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    namespace: Option<String>,
    name: String,
}

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        ResourceKey {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    /// Key of an object from its metadata. `None` when the object has no name.
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        let name = meta.name.as_deref().filter(|n| !n.is_empty())?;
        Some(Self::new(meta.namespace.as_deref(), name))
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let key = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => ResourceKey::new(None, name),
            (Some(ns), Some(name), None) => {
                let ns = Some(ns).filter(|ns| !ns.is_empty());
                ResourceKey::new(ns, name)
            }
            _ => return Err(Error::InvalidKey(s.to_string())),
        };
        if key.name.is_empty() {
            return Err(Error::InvalidKey(s.to_string()));
        }
        Ok(key)
    }
}
