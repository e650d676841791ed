pub mod backoff;
pub mod cluster;
pub mod config;
pub mod controller;
mod error;
pub mod handler;
pub mod informer;
mod key;
mod mydemo;
pub mod queue;
pub mod reconciler;

pub use self::config::ControllerConfig;
pub use self::error::{Disposition, Error, Result};
pub use self::key::ResourceKey;
pub use self::mydemo::{Mydemo, MydemoSpec, MydemoStatus};
pub use k8s_openapi;
pub use kube::{self, CustomResource, CustomResourceExt};
