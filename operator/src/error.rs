use crate::ResourceKey;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("crddemo CRDs are not installed")]
    CrdNotInstalled,
    #[error("Kube error: {0}")]
    Kube(#[source] kube::Error),
    #[error("invalid resource key: {0:?}")]
    InvalidKey(String),
    #[error("invalid spec for {key}: {reason}")]
    InvalidSpec { key: ResourceKey, reason: String },
    #[error("deployment {deployment} is not controlled by {key}")]
    OwnerConflict { key: ResourceKey, deployment: String },
    #[error("transient error: {0}")]
    Transient(String),
    #[error("object changed since it was read: {0}")]
    VersionConflict(#[source] kube::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What the worker pool does with a key after its reconcile failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Surface and stop, retrying cannot fix it.
    Terminal,
    /// Requeue after the key's next backoff delay.
    Backoff,
    /// Requeue right away without growing the backoff.
    Immediate,
}

impl Error {
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::InvalidKey(_)
            | Error::InvalidSpec { .. }
            | Error::OwnerConflict { .. }
            | Error::InvalidConfig(_)
            | Error::CrdNotInstalled => Disposition::Terminal,
            Error::VersionConflict(_) => Disposition::Immediate,
            Error::Kube(_) | Error::Transient(_) | Error::Serialization(_) => Disposition::Backoff,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.disposition() == Disposition::Terminal
    }

    /// The API server reported that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Short machine readable reason, used for recorded events.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InvalidSpec { .. } => "InvalidSpec",
            Error::OwnerConflict { .. } => "ErrResourceExists",
            Error::InvalidKey(_) => "InvalidKey",
            Error::VersionConflict(_) => "VersionConflict",
            _ => "ReconcileFailed",
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        let stale = matches!(
            &err,
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "Conflict"
        );
        if stale {
            Error::VersionConflict(err)
        } else {
            Error::Kube(err)
        }
    }
}
