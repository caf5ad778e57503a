use converge_core::{CoreError, Gvk, ResourceKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// The kind is not served by the cluster (e.g. an optional CRD is not installed).
    #[error("kind {0} is not registered with the cluster")]
    KindNotRegistered(Gvk),
    #[error("{0} already exists")]
    AlreadyExists(ResourceKey),
    #[error("{0} not found")]
    NotFound(ResourceKey),
    #[error("conflict on {key}: {message}")]
    Conflict { key: ResourceKey, message: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("{op} {target} rejected: {message}")]
    Rejected { op: &'static str, target: String, message: String },
    #[error("encoding object: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("{op} {target} failed: {source}")]
    Api {
        op: &'static str,
        target: String,
        #[source]
        source: kube::Error,
    },
}

impl ClusterError {
    pub fn is_kind_not_registered(&self) -> bool {
        matches!(self, ClusterError::KindNotRegistered(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }

    /// Classify a raw kube error for an operation on `key`. A 404 only means
    /// the object is missing for operations that address an existing object;
    /// for create and apply it points elsewhere (e.g. a missing namespace) and
    /// the server's message is kept.
    pub fn from_kube(op: &'static str, key: &ResourceKey, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                ClusterError::AlreadyExists(key.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => {
                ClusterError::Conflict { key: key.clone(), message: resp.message.clone() }
            }
            kube::Error::Api(resp) if resp.code == 404 && addresses_existing(op) => {
                ClusterError::NotFound(key.clone())
            }
            _ => ClusterError::Api { op, target: key.to_string(), source: err },
        }
    }

    /// Classify a discovery failure for `gvk`: a missing group or kind means
    /// the kind is not registered.
    pub fn from_discovery(gvk: &Gvk, err: kube::Error) -> Self {
        match &err {
            kube::Error::Discovery(_) => ClusterError::KindNotRegistered(gvk.clone()),
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::KindNotRegistered(gvk.clone()),
            _ => ClusterError::Api { op: "discover", target: gvk.to_string(), source: err },
        }
    }
}

fn addresses_existing(op: &str) -> bool {
    matches!(op, "get" | "update" | "patch" | "delete")
}
