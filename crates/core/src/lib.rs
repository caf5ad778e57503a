//! Converge core: resource identity, ownership conventions and settings.

#![forbid(unsafe_code)]

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod key;
pub mod ownership;
pub mod settings;
pub mod tracked;

pub use key::{Gvk, ResourceKey, Scope};
pub use ownership::{
    component_label_key, label_selector, owner_label_key, validate_label_value, OwnershipConfig,
    MANAGED_TRUE,
};
pub use settings::{DeletePropagation, Settings};
pub use tracked::TrackedSet;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid label value {value:?}: {reason}")]
    InvalidLabelValue { value: String, reason: &'static str },
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvk(String),
    #[error("object missing {0}")]
    MissingField(&'static str),
    #[error("field manager must not be empty")]
    EmptyFieldManager,
}

pub mod prelude {
    pub use super::{CoreError, Gvk, OwnershipConfig, ResourceKey, Scope, Settings, TrackedSet};
}

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `default_env`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(default_env: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_env))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}
