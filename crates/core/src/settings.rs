//! Environment-driven knobs. Unset or unparsable values fall back to defaults.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HASH_LEN: usize = 8;
pub const MIN_HASH_LEN: usize = 4;
/// Hex length of a full SHA-256 digest.
pub const MAX_HASH_LEN: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletePropagation {
    #[default]
    Background,
    Foreground,
    Orphan,
}

impl DeletePropagation {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletePropagation::Background => "Background",
            DeletePropagation::Foreground => "Foreground",
            DeletePropagation::Orphan => "Orphan",
        }
    }
}

impl FromStr for DeletePropagation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "background" => Ok(Self::Background),
            "foreground" => Ok(Self::Foreground),
            "orphan" => Ok(Self::Orphan),
            other => Err(format!("unknown propagation policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Hex characters kept from the content digest (`CONVERGE_HASH_LEN`).
    pub hash_len: usize,
    /// Report orphans without deleting them (`CONVERGE_PRUNE_DRY_RUN`).
    pub prune_dry_run: bool,
    /// `CONVERGE_DELETE_PROPAGATION`
    pub propagation: DeletePropagation,
}

impl Default for Settings {
    fn default() -> Self {
        Self { hash_len: DEFAULT_HASH_LEN, prune_dry_run: false, propagation: DeletePropagation::Background }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let hash_len = lookup("CONVERGE_HASH_LEN")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .map(clamp_hash_len)
            .unwrap_or(defaults.hash_len);
        let prune_dry_run = lookup("CONVERGE_PRUNE_DRY_RUN")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.prune_dry_run);
        let propagation = lookup("CONVERGE_DELETE_PROPAGATION")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.propagation);
        Self { hash_len, prune_dry_run, propagation }
    }
}

pub fn clamp_hash_len(len: usize) -> usize {
    len.clamp(MIN_HASH_LEN, MAX_HASH_LEN)
}
