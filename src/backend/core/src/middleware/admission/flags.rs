//! Feature-flag lookups keyed by worker type and flag kind.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;

use crate::error::Result;

/// Per-worker admission flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagKind {
    /// When on, jobs are dropped without running
    DropJobs,
    /// When explicitly off, jobs are deferred
    RunJobs,
}

impl FlagKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::DropJobs => "drop_jobs_for_",
            Self::RunJobs => "run_jobs_for_",
        }
    }
}

/// Lookup key for a feature flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlagKey {
    Worker { worker: String, kind: FlagKind },
    Global(String),
}

impl FlagKey {
    pub fn drop_jobs(worker: impl Into<String>) -> Self {
        Self::Worker {
            worker: worker.into(),
            kind: FlagKind::DropJobs,
        }
    }

    pub fn run_jobs(worker: impl Into<String>) -> Self {
        Self::Worker {
            worker: worker.into(),
            kind: FlagKind::RunJobs,
        }
    }

    pub fn global(name: impl Into<String>) -> Self {
        Self::Global(name.into())
    }

    /// Flag name as it appears in the flag store and in logs.
    pub fn name(&self) -> String {
        match self {
            Self::Worker { worker, kind } => format!("{}{}", kind.prefix(), worker),
            Self::Global(name) => name.clone(),
        }
    }
}

impl fmt::Display for FlagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Feature-flag provider.
#[async_trait]
pub trait FeatureFlags: Send + Sync {
    /// The flag's value, or `None` when it was never set.
    async fn get(&self, key: &FlagKey) -> Result<Option<bool>>;

    /// Whether the flag is on; unset flags are off.
    async fn enabled(&self, key: &FlagKey) -> Result<bool> {
        Ok(self.get(key).await?.unwrap_or(false))
    }
}

/// In-memory flag store for testing and development.
#[derive(Debug, Default)]
pub struct InMemoryFeatureFlags {
    flags: DashMap<FlagKey, bool>,
}

impl InMemoryFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: FlagKey, value: bool) {
        self.flags.insert(key, value);
    }

    pub fn unset(&self, key: &FlagKey) {
        self.flags.remove(key);
    }
}

#[async_trait]
impl FeatureFlags for InMemoryFeatureFlags {
    async fn get(&self, key: &FlagKey) -> Result<Option<bool>> {
        Ok(self.flags.get(key).map(|value| *value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_names() {
        assert_eq!(FlagKey::drop_jobs("PostReceive").name(), "drop_jobs_for_PostReceive");
        assert_eq!(FlagKey::run_jobs("PostReceive").name(), "run_jobs_for_PostReceive");
        assert_eq!(FlagKey::global("zoekt_indexing_paused").to_string(), "zoekt_indexing_paused");
    }

    #[tokio::test]
    async fn test_unset_is_distinct_from_false() {
        let flags = InMemoryFeatureFlags::new();
        let key = FlagKey::run_jobs("W");

        assert_eq!(flags.get(&key).await.unwrap(), None);
        assert!(!flags.enabled(&key).await.unwrap());

        flags.set(key.clone(), false);
        assert_eq!(flags.get(&key).await.unwrap(), Some(false));

        flags.unset(&key);
        assert_eq!(flags.get(&key).await.unwrap(), None);
    }
}
