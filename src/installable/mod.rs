use async_trait::async_trait;

use crate::resources::cfapis::InstallationConfig;
use crate::Result;

pub mod admins;
pub mod certificates;
pub mod conditional;
pub mod events;
pub mod helm;
pub mod orgs;
pub mod values;
pub mod yaml;

pub use events::EventRecorder;

/// Outcome of one installable operation. `Failed` captures a recognized,
/// stable failure surfaced through status conditions; unexpected failures
/// travel as `Err` instead and hit the reconcile retry path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallResult {
    pub state: ResultState,
    pub message: String,
}

impl InstallResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn success_with(message: impl Into<String>) -> Self {
        Self {
            state: ResultState::Success,
            message: message.into(),
        }
    }

    pub fn in_progress(message: impl Into<String>) -> Self {
        Self {
            state: ResultState::InProgress,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: ResultState::Failed,
            message: message.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResultState {
    #[default]
    Success,
    InProgress,
    Failed,
}

impl ResultState {
    /// Total order used when aggregating results: Failed > InProgress >
    /// Success. Aggregation must go through this function rather than the
    /// declaration order of the enum.
    pub fn severity(self) -> u8 {
        match self {
            ResultState::Success => 0,
            ResultState::InProgress => 1,
            ResultState::Failed => 2,
        }
    }
}

/// A unit of idempotent install work against cluster state. Implementations
/// are re-invoked on every reconcile and must converge rather than assume a
/// fresh cluster.
#[async_trait]
pub trait Installable: Send + Sync {
    fn name(&self) -> String;

    async fn install(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult>;
}

/// The uninstall capability. Kept separate from [`Installable`] so that
/// uninstall-only units (org draining) never expose an install operation.
#[async_trait]
pub trait Uninstallable: Send + Sync {
    fn name(&self) -> String;

    async fn uninstall(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_failed_above_in_progress_above_success() {
        assert!(ResultState::Failed.severity() > ResultState::InProgress.severity());
        assert!(ResultState::InProgress.severity() > ResultState::Success.severity());
    }

    #[test]
    fn default_result_is_success() {
        assert_eq!(InstallResult::default().state, ResultState::Success);
        assert_eq!(InstallResult::success(), InstallResult::default());
    }
}
