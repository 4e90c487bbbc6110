use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::installable::{EventRecorder, InstallResult, Installable};
use crate::resources::cfapis::InstallationConfig;
use crate::Result;

/// Decides whether a conditional installable applies for a given config.
/// Returns the decision plus a message explaining a negative outcome.
pub trait Predicate: Send + Sync {
    fn evaluate(&self, config: &InstallationConfig) -> (bool, String);
}

impl<F> Predicate for F
where
    F: Fn(&InstallationConfig) -> (bool, String) + Send + Sync,
{
    fn evaluate(&self, config: &InstallationConfig) -> (bool, String) {
        self(config)
    }
}

/// Gates a delegate installable on a config predicate. An unmet predicate
/// short-circuits to success so the pipeline treats the unit as not
/// applicable rather than pending.
pub struct Conditional {
    predicate: Box<dyn Predicate>,
    delegate: Arc<dyn Installable>,
}

impl Conditional {
    pub fn new(predicate: impl Predicate + 'static, delegate: Arc<dyn Installable>) -> Self {
        Self {
            predicate: Box::new(predicate),
            delegate,
        }
    }
}

#[async_trait]
impl Installable for Conditional {
    fn name(&self) -> String {
        format!("Conditional: {}", self.delegate.name())
    }

    async fn install(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let (met, message) = self.predicate.evaluate(config);
        if !met {
            info!("condition not met: {message}");
            return Ok(InstallResult::success_with(message));
        }

        self.delegate.install(config, events).await
    }
}
