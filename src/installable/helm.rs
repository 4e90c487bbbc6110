use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::error;

use crate::helm::{HelmClient, ReleaseStatus};
use crate::installable::values::HelmValuesProvider;
use crate::installable::{EventRecorder, InstallResult, Installable, Uninstallable};
use crate::resources::cfapis::InstallationConfig;
use crate::Result;

/// Installs one helm chart and maps its release status to an install result:
/// deployed reads as success, failed as failed, everything else (including
/// the pending states) as in progress.
pub struct HelmChart {
    chart_path: PathBuf,
    namespace: String,
    release: String,
    values_provider: Arc<dyn HelmValuesProvider>,
    helm_client: Arc<dyn HelmClient>,
}

impl HelmChart {
    pub fn new(
        chart_path: impl Into<PathBuf>,
        namespace: impl Into<String>,
        release: impl Into<String>,
        values_provider: Arc<dyn HelmValuesProvider>,
        helm_client: Arc<dyn HelmClient>,
    ) -> Self {
        Self {
            chart_path: chart_path.into(),
            namespace: namespace.into(),
            release: release.into(),
            values_provider,
            helm_client,
        }
    }
}

#[async_trait]
impl Installable for HelmChart {
    fn name(&self) -> String {
        format!("Helm Installable: {}", self.release)
    }

    async fn install(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let values = match self.values_provider.values(config).await {
            Ok(values) => values,
            Err(err) => {
                error!(chart = %self.release, "failed to get helm chart values: {err}");
                return Ok(InstallResult::in_progress(format!(
                    "failed to get helm chart {} values: {err}",
                    self.release
                )));
            }
        };

        let helm_result = match self
            .helm_client
            .apply(&self.chart_path, &self.namespace, &self.release, &values)
            .await
        {
            Ok(helm_result) => helm_result,
            Err(err) => {
                error!(chart = %self.release, "failed to apply chart: {err}");
                return Ok(InstallResult::failed(format!(
                    "failed to install/upgrade helm chart {}: {err}",
                    self.release
                )));
            }
        };

        events
            .event(
                EventType::Normal,
                "HelmChartApplied",
                &format!(
                    "Helm chart {} applied with status {}",
                    self.release, helm_result.status
                ),
            )
            .await;

        match helm_result.status {
            ReleaseStatus::Deployed => {
                events
                    .event(
                        EventType::Normal,
                        "HelmChartDeployed",
                        &format!("Helm chart {} deployed successfully", self.release),
                    )
                    .await;
                Ok(InstallResult::success())
            }
            ReleaseStatus::Failed => {
                events
                    .event(
                        EventType::Warning,
                        "HelmChartDeploymentFailed",
                        &format!(
                            "Helm chart {} failed to deploy: {}",
                            self.release, helm_result.message
                        ),
                    )
                    .await;
                Ok(InstallResult::failed(helm_result.message))
            }
            status => {
                events
                    .event(
                        EventType::Normal,
                        "HelmChartDeploying",
                        &format!("Helm chart {} is being deployed", self.release),
                    )
                    .await;
                Ok(InstallResult::in_progress(format!(
                    "helm chart {} is in status {status}: {}",
                    self.release, helm_result.message
                )))
            }
        }
    }
}

#[async_trait]
impl Uninstallable for HelmChart {
    fn name(&self) -> String {
        format!("Helm Installable: {}", self.release)
    }

    async fn uninstall(
        &self,
        _config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let helm_result = match self
            .helm_client
            .uninstall(&self.namespace, &self.release)
            .await
        {
            Ok(helm_result) => helm_result,
            Err(err) => {
                error!(chart = %self.release, "failed to uninstall chart: {err}");
                return Ok(InstallResult::failed(format!(
                    "failed to uninstall helm chart {}: {err}",
                    self.release
                )));
            }
        };

        match helm_result {
            None => {
                events
                    .event(
                        EventType::Normal,
                        "HelmChartUninstalled",
                        &format!("Helm chart {} uninstalled successfully", self.release),
                    )
                    .await;
                Ok(InstallResult::success())
            }
            Some(helm_result) => {
                events
                    .event(
                        EventType::Normal,
                        "HelmChartUninstalling",
                        &format!("Helm chart {} is being uninstalled", self.release),
                    )
                    .await;
                Ok(InstallResult::in_progress(format!(
                    "helm chart {} is in status {}: {}",
                    self.release, helm_result.status, helm_result.message
                )))
            }
        }
    }
}
