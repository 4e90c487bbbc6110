use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{Error, Result};

/// Status of a helm release, as reported by the helm binary.
#[derive(Deserialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    Superseded,
    Uninstalling,
    Uninstalled,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ReleaseStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingRollback
        )
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Uninstalling => "uninstalling",
            ReleaseStatus::Uninstalled => "uninstalled",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
            ReleaseStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HelmResult {
    pub status: ReleaseStatus,
    pub message: String,
}

/// Narrow contract towards helm: apply a chart to its desired state, or tear
/// a release down. Both calls report the resulting release status and leave
/// retry policy to the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HelmClient: Send + Sync {
    async fn apply(
        &self,
        chart_path: &Path,
        namespace: &str,
        release: &str,
        values: &serde_json::Value,
    ) -> Result<HelmResult>;

    /// Returns `None` when no release with the given name exists.
    async fn uninstall(&self, namespace: &str, release: &str) -> Result<Option<HelmResult>>;
}

/// Drives the helm binary. Charts are installed with `upgrade --install`,
/// values are piped as YAML on stdin, and release state is read back from
/// `helm status -o json`.
#[derive(Clone, Debug)]
pub struct HelmCli {
    binary: PathBuf,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("helm"),
        }
    }
}

#[derive(Deserialize)]
struct ReleasePayload {
    #[serde(default)]
    info: ReleaseInfo,
}

#[derive(Deserialize, Default)]
struct ReleaseInfo {
    #[serde(default)]
    status: ReleaseStatus,
    #[serde(default)]
    description: String,
}

impl HelmCli {
    async fn release_status(&self, namespace: &str, release: &str) -> Result<Option<HelmResult>> {
        let output = Command::new(&self.binary)
            .args(["status", release, "-n", namespace, "-o", "json"])
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") {
                return Ok(None);
            }
            return Err(Error::HelmCli(stderr.trim().to_owned()));
        }

        let payload: ReleasePayload = serde_json::from_slice(&output.stdout)?;
        Ok(Some(HelmResult {
            status: payload.info.status,
            message: payload.info.description,
        }))
    }
}

#[async_trait]
impl HelmClient for HelmCli {
    async fn apply(
        &self,
        chart_path: &Path,
        namespace: &str,
        release: &str,
        values: &serde_json::Value,
    ) -> Result<HelmResult> {
        if let Some(current) = self.release_status(namespace, release).await? {
            if current.status.is_pending() {
                info!(release, status = %current.status, "helm operation is pending");
                return Ok(HelmResult {
                    status: current.status,
                    message: "operation pending".into(),
                });
            }
        }

        debug!(release, chart = %chart_path.display(), "applying helm chart");

        let mut child = Command::new(&self.binary)
            .args(["upgrade", "--install", release])
            .arg(chart_path)
            .args(["-n", namespace, "--create-namespace", "--values", "-", "-o", "json"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let values_yaml = serde_yaml::to_string(values)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(values_yaml.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Ok(HelmResult {
                status: ReleaseStatus::Unknown,
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let payload: ReleasePayload = serde_json::from_slice(&output.stdout)?;
        Ok(HelmResult {
            status: payload.info.status,
            message: payload.info.description,
        })
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<Option<HelmResult>> {
        let Some(current) = self.release_status(namespace, release).await? else {
            debug!(release, "release not found, nothing to uninstall");
            return Ok(None);
        };

        if current.status == ReleaseStatus::Uninstalling {
            info!(release, "uninstall operation is ongoing");
            return Ok(Some(HelmResult {
                status: current.status,
                message: "operation pending".into(),
            }));
        }

        let output = Command::new(&self.binary)
            .args(["uninstall", release, "-n", namespace])
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Ok(Some(HelmResult {
                status: ReleaseStatus::Unknown,
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }));
        }

        Ok(None)
    }
}
