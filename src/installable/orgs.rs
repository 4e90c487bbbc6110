use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams};
use kube::core::GroupVersionKind;
use kube::runtime::events::EventType;
use kube::Client;

use crate::installable::{EventRecorder, InstallResult, Uninstallable};
use crate::resources::cfapis::InstallationConfig;
use crate::Result;

fn cforg_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("korifi.cloudfoundry.org", "v1alpha1", "CFOrg"),
        "cforgs",
    )
}

/// Drains all CF orgs from the root namespace before the korifi charts are
/// torn down; org deletion cascades through spaces and apps, so this keeps
/// reporting in-progress until the last org is gone.
pub struct Orgs {
    client: Client,
}

impl Orgs {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, root_namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), root_namespace, &cforg_resource())
    }

    async fn delete_all_orgs(&self, root_namespace: &str) -> Result<()> {
        let api = self.api(root_namespace);
        match api
            .delete_collection(&DeleteParams::default(), &ListParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn remaining_orgs(&self, root_namespace: &str) -> Result<usize> {
        let api = self.api(root_namespace);
        match api.list(&ListParams::default()).await {
            Ok(orgs) => Ok(orgs.items.len()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Uninstallable for Orgs {
    fn name(&self) -> String {
        "Orgs Installable".into()
    }

    async fn uninstall(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        if let Err(err) = self.delete_all_orgs(&config.root_namespace).await {
            events
                .event(
                    EventType::Warning,
                    "InstallableFailed",
                    &format!("Installable {} failed", self.name()),
                )
                .await;
            return Err(err);
        }

        let remaining = match self.remaining_orgs(&config.root_namespace).await {
            Ok(remaining) => remaining,
            Err(err) => {
                events
                    .event(
                        EventType::Warning,
                        "InstallableFailed",
                        &format!("Installable {} failed", self.name()),
                    )
                    .await;
                return Err(err);
            }
        };

        if remaining > 0 {
            return Ok(InstallResult::in_progress(format!(
                "{remaining} orgs remaining"
            )));
        }

        Ok(InstallResult::success_with("Orgs deleted successfully"))
    }
}
