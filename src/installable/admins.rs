use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use crate::installable::{EventRecorder, InstallResult, Installable};
use crate::resources::cfapis::{InstallationConfig, FIELD_MANAGER};
use crate::Result;

const ROLE_BINDING_NAME: &str = "cfapi-admins";
const ADMIN_CLUSTER_ROLE: &str = "korifi-controllers-admin";
const IDENTITY_PREFIX: &str = "sap.ids:";

/// Grants the configured CF admin identities the korifi admin role through a
/// single RoleBinding in the root namespace.
pub struct Admins {
    client: Client,
}

impl Admins {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Prefixes an identity with the identity-provider namespace unless it
/// already carries it; applying this twice is a no-op.
fn subject_name(admin: &str) -> String {
    if admin.starts_with(IDENTITY_PREFIX) {
        admin.to_owned()
    } else {
        format!("{IDENTITY_PREFIX}{admin}")
    }
}

fn role_binding(config: &InstallationConfig) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(ROLE_BINDING_NAME.into()),
            namespace: Some(config.root_namespace.clone()),
            annotations: Some(BTreeMap::from_iter([(
                "cloudfoundry.org/propagate-cf-role".to_owned(),
                "true".to_owned(),
            )])),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "ClusterRole".into(),
            name: ADMIN_CLUSTER_ROLE.into(),
        },
        subjects: Some(
            config
                .cf_admins
                .iter()
                .map(|admin| Subject {
                    kind: "User".into(),
                    name: subject_name(admin),
                    namespace: Some(config.root_namespace.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

#[async_trait]
impl Installable for Admins {
    fn name(&self) -> String {
        "Admins Installable".into()
    }

    async fn install(
        &self,
        config: &InstallationConfig,
        _events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &config.root_namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(
            ROLE_BINDING_NAME,
            &params,
            &Patch::Apply(&role_binding(config)),
        )
        .await?;

        Ok(InstallResult::success())
    }
}
