use async_trait::async_trait;
use serde_json::{json, Value};

use crate::resources::cfapis::InstallationConfig;
use crate::Result;

/// Resolves the desired helm values for one chart from the compiled
/// installation config. Pluggable per chart installable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HelmValuesProvider: Send + Sync {
    async fn values(&self, config: &InstallationConfig) -> Result<Value>;
}

/// A fixed value map, for charts that take no input from the config.
#[derive(Clone, Debug, Default)]
pub struct Override(pub Value);

#[async_trait]
impl HelmValuesProvider for Override {
    async fn values(&self, _config: &InstallationConfig) -> Result<Value> {
        Ok(if self.0.is_null() {
            json!({})
        } else {
            self.0.clone()
        })
    }
}

pub struct KorifiValues;

#[async_trait]
impl HelmValuesProvider for KorifiValues {
    async fn values(&self, config: &InstallationConfig) -> Result<Value> {
        Ok(json!({
            "adminUserName": "cf-admin",
            "generateInternalCertificates": false,
            "containerRegistrySecrets": [config.container_registry_secret],
            "containerRepositoryPrefix": config.container_repository_prefix,
            "defaultAppDomainName": format!("apps.{}", config.cf_domain),
            "api": {
                "apiServer": {
                    "url": format!("cfapi.{}", config.cf_domain),
                },
                "uaaURL": config.uaa_url,
            },
            "kpackImageBuilder": {
                "builderRepository": config.builder_repository,
            },
            "networking": {
                "gatewayClass": config.gateway_type.gateway_class(),
            },
            "experimental": {
                "managedServices": {
                    "enabled": true,
                },
                "uaa": {
                    "enabled": true,
                    "url": config.uaa_url,
                },
            },
        }))
    }
}

/// Values for the prerequisites chart, which propagates the container
/// registry secret into the CF root namespace.
pub struct PrerequisitesValues;

#[async_trait]
impl HelmValuesProvider for PrerequisitesValues {
    async fn values(&self, config: &InstallationConfig) -> Result<Value> {
        Ok(json!({
            "sourceNamespace": "cfapi-system",
            "sourceSecret": config.container_registry_secret,
            "destinationNamespace": config.root_namespace,
            "destinationSecret": config.container_registry_secret,
            "secretPropagationDisabled": config.disable_container_registry_secret_propagation,
        }))
    }
}

pub struct CfApiConfigValues;

#[async_trait]
impl HelmValuesProvider for CfApiConfigValues {
    async fn values(&self, config: &InstallationConfig) -> Result<Value> {
        Ok(json!({
            "rootNamespace": config.root_namespace,
            "cfDomain": config.cf_domain,
            "uaaURL": config.uaa_url,
            "cfAdmins": config.cf_admins,
            "korifiIngressHost": config.korifi_ingress_host,
            "useSelfSignedCertificates": config.use_self_signed_certificates,
        }))
    }
}

pub fn contour() -> Override {
    Override(json!({
        "gatewayAPI": {
            "manageCRDs": false,
        },
        "configInline": {
            "gateway": {
                "gatewayRef": {
                    "name": "korifi",
                    "namespace": "cfapi-system",
                },
            },
        },
    }))
}
