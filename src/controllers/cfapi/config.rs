use async_trait::async_trait;
use kube::{Client, ResourceExt};

use crate::controllers::cfapi::kyma::KymaCluster;
use crate::resources::cfapis::{GatewayType, InstallationConfig, CFAPI};
use crate::{Error, Result};

const DEFAULT_ROOT_NAMESPACE: &str = "cf";

/// Compiles the per-reconcile installation config from the CFAPI spec and
/// live cluster state. Compilation is fail-fast: the first failing lookup
/// aborts and no partial config escapes.
#[async_trait]
pub trait CompileConfig: Send + Sync {
    async fn compile(&self, cfapi: &CFAPI) -> Result<InstallationConfig>;
}

pub struct KymaConfigCompiler {
    kyma: KymaCluster,
}

impl KymaConfigCompiler {
    pub fn new(client: Client) -> Self {
        Self {
            kyma: KymaCluster::new(client),
        }
    }

    async fn validate_gateway_type(&self, gateway_type: GatewayType) -> Result<()> {
        if gateway_type != GatewayType::Istio {
            return Ok(());
        }

        if !self.kyma.alpha_gateway_api_enabled().await? {
            return Err(Error::InvalidConfiguration(
                "alpha gateway API feature is not enabled in istio. To fix this, enable the \
                 `experimental` channel on the istio module and set \
                 `spec.experimental.pilot.enableAlphaGatewayAPI` to `true` on the \
                 `kyma-system/default` Istio resource"
                    .into(),
            ));
        }

        Ok(())
    }

    /// Resolves the registry secret name and URL, preferring a custom
    /// dockerconfigjson secret from the CFAPI namespace over the platform
    /// registry.
    async fn resolve_container_registry(&self, cfapi: &CFAPI) -> Result<(String, String)> {
        let namespace = cfapi.namespace().unwrap_or_default();

        if let Some(secret_name) = cfapi
            .spec
            .container_registry_secret
            .as_deref()
            .filter(|name| !name.is_empty())
        {
            let registry_config = self
                .kyma
                .docker_registry_config(&namespace, secret_name)
                .await?;

            let registry_url = registry_config.auths.keys().next().cloned().ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "container registry secret {secret_name} does not specify container registries"
                ))
            })?;

            return Ok((secret_name.to_owned(), registry_url));
        }

        self.kyma.platform_registry(&namespace).await
    }

    async fn resolve_uaa_url(&self, cfapi: &CFAPI) -> Result<String> {
        match cfapi.spec.uaa.as_deref().filter(|uaa| !uaa.is_empty()) {
            Some(uaa) => Ok(uaa.to_owned()),
            None => self.kyma.uaa_url().await,
        }
    }

    async fn resolve_cf_admins(&self, cfapi: &CFAPI) -> Result<Vec<String>> {
        match cfapi.spec.cf_admins.as_deref() {
            Some(admins) if !admins.is_empty() => Ok(admins.to_vec()),
            _ => self.kyma.cluster_admins().await,
        }
    }
}

#[async_trait]
impl CompileConfig for KymaConfigCompiler {
    async fn compile(&self, cfapi: &CFAPI) -> Result<InstallationConfig> {
        let root_namespace = cfapi
            .spec
            .root_namespace
            .clone()
            .filter(|namespace| !namespace.is_empty())
            .unwrap_or_else(|| DEFAULT_ROOT_NAMESPACE.to_owned());

        let gateway_type = cfapi.spec.gateway_type.unwrap_or_default();
        self.validate_gateway_type(gateway_type).await?;

        let cf_domain = self.kyma.domain().await?;

        let (container_registry_secret, container_registry_url) =
            self.resolve_container_registry(cfapi).await?;

        let container_repository_prefix = cfapi
            .spec
            .container_repository_prefix
            .clone()
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or_else(|| format!("{container_registry_url}/"));

        let builder_repository = cfapi
            .spec
            .builder_repository
            .clone()
            .filter(|repository| !repository.is_empty())
            .unwrap_or_else(|| format!("{container_registry_url}/cfapi/kpack-builder"));

        let uaa_url = self.resolve_uaa_url(cfapi).await?;
        let cf_admins = self.resolve_cf_admins(cfapi).await?;

        let korifi_ingress_service = match gateway_type {
            GatewayType::Istio => "korifi-istio",
            GatewayType::Contour => "contour-envoy",
        };
        let korifi_ingress_host = self.kyma.ingress_host(korifi_ingress_service).await?;

        Ok(InstallationConfig {
            root_namespace,
            container_registry_secret,
            container_registry_url,
            container_repository_prefix,
            builder_repository,
            uaa_url,
            cf_admins,
            cf_domain,
            gateway_type,
            korifi_ingress_service: korifi_ingress_service.to_owned(),
            korifi_ingress_host,
            use_self_signed_certificates: cfapi.spec.use_self_signed_certificates.unwrap_or(false),
            disable_container_registry_secret_propagation: cfapi
                .spec
                .disable_container_registry_secret_propagation
                .unwrap_or(false),
        })
    }
}
