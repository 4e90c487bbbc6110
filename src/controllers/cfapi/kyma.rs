use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::core::GroupVersionKind;
use kube::Client;
use serde::Deserialize;

use crate::{Error, Result};

const KYMA_SYSTEM_NAMESPACE: &str = "kyma-system";
const KYMA_GATEWAY_NAME: &str = "kyma-gateway";
const BTP_SERVICE_OPERATOR_SECRET: &str = "sap-btp-service-operator";
const KORIFI_GATEWAY_NAMESPACE: &str = "korifi-gateway";

/// Name of the secret through which the dockerregistry Kyma module exposes
/// its externally reachable registry.
pub const PLATFORM_REGISTRY_SECRET: &str = "dockerregistry-config-external";

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct DockerRegistryConfig {
    #[serde(default)]
    pub auths: BTreeMap<String, DockerRegistryAuth>,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct DockerRegistryAuth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn istio_gateway_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("networking.istio.io", "v1beta1", "Gateway"),
        "gateways",
    )
}

fn kyma_istio_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("operator.kyma-project.io", "v1alpha2", "Istio"),
        "istios",
    )
}

/// Lookups against the hosting Kyma cluster used to compile the installation
/// config. Every method issues live API calls; nothing is cached between
/// reconciles.
pub struct KymaCluster {
    client: Client,
}

impl KymaCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The base DNS domain of the cluster, read from the wildcard host of
    /// the kyma gateway.
    pub async fn domain(&self) -> Result<String> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            KYMA_SYSTEM_NAMESPACE,
            &istio_gateway_resource(),
        );

        let gateway = api.get_opt(KYMA_GATEWAY_NAME).await?.ok_or_else(|| {
            Error::InvalidConfiguration("failed to get the kyma system gateway".into())
        })?;

        let host = gateway
            .data
            .pointer("/spec/servers/0/hosts/0")
            .and_then(|host| host.as_str())
            .ok_or_else(|| {
                Error::InvalidConfiguration(
                    "failed to get the kyma gateway domain: gateway has no servers".into(),
                )
            })?;

        Ok(domain_from_wildcard(host).to_owned())
    }

    /// Whether the istio module has the alpha Gateway API feature enabled.
    pub async fn alpha_gateway_api_enabled(&self) -> Result<bool> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            KYMA_SYSTEM_NAMESPACE,
            &kyma_istio_resource(),
        );

        let istio = api.get_opt("default").await?.ok_or_else(|| {
            Error::InvalidConfiguration(
                "failed to get the istio resource. Make sure the istio kyma module is enabled"
                    .into(),
            )
        })?;

        Ok(istio
            .data
            .pointer("/spec/experimental/pilot/enableAlphaGatewayAPI")
            .and_then(|enabled| enabled.as_bool())
            .unwrap_or(false))
    }

    /// The UAA URL, derived from the token URL of the BTP service operator
    /// secret.
    pub async fn uaa_url(&self) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), KYMA_SYSTEM_NAMESPACE);

        let secret = api
            .get_opt(BTP_SERVICE_OPERATOR_SECRET)
            .await?
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "failed to get the btp service operator secret {BTP_SERVICE_OPERATOR_SECRET}. Make sure the btp operator kyma module is enabled"
                ))
            })?;

        let token_url = secret_value(&secret, "tokenurl")?;
        uaa_url_from_token_url(&token_url)
    }

    /// All users directly bound to the cluster-admin role.
    pub async fn cluster_admins(&self) -> Result<Vec<String>> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let bindings = api.list(&ListParams::default()).await?;

        let mut admins = Vec::new();
        for binding in bindings {
            if binding.role_ref.name != "cluster-admin" {
                continue;
            }

            for subject in binding.subjects.unwrap_or_default() {
                if subject.kind == "User" {
                    admins.push(subject.name);
                }
            }
        }

        Ok(admins)
    }

    /// The platform registry secret and its push URL, available once the
    /// dockerregistry module is enabled and external access is on.
    pub async fn platform_registry(&self, namespace: &str) -> Result<(String, String)> {
        if !self.docker_registry_module_enabled().await? {
            return Err(Error::InvalidConfiguration(
                "dockerregistry kyma module is not enabled".into(),
            ));
        }

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(PLATFORM_REGISTRY_SECRET)
            .await?
            .ok_or_else(|| Error::SecretNotFound(PLATFORM_REGISTRY_SECRET.into()))?;

        let url = secret_value(&secret, "pushRegAddr")?;
        Ok((PLATFORM_REGISTRY_SECRET.to_owned(), url))
    }

    /// Fetches and decodes a dockerconfigjson secret.
    pub async fn docker_registry_config(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<DockerRegistryConfig> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(secret_name)
            .await?
            .ok_or_else(|| Error::SecretNotFound(secret_name.into()))?;

        let config_json = secret
            .data
            .as_ref()
            .and_then(|data| data.get(".dockerconfigjson"))
            .ok_or_else(|| {
                Error::SecretKeyNotFound(".dockerconfigjson".into(), secret_name.into())
            })?;

        Ok(serde_json::from_slice(&config_json.0)?)
    }

    /// External hostname (or IP) of the korifi ingress service; empty until
    /// the load balancer is provisioned.
    pub async fn ingress_host(&self, service_name: &str) -> Result<String> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), KORIFI_GATEWAY_NAMESPACE);

        let Some(service) = api.get_opt(service_name).await? else {
            return Ok(String::new());
        };

        let ingress = service
            .status
            .and_then(|status| status.load_balancer)
            .and_then(|lb| lb.ingress)
            .unwrap_or_default();

        let Some(ingress) = ingress.into_iter().next() else {
            return Ok(String::new());
        };

        Ok(ingress.hostname.or(ingress.ip).unwrap_or_default())
    }

    async fn docker_registry_module_enabled(&self) -> Result<bool> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crds = api.list(&ListParams::default()).await?;

        Ok(crds
            .items
            .iter()
            .any(|crd| crd.spec.names.kind == "DockerRegistry"))
    }
}

fn secret_value(secret: &Secret, key: &str) -> Result<String> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| Error::SecretKeyNotFound(key.into(), name))?;

    Ok(String::from_utf8_lossy(&value.0).into_owned())
}

fn domain_from_wildcard(host: &str) -> &str {
    host.strip_prefix("*.").unwrap_or(host)
}

/// Rewrites a BTP token URL into the corresponding UAA URL by replacing the
/// first two dot-separated segments with the fixed UAA prefix:
/// `https://worker1-q3zjpctt.authentication.eu12.hana.ondemand.com` becomes
/// `https://uaa.cf.eu12.hana.ondemand.com`.
fn uaa_url_from_token_url(token_url: &str) -> Result<String> {
    let parts: Vec<&str> = token_url.split('.').collect();
    if parts.len() <= 2 {
        return Err(Error::InvalidConfiguration(format!(
            "token url {token_url} has no region segments"
        )));
    }

    Ok(format!("https://uaa.cf.{}", parts[2..].join(".")))
}
