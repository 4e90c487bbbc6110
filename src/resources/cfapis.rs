use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static CFAPI_FINALIZER: &str = "cfapi.kyma-project.io/finalizer";

/// Field manager identity used for every server-side apply issued by the
/// operator.
pub static FIELD_MANAGER: &str = "cfapi-operator";

pub static CONDITION_TYPE_CONFIGURATION: &str = "Configuration";
pub static CONDITION_TYPE_INSTALLATION: &str = "Installation";
pub static CONDITION_TYPE_DELETION: &str = "Deletion";

pub static CONDITION_TRUE: &str = "True";
pub static CONDITION_FALSE: &str = "False";
pub static CONDITION_UNKNOWN: &str = "Unknown";

/// Represents the desired state of the Cloud Foundry API installation on a
/// Kyma cluster. All fields are optional; every unset field is resolved from
/// cluster state when the installation config is compiled.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[cfg_attr(test, derive(PartialEq))]
#[kube(
    kind = "CFAPI",
    group = "operator.kyma-project.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "CFAPIStatus", shortname = "cfapi")]
#[serde(rename_all = "camelCase")]
pub struct CFAPISpec {
    /// Namespace under which CF orgs and spaces are created. Defaults to "cf".
    pub root_namespace: Option<String>,
    /// Name of a dockerconfigjson Secret in the CFAPI namespace pointing to a
    /// custom container registry. When unset the platform registry is used.
    pub container_registry_secret: Option<String>,
    /// Prefix prepended to app image repositories. Derived from the registry
    /// URL when unset.
    pub container_repository_prefix: Option<String>,
    /// Repository used by kpack to store builder images.
    pub builder_repository: Option<String>,
    /// UAA URL override. Derived from the BTP service operator secret when
    /// unset.
    #[serde(rename = "uaa")]
    pub uaa: Option<String>,
    /// CF admin identities. Defaults to the cluster-admin users of the
    /// cluster.
    #[serde(rename = "cfadmins")]
    pub cf_admins: Option<Vec<String>>,
    pub gateway_type: Option<GatewayType>,
    pub use_self_signed_certificates: Option<bool>,
    pub disable_container_registry_secret_propagation: Option<bool>,
    /// Secret propagated to app workloads for pulling app images.
    pub app_image_pull_secret: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayType {
    #[default]
    Contour,
    Istio,
}

impl GatewayType {
    pub fn gateway_class(&self) -> &'static str {
        match self {
            GatewayType::Contour => "contour",
            GatewayType::Istio => "istio",
        }
    }
}

/// Status of the CFAPI installation.
/// This is set and managed automatically.
/// Read-only.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[cfg_attr(test, derive(PartialEq))]
#[serde(rename_all = "camelCase")]
pub struct CFAPIStatus {
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub state: State,

    /// URL to be used by the cf CLI in order to consume the CF API.
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CFAPICondition>,

    /// The configuration compiled during the last successful configuration
    /// step; uninstallation reuses it after the spec becomes unavailable.
    pub installation_config: Option<InstallationConfig>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum State {
    #[default]
    #[serde(rename = "")]
    Unmanaged,
    Processing,
    Deleting,
    Error,
    Warning,
    Ready,
}

/// The flat configuration consumed by every installable. Compiled once per
/// reconcile from the CFAPI spec plus live cluster lookups and never mutated
/// afterwards.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallationConfig {
    pub root_namespace: String,
    pub container_registry_secret: String,
    pub container_registry_url: String,
    pub container_repository_prefix: String,
    pub builder_repository: String,
    pub uaa_url: String,
    pub cf_admins: Vec<String>,
    pub cf_domain: String,
    pub gateway_type: GatewayType,
    pub korifi_ingress_service: String,
    pub korifi_ingress_host: String,
    pub use_self_signed_certificates: bool,
    pub disable_container_registry_secret_propagation: bool,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CFAPICondition {
    /// Type of the condition, known values are `Configuration`,
    /// `Installation` and `Deletion`.
    pub r#type: String,

    /// Status of the condition. Can be True, False, Unknown.
    pub status: String,

    /// Generation of the CFAPI the condition was computed for. A condition
    /// observed at an older generation is not authoritative.
    pub observed_generation: Option<i64>,

    /// Unique, one-word, CamelCase reason for the condition's last transition.
    pub reason: Option<String>,

    /// Human-readable message indicating details about last transition.
    pub message: Option<String>,

    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,
}

impl CFAPIStatus {
    /// Upserts a condition by type. The transition time is carried over from
    /// the previous condition unless the status changed.
    pub fn set_condition(
        &mut self,
        r#type: &str,
        status: &str,
        reason: &str,
        message: &str,
        observed_generation: Option<i64>,
    ) {
        let now = Time(Utc::now());

        let condition = CFAPICondition {
            r#type: r#type.to_owned(),
            status: status.to_owned(),
            observed_generation,
            reason: Some(reason.to_owned()),
            message: Some(message.to_owned()),
            last_transition_time: Some(now.clone()),
        };

        match self.conditions.iter_mut().find(|c| c.r#type == r#type) {
            Some(existing) => {
                let transition_time = if existing.status == condition.status {
                    existing.last_transition_time.clone().or(Some(now))
                } else {
                    Some(now)
                };
                *existing = CFAPICondition {
                    last_transition_time: transition_time,
                    ..condition
                };
            }
            None => self.conditions.push(condition),
        }
    }
}

/// Checks that a condition is both true and computed for the current
/// generation; a condition stamped with an older generation reflects a state
/// decision that has not been re-evaluated yet and must not be trusted.
pub fn check_condition_is_true(cfapi: &CFAPI, r#type: &str) -> Result<(), String> {
    let condition = cfapi
        .status
        .as_ref()
        .and_then(|s| s.conditions.iter().find(|c| c.r#type == r#type))
        .ok_or(format!("condition {} not set yet", r#type))?;

    if condition.observed_generation != cfapi.metadata.generation {
        return Err(format!("condition {} is outdated", r#type));
    }

    if condition.status != CONDITION_TRUE {
        return Err(format!("{} condition is not true", r#type));
    }

    Ok(())
}

pub fn ensure_finalizer(cfapi: &mut CFAPI) {
    let finalizers = cfapi.finalizers_mut();
    if !finalizers.iter().any(|f| f == CFAPI_FINALIZER) {
        finalizers.push(CFAPI_FINALIZER.to_owned());
    }
}

pub fn remove_finalizer(cfapi: &mut CFAPI) {
    cfapi.finalizers_mut().retain(|f| f != CFAPI_FINALIZER);
}
