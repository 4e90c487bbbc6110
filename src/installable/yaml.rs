use std::path::PathBuf;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{Discovery, Scope};
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tracing::debug;

use crate::installable::{EventRecorder, InstallResult, Installable, Uninstallable};
use crate::resources::cfapis::InstallationConfig;
use crate::{Error, Result};

/// Splits a multi-document YAML stream into dynamic objects, skipping empty
/// and null documents.
pub(crate) fn parse_manifests(input: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();

    for document in serde_yaml::Deserializer::from_str(input) {
        let value = serde_json::Value::deserialize(document)?;
        if value.is_null() || value.as_object().is_some_and(|fields| fields.is_empty()) {
            continue;
        }

        let object: DynamicObject = serde_json::from_value(value)?;
        objects.push(object);
    }

    Ok(objects)
}

fn dynamic_api(
    client: &Client,
    discovery: &Discovery,
    object: &DynamicObject,
) -> Result<Api<DynamicObject>> {
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| Error::UnknownResourceKind(object.name_any()))?;

    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    let gvk = GroupVersionKind::gvk(group, version, &types.kind);

    let (api_resource, capabilities) = discovery
        .resolve_gvk(&gvk)
        .ok_or_else(|| Error::UnknownResourceKind(format!("{}/{}", types.api_version, types.kind)))?;

    Ok(if matches!(capabilities.scope, Scope::Namespaced) {
        let namespace = object.namespace().unwrap_or_else(|| "default".into());
        Api::namespaced_with(client.clone(), &namespace, &api_resource)
    } else {
        Api::all_with(client.clone(), &api_resource)
    })
}

/// Get-then-create-or-update, carrying the live resourceVersion forward on
/// update so repeated installs converge instead of conflicting.
async fn create_or_update(
    client: &Client,
    discovery: &Discovery,
    object: &DynamicObject,
) -> Result<()> {
    let api = dynamic_api(client, discovery, object)?;
    let name = object.name_any();

    match api.get_opt(&name).await? {
        None => {
            api.create(&PostParams::default(), object).await?;
        }
        Some(existing) => {
            let mut desired = object.clone();
            desired.metadata.resource_version = existing.resource_version();
            api.replace(&name, &PostParams::default(), &desired).await?;
        }
    }

    debug!(name, "applied manifest object");
    Ok(())
}

/// Applies every object of a manifest stream. Parse and apply failures are
/// filed as a failed result so the orchestrator keeps aggregating instead of
/// aborting the whole pipeline.
async fn install_manifests(client: &Client, manifests: &str) -> Result<InstallResult> {
    let objects = match parse_manifests(manifests) {
        Ok(objects) => objects,
        Err(err) => {
            return Ok(InstallResult::failed(format!(
                "failed to parse file to objects: {err}"
            )));
        }
    };

    let discovery = Discovery::new(client.clone()).run().await?;

    for object in &objects {
        if let Err(err) = create_or_update(client, &discovery, object).await {
            let kind = object
                .types
                .as_ref()
                .map(|t| t.kind.clone())
                .unwrap_or_default();
            return Ok(InstallResult::failed(format!(
                "failed to create/update {kind}/{}: {err}",
                object.name_any()
            )));
        }
    }

    Ok(InstallResult::success())
}

/// Deletes every object of a manifest stream, tolerating already-gone
/// objects. Success is only reported once no object remains.
async fn uninstall_manifests(client: &Client, manifests: &str) -> Result<InstallResult> {
    let objects = match parse_manifests(manifests) {
        Ok(objects) => objects,
        Err(err) => {
            return Ok(InstallResult::failed(format!(
                "failed to parse file to objects: {err}"
            )));
        }
    };

    let discovery = Discovery::new(client.clone()).run().await?;

    let mut remaining = 0;
    for object in objects.iter().rev() {
        let api = match dynamic_api(client, &discovery, object) {
            Ok(api) => api,
            // the whole api group is gone, so the object is too
            Err(Error::UnknownResourceKind(_)) => continue,
            Err(err) => return Err(err),
        };
        let name = object.name_any();

        if api.get_opt(&name).await?.is_none() {
            continue;
        }

        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => continue,
            Err(err) => return Err(err.into()),
        }
        remaining += 1;
    }

    if remaining > 0 {
        return Ok(InstallResult::in_progress(format!(
            "{remaining} resources remaining"
        )));
    }

    Ok(InstallResult::success())
}

/// Installs the objects of one static manifest file.
pub struct YamlFile {
    client: Client,
    path: PathBuf,
    display_name: String,
}

impl YamlFile {
    pub fn new(client: Client, path: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            display_name: display_name.into(),
        }
    }
}

#[async_trait]
impl Installable for YamlFile {
    fn name(&self) -> String {
        format!("Yaml Installable: {}", self.display_name)
    }

    async fn install(
        &self,
        _config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let manifests = match tokio::fs::read_to_string(&self.path).await {
            Ok(manifests) => manifests,
            Err(err) => {
                return Ok(InstallResult::failed(format!(
                    "failed to read file {}: {err}",
                    self.path.display()
                )));
            }
        };

        let result = install_manifests(&self.client, &manifests).await?;
        if result.state == super::ResultState::Success {
            events
                .event(
                    EventType::Normal,
                    "InstallableDeployed",
                    &format!("Installable {} deployed", self.display_name),
                )
                .await;
        }

        Ok(result)
    }
}

#[async_trait]
impl Uninstallable for YamlFile {
    fn name(&self) -> String {
        format!("Yaml Installable: {}", self.display_name)
    }

    async fn uninstall(
        &self,
        _config: &InstallationConfig,
        _events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let manifests = tokio::fs::read_to_string(&self.path).await?;
        uninstall_manifests(&self.client, &manifests).await
    }
}

/// Installs a manifest rendered from a template, with the installation
/// config as template context (fields addressable under their camelCase
/// names, e.g. `{{ rootNamespace }}`).
pub struct YamlTemplate {
    client: Client,
    path: PathBuf,
    display_name: String,
}

impl YamlTemplate {
    pub fn new(client: Client, path: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            display_name: display_name.into(),
        }
    }

    async fn render(&self, config: &InstallationConfig) -> Result<String> {
        let source = tokio::fs::read_to_string(&self.path).await?;
        Ok(render_template(&source, config)?)
    }
}

pub(crate) fn render_template(
    source: &str,
    config: &InstallationConfig,
) -> Result<String, minijinja::Error> {
    let env = minijinja::Environment::new();
    env.render_str(source, config)
}

#[async_trait]
impl Installable for YamlTemplate {
    fn name(&self) -> String {
        format!("Yaml Installable: {}", self.display_name)
    }

    async fn install(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let manifests = match self.render(config).await {
            Ok(manifests) => manifests,
            Err(err) => {
                return Ok(InstallResult::failed(format!(
                    "failed to render template {}: {err}",
                    self.path.display()
                )));
            }
        };

        let result = install_manifests(&self.client, &manifests).await?;
        if result.state == super::ResultState::Success {
            events
                .event(
                    EventType::Normal,
                    "InstallableDeployed",
                    &format!("Installable {} deployed", self.display_name),
                )
                .await;
        }

        Ok(result)
    }
}

#[async_trait]
impl Uninstallable for YamlTemplate {
    fn name(&self) -> String {
        format!("Yaml Installable: {}", self.display_name)
    }

    async fn uninstall(
        &self,
        config: &InstallationConfig,
        _events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let manifests = self.render(config).await?;
        uninstall_manifests(&self.client, &manifests).await
    }
}

/// Installs every `.yaml`/`.yml` file in a directory, in lexical order.
pub struct YamlDir {
    client: Client,
    dir: PathBuf,
    display_name: String,
}

impl YamlDir {
    pub fn new(client: Client, dir: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            client,
            dir: dir.into(),
            display_name: display_name.into(),
        }
    }

    async fn manifest_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_yaml {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl Installable for YamlDir {
    fn name(&self) -> String {
        format!("Yaml Installable: {}", self.display_name)
    }

    async fn install(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        for path in self.manifest_files().await? {
            let file = YamlFile::new(
                self.client.clone(),
                &path,
                format!("{}: {}", self.display_name, path.display()),
            );

            let result = file.install(config, events).await?;
            if result.state != super::ResultState::Success {
                return Ok(result);
            }
        }

        Ok(InstallResult::success_with(format!(
            "{} installed successfully",
            self.display_name
        )))
    }
}

#[async_trait]
impl Uninstallable for YamlDir {
    fn name(&self) -> String {
        format!("Yaml Installable: {}", self.display_name)
    }

    async fn uninstall(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let mut worst = InstallResult::success();
        let mut files = self.manifest_files().await?;
        files.reverse();

        for path in files {
            let file = YamlFile::new(
                self.client.clone(),
                &path,
                format!("{}: {}", self.display_name, path.display()),
            );

            let result = file.uninstall(config, events).await?;
            if result.state.severity() > worst.state.severity() {
                worst = result;
            }
        }

        Ok(worst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::cfapis::GatewayType;

    #[test]
    fn parses_multi_document_streams() {
        let objects = parse_manifests(
            r#"
apiVersion: v1
kind: Namespace
metadata:
  name: cfapi-system
---
---
null
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfapi-config
  namespace: cfapi-system
data:
  domain: example.dev
"#,
        )
        .unwrap();

        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].types.as_ref().unwrap().kind, "Namespace");
        assert_eq!(objects[0].name_any(), "cfapi-system");
        assert_eq!(objects[1].types.as_ref().unwrap().kind, "ConfigMap");
        assert_eq!(objects[1].namespace().as_deref(), Some("cfapi-system"));
    }

    #[test]
    fn rejects_invalid_documents() {
        assert!(parse_manifests("a: [unterminated").is_err());
    }

    #[test]
    fn renders_config_into_templates() {
        let config = InstallationConfig {
            root_namespace: "cf".into(),
            cf_domain: "example.dev".into(),
            gateway_type: GatewayType::Contour,
            ..Default::default()
        };

        let rendered = render_template(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {{ rootNamespace }}\n  labels:\n    domain: {{ cfDomain }}\n",
            &config,
        )
        .unwrap();

        assert!(rendered.contains("name: cf"));
        assert!(rendered.contains("domain: example.dev"));
    }

    #[test]
    fn undefined_template_variables_render_empty() {
        let rendered =
            render_template("name: {{ doesNotExist }}", &InstallationConfig::default()).unwrap();
        assert_eq!(rendered, "name: ");
    }
}
