use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::EventType;
use kube::{Api, Client};
use tracing::info;

use crate::installable::{EventRecorder, InstallResult, Installable, ResultState};
use crate::resources::cfapis::InstallationConfig;
use crate::Result;

const CERTIFICATES_NAMESPACE: &str = "korifi";

const EXPECTED_SECRETS: [&str; 6] = [
    "korifi-api-ingress-cert",
    "korifi-api-internal-cert",
    "korifi-workloads-ingress-cert",
    "korifi-controllers-webhook-cert",
    "korifi-kpack-image-builder-webhook-cert",
    "korifi-statefulset-runner-webhook-cert",
];

/// Applies the certificate manifests through the wrapped installable, then
/// reports in-progress until the certificate controller has materialized
/// every expected TLS secret.
pub struct Certificates {
    client: Client,
    inner: Arc<dyn Installable>,
}

impl Certificates {
    pub fn new(client: Client, inner: Arc<dyn Installable>) -> Self {
        Self { client, inner }
    }

    async fn missing_secrets(&self) -> Result<Vec<&'static str>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), CERTIFICATES_NAMESPACE);

        let mut missing = Vec::new();
        for name in EXPECTED_SECRETS {
            if api.get_opt(name).await?.is_none() {
                missing.push(name);
            }
        }

        Ok(missing)
    }
}

#[async_trait]
impl Installable for Certificates {
    fn name(&self) -> String {
        "Certificates Installable".into()
    }

    async fn install(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let result = self.inner.install(config, events).await?;
        if result.state != ResultState::Success {
            return Ok(result);
        }

        let missing = self.missing_secrets().await?;
        if !missing.is_empty() {
            let message = format!("secrets not yet available: {}", missing.join(", "));
            info!("certificates not yet installed: {message}");
            events
                .event(
                    EventType::Normal,
                    "CertificatesInstallation",
                    &format!("Certificates not yet installed: {message}"),
                )
                .await;
            return Ok(InstallResult::in_progress(format!(
                "Certificates being installed: {message}"
            )));
        }

        events
            .event(
                EventType::Normal,
                "CertificatesInstallation",
                "Certificates installed successfully",
            )
            .await;
        Ok(InstallResult::success_with(
            "Certificates installed successfully",
        ))
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::*;
    use crate::installable::test_doubles::{RecordingEvents, StubInstallable};
    use crate::test_support::{json_response, mock_client, not_found_response};

    #[tokio::test]
    async fn reports_in_progress_while_a_secret_is_missing() {
        let (client, mut handle) = mock_client();

        tokio::spawn(async move {
            // first expected secret exists, second does not; the poll keeps
            // going through the rest of the list
            for index in 0..EXPECTED_SECRETS.len() {
                let (request, send) = handle.next_request().await.expect("secret lookup");
                assert_eq!(request.method(), Method::GET);
                assert!(request
                    .uri()
                    .path()
                    .starts_with("/api/v1/namespaces/korifi/secrets/"));

                if index == 1 {
                    send.send_response(not_found_response());
                } else {
                    send.send_response(json_response(serde_json::json!({
                        "apiVersion": "v1",
                        "kind": "Secret",
                        "metadata": {
                            "name": EXPECTED_SECRETS[index],
                            "namespace": "korifi",
                        }
                    })));
                }
            }
        });

        let inner = Arc::new(StubInstallable::returning(InstallResult::success()));
        let certificates = Certificates::new(client, inner);

        let events = RecordingEvents::default();
        let result = certificates
            .install(&InstallationConfig::default(), &events)
            .await
            .unwrap();

        assert_eq!(result.state, ResultState::InProgress);
        assert!(result.message.contains("korifi-api-internal-cert"));
    }

    #[tokio::test]
    async fn a_non_success_inner_result_short_circuits_the_poll() {
        let (client, _handle) = mock_client();

        let inner = Arc::new(StubInstallable::returning(InstallResult::in_progress(
            "applying",
        )));
        let certificates = Certificates::new(client, inner.clone());

        let events = RecordingEvents::default();
        let result = certificates
            .install(&InstallationConfig::default(), &events)
            .await
            .unwrap();

        // no secret lookups happen; the mock handle would panic on drop
        // otherwise since nothing serves requests
        assert_eq!(result, InstallResult::in_progress("applying"));
        assert_eq!(inner.call_count(), 1);
    }
}
