use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("TemplateError: {0}")]
    TemplateError(#[from] minijinja::Error),

    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("CFAPI is not yet ready: {message}")]
    NotReady {
        message: String,
        reason: String,
        requeue_after: Option<Duration>,
    },

    #[error("Invalid CFAPI configuration: {0}")]
    InvalidConfiguration(String),

    #[error("The Secret {0} does not exist")]
    SecretNotFound(String),
    #[error("The Secret key {0} in {1} does not exist")]
    SecretKeyNotFound(String, String),

    #[error("No API resource registered for {0}")]
    UnknownResourceKind(String),

    #[error("helm invocation failed: {0}")]
    HelmCli(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::TemplateError(_) => "TemplateError",
            Error::IoError(_) => "IoError",
            Error::KubeError(_) => "KubeError",
            Error::NotReady { .. } => "NotReady",
            Error::InvalidConfiguration(_) => "InvalidConfiguration",
            Error::SecretNotFound(_) => "SecretNotFound",
            Error::SecretKeyNotFound(_, _) => "SecretKeyNotFound",
            Error::UnknownResourceKind(_) => "UnknownResourceKind",
            Error::HelmCli(_) => "HelmCli",
        }
    }
}

pub mod controllers;

/// Helm release management through the helm binary
pub mod helm;

/// Units of idempotent install/uninstall work
pub mod installable;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// CRDs
pub mod resources;

#[cfg(test)]
pub(crate) mod test_support {
    use http::{Request, Response};
    use kube::client::Body;
    use kube::Client;
    use tower_test::mock::{self, Handle};

    pub type ApiHandle = Handle<Request<Body>, Response<Body>>;

    /// A client backed by a tower-test mock service; the returned handle
    /// serves one request per `next_request` call.
    pub fn mock_client() -> (Client, ApiHandle) {
        let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        (Client::new(mock_service, "default"), handle)
    }

    pub fn json_response(body: serde_json::Value) -> Response<Body> {
        Response::builder()
            .status(200)
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    pub fn not_found_response() -> Response<Body> {
        Response::builder()
            .status(404)
            .body(Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "status": "Failure",
                    "reason": "NotFound",
                    "code": 404
                }))
                .unwrap(),
            ))
            .unwrap()
    }
}
