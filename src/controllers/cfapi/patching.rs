use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::resources::cfapis::FIELD_MANAGER;
use crate::Result;

/// The domain side of a reconcile: mutates the fetched object (spec,
/// metadata, status) in place and reports the requested scheduling action.
/// Persistence is the wrapper's concern.
#[async_trait]
pub trait ObjectReconciler<K>: Send + Sync {
    async fn reconcile_resource(&self, object: &mut K) -> Result<Action>;
}

/// Fetches the object, delegates to the inner reconciler, and persists both
/// the object and its status through force-applied server-side patches
/// regardless of the reconcile outcome, so partial progress stays visible
/// even when the reconcile errors.
pub struct PatchingReconciler<K, R> {
    client: Client,
    inner: R,
    _resource_type: PhantomData<K>,
}

impl<K, R> PatchingReconciler<K, R>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
    R: ObjectReconciler<K>,
{
    pub fn new(client: Client, inner: R) -> Self {
        Self {
            client,
            inner,
            _resource_type: PhantomData,
        }
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);

        let Some(mut object) = api.get_opt(name).await? else {
            debug!("{namespace}/{name} got deleted");
            return Ok(Action::await_change());
        };

        let outcome = self.inner.reconcile_resource(&mut object).await;

        // the fetched object carries managed fields, which an apply payload
        // must not
        object.meta_mut().managed_fields = None;

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(&object)).await?;
        api.patch_status(name, &params, &Patch::Apply(&object))
            .await?;

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use http::Method;

    use super::*;
    use crate::resources::cfapis::{CFAPISpec, CFAPIStatus, State, CFAPI};
    use crate::test_support::{json_response, mock_client, not_found_response};
    use crate::Error;

    struct FakeReconciler {
        calls: AtomicUsize,
        error: Option<fn() -> Error>,
    }

    #[async_trait]
    impl ObjectReconciler<CFAPI> for FakeReconciler {
        async fn reconcile_resource(&self, cfapi: &mut CFAPI) -> Result<Action> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            cfapi.spec.uaa = Some("https://my-uaa.example.org".into());
            cfapi.status = Some(CFAPIStatus {
                state: State::Processing,
                url: Some("https://cfapi.example.dev".into()),
                ..Default::default()
            });

            match self.error {
                Some(make_error) => Err(make_error()),
                None => Ok(Action::requeue(Duration::from_secs(1))),
            }
        }
    }

    fn serve_object_then_patches(
        mut handle: crate::test_support::ApiHandle,
    ) -> tokio::task::JoinHandle<Vec<(Method, String)>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();

            let (request, send) = handle.next_request().await.expect("get");
            seen.push((request.method().clone(), request.uri().to_string()));
            send.send_response(json_response(serde_json::json!({
                "apiVersion": "operator.kyma-project.io/v1alpha1",
                "kind": "CFAPI",
                "metadata": {"name": "cfapi", "namespace": "cfapi-system"},
                "spec": {}
            })));

            for _ in 0..2 {
                let (request, send) = handle.next_request().await.expect("patch");
                seen.push((request.method().clone(), request.uri().to_string()));
                send.send_response(json_response(serde_json::json!({
                    "apiVersion": "operator.kyma-project.io/v1alpha1",
                    "kind": "CFAPI",
                    "metadata": {"name": "cfapi", "namespace": "cfapi-system"},
                    "spec": {}
                })));
            }

            seen
        })
    }

    #[tokio::test]
    async fn patches_object_and_status_after_reconcile() {
        let (client, handle) = mock_client();
        let server = serve_object_then_patches(handle);

        let reconciler = PatchingReconciler::<CFAPI, _>::new(
            client,
            FakeReconciler {
                calls: AtomicUsize::new(0),
                error: None,
            },
        );

        let action = reconciler.reconcile("cfapi-system", "cfapi").await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));

        let seen = server.await.unwrap();
        assert_eq!(seen[0].0, Method::GET);
        assert_eq!(seen[1].0, Method::PATCH);
        assert!(seen[1].1.contains("fieldManager=cfapi-operator"));
        assert!(!seen[1].1.contains("/status"));
        assert_eq!(seen[2].0, Method::PATCH);
        assert!(seen[2].1.contains("/status"));
    }

    #[tokio::test]
    async fn inner_errors_are_returned_after_both_patches() {
        let (client, handle) = mock_client();
        let server = serve_object_then_patches(handle);

        let reconciler = PatchingReconciler::<CFAPI, _>::new(
            client,
            FakeReconciler {
                calls: AtomicUsize::new(0),
                error: Some(|| Error::InvalidConfiguration("bad registry".into())),
            },
        );

        let err = reconciler
            .reconcile("cfapi-system", "cfapi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));

        // both patches were still served before the error surfaced
        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn a_deleted_object_reconciles_trivially() {
        let (client, mut handle) = mock_client();

        tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("get");
            assert_eq!(request.method(), Method::GET);
            send.send_response(not_found_response());
        });

        let fake = FakeReconciler {
            calls: AtomicUsize::new(0),
            error: None,
        };
        let reconciler = PatchingReconciler::<CFAPI, _>::new(client, fake);

        let action = reconciler.reconcile("cfapi-system", "cfapi").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(reconciler.inner.calls.load(Ordering::SeqCst), 0);
    }
}
