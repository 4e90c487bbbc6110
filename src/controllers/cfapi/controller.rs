use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::watcher;
use kube::Resource;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::*;

use crate::controllers::cfapi::config::CompileConfig;
use crate::controllers::cfapi::patching::{ObjectReconciler, PatchingReconciler};
use crate::controllers::{Diagnostics, State};
use crate::installable::events::CfApiEventRecorder;
use crate::installable::{EventRecorder, InstallResult, Installable, ResultState, Uninstallable};
use crate::resources::cfapis::{
    ensure_finalizer, remove_finalizer, CFAPIStatus, InstallationConfig, State as CfApiState,
    CFAPI, CONDITION_FALSE, CONDITION_TRUE, CONDITION_TYPE_CONFIGURATION, CONDITION_TYPE_DELETION,
    CONDITION_TYPE_INSTALLATION, CONDITION_UNKNOWN,
};
use crate::{telemetry, Error, Metrics, Result};

/// Ready and Error states are re-reconciled on this timer so drifted cluster
/// state heals without a spec change.
const SELF_HEAL_INTERVAL: Duration = Duration::from_secs(5 * 60);

// Context for our reconciler
pub(super) struct Context {
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Fetch-reconcile-patch harness around the CFAPI reconciler
    pub patching: PatchingReconciler<CFAPI, Reconciler>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(
        client: Client,
        metrics: Metrics,
        state: State,
        reconciler: Reconciler,
    ) -> Arc<Context> {
        Arc::new(Context {
            recorder: Recorder::new(client.clone(), "cfapi-operator".into()),
            patching: PatchingReconciler::new(client, reconciler),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

/// The CFAPI state machine: compiles the installation config and drives the
/// ordered installable pipeline, or the uninstall pipeline while the
/// resource is being finalized. Mutates the object in place; persistence is
/// left to the surrounding [`PatchingReconciler`].
pub struct Reconciler {
    requeue_interval: Duration,
    recorder: Recorder,
    compiler: Arc<dyn CompileConfig>,
    install_order: Vec<Arc<dyn Installable>>,
    uninstall_order: Vec<Arc<dyn Uninstallable>>,
}

impl Reconciler {
    pub fn new(
        requeue_interval: Duration,
        recorder: Recorder,
        compiler: Arc<dyn CompileConfig>,
        install_order: Vec<Arc<dyn Installable>>,
        uninstall_order: Vec<Arc<dyn Uninstallable>>,
    ) -> Self {
        Self {
            requeue_interval,
            recorder,
            compiler,
            install_order,
            uninstall_order,
        }
    }

    /// Runs the full install pipeline and aggregates per-installable results
    /// into the most severe one, so the overall status reflects the worst
    /// current blocker rather than the first one encountered. An error from
    /// any installable aborts the pipeline immediately.
    async fn install_all(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        let mut results = Vec::with_capacity(self.install_order.len());

        for installable in &self.install_order {
            let result = installable.install(config, events).await?;
            debug!(installable = %installable.name(), state = ?result.state, "installable finished");
            results.push(result);
        }

        // ties keep the earliest result so messages point at the first
        // blocker in install order
        Ok(results
            .into_iter()
            .reduce(|worst, result| {
                if result.state.severity() > worst.state.severity() {
                    result
                } else {
                    worst
                }
            })
            .unwrap_or_default())
    }

    /// Runs the uninstall pipeline but stops at the first non-success:
    /// uninstall order encodes a dependency chain, and later steps must not
    /// run before earlier ones have fully cleared.
    async fn uninstall_all(
        &self,
        config: &InstallationConfig,
        events: &dyn EventRecorder,
    ) -> Result<InstallResult> {
        for uninstallable in &self.uninstall_order {
            let result = uninstallable.uninstall(config, events).await?;
            if result.state != ResultState::Success {
                debug!(uninstallable = %uninstallable.name(), state = ?result.state, "uninstall blocked");
                return Ok(result);
            }
        }

        Ok(InstallResult::success())
    }

    fn apply_install_result(&self, result: InstallResult, cfapi: &mut CFAPI) -> Action {
        let generation = cfapi.metadata.generation;
        let domain = cfapi
            .status
            .as_ref()
            .and_then(|status| status.installation_config.as_ref())
            .map(|config| config.cf_domain.clone())
            .unwrap_or_default();
        let status = status_mut(cfapi);

        match result.state {
            ResultState::Success => {
                status.state = CfApiState::Ready;
                status.url = Some(format!("https://cfapi.{domain}"));
                status.set_condition(
                    CONDITION_TYPE_INSTALLATION,
                    CONDITION_TRUE,
                    "InstallationSuccess",
                    "",
                    generation,
                );
                Action::requeue(SELF_HEAL_INTERVAL)
            }
            ResultState::Failed => {
                status.url = None;
                status.state = CfApiState::Error;
                status.set_condition(
                    CONDITION_TYPE_INSTALLATION,
                    CONDITION_FALSE,
                    "InstallationFailed",
                    &result.message,
                    generation,
                );
                Action::requeue(SELF_HEAL_INTERVAL)
            }
            ResultState::InProgress => {
                status.url = None;
                status.state = CfApiState::Processing;
                status.set_condition(
                    CONDITION_TYPE_INSTALLATION,
                    CONDITION_UNKNOWN,
                    "InstallationInProgress",
                    &result.message,
                    generation,
                );
                Action::requeue(self.requeue_interval)
            }
        }
    }

    async fn finalize(&self, cfapi: &mut CFAPI, events: &dyn EventRecorder) -> Result<Action> {
        let generation = cfapi.metadata.generation;
        status_mut(cfapi).state = CfApiState::Deleting;

        let config = cfapi
            .status
            .as_ref()
            .and_then(|status| status.installation_config.clone())
            .filter(|config| *config != InstallationConfig::default());

        let Some(config) = config else {
            // installation never got far enough to compile a config, so
            // there is nothing to clean up
            remove_finalizer(cfapi);
            return Ok(Action::await_change());
        };

        let result = self.uninstall_all(&config, events).await?;
        if result.state != ResultState::Success {
            status_mut(cfapi).set_condition(
                CONDITION_TYPE_DELETION,
                CONDITION_FALSE,
                "DeletionInProgress",
                &result.message,
                generation,
            );
            return Ok(Action::requeue(self.requeue_interval));
        }

        remove_finalizer(cfapi);
        Ok(Action::await_change())
    }
}

fn status_mut(cfapi: &mut CFAPI) -> &mut CFAPIStatus {
    cfapi.status.get_or_insert_with(Default::default)
}

#[async_trait]
impl ObjectReconciler<CFAPI> for Reconciler {
    async fn reconcile_resource(&self, cfapi: &mut CFAPI) -> Result<Action> {
        let events = CfApiEventRecorder::new(self.recorder.clone(), cfapi.object_ref(&()));
        let generation = cfapi.metadata.generation;

        {
            let status = status_mut(cfapi);
            status.observed_generation = generation;
            status.state = CfApiState::Processing;
        }

        if cfapi.meta().deletion_timestamp.is_some() {
            info!("deleting CFAPI \"{}\"", cfapi.name_any());
            return self.finalize(cfapi, &events).await;
        }

        ensure_finalizer(cfapi);

        let config = match self.compiler.compile(cfapi).await {
            Ok(config) => config,
            Err(err) => {
                warn!("failed to compile CFAPI installation config: {err}");
                let status = status_mut(cfapi);
                status.state = CfApiState::Warning;
                status.set_condition(
                    CONDITION_TYPE_CONFIGURATION,
                    CONDITION_FALSE,
                    "InvalidConfiguration",
                    &err.to_string(),
                    generation,
                );
                return Err(Error::NotReady {
                    message: err.to_string(),
                    reason: "InvalidConfiguration".into(),
                    requeue_after: Some(self.requeue_interval),
                });
            }
        };

        {
            let status = status_mut(cfapi);
            status.set_condition(
                CONDITION_TYPE_CONFIGURATION,
                CONDITION_TRUE,
                "ValidConfiguration",
                "",
                generation,
            );
            status.installation_config = Some(config.clone());
        }

        let install_result = self.install_all(&config, &events).await?;
        debug!("install pipeline finished: {install_result:?}");
        Ok(self.apply_install_result(install_result, cfapi))
    }
}

#[instrument(skip(ctx, cfapi), fields(trace_id))]
async fn reconcile(cfapi: Arc<CFAPI>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<CFAPI>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = cfapi.name_any();
    let namespace = cfapi.namespace().unwrap_or_default();

    info!("Reconciling CFAPI \"{namespace}/{name}\"");
    match ctx.patching.reconcile(&namespace, &name).await {
        Ok(action) => Ok(action),
        Err(Error::NotReady {
            message,
            requeue_after,
            ..
        }) => {
            // misconfiguration is retried on a fixed interval rather than
            // the error-backoff path, so a broken spec does not spam retries
            info!("CFAPI is not yet ready: {message}");
            Ok(Action::requeue(
                requeue_after.unwrap_or(Duration::from_secs(60)),
            ))
        }
        Err(err) => {
            warn!("reconcile failed: {err:?}");

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &cfapi.object_ref(&()),
                )
                .await?;

            ctx.metrics.reconcile_failure(cfapi.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy<K, C>(_cfapi: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

// Initialize the controller (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State, reconciler: Reconciler) {
    let cfapi_api = Api::<CFAPI>::all(client.clone());

    if let Err(e) = cfapi_api.list(&ListParams::default().limit(1)).await {
        error!("CFAPI is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    Controller::new(cfapi_api, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            reconcile,
            error_policy,
            Context::new(client, metrics, state, reconciler),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::installable::test_doubles::{ErroringInstallable, StubInstallable};
    use crate::resources::cfapis::{check_condition_is_true, CFAPISpec, CFAPI_FINALIZER};
    use crate::test_support::mock_client;

    struct FakeCompiler {
        config: Option<InstallationConfig>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl FakeCompiler {
        fn returning(config: InstallationConfig) -> Self {
            Self {
                config: Some(config),
                calls: Default::default(),
            }
        }

        fn failing() -> Self {
            Self {
                config: None,
                calls: Default::default(),
            }
        }
    }

    #[async_trait]
    impl CompileConfig for FakeCompiler {
        async fn compile(&self, _cfapi: &CFAPI) -> Result<InstallationConfig> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.config.clone().ok_or(Error::InvalidConfiguration(
                "container registry secret my-registry does not specify container registries"
                    .into(),
            ))
        }
    }

    fn sample_config() -> InstallationConfig {
        InstallationConfig {
            root_namespace: "cf".into(),
            cf_domain: "c-1234.kyma.ondemand.com".into(),
            container_registry_secret: "registry".into(),
            ..Default::default()
        }
    }

    fn reconciler(
        compiler: FakeCompiler,
        install_order: Vec<Arc<dyn Installable>>,
        uninstall_order: Vec<Arc<dyn Uninstallable>>,
    ) -> Reconciler {
        // events published through this recorder go nowhere; delivery
        // failures are swallowed by design
        let (client, _handle) = mock_client();
        Reconciler::new(
            Duration::from_secs(10),
            Recorder::new(client, "cfapi-operator".into()),
            Arc::new(compiler),
            install_order,
            uninstall_order,
        )
    }

    fn cfapi() -> CFAPI {
        let mut cfapi = CFAPI::new("cfapi", CFAPISpec::default());
        cfapi.metadata.namespace = Some("cfapi-system".into());
        cfapi.metadata.generation = Some(1);
        cfapi
    }

    fn deleted_cfapi(stored_config: Option<InstallationConfig>) -> CFAPI {
        let mut cfapi = cfapi();
        cfapi.metadata.deletion_timestamp = Some(Time(Utc::now()));
        cfapi.metadata.finalizers = Some(vec![CFAPI_FINALIZER.to_owned()]);
        cfapi.status = Some(CFAPIStatus {
            installation_config: stored_config,
            ..Default::default()
        });
        cfapi
    }

    fn status(cfapi: &CFAPI) -> &CFAPIStatus {
        cfapi.status.as_ref().unwrap()
    }

    #[tokio::test]
    async fn a_fresh_resource_becomes_ready_with_a_url() {
        let installable = Arc::new(StubInstallable::returning(InstallResult::success()));
        let reconciler = reconciler(
            FakeCompiler::returning(sample_config()),
            vec![installable.clone()],
            vec![],
        );

        let mut cfapi = cfapi();
        let action = reconciler.reconcile_resource(&mut cfapi).await.unwrap();

        assert_eq!(action, Action::requeue(SELF_HEAL_INTERVAL));
        assert_eq!(status(&cfapi).state, CfApiState::Ready);
        assert_eq!(status(&cfapi).observed_generation, Some(1));
        assert_eq!(
            status(&cfapi).url.as_deref(),
            Some("https://cfapi.c-1234.kyma.ondemand.com")
        );
        assert_eq!(
            cfapi.metadata.finalizers,
            Some(vec![CFAPI_FINALIZER.to_owned()])
        );
        assert!(check_condition_is_true(&cfapi, CONDITION_TYPE_CONFIGURATION).is_ok());
        assert!(check_condition_is_true(&cfapi, CONDITION_TYPE_INSTALLATION).is_ok());
        assert_eq!(installable.call_count(), 1);
    }

    #[tokio::test]
    async fn a_config_failure_is_a_warning_and_skips_installation() {
        let installable = Arc::new(StubInstallable::returning(InstallResult::success()));
        let reconciler = reconciler(FakeCompiler::failing(), vec![installable.clone()], vec![]);

        let mut cfapi = cfapi();
        let err = reconciler.reconcile_resource(&mut cfapi).await.unwrap_err();

        assert!(matches!(err, Error::NotReady { .. }));
        assert_eq!(status(&cfapi).state, CfApiState::Warning);
        assert_eq!(installable.call_count(), 0);

        let condition = status(&cfapi)
            .conditions
            .iter()
            .find(|c| c.r#type == CONDITION_TYPE_CONFIGURATION)
            .unwrap();
        assert_eq!(condition.status, CONDITION_FALSE);
        assert_eq!(condition.reason.as_deref(), Some("InvalidConfiguration"));
        assert!(condition
            .message
            .as_deref()
            .unwrap()
            .contains("does not specify container registries"));
    }

    #[tokio::test]
    async fn a_failed_installable_turns_the_resource_into_error_state() {
        let reconciler = reconciler(
            FakeCompiler::returning(sample_config()),
            vec![
                Arc::new(StubInstallable::returning(InstallResult::success())),
                Arc::new(StubInstallable::returning(InstallResult::failed("boom"))),
                Arc::new(StubInstallable::returning(InstallResult::success())),
            ],
            vec![],
        );

        let mut cfapi = cfapi();
        reconciler.reconcile_resource(&mut cfapi).await.unwrap();

        assert_eq!(status(&cfapi).state, CfApiState::Error);
        assert_eq!(status(&cfapi).url, None);
        let condition = status(&cfapi)
            .conditions
            .iter()
            .find(|c| c.r#type == CONDITION_TYPE_INSTALLATION)
            .unwrap();
        assert_eq!(condition.status, CONDITION_FALSE);
        assert_eq!(condition.message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn in_progress_installables_keep_the_resource_processing() {
        let reconciler = reconciler(
            FakeCompiler::returning(sample_config()),
            vec![
                Arc::new(StubInstallable::returning(InstallResult::success())),
                Arc::new(StubInstallable::returning(InstallResult::in_progress(
                    "kpack is being deployed",
                ))),
            ],
            vec![],
        );

        let mut cfapi = cfapi();
        let action = reconciler.reconcile_resource(&mut cfapi).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(status(&cfapi).state, CfApiState::Processing);
        let condition = status(&cfapi)
            .conditions
            .iter()
            .find(|c| c.r#type == CONDITION_TYPE_INSTALLATION)
            .unwrap();
        assert_eq!(condition.status, CONDITION_UNKNOWN);
    }

    #[tokio::test]
    async fn installable_errors_abort_without_touching_conditions() {
        let survivor = Arc::new(StubInstallable::returning(InstallResult::success()));
        let reconciler = reconciler(
            FakeCompiler::returning(sample_config()),
            vec![Arc::new(ErroringInstallable), survivor.clone()],
            vec![],
        );

        let mut cfapi = cfapi();
        let err = reconciler.reconcile_resource(&mut cfapi).await.unwrap_err();

        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(survivor.call_count(), 0);
        assert!(status(&cfapi)
            .conditions
            .iter()
            .all(|c| c.r#type != CONDITION_TYPE_INSTALLATION));
    }

    #[tokio::test]
    async fn install_aggregation_picks_the_most_severe_result() {
        let reconciler = reconciler(FakeCompiler::failing(), vec![], vec![]);
        let events = crate::installable::test_doubles::RecordingEvents::default();

        let reconciler = Reconciler {
            install_order: vec![
                Arc::new(StubInstallable::returning(InstallResult::success())),
                Arc::new(StubInstallable::returning(InstallResult::in_progress(
                    "first blocker",
                ))),
                Arc::new(StubInstallable::returning(InstallResult::in_progress(
                    "second blocker",
                ))),
            ],
            ..reconciler
        };

        let aggregated = reconciler
            .install_all(&sample_config(), &events)
            .await
            .unwrap();
        assert_eq!(aggregated, InstallResult::in_progress("first blocker"));
    }

    #[tokio::test]
    async fn uninstall_stops_at_the_first_non_success() {
        let drained = Arc::new(StubInstallable::returning(InstallResult::in_progress(
            "2 orgs remaining",
        )));
        let untouched = Arc::new(StubInstallable::returning(InstallResult::success()));

        let reconciler = reconciler(
            FakeCompiler::failing(),
            vec![],
            vec![drained.clone(), untouched.clone()],
        );
        let events = crate::installable::test_doubles::RecordingEvents::default();

        let result = reconciler
            .uninstall_all(&sample_config(), &events)
            .await
            .unwrap();

        assert_eq!(result, InstallResult::in_progress("2 orgs remaining"));
        assert_eq!(drained.call_count(), 1);
        assert_eq!(untouched.call_count(), 0);
    }

    #[tokio::test]
    async fn deletion_waits_for_uninstall_and_then_drops_the_finalizer() {
        let uninstallable = Arc::new(StubInstallable::scripted(
            vec![InstallResult::in_progress("cleaning")],
            InstallResult::success(),
        ));
        let reconciler = reconciler(
            FakeCompiler::failing(),
            vec![],
            vec![uninstallable.clone()],
        );

        let mut cfapi = deleted_cfapi(Some(sample_config()));

        // first pass: uninstall still in progress, finalizer stays
        let action = reconciler.reconcile_resource(&mut cfapi).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(status(&cfapi).state, CfApiState::Deleting);
        assert_eq!(
            cfapi.metadata.finalizers,
            Some(vec![CFAPI_FINALIZER.to_owned()])
        );
        let condition = status(&cfapi)
            .conditions
            .iter()
            .find(|c| c.r#type == CONDITION_TYPE_DELETION)
            .unwrap();
        assert_eq!(condition.status, CONDITION_FALSE);
        assert_eq!(condition.reason.as_deref(), Some("DeletionInProgress"));
        assert_eq!(condition.message.as_deref(), Some("cleaning"));

        // second pass: uninstall succeeds, finalizer is removed
        let action = reconciler.reconcile_resource(&mut cfapi).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(cfapi.metadata.finalizers, Some(vec![]));
        assert_eq!(uninstallable.call_count(), 2);
    }

    #[tokio::test]
    async fn deletion_without_a_stored_config_skips_uninstall_entirely() {
        let uninstallable = Arc::new(StubInstallable::returning(InstallResult::success()));
        let reconciler = reconciler(
            FakeCompiler::failing(),
            vec![],
            vec![uninstallable.clone()],
        );

        // a default stored config counts as never-compiled just like a
        // missing one
        for stored in [None, Some(InstallationConfig::default())] {
            let mut cfapi = deleted_cfapi(stored);
            let action = reconciler.reconcile_resource(&mut cfapi).await.unwrap();

            assert_eq!(action, Action::await_change());
            assert_eq!(cfapi.metadata.finalizers, Some(vec![]));
            assert_eq!(status(&cfapi).state, CfApiState::Deleting);
        }

        assert_eq!(uninstallable.call_count(), 0);
    }
}
