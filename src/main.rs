use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::runtime::events::Recorder;
use kube::Client;
use prometheus::{Encoder, TextEncoder};

use cfapi_operator::controllers::cfapi::config::KymaConfigCompiler;
use cfapi_operator::controllers::cfapi::{self, Reconciler};
use cfapi_operator::controllers::State;
use cfapi_operator::helm::{HelmCli, HelmClient};
use cfapi_operator::installable::admins::Admins;
use cfapi_operator::installable::certificates::Certificates;
use cfapi_operator::installable::conditional::Conditional;
use cfapi_operator::installable::helm::HelmChart;
use cfapi_operator::installable::orgs::Orgs;
use cfapi_operator::installable::values::{
    self, CfApiConfigValues, KorifiValues, Override, PrerequisitesValues,
};
use cfapi_operator::installable::yaml::{YamlDir, YamlFile, YamlTemplate};
use cfapi_operator::installable::{Installable, Uninstallable};
use cfapi_operator::resources::cfapis::{GatewayType, InstallationConfig};
use cfapi_operator::{telemetry, Metrics};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Directory holding the manifests and charts shipped with the operator
    #[arg(
        long = "module-data",
        env = "MODULE_DATA_DIR",
        value_name = "DIR",
        default_value = "./module-data"
    )]
    module_data: PathBuf,

    /// Interval between reconciles while the installation is in progress
    #[arg(
        long = "requeue-interval-seconds",
        env = "REQUEUE_INTERVAL_SECONDS",
        value_name = "SECONDS",
        default_value_t = 10
    )]
    requeue_interval_seconds: u64,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

fn contour_enabled(config: &InstallationConfig) -> (bool, String) {
    (
        config.gateway_type == GatewayType::Contour,
        "skipped: korifi gateway is not contour".to_owned(),
    )
}

fn self_signed_certificates_enabled(config: &InstallationConfig) -> (bool, String) {
    (
        config.use_self_signed_certificates,
        "skipped: self-signed certificates are not enabled".to_owned(),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let args: Arguments = Arguments::parse();

    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let state = State::default();
    let operator_metrics = Metrics::new(&state.registry).unwrap();

    let helm_client: Arc<dyn HelmClient> = Arc::new(HelmCli::default());
    let module_data = args.module_data;

    let system_ns = Arc::new(YamlFile::new(
        client.clone(),
        module_data.join("namespaces/system.yaml"),
        "System Namespaces",
    ));
    let cf_root_ns = Arc::new(YamlTemplate::new(
        client.clone(),
        module_data.join("namespaces/cfroot.yaml"),
        "Root Namespace",
    ));
    let cert_issuers = Arc::new(YamlFile::new(
        client.clone(),
        module_data.join("issuers/issuers.yaml"),
        "CertIssuers",
    ));
    let self_signed_certificates = Arc::new(Conditional::new(
        self_signed_certificates_enabled,
        Arc::new(Certificates::new(
            client.clone(),
            Arc::new(YamlTemplate::new(
                client.clone(),
                module_data.join("certificates/self-signed-certificates.yaml"),
                "Self Signed Certificates",
            )),
        )),
    ));
    let gateway_api = Arc::new(YamlFile::new(
        client.clone(),
        module_data.join("vendor/gateway-api/experimental-install.yaml"),
        "Gateway API",
    ));
    let contour_chart = Arc::new(HelmChart::new(
        module_data.join("vendor/contour-chart"),
        "cfapi-system",
        "contour",
        Arc::new(values::contour()),
        helm_client.clone(),
    ));
    let contour = Arc::new(Conditional::new(contour_enabled, contour_chart.clone()));
    let kpack = Arc::new(YamlDir::new(
        client.clone(),
        module_data.join("vendor/kpack"),
        "kpack",
    ));
    let korifi_prerequisites = Arc::new(HelmChart::new(
        module_data.join("korifi-prerequisites-chart"),
        "korifi",
        "korifi-prerequisites",
        Arc::new(PrerequisitesValues),
        helm_client.clone(),
    ));
    let korifi = Arc::new(HelmChart::new(
        module_data.join("vendor/korifi-chart"),
        "korifi",
        "korifi",
        Arc::new(KorifiValues),
        helm_client.clone(),
    ));
    let admins = Arc::new(Admins::new(client.clone()));
    let cfapi_config = Arc::new(HelmChart::new(
        module_data.join("cfapi-config-chart"),
        "korifi",
        "cfapi-config",
        Arc::new(CfApiConfigValues),
        helm_client.clone(),
    ));
    let btp_service_broker = Arc::new(HelmChart::new(
        module_data.join("btp-service-broker/helm"),
        "cfapi-system",
        "btp-service-broker",
        Arc::new(Override::default()),
        helm_client.clone(),
    ));

    let install_order: Vec<Arc<dyn Installable>> = vec![
        system_ns.clone(),
        cf_root_ns.clone(),
        cert_issuers.clone(),
        self_signed_certificates,
        gateway_api.clone(),
        contour,
        kpack.clone(),
        korifi_prerequisites.clone(),
        korifi.clone(),
        admins,
        cfapi_config.clone(),
        btp_service_broker.clone(),
    ];

    let uninstall_order: Vec<Arc<dyn Uninstallable>> = vec![
        Arc::new(Orgs::new(client.clone())),
        cf_root_ns,
        btp_service_broker,
        cfapi_config,
        korifi,
        korifi_prerequisites,
        kpack,
        contour_chart,
        gateway_api,
        cert_issuers,
        system_ns,
    ];

    let reconciler = Reconciler::new(
        Duration::from_secs(args.requeue_interval_seconds),
        Recorder::new(client.clone(), "cfapi-operator".into()),
        Arc::new(KymaConfigCompiler::new(client.clone())),
        install_order,
        uninstall_order,
    );

    let controller = cfapi::run(client, operator_metrics, state.clone(), reconciler);
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
