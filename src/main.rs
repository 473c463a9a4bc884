use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};

pub use cluster_import_operator::{self, telemetry, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// How long a work's postpone-delete window stays open after cluster deletion, in seconds
    #[arg(
        long = "postpone-delete-grace-seconds",
        env = "POSTPONE_DELETE_GRACE_SECONDS",
        default_value_t = 600
    )]
    postpone_delete_grace_seconds: u64,

    /// How long to wait for the CRD work's deletion acknowledgement before
    /// stripping its finalizers during a forced detach, in seconds
    #[arg(
        long = "crd-work-grace-seconds",
        env = "CRD_WORK_GRACE_SECONDS",
        default_value_t = 30
    )]
    crd_work_grace_seconds: u64,

    /// Delay between import attempts, in seconds
    #[arg(
        long = "import-retry-period-seconds",
        env = "IMPORT_RETRY_PERIOD_SECONDS",
        default_value_t = 30
    )]
    import_retry_period_seconds: u64,

    /// Delay between garbage collection sweeps, in seconds
    #[arg(
        long = "gc-interval-seconds",
        env = "GC_INTERVAL_SECONDS",
        default_value_t = 300
    )]
    gc_interval_seconds: u64,

    /// Externally owned kinds whose vanished owners prune manifest work owner
    /// references, as Kind.group/version
    #[arg(
        long = "gc-owner-kinds",
        env = "GC_OWNER_KINDS",
        value_delimiter = ',',
        default_value = "ClusterDeployment.hive.openshift.io/v1"
    )]
    gc_owner_kinds: Vec<String>,
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let args: Arguments = Arguments::parse();

    // Initiatilize Kubernetes controller state
    let state = State::new(
        Duration::from_secs(args.postpone_delete_grace_seconds),
        Duration::from_secs(args.crd_work_grace_seconds),
        Duration::from_secs(args.import_retry_period_seconds),
        Duration::from_secs(args.gc_interval_seconds),
        args.gc_owner_kinds,
    );
    let controllers = cluster_import_operator::run(state.clone());
    tokio::pin!(controllers);

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
    tokio::join!(controllers, server).1?;
    Ok(())
}
