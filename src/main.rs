use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::Client;
use prometheus::{Encoder, TextEncoder};

pub use node_readiness_controller::{self, telemetry, Settings, State};

#[derive(Debug, clap::Parser)]
#[command(about = "Manages node taints from node-readiness rules")]
struct Arguments {
    /// Address the health and metrics server listens on
    #[arg(long = "bind-address", env = "BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    bind_address: String,

    /// Immediate retries after a write conflict before the reconciliation is requeued
    #[arg(long = "max-conflict-retries", env = "MAX_CONFLICT_RETRIES", default_value_t = 3)]
    max_conflict_retries: u32,

    #[arg(
        long = "error-requeue-seconds",
        env = "ERROR_REQUEUE_SECONDS",
        default_value_t = 30
    )]
    error_requeue_seconds: u64,

    /// Steady-state re-evaluation interval
    #[arg(long = "resync-seconds", env = "RESYNC_SECONDS", default_value_t = 300)]
    resync_seconds: u64,

    /// Concurrent node reconciliations, 0 for unbounded
    #[arg(long = "concurrency", env = "CONTROLLER_CONCURRENCY", default_value_t = 0)]
    concurrency: u16,

    #[arg(long = "log-format", env = "LOG_FORMAT", value_enum, default_value_t)]
    log_format: telemetry::LogFormat,
}

impl Arguments {
    fn settings(&self) -> Settings {
        Settings {
            max_conflict_retries: self.max_conflict_retries,
            error_requeue: Duration::from_secs(self.error_requeue_seconds),
            resync: Duration::from_secs(self.resync_seconds),
            concurrency: self.concurrency,
        }
    }
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

#[get("/readyz")]
async fn ready(c: Data<State>, _req: HttpRequest) -> impl Responder {
    if c.is_ready() {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("syncing")
    }
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();
    telemetry::init(args.log_format)?;

    let settings = args.settings();

    let client = Client::try_default().await?;

    // Initiatilize Kubernetes controller state
    let state = State::default();
    let controller = node_readiness_controller::run(client, state.clone(), settings);
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(
                middleware::Logger::default()
                    .exclude("/health")
                    .exclude("/readyz"),
            )
            .service(index)
            .service(health)
            .service(ready)
            .service(metrics)
    })
    .bind(&args.bind_address)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
