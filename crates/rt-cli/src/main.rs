use clap::{Args, Parser, Subcommand};
use rt_common::config::RuntimeConfig;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rt-cli", version, about = "Distributed inference runtime CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline coordinator: cluster membership, batch admission, sampling.
    Coordinator(CoordinatorArgs),
    /// Run a worker: hosts one pipeline-parallel layer range's transformer blocks.
    Worker(WorkerArgs),
    /// Print host CPU/memory stats (see /metrics for the Prometheus series).
    Stats,
    Version,
}

#[derive(Args, Debug)]
struct CoordinatorArgs {
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Total decoder layers `L` the registered worker pool must cover.
    #[arg(long)]
    total_layers: usize,
    /// Number of pipeline-parallel slots to split those layers across.
    #[arg(long, default_value_t = 1)]
    pipeline_stages: usize,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(long, default_value_t = 8081)]
    port: u16,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Coordinator(args) => serve_coordinator(args).await,
        Commands::Worker(args) => serve_worker(args).await,
        Commands::Stats => stats().await,
        Commands::Version => println!("{}", env!("CARGO_PKG_VERSION")),
    }
}

async fn serve_coordinator(args: CoordinatorArgs) {
    let config = RuntimeConfig::load();
    let state = rt_coordinator::AppState::new(args.total_layers, args.pipeline_stages, config);
    let app = rt_coordinator::router(state);
    serve(app, args.port, "coordinator").await;
}

async fn serve_worker(args: WorkerArgs) {
    let config = RuntimeConfig::load();
    let state = rt_worker::AppState::new(config);
    let app = rt_worker::router(state);
    serve(app, args.port, "worker").await;
}

async fn serve(app: axum::Router, port: u16, role: &str) {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await.unwrap();
    tracing::info!(role, port, "listening");
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(role, "shutdown signal received");
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await.unwrap();
}

async fn stats() {
    use sysinfo::{CpuExt, System, SystemExt};
    let mut sys = System::new_all();
    sys.refresh_all();
    let total_mem = sys.total_memory();
    let used_mem = sys.used_memory();
    let cpu_avg: f32 = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / (sys.cpus().len() as f32);
    println!("CPU: {:.1}%", cpu_avg);
    println!("Memory: {} / {} MiB", used_mem / 1024 / 1024, total_mem / 1024 / 1024);
    println!("GPU: see /metrics for NVML-based GPU stats if the nvidia feature is built in");
}

fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer()).init();
}
