use axum::Router;
use clap::{Args, Parser, Subcommand};
use gateway_api::app;
use gateway_common::config::GatewayConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gateway", version, about = "Inference admission gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway until Ctrl-C.
    Serve(ServeArgs),
    /// Send a single /v1/generate request to a running gateway.
    Request(RequestArgs),
    /// Print local CPU/memory utilization.
    Stats,
    Version,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,
}

#[derive(Args, Debug)]
struct RequestArgs {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    url: String,
    #[arg(long)]
    tenant_id: String,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = 128)]
    max_new_tokens: u32,
    #[arg(long)]
    adapter_id: Option<String>,
    #[arg(long)]
    request_id: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Request(args) => request(args).await,
        Commands::Stats => stats(),
        Commands::Version => println!("{}", env!("CARGO_PKG_VERSION")),
    }
}

async fn serve(args: ServeArgs) {
    let config = GatewayConfig::load();
    let (router, gateway): (Router, _) = app(config);
    gateway.start().await;

    let listener = tokio::net::TcpListener::bind(&args.bind).await.unwrap();
    tracing::info!(target: "gateway-cli", bind = %args.bind, "listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(target: "gateway-cli", "shutdown signal received");
    };
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await.unwrap();

    gateway.stop().await;
}

async fn request(args: RequestArgs) {
    let client = reqwest::Client::new();
    let mut body = serde_json::json!({
        "tenant_id": args.tenant_id,
        "prompt": args.prompt,
        "max_new_tokens": args.max_new_tokens,
    });
    if let Some(adapter_id) = args.adapter_id {
        body["adapter_id"] = serde_json::Value::String(adapter_id);
    }
    if let Some(request_id) = args.request_id {
        body["request_id"] = serde_json::Value::String(request_id);
    }

    let url = format!("{}/v1/generate", args.url.trim_end_matches('/'));
    match client.post(&url).json(&body).send().await {
        Ok(response) => {
            let status = response.status();
            match response.text().await {
                Ok(text) => println!("{status}: {text}"),
                Err(err) => eprintln!("{status}: failed to read response body: {err}"),
            }
        }
        Err(err) => eprintln!("request failed: {err}"),
    }
}

fn stats() {
    use sysinfo::{CpuExt, System, SystemExt};
    let mut sys = System::new_all();
    sys.refresh_all();
    let total_mem = sys.total_memory();
    let used_mem = sys.used_memory();
    let cpu_avg: f32 = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / (sys.cpus().len() as f32);
    println!("CPU: {cpu_avg:.1}%");
    println!("Memory: {} / {} MiB", used_mem / 1024 / 1024, total_mem / 1024 / 1024);
}

fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer()).init();
}
