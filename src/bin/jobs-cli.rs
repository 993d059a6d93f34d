use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "jobs-cli")]
#[command(about = "Management CLI for the research job service", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check service status
    Status,
    /// List queues with job counts
    Queues,
    /// Show one job
    Job { queue: String, id: String },
    /// Enqueue a job with a JSON payload
    Enqueue {
        queue: String,
        payload: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        #[arg(long, default_value_t = 1)]
        attempts: u32,
    },
    /// Cancel a job that has not started
    Cancel { id: String },
    /// Stop dequeuing from a queue
    Pause { queue: String },
    /// Resume dequeuing from a queue
    Resume { queue: String },
    /// Show circuit breaker states
    Circuits,
    /// Force a service's circuit closed
    ResetCircuit { service: String },
    /// Show rate limit usage
    RateLimits,
    /// Change a provider's standard ceiling
    SetLimit {
        provider: String,
        #[arg(long)]
        max_requests: Option<u32>,
        #[arg(long)]
        window_ms: Option<u64>,
        #[arg(long)]
        expensive_max_requests: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", cli.key))?);

    let (method, path, body) = match cli.command {
        Commands::Status => (Method::GET, "/admin/status".to_string(), None),
        Commands::Queues => (Method::GET, "/admin/queues".to_string(), None),
        Commands::Job { queue, id } => (Method::GET, format!("/admin/queues/{}/jobs/{}", queue, id), None),
        Commands::Enqueue {
            queue,
            payload,
            priority,
            delay_ms,
            attempts,
        } => {
            let payload: Value = serde_json::from_str(&payload)?;
            let body = json!({
                "payload": payload,
                "options": { "priority": priority, "delay_ms": delay_ms, "max_attempts": attempts },
            });
            (Method::POST, format!("/admin/queues/{}/jobs", queue), Some(body))
        }
        Commands::Cancel { id } => (Method::DELETE, format!("/admin/jobs/{}", id), None),
        Commands::Pause { queue } => (Method::POST, format!("/admin/queues/{}/pause", queue), None),
        Commands::Resume { queue } => (Method::POST, format!("/admin/queues/{}/resume", queue), None),
        Commands::Circuits => (Method::GET, "/admin/circuits".to_string(), None),
        Commands::ResetCircuit { service } => (Method::POST, format!("/admin/circuits/{}/reset", service), None),
        Commands::RateLimits => (Method::GET, "/admin/rate-limits".to_string(), None),
        Commands::SetLimit {
            provider,
            max_requests,
            window_ms,
            expensive_max_requests,
        } => {
            let body = json!({
                "max_requests": max_requests,
                "window_ms": window_ms,
                "expensive_max_requests": expensive_max_requests,
            });
            (Method::PATCH, format!("/admin/rate-limits/{}", provider), Some(body))
        }
    };

    let mut request = client.request(method, format!("{}{}", cli.url, path)).headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }

    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
