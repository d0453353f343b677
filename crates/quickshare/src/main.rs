use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "quickshare", about = "QuickShare: burn-after-read text sharing", version)]
struct Cli {
    /// QuickShare server URL (default: http://localhost:8000 or $QUICKSHARE_SERVER)
    #[arg(long, env = "QUICKSHARE_SERVER", default_value = "http://localhost:8000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the QuickShare HTTP server
    Serve {
        /// Port to listen on (default: $QUICKSHARE_PORT or 8000)
        #[arg(long, env = "QUICKSHARE_PORT", default_value = "8000")]
        port: u16,
        /// Host to bind (default: $QUICKSHARE_HOST or 0.0.0.0)
        #[arg(long, env = "QUICKSHARE_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Share text. Reads stdin when CONTENT is omitted or `-`
    Create {
        /// Text to share
        content: Option<String>,
        /// Hours until the paste expires (0 = never)
        #[arg(long, default_value = "0")]
        expire_hours: u32,
        /// Views before the paste self-destructs (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_views: u32,
        /// Require this password to read the paste
        #[arg(long)]
        password: Option<String>,
    },
    /// Read a paste by id or share link. Consumes one view
    Get {
        /// Paste id or a share link containing `id=`
        target: String,
        /// Password for protected pastes
        #[arg(long)]
        password: Option<String>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("QUICKSHARE_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Create {
            content,
            expire_hours,
            max_views,
            password,
        } => {
            let content = match content.as_deref() {
                None | Some("-") => read_stdin()?,
                Some(c) => c.to_owned(),
            };
            let req = CreateRequest {
                content,
                expire_hours,
                max_views,
                password,
            };
            let created = create_paste(&cli.server, &req).await?;
            println!("{}", created.share_url);
            Ok(())
        }

        Commands::Get { target, password } => {
            let id = extract_id(&target);
            let view = fetch_paste(&cli.server, id, password.as_deref()).await?;
            print!("{}", view.content);
            if !view.content.ends_with('\n') {
                println!();
            }
            if view.will_destroy {
                eprintln!("(this paste has now been destroyed)");
            }
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = quickshare_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    quickshare_server::run(cfg).await
}

#[derive(Debug, Serialize)]
struct CreateRequest {
    content: String,
    expire_hours: u32,
    max_views: u32,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    unique_id: String,
    share_url: String,
}

#[derive(Debug, Deserialize)]
struct ViewResponse {
    content: String,
    will_destroy: bool,
}

async fn create_paste(server: &str, req: &CreateRequest) -> Result<CreateResponse> {
    let client = Client::new();
    let resp = client
        .post(format!("{}/api/create", server.trim_end_matches('/')))
        .json(req)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    if !status.is_success() {
        let json: Value = resp.json().await.unwrap_or_default();
        anyhow::bail!("server returned {status}: {}", detail(&json));
    }
    let created: CreateResponse = resp.json().await.context("parse response")?;
    tracing::debug!(id = %created.unique_id, "created paste");
    Ok(created)
}

async fn fetch_paste(server: &str, id: &str, password: Option<&str>) -> Result<ViewResponse> {
    let client = Client::new();
    let url = format!("{}/api/get/{}", server.trim_end_matches('/'), id);
    let request = match password {
        Some(p) => client.post(&url).json(&serde_json::json!({ "password": p })),
        None => client.get(&url),
    };
    let resp = request.send().await.context("HTTP request failed")?;

    let status = resp.status();
    if status.is_success() {
        return resp.json().await.context("parse response");
    }

    let json: Value = resp.json().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => anyhow::bail!("paste is password protected; pass --password"),
        StatusCode::FORBIDDEN => anyhow::bail!("invalid password"),
        StatusCode::NOT_FOUND => anyhow::bail!("{}", detail(&json)),
        _ => anyhow::bail!("server returned {status}: {}", detail(&json)),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read stdin")?;
    Ok(buf)
}

fn detail(json: &Value) -> &str {
    json["detail"].as_str().unwrap_or("unknown error")
}

/// Accept a bare id or a share link such as `https://host/#view?id=<id>`.
fn extract_id(target: &str) -> &str {
    match target.split_once("id=") {
        Some((_, rest)) => rest.split(['&', '#']).next().unwrap_or(rest),
        None => target,
    }
}
