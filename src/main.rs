use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use covend::config::Config;
use covend::paths::WorkspacePaths;

#[derive(Parser)]
#[command(name = "covend")]
#[command(about = "Per-workspace orchestration daemon for concurrent AI coding agents")]
#[command(version)]
struct Cli {
    /// Workspace root (defaults to current directory)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground
    Start,
    /// Ask a running daemon to exit gracefully (`POST /shutdown`)
    Stop,
    /// Report whether a daemon is running for this workspace
    Status,
    /// Create `.coven/` and a default `config.json`
    Init {
        /// Overwrite an existing config.json
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let work_dir = cli.path.unwrap_or_else(|| PathBuf::from("."));
    let paths = WorkspacePaths::new(work_dir.canonicalize().unwrap_or(work_dir));

    let log_level = std::env::var("RUST_LOG").ok().unwrap_or_else(|| {
        Config::load(&paths.config_path()).map(|c| c.log_level).unwrap_or_else(|_| "info".to_string())
    });
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Start => start(paths).await,
        Commands::Stop => stop(paths).await,
        Commands::Status => status(paths).await,
        Commands::Init { force } => init(paths, force),
    }
}

async fn start(paths: WorkspacePaths) -> Result<()> {
    let runtime = covend::daemon::build_runtime(paths.workspace_root()).await?;
    covend::daemon::run(runtime).await
}

async fn stop(paths: WorkspacePaths) -> Result<()> {
    let Ok(pid_content) = std::fs::read_to_string(paths.pid_path()) else {
        bail!("no daemon appears to be running ({} not found)", paths.pid_path().display());
    };
    let pid: u32 = pid_content.trim().parse().context("parsing covend.pid")?;
    if !covend::process::is_alive(pid) {
        bail!("stale pid file: process {pid} is not running");
    }

    let (status, _body) = socket_request(&paths, "POST", "/shutdown").await?;
    if status != 200 {
        bail!("daemon rejected shutdown request: HTTP {status}");
    }
    println!("shutdown requested");
    Ok(())
}

async fn status(paths: WorkspacePaths) -> Result<()> {
    let Ok(pid_content) = std::fs::read_to_string(paths.pid_path()) else {
        println!("not running");
        return Ok(());
    };
    let pid: u32 = pid_content.trim().parse().unwrap_or(0);
    if pid == 0 || !covend::process::is_alive(pid) {
        println!("not running (stale pid file)");
        return Ok(());
    }

    match socket_request(&paths, "GET", "/state").await {
        Ok((200, body)) => {
            println!("running, pid {pid}");
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json).unwrap_or(body)),
                Err(_) => println!("{body}"),
            }
        }
        _ => println!("running, pid {pid} (socket not responding)"),
    }
    Ok(())
}

/// A minimal HTTP/1.0 request over the daemon's Unix socket — just
/// enough for the CLI's own `stop`/`status` to talk to a process it
/// didn't spawn, without pulling in a full client stack for two calls.
async fn socket_request(paths: &WorkspacePaths, method: &str, path: &str) -> Result<(u16, String)> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    let socket_path = paths.socket_path();
    let mut stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("connecting to {}", socket_path.display()))?;

    let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.context("writing request")?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.context("reading response")?;

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);
    Ok((status, body.to_string()))
}

fn init(paths: WorkspacePaths, force: bool) -> Result<()> {
    paths.ensure_dirs().context("creating .coven directories")?;

    let config_path = paths.config_path();
    if config_path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", config_path.display());
    } else {
        Config::default().save(&config_path)?;
        println!("wrote {}", config_path.display());
    }

    let secrets_path = paths.secrets_path();
    if !secrets_path.exists() {
        std::fs::write(&secrets_path, "# name: value\n")?;
    }
    let gitignore_path = paths.coven_dir().join(".gitignore");
    if !gitignore_path.exists() {
        std::fs::write(&gitignore_path, "secrets.yaml\nworktrees/\n*.sock\n*.pid\n")?;
    }

    println!("initialized {}", paths.coven_dir().display());
    Ok(())
}
