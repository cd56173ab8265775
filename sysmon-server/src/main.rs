use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sysmon::api::ApiServer;
use sysmon::collector::{MetricsCollector, SystemCollector};
use sysmon::config::ObservabilityConfig;
use sysmon::mcp::McpHandler;
use sysmon::stdio::StdioServer;

#[derive(Parser, Debug)]
#[command(name = "sysmon-server")]
#[command(about = "System metrics MCP server (Streamable HTTP or stdio)")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "sysmon.toml")]
    config: String,

    /// Host to bind to (overrides server.bind_addr)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides server.bind_addr)
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Serve line-delimited JSON-RPC on stdin/stdout instead of HTTP
    #[arg(long)]
    stdio: bool,

    /// Log format: pretty or json
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<String>,
}

/// Stdout belongs to the protocol in stdio mode, so logs go to stderr there
fn init_tracing(config: &ObservabilityConfig, format: &str, stdio: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log filter")?;

    let file = match &config.log_file {
        Some(path) => Some(Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?,
        )),
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let json = format == "json";
    match (file, json, stdio) {
        (Some(file), true, _) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(file))
            .init(),
        (Some(file), false, _) => registry
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file))
            .init(),
        (None, true, true) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        (None, false, true) => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        (None, true, false) => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        (None, false, false) => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = sysmon::config::Config::load_or_create(Path::new(&args.config))?;
    if args.host.is_some() || args.port.is_some() {
        let (default_host, default_port) = config
            .server
            .bind_addr
            .rsplit_once(':')
            .map(|(h, p)| (h.to_string(), p.parse().unwrap_or(8080)))
            .unwrap_or_else(|| ("127.0.0.1".to_string(), 8080));
        config.server.bind_addr = format!(
            "{}:{}",
            args.host.clone().unwrap_or(default_host),
            args.port.unwrap_or(default_port)
        );
    }

    let log_format = args
        .log_format
        .clone()
        .unwrap_or_else(|| config.observability.log_format.clone());
    init_tracing(&config.observability, &log_format, args.stdio)?;

    tracing::info!("Config file: {}", args.config);

    let collector: Arc<dyn MetricsCollector> = Arc::new(SystemCollector::new());

    if args.stdio {
        tracing::info!("Starting sysmon MCP server on stdio");
        let handler = Arc::new(McpHandler::with_system_tools(
            config.session.clone(),
            collector,
        ));
        StdioServer::new(handler).run().await?;
        return Ok(());
    }

    let mut server = ApiServer::new(config.clone(), collector);
    if config.observability.metrics_enabled {
        server = server.with_metrics(sysmon::metrics::install_recorder()?);
    }

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.server.bind_addr))?;

    tracing::info!("Starting sysmon MCP server on {}", config.server.bind_addr);
    if config.security.enabled() {
        tracing::info!("API key authentication enabled");
    }

    server.serve_on(listener, shutdown_signal()).await?;

    Ok(())
}
