use std::net::SocketAddr;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rmcp::transport::sse_server::SseServer;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use rmcp::ServiceExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pgdba_mcp::config::{obfuscate_password, AccessMode, ServerConfig};
use pgdba_mcp::db::DbPool;
use pgdba_mcp::server::DbaServer;

const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_INTERRUPT: i32 = 130;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    Stdio,
    Sse,
    StreamableHttp,
}

/// PostgreSQL DBA tools over the Model Context Protocol.
#[derive(Parser, Debug)]
#[command(name = "pgdba-mcp")]
#[command(version)]
#[command(about = "PostgreSQL DBA tools over the Model Context Protocol")]
struct Cli {
    /// Database connection URL (postgresql://...)
    database_url: Option<String>,

    /// Database connection URL; also read from DATABASE_URI
    #[arg(long = "database-uri", env = "DATABASE_URI")]
    database_uri: Option<String>,

    /// SQL access mode: unrestricted, or restricted (read-only with
    /// parser-enforced guardrails)
    #[arg(long = "access-mode", value_enum, default_value = "unrestricted")]
    access_mode: AccessMode,

    /// MCP transport
    #[arg(long = "transport", value_enum, default_value = "stdio")]
    transport: Transport,

    /// Host to bind the SSE server to
    #[arg(long = "sse-host", default_value = "127.0.0.1")]
    sse_host: String,

    /// Host to bind the streamable HTTP server to
    #[arg(long = "streamable-http-host", default_value = "127.0.0.1")]
    streamable_http_host: String,

    /// Port for the network transports
    #[arg(long = "port", default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgdba_mcp=info,rmcp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let database_url = cli
        .database_url
        .clone()
        .or_else(|| cli.database_uri.clone())
        .unwrap_or_default();
    let config = ServerConfig::new(database_url, cli.access_mode);
    if let Err(err) = config.validate() {
        error!("{err}");
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    info!(
        "Starting pgdba-mcp in {} mode against {}",
        config.access_mode.as_str(),
        obfuscate_password(&config.database_url)
    );

    let pool = match DbPool::connect(&config.database_url, config.pool_size).await {
        Ok(pool) => pool,
        Err(err) => {
            warn!(
                "Could not connect to database yet ({err}); starting anyway, \
                 operations will fail until the database is reachable"
            );
            match DbPool::connect_lazy(&config.database_url, config.pool_size) {
                Ok(pool) => pool,
                Err(err) => {
                    error!("Invalid database URL: {err}");
                    std::process::exit(EXIT_CONFIG_ERROR);
                }
            }
        }
    };

    match cli.transport {
        Transport::Stdio => run_stdio(pool, config).await,
        Transport::Sse => {
            let addr: SocketAddr = format!("{}:{}", cli.sse_host, cli.port)
                .parse()
                .context("invalid SSE bind address")?;
            run_sse(pool, config, addr).await
        }
        Transport::StreamableHttp => {
            let addr: SocketAddr = format!("{}:{}", cli.streamable_http_host, cli.port)
                .parse()
                .context("invalid streamable HTTP bind address")?;
            run_streamable_http(pool, config, addr).await
        }
    }
}

async fn run_stdio(pool: DbPool, config: ServerConfig) -> anyhow::Result<()> {
    let server = DbaServer::new(pool.clone(), &config);
    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .context("failed to serve MCP over stdio")?;

    tokio::select! {
        outcome = service.waiting() => {
            outcome.context("stdio transport failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing connections");
            pool.close().await;
            std::process::exit(EXIT_INTERRUPT);
        }
    }
    pool.close().await;
    Ok(())
}

async fn run_sse(pool: DbPool, config: ServerConfig, addr: SocketAddr) -> anyhow::Result<()> {
    info!("Serving SSE on {addr}");
    let service_pool = pool.clone();
    let cancel = SseServer::serve(addr)
        .await
        .context("failed to bind SSE server")?
        .with_service(move || DbaServer::new(service_pool.clone(), &config));

    tokio::signal::ctrl_c().await.ok();
    info!("Interrupted, closing connections");
    cancel.cancel();
    pool.close().await;
    std::process::exit(EXIT_INTERRUPT);
}

async fn run_streamable_http(
    pool: DbPool,
    config: ServerConfig,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    info!("Serving streamable HTTP on {addr}");
    let service_pool = pool.clone();
    let service = StreamableHttpService::new(
        move || Ok(DbaServer::new(service_pool.clone(), &config)),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let router = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind streamable HTTP server")?;
    let interrupted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let shutdown_flag = interrupted.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            shutdown_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .await
        .context("streamable HTTP server failed")?;
    pool.close().await;
    if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
        std::process::exit(EXIT_INTERRUPT);
    }
    Ok(())
}
