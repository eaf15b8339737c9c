//! Quaymail IMAP server binary

use chrono::Utc;
use clap::Parser;
use futures::prelude::*;
use quaymail::mailservice::r#impl::InMemoryMailService;
use quaymail::{ImapServer, Mail, NativeTlsEncryptor, ServerConfig};
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "quaymail", version, about = "Minimal IMAP server with STARTTLS")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    env_logger::Builder::new()
        .filter_level(config.log_level()?)
        .parse_default_env()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_pool.max_working_threads)
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("Initializing IMAP server components...");

    let cert = tokio::fs::read(&config.tls.certificate).await.map_err(|e| {
        format!("failed to read certificate {}: {}", config.tls.certificate.display(), e)
    })?;
    let key = tokio::fs::read(&config.tls.private_key).await.map_err(|e| {
        format!("failed to read private key {}: {}", config.tls.private_key.display(), e)
    })?;
    let encryptor = NativeTlsEncryptor::from_pem(&cert, &key)?;

    log::info!("Creating default test user...");
    let service = InMemoryMailService::new();
    service.add_user("test", "test").await?;
    service
        .deliver(
            "test",
            "INBOX",
            Mail::new(
                format!("postmaster@{}", config.server.name),
                format!("test@{}", config.server.name),
                "Welcome",
                Utc::now(),
                format!("Welcome to {}.\r\n", config.server.display_name),
            ),
        )
        .await?;

    let addr = config.socket_addr()?;
    let server = ImapServer::new(service, encryptor).with_config(&config);

    log::info!("Starting IMAP server for {}...", config.server.name);
    log::info!("  Plain IMAP with STARTTLS: {}", addr);
    log::info!("  Idle timeout: {}s", config.communication.socket_timeout);
    log::info!("Default credentials: username=test, password=test");

    // Set up signal handling for graceful shutdown
    let signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
    let handle = signals.handle();

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.listen(addr).await {
            log::error!("IMAP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    let mut signals = signals.fuse();
    if let Some(signal) = signals.next().await {
        let signal_name = match signal {
            SIGTERM => "SIGTERM",
            SIGINT => "SIGINT",
            SIGHUP => "SIGHUP",
            _ => "unknown signal",
        };
        log::info!(
            "Received {} signal, initiating graceful shutdown...",
            signal_name
        );
    }

    handle.close();
    server_task.abort();

    log::info!("Shutdown complete");
    Ok(())
}
