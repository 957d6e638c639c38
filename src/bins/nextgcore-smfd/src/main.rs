//! NextGCore SMF (Session Management Function)
//!
//! Loads the configuration, binds the N4 socket, associates with every
//! configured UPF and serves PFCP until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use nextgcore_smfd::consumer::SmPolicyDecision;
use nextgcore_smfd::pfcp_path::UdpTransport;
use nextgcore_smfd::{Collaborators, SmfConfig, SmfContext};

/// Largest PFCP datagram accepted
const MAX_DATAGRAM: usize = 8192;

/// NextGCore SMF - Session Management Function
#[derive(Parser, Debug)]
#[command(name = "nextgcore-smfd")]
#[command(author = "NextGCore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "5G Core Session Management Function", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, default_value = "/etc/nextgcore/smf.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'e', long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(short = 'm', long)]
    no_color: bool,

    /// PFCP bind address, overriding the configuration
    #[arg(long)]
    pfcp_addr: Option<String>,
}

/// Global shutdown flag
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    log::info!("NextGCore SMF v{} starting...", env!("CARGO_PKG_VERSION"));

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    log::info!("Loading configuration from {}", args.config);
    let mut config = SmfConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config))?;
    if let Some(addr) = &args.pfcp_addr {
        config.smf.pfcp.addr = addr.clone();
    }

    let bind: SocketAddr = format!("{}:{}", config.smf.pfcp.addr, config.smf.pfcp.port)
        .parse()
        .context("Invalid PFCP address")?;
    let socket = Arc::new(
        UdpSocket::bind(bind)
            .await
            .with_context(|| format!("Failed to bind PFCP socket {}", bind))?,
    );
    log::info!("PFCP server listening on {}", bind);

    let transport = Arc::new(UdpTransport::new(socket.clone()));
    let smf = SmfContext::new(config, transport, Collaborators::local(SmPolicyDecision::default()))
        .context("Failed to initialize SMF context")?;
    smf.associate_all();
    log::info!("NextGCore SMF ready");

    run_pfcp_loop(&smf, &socket, shutdown).await;

    log::info!("Shutting down...");
    log::info!("{} SM context(s) left at shutdown", smf.registry.len());
    log::info!("NextGCore SMF stopped");
    Ok(())
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    builder.filter_level(level);
    builder.format_timestamp_millis();

    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }

    builder.init();
}

fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        shutdown.store(true, Ordering::SeqCst);
        SHUTDOWN.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    Ok(())
}

/// Receive PFCP datagrams until shutdown; each one is handled on its own task
async fn run_pfcp_loop(smf: &Arc<SmfContext>, socket: &UdpSocket, shutdown: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while !shutdown.load(Ordering::SeqCst) && !SHUTDOWN.load(Ordering::SeqCst) {
        let received = tokio::time::timeout(Duration::from_millis(100), socket.recv_from(&mut buf)).await;
        match received {
            Err(_) => continue,
            Ok(Err(e)) => log::error!("PFCP receive failed: {}", e),
            Ok(Ok((len, peer))) => {
                let data = buf[..len].to_vec();
                let smf = smf.clone();
                tokio::spawn(async move {
                    smf.handle_pfcp_datagram(peer, &data).await;
                });
            }
        }
    }
}
