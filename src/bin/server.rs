use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::fmt::time::ChronoLocal;

use framelink::{AppResult, Server, ServerConfig, ServerEvent};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file; flags below are ignored when given
    #[arg(short, long)]
    pub conf: Option<String>,
    /// listen address
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: String,
    /// listen port
    #[arg(short, long, default_value_t = 6315)]
    pub port: u16,
    /// terminate the server when a key is pressed
    #[arg(short = 'k', long)]
    pub keypress: bool,
    /// seconds without activity before an idle notification (0 disables)
    #[arg(long, default_value_t = 2)]
    pub idle_notify_secs: u64,
    /// log level (v: debug, vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();

    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let level = match commandline.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_timer(timer)
        .with_max_level(level)
        .with_target(true)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| framelink::AppError::IllegalState(e.to_string()))?;

    let config = match &commandline.conf {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig {
            ip: commandline.ip.clone(),
            port: commandline.port,
            terminate_on_keypress: commandline.keypress,
            idle_notify_secs: commandline.idle_notify_secs,
        },
    };

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = Arc::new(move |event: ServerEvent| {
        // keep the callback cheap: hand events off to the processing task
        let _ = event_tx.send(event);
    });

    let server = match Server::bind(config, handler) {
        Ok(server) => server,
        Err(e) => {
            error!(
                "failed to bind {}:{}: {}",
                commandline.ip, commandline.port, e
            );
            // setup failures exit with the platform error code
            std::process::exit(e.os_error().unwrap_or(1));
        }
    };
    let handle = server.handle();
    info!("sample server listening on {}", server.local_addr());

    let event_handle = handle.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                ServerEvent::MessageReceived { conn, payload } => {
                    info!(
                        "received {} bytes from {}: {:?}",
                        payload.len(),
                        conn,
                        String::from_utf8_lossy(&payload)
                    );
                    if let Err(e) = event_handle.send_to(conn, b"ack", false).await {
                        error!("failed to ack {}: {}", conn, e);
                    }
                }
                ServerEvent::ConnectionAdded { conn, peer_addr } => {
                    info!("connection added: {} from {}", conn, peer_addr);
                }
                ServerEvent::ConnectionDropped { conn } => {
                    info!("connection dropped: {}", conn);
                }
                ServerEvent::IdleNotify => {
                    debug!("no activity, still waiting for messages");
                }
            }
        }
    });

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("got shutdown signal");
            ctrl_c_handle.shutdown();
        }
    });

    server.run().await
}
