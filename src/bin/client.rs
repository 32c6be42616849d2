use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt::time::ChronoLocal;

use framelink::{AppError, AppResult, ClientConfig, ClientSession};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file; flags below are ignored when given
    #[arg(short, long)]
    pub conf: Option<String>,
    /// server address
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: String,
    /// server port
    #[arg(short, long, default_value_t = 6315)]
    pub port: u16,
    /// number of messages to send
    #[arg(short = 'n', long, default_value_t = 5)]
    pub count: u32,
    /// send timeout in milliseconds; no timeout when omitted
    #[arg(long)]
    pub send_timeout_ms: Option<u64>,
    /// log level (v: debug, vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn main() -> AppResult<()> {
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
        .map_err(|e| AppError::IllegalState(e.to_string()))?;

    let config = match &commandline.conf {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig {
            ip: commandline.ip.clone(),
            port: commandline.port,
            send_timeout_ms: commandline.send_timeout_ms,
        },
    };

    let session = match ClientSession::from_config(&config) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!("failed to connect to {}:{}: {}", config.ip, config.port, e);
            // setup failures exit with the platform error code
            std::process::exit(e.os_error().unwrap_or(1));
        }
    };
    info!("connected to {}:{}", config.ip, config.port);

    // one receiver thread, one sender thread; the two directions are
    // independent and may run concurrently
    let receiver = {
        let session = session.clone();
        let count = commandline.count;
        thread::spawn(move || {
            for _ in 0..count {
                match session.receive() {
                    Ok(size) => {
                        let reply = session.take_message().unwrap_or_default();
                        info!(
                            "received {} bytes: {:?}",
                            size,
                            String::from_utf8_lossy(&reply)
                        );
                    }
                    Err(AppError::Terminated) => {
                        info!("receive terminated");
                        break;
                    }
                    Err(e) => {
                        error!("receive error: {}", e);
                        break;
                    }
                }
            }
        })
    };

    for i in 0..commandline.count {
        let msg = format!("message {}", i + 1);
        if let Err(e) = session.send(msg.as_bytes(), false) {
            error!("send error: {}", e);
            break;
        }
        info!("sent {:?}", msg);
        thread::sleep(Duration::from_millis(200));
    }

    receiver
        .join()
        .map_err(|_| AppError::IllegalState("receiver thread panicked".to_string()))?;
    session.shutdown();
    info!("client done, {} messages received", session.received_count());
    Ok(())
}
