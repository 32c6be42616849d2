use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Server-side configuration, owned by whoever builds the [`Server`].
///
/// [`Server`]: crate::Server
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    /// When set, any input on stdin terminates the listen loop.
    pub terminate_on_keypress: bool,
    /// Seconds of inactivity before an idle notification fires. Zero disables
    /// idle notification.
    pub idle_notify_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ip: "127.0.0.1".to_string(),
            port: 6315,
            terminate_on_keypress: false,
            idle_notify_secs: 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    pub ip: String,
    pub port: u16,
    /// Send timeout for the whole connection; `None` means no timeout.
    pub send_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            ip: "127.0.0.1".to_string(),
            port: 6315,
            send_timeout_ms: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        load_config(path)
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<ClientConfig> {
        load_config(path)
    }
}

fn load_config<P, C>(path: P) -> AppResult<C>
where
    P: AsRef<Path>,
    C: for<'de> Deserialize<'de>,
{
    let path_str = path
        .as_ref()
        .to_str()
        .ok_or_else(|| {
            AppError::IllegalState(format!(
                "config file path not valid utf-8: {}",
                path.as_ref().to_string_lossy()
            ))
        })?;
    let config = config::Config::builder()
        .add_source(config::File::with_name(path_str))
        .build()?;
    Ok(config.try_deserialize()?)
}
