//! Command line and environment configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::coordinator::SessionOptions;
use crate::model::{AudioTrackOptions, VideoTrackOptions};

#[derive(Debug, Parser)]
#[command(name = "rtc-signal", version, about = "WebRTC signaling over WebSocket")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the signaling endpoint and answer browser offers
    Server(ServerConfig),
    /// Connect to a signaling server and offer to receive its media
    Client(ClientConfig),
}

#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Address the HTTP host listens on
    #[arg(long, env = "RTC_SIGNAL_BIND", default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,

    /// Directory served for every path other than the signaling endpoint
    #[arg(long, env = "RTC_SIGNAL_STATIC_DIR", default_value = "wwwroot")]
    pub static_dir: PathBuf,

    /// Address advertised in ICE host candidates; picked from the local
    /// interfaces when unset
    #[arg(long, env = "RTC_SIGNAL_HOST_ADDR")]
    pub host_addr: Option<IpAddr>,

    /// Do not attach an audio track to new sessions
    #[arg(long)]
    pub no_audio: bool,

    /// Do not attach a video track to new sessions
    #[arg(long)]
    pub no_video: bool,
}

impl ServerConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            audio: (!self.no_audio).then(AudioTrackOptions::default),
            video: (!self.no_video).then(VideoTrackOptions::default),
            ..SessionOptions::default()
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ClientConfig {
    /// Signaling endpoint to connect to
    #[arg(long, env = "RTC_SIGNAL_URL", default_value = "ws://127.0.0.1:3000/signaling")]
    pub url: String,

    /// Delay before reconnecting after the connection closes
    #[arg(long = "retry-ms", env = "RTC_SIGNAL_RETRY_MS", default_value_t = 1000)]
    pub retry_ms: u64,

    /// Address advertised in ICE host candidates
    #[arg(long, env = "RTC_SIGNAL_HOST_ADDR")]
    pub host_addr: Option<IpAddr>,
}

impl ClientConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }
}
