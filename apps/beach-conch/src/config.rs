use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;

use crate::recorder::RecorderConfig;
use crate::registry::DEFAULT_OUTBOUND_DEPTH;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_MEDIA_TYPE: &str = "audio/webm; codecs=opus";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub assets_dir: PathBuf,
    pub archive: Option<ArchiveConfig>,
    pub media_type: String,
    pub outbound_buffer: usize,
    pub error_replies: bool,
    pub ice_servers: Vec<String>,
    pub recorder: Option<RecorderConfig>,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    pub dir: PathBuf,
    pub extension: String,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-conch",
    author,
    version,
    about = "WebSocket audio relay and signaling server"
)]
pub struct Cli {
    /// Address of the websocket listener; clients upgrade at `/`.
    #[arg(long, env = "BEACH_CONCH_LISTEN_ADDR", default_value = "0.0.0.0:4040")]
    pub listen_addr: String,

    /// Address serving the browser page and script.
    #[arg(long, env = "BEACH_CONCH_HTTP_ADDR", default_value = "0.0.0.0:8000")]
    pub http_addr: String,

    /// Directory holding index.html and client.js.
    #[arg(long, env = "BEACH_CONCH_ASSETS_DIR", default_value = ".")]
    pub assets_dir: PathBuf,

    /// Write every relayed media frame to this directory.
    #[arg(long, env = "BEACH_CONCH_ARCHIVE_DIR")]
    pub archive_dir: Option<PathBuf>,

    /// File extension for archived frames.
    #[arg(long, env = "BEACH_CONCH_ARCHIVE_EXTENSION", default_value = "webm")]
    pub archive_extension: String,

    /// Codec tag of the relayed media frames.
    #[arg(long, env = "BEACH_CONCH_MEDIA_TYPE", default_value = DEFAULT_MEDIA_TYPE)]
    pub media_type: String,

    /// Per-connection outbound queue depth.
    #[arg(long, env = "BEACH_CONCH_OUTBOUND_BUFFER", default_value_t = DEFAULT_OUTBOUND_DEPTH)]
    pub outbound_buffer: usize,

    /// Reply with an error envelope when an envelope is rejected.
    #[arg(long, env = "BEACH_CONCH_ERROR_REPLIES", default_value_t = false)]
    pub error_replies: bool,

    /// ICE server URL for server-side peer connections (repeatable).
    #[arg(
        long = "ice-server",
        env = "BEACH_CONCH_ICE_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_SERVER
    )]
    pub ice_servers: Vec<String>,

    /// Use host candidates only.
    #[arg(long, env = "BEACH_CONCH_DISABLE_STUN", default_value_t = false)]
    pub disable_stun: bool,

    /// Record server-side audio sessions into this directory.
    #[arg(long, env = "BEACH_CONCH_RECORD_DIR")]
    pub record_dir: Option<PathBuf>,

    /// Encoder binary used for recordings.
    #[arg(long, env = "BEACH_CONCH_ENCODER", default_value = "ffmpeg")]
    pub encoder: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_CONCH_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let http_addr: SocketAddr = cli
            .http_addr
            .parse()
            .with_context(|| format!("invalid http address: {}", cli.http_addr))?;
        if cli.outbound_buffer == 0 {
            bail!("outbound buffer must be greater than zero");
        }
        if listen_addr == http_addr && listen_addr.port() != 0 {
            bail!("websocket and http listeners cannot share {listen_addr}");
        }

        let ice_servers = if cli.disable_stun {
            Vec::new()
        } else {
            cli.ice_servers
                .into_iter()
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .collect()
        };

        let archive = cli.archive_dir.map(|dir| ArchiveConfig {
            dir,
            extension: cli.archive_extension.trim_start_matches('.').to_string(),
        });
        let recorder = cli.record_dir.map(|dir| RecorderConfig {
            dir,
            encoder: cli.encoder,
        });

        Ok(ServerConfig {
            listen_addr,
            http_addr,
            assets_dir: cli.assets_dir,
            archive,
            media_type: cli.media_type,
            outbound_buffer: cli.outbound_buffer,
            error_replies: cli.error_replies,
            ice_servers,
            recorder,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
