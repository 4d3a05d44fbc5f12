//! Entry point for `rcp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, argument parsing).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rcp::{Config, CongestionStrategy, Connection, Listener, Socket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Reliable byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct Tuning {
    /// Fixed congestion window in packets (AIMD when omitted).
    #[arg(long, global = true)]
    window: Option<usize>,

    /// Initial retransmission timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 200)]
    rto_ms: u64,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and echo back everything received.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
    },
    /// Connect, send a message, and print the echo.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,

        /// Message to send; standard input when omitted.
        #[arg(short, long)]
        message: Option<String>,
    },
}

impl Tuning {
    fn config(&self) -> Config {
        Config {
            initial_rto: Duration::from_millis(self.rto_ms),
            congestion: match self.window {
                Some(n) => CongestionStrategy::Fixed(n),
                None => CongestionStrategy::Aimd,
            },
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.tuning.config();

    match cli.mode {
        Mode::Server { bind } => serve(bind, config).await,
        Mode::Client { server, message } => client(server, message, config).await,
    }
}

async fn serve(bind: SocketAddr, config: Config) -> anyhow::Result<()> {
    let mut listener = Listener::bind(bind, config)
        .await
        .with_context(|| format!("binding {bind}"))?;
    log::info!("Echo server on {}", listener.local_addr());

    loop {
        match listener.accept().await {
            Ok(conn) => {
                tokio::spawn(async move {
                    let peer = conn.peer_addr();
                    if let Err(e) = echo(conn).await {
                        log::warn!("[{peer}] {e}");
                    }
                });
            }
            Err(e) => log::warn!("accept: {e}"),
        }
    }
}

async fn echo(mut conn: Connection) -> anyhow::Result<()> {
    let mut total = 0usize;
    while let Some(chunk) = conn.recv().await? {
        total += chunk.len();
        conn.send(&chunk).await?;
    }
    conn.close().await?;
    log::info!("[{}] echoed {total} bytes", conn.peer_addr());
    Ok(())
}

async fn client(server: SocketAddr, message: Option<String>, config: Config) -> anyhow::Result<()> {
    let payload = match message {
        Some(m) => m.into_bytes(),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            buf
        }
    };

    let local: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = Socket::bind(local, config).await?;
    let mut conn = socket
        .connect(server)
        .await
        .with_context(|| format!("connecting to {server}"))?;

    conn.send(&payload).await?;
    let mut echoed = Vec::with_capacity(payload.len());
    while echoed.len() < payload.len() {
        match conn.recv().await? {
            Some(chunk) => echoed.extend_from_slice(&chunk),
            None => break,
        }
    }
    conn.close().await?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&echoed).await?;
    stdout.flush().await?;
    if echoed.len() < payload.len() {
        anyhow::bail!("server closed after {} of {} bytes", echoed.len(), payload.len());
    }
    Ok(())
}
