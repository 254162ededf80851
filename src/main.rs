//! Entry point for `rudp`.
//!
//! Parses CLI arguments and dispatches into **server**, **client** or
//! **proxy** mode.  Protocol work lives in the library; `main.rs` owns only
//! process setup (logging and argument parsing).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use rudp::simulator::{Impairment, Proxy, ProxyConfig};
use rudp::{Connection, TransportConfig};

/// Reliable message delivery over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and print every message received.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Connect to a server, deliver one message and close.
    Client {
        /// Remote server (or proxy) address.
        #[arg(short, long)]
        server: SocketAddr,
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        #[command(flatten)]
        tuning: Tuning,
        /// Message to send.
        message: String,
    },
    /// Relay between a client and a server, dropping and delaying datagrams.
    Proxy {
        /// Address clients send to.
        #[arg(short, long, default_value = "0.0.0.0:8000")]
        listen: SocketAddr,
        /// Server to forward client traffic to.
        #[arg(short, long)]
        target: SocketAddr,
        /// Percent of client → server datagrams to drop.
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=100))]
        client_drop: u8,
        /// Percent of client → server datagrams to delay.
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=100))]
        client_delay: u8,
        /// Delay applied to client → server datagrams, in milliseconds.
        #[arg(long, default_value_t = 0)]
        client_delay_ms: u64,
        /// Percent of server → client datagrams to drop.
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=100))]
        server_drop: u8,
        /// Percent of server → client datagrams to delay.
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=100))]
        server_delay: u8,
        /// Delay applied to server → client datagrams, in milliseconds.
        #[arg(long, default_value_t = 0)]
        server_delay_ms: u64,
        /// Seed for reproducible drop/delay decisions.
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Args)]
struct Tuning {
    /// Give up on an unresponsive peer after this many seconds.
    #[arg(short, long, default_value = "5", value_parser = parse_secs)]
    timeout: Duration,
    /// Payload bytes per segment.
    #[arg(long, default_value_t = 1)]
    chunk_size: usize,
}

impl Tuning {
    fn config(&self) -> TransportConfig {
        TransportConfig::default()
            .with_disconnect_timeout(self.timeout)
            .with_chunk_size(self.chunk_size)
    }
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server { bind, tuning } => serve(bind, tuning.config()).await,
        Mode::Client {
            server,
            bind,
            tuning,
            message,
        } => {
            let mut conn = Connection::bind(bind, tuning.config())
                .await
                .context("binding client socket")?;
            conn.connect(server)
                .await
                .with_context(|| format!("connecting to {server}"))?;
            conn.send(message.as_bytes()).await.context("sending message")?;
            conn.close().await?;
            Ok(())
        }
        Mode::Proxy {
            listen,
            target,
            client_drop,
            client_delay,
            client_delay_ms,
            server_drop,
            server_delay,
            server_delay_ms,
            seed,
        } => {
            let mut config = ProxyConfig::new(listen, target)
                .with_client(Impairment::new(
                    client_drop,
                    client_delay,
                    Duration::from_millis(client_delay_ms),
                ))
                .with_server(Impairment::new(
                    server_drop,
                    server_delay,
                    Duration::from_millis(server_delay_ms),
                ));
            if let Some(seed) = seed {
                config = config.with_seed(seed);
            }
            Proxy::bind(config).await?.run().await?;
            Ok(())
        }
    }
}

async fn serve(bind: SocketAddr, config: TransportConfig) -> Result<()> {
    let mut conn = Connection::bind(bind, config)
        .await
        .with_context(|| format!("binding {bind}"))?;
    log::info!("Listening on {}", conn.local_addr());
    loop {
        let peer = conn.accept().await?;
        println!("connected: {peer}");
        while let Some(message) = conn.recv().await? {
            println!("{}", String::from_utf8_lossy(&message));
        }
        println!("disconnected: {peer}");
    }
}
