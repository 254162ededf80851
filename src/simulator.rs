//! Lossy, delaying UDP relay for exercising the transport.
//!
//! [`Proxy`] sits between one client and one server:
//!
//! ```text
//!  client ──▶ proxy ──(client impairment)──▶ server
//!  client ◀── proxy ◀──(server impairment)── server
//! ```
//!
//! Datagrams arriving from the server address go back to the most recently
//! seen client; everything else is forwarded to the server.  Each direction
//! has its own [`Impairment`]: a datagram is dropped with `drop_percent`
//! probability, otherwise held back for `delay` with `delay_percent`
//! probability.  Delayed datagrams are sent from their own task, so later
//! traffic can overtake them.
//!
//! Impairments can be changed while the proxy runs through a
//! [`ProxyHandle`].  Supplying a seed makes the drop/delay decisions
//! reproducible.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::socket::DEFAULT_BUFFER;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fault model for one direction of traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Impairment {
    /// Chance, in percent, that a datagram is discarded.
    pub drop_percent: u8,
    /// Chance, in percent, that a surviving datagram is held back.
    pub delay_percent: u8,
    /// How long a held-back datagram waits.
    pub delay: Duration,
}

impl Impairment {
    pub fn new(drop_percent: u8, delay_percent: u8, delay: Duration) -> Self {
        Self {
            drop_percent,
            delay_percent,
            delay,
        }
    }

    /// Drop `percent` of datagrams, delay none.
    pub fn lossy(percent: u8) -> Self {
        Self::new(percent, 0, Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Sides {
    client: Impairment,
    server: Impairment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address the proxy listens on; clients talk to this.
    pub listen: SocketAddr,
    /// The server that client traffic is forwarded to.
    pub target: SocketAddr,
    /// Applied to client → server traffic.
    pub client: Impairment,
    /// Applied to server → client traffic.
    pub server: Impairment,
    pub seed: Option<u64>,
}

impl ProxyConfig {
    /// A transparent proxy from `listen` to `target`.
    pub fn new(listen: SocketAddr, target: SocketAddr) -> Self {
        Self {
            listen,
            target,
            client: Impairment::default(),
            server: Impairment::default(),
            seed: None,
        }
    }

    pub fn with_client(mut self, impairment: Impairment) -> Self {
        self.client = impairment;
        self
    }

    pub fn with_server(mut self, impairment: Impairment) -> Self {
        self.server = impairment;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    delayed: AtomicU64,
}

/// Datagram totals since the proxy started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub delayed: u64,
}

/// Cloneable control handle for a running [`Proxy`].
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    sides: Arc<Mutex<Sides>>,
    counters: Arc<Counters>,
}

impl ProxyHandle {
    pub fn set_client(&self, impairment: Impairment) {
        self.sides.lock().unwrap_or_else(PoisonError::into_inner).client = impairment;
    }

    pub fn set_server(&self, impairment: Impairment) {
        self.sides.lock().unwrap_or_else(PoisonError::into_inner).server = impairment;
    }

    pub fn client(&self) -> Impairment {
        self.sides.lock().unwrap_or_else(PoisonError::into_inner).client
    }

    pub fn server(&self) -> Impairment {
        self.sides.lock().unwrap_or_else(PoisonError::into_inner).server
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delayed: self.counters.delayed.load(Ordering::Relaxed),
        }
    }
}

/// What happens to one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Forward,
    Drop,
    Delay(Duration),
}

pub struct Proxy {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    client: Option<SocketAddr>,
    rng: StdRng,
    handle: ProxyHandle,
}

impl Proxy {
    pub async fn bind(config: ProxyConfig) -> Result<Self, ProxyError> {
        let socket = UdpSocket::bind(config.listen).await?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            socket: Arc::new(socket),
            target: config.target,
            client: None,
            rng,
            handle: ProxyHandle {
                sides: Arc::new(Mutex::new(Sides {
                    client: config.client,
                    server: config.server,
                })),
                counters: Arc::new(Counters::default()),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn handle(&self) -> ProxyHandle {
        self.handle.clone()
    }

    /// Relay datagrams until an I/O error occurs.
    pub async fn run(mut self) -> Result<(), ProxyError> {
        log::info!(
            "[proxy] {} → {} (client side {:?}, server side {:?})",
            self.local_addr()?,
            self.target,
            self.handle.client(),
            self.handle.server()
        );
        let mut buf = vec![0u8; DEFAULT_BUFFER];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            self.relay(buf[..n].to_vec(), from).await?;
        }
    }

    /// Run on a background task.
    pub fn spawn(self) -> JoinHandle<Result<(), ProxyError>> {
        tokio::spawn(async move {
            let result = self.run().await;
            if let Err(e) = &result {
                log::error!("[proxy] stopped: {e}");
            }
            result
        })
    }

    async fn relay(&mut self, datagram: Vec<u8>, from: SocketAddr) -> Result<(), ProxyError> {
        let sides = *self.handle.sides.lock().unwrap_or_else(PoisonError::into_inner);
        let (dest, impairment) = if from == self.target {
            match self.client {
                Some(client) => (client, sides.server),
                None => {
                    log::debug!("[proxy] no client yet; dropping server datagram");
                    return Ok(());
                }
            }
        } else {
            self.client = Some(from);
            (self.target, sides.client)
        };

        let fate = self.decide(impairment);
        let counters = &self.handle.counters;
        match fate {
            Fate::Drop => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("[proxy] ✗ {from} → {dest} ({} bytes)", datagram.len());
            }
            Fate::Delay(delay) => {
                counters.delayed.fetch_add(1, Ordering::Relaxed);
                log::debug!("[proxy] ⏳ {from} → {dest} after {delay:?}");
                let socket = Arc::clone(&self.socket);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = socket.send_to(&datagram, dest).await {
                        log::warn!("[proxy] delayed send to {dest} failed: {e}");
                    }
                });
            }
            Fate::Forward => {
                counters.forwarded.fetch_add(1, Ordering::Relaxed);
                self.socket.send_to(&datagram, dest).await?;
            }
        }
        Ok(())
    }

    fn decide(&mut self, impairment: Impairment) -> Fate {
        if self.rng.random_range(0..100u8) < impairment.drop_percent {
            Fate::Drop
        } else if self.rng.random_range(0..100u8) < impairment.delay_percent {
            Fate::Delay(impairment.delay)
        } else {
            Fate::Forward
        }
    }
}
