//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Packet`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.
//!
//! A wait that runs out is not an error: [`Socket::recv_timeout`] reports it
//! as [`Recv::TimedOut`] so callers can retransmit, while genuine I/O
//! failures surface as [`SocketError`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::Packet;

/// Default receive buffer size.
pub const DEFAULT_BUFFER: usize = 1024;

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a bounded wait for a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    Datagram(Packet, SocketAddr),
    TimedOut,
}

/// An async, packet-oriented UDP socket.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    buffer_size: usize,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        Self::bind_with_buffer(local_addr, DEFAULT_BUFFER).await
    }

    /// Bind with a specific receive buffer size.
    pub async fn bind_with_buffer(local_addr: SocketAddr, buffer_size: usize) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner,
            buffer_size,
        })
    }

    /// Encode `packet` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        self.inner.send_to(&packet.encode(), dest).await?;
        Ok(())
    }

    /// Wait for the next datagram without a time limit.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        let mut buf = vec![0u8; self.buffer_size];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        Ok((Packet::decode(&buf[..n]), addr))
    }

    /// Wait at most `wait` for the next datagram.
    pub async fn recv_timeout(&self, wait: Duration) -> Result<Recv, SocketError> {
        match tokio::time::timeout(wait, self.recv_from()).await {
            Ok(Ok((packet, addr))) => Ok(Recv::Datagram(packet, addr)),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(Recv::TimedOut),
        }
    }

    /// Discard every datagram already queued on the socket.
    ///
    /// Returns how many were thrown away.
    pub fn drain(&self) -> usize {
        let mut buf = vec![0u8; self.buffer_size];
        let mut dropped = 0;
        loop {
            match self.inner.try_recv_from(&mut buf) {
                Ok(_) => dropped += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("[socket] drain stopped: {e}");
                    break;
                }
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;

    async fn loopback() -> Socket {
        Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn send_and_receive_packet() {
        let a = loopback().await;
        let b = loopback().await;
        let pkt = Packet::segment(7, 8, flags::SYN).with_payload(b"hi".to_vec());
        a.send_to(&pkt, b.local_addr).await.unwrap();
        let (got, from) = b.recv_from().await.unwrap();
        assert_eq!(got, pkt);
        assert_eq!(from, a.local_addr);
    }

    #[tokio::test]
    async fn silent_wait_times_out() {
        let a = loopback().await;
        let out = a.recv_timeout(Duration::from_millis(20)).await.unwrap();
        assert_eq!(out, Recv::TimedOut);
    }

    #[tokio::test]
    async fn drain_discards_queued_datagrams() {
        let a = loopback().await;
        let b = loopback().await;
        for i in 0..3 {
            a.send_to(&Packet::segment(i, 0, 0), b.local_addr).await.unwrap();
        }
        // Give the kernel a moment to queue all three.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.drain(), 3);
        assert_eq!(
            b.recv_timeout(Duration::from_millis(20)).await.unwrap(),
            Recv::TimedOut
        );
    }
}
