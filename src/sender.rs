//! Reliable stop-and-wait send.
//!
//! A message travels as its own session: the first chunk carries `syn`, the
//! last carries `fin`, and every chunk's `seq_num` is the session identifier
//! plus the chunk's byte offset.  Exactly one chunk is in flight at a time.
//!
//! ```text
//!  SEND_DATA ──▶ WAIT_ACK ──ack──▶ SEND_DATA        (next chunk)
//!      ▲            │  ├──────────▶ WAIT_ACK         (stale / foreign / awaiting FIN)
//!      └──timeout───┘  └─FIN──────▶ SEND_ACK ──▶ TIME_WAIT ──▶ EXIT
//!                                       ▲            │
//!                                       └─dup FIN────┘
//! ```
//!
//! Once the last chunk is acknowledged the receiver closes the session with
//! its own FIN.  The sender acknowledges it and lingers briefly so that a
//! lost ACK can be repeated.  A FIN that never shows up does not fail the
//! send; the data was already acknowledged.

use std::net::SocketAddr;
use std::ops::Range;
use std::time::Duration;

use tokio::time::Instant;

use crate::connection::{ConnError, Connection, Link};
use crate::fsm::{BoxFuture, FsmError, Machine, MachineState, Step, Transition};
use crate::packet::{flags, Packet};
use crate::session::SessionState;
use crate::socket::Recv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Start,
    SendData,
    WaitAck,
    SendAck,
    TimeWait,
    Exit,
}

impl MachineState for SendState {
    const START: Self = SendState::Start;
    const EXIT: Self = SendState::Exit;
}

/// Value carried between send steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Progress {
    /// The current chunk has not been sent yet.
    #[default]
    Fresh,
    /// The current chunk timed out and goes out again.
    Retransmit { first_sent: Instant },
    /// The current chunk is on the wire.
    InFlight { first_sent: Instant, sent_at: Instant },
    /// Every chunk is acknowledged; waiting for the receiver's FIN.
    AwaitFin { since: Instant },
    /// The receiver's FIN arrived with this sequence number.
    PeerFin { seq: u16 },
    /// Re-acknowledging duplicate FINs until `until`.
    Lingering { until: Instant, fin_seq: u16 },
    Delivered,
}

struct SendCtx {
    link: Link,
    session: SessionState,
    peer: SocketAddr,
    message: Vec<u8>,
    chunks: Vec<Range<usize>>,
    index: usize,
    disconnect: Duration,
    linger: Duration,
}

impl SendCtx {
    fn chunk(&self) -> Range<usize> {
        self.chunks[self.index].clone()
    }

    fn all_acked(&self) -> bool {
        self.index == self.chunks.len()
    }
}

type Outcome<'a> = BoxFuture<'a, Result<Step<SendState, Progress>, ConnError>>;

/// Byte ranges of each chunk.  An empty message is one empty chunk.
fn chunk_ranges(len: usize, chunk_size: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return vec![0..0];
    }
    (0..len)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(len))
        .collect()
}

impl Connection {
    /// Deliver `message` to the peer, blocking until every chunk is
    /// acknowledged.
    ///
    /// Fails with [`ConnError::DisconnectTimeout`] if one chunk stays
    /// unacknowledged for longer than the disconnect timeout, and with
    /// [`ConnError::Reset`] if the peer rejects the session.
    pub async fn send(&mut self, message: &[u8]) -> Result<(), ConnError> {
        let peer = self.peer_addr().ok_or(ConnError::NotConnected)?;
        let machine: Machine<SendCtx, SendState, Progress, ConnError> = Machine::new(
            "send",
            vec![
                Transition::new(SendState::Start, SendState::SendData, send_data),
                Transition::new(SendState::SendData, SendState::WaitAck, wait_ack),
                Transition::new(SendState::WaitAck, SendState::SendData, send_data),
                Transition::new(SendState::WaitAck, SendState::WaitAck, wait_ack),
                Transition::new(SendState::WaitAck, SendState::SendAck, send_ack),
                Transition::new(SendState::SendAck, SendState::TimeWait, time_wait),
                Transition::new(SendState::TimeWait, SendState::SendAck, send_ack),
                Transition::new(SendState::TimeWait, SendState::TimeWait, time_wait),
            ],
        )?;

        let config = *self.config();
        let mut ctx = SendCtx {
            link: self.take_link(),
            session: SessionState::new(Some(peer), &config),
            peer,
            message: message.to_vec(),
            chunks: chunk_ranges(message.len(), config.chunk_size),
            index: 0,
            disconnect: config.disconnect_timeout,
            linger: config.linger,
        };
        log::debug!(
            "[send] {} byte(s) in {} chunk(s) to {peer} (id {})",
            message.len(),
            ctx.chunks.len(),
            ctx.session.random_number
        );

        let outcome = machine.run(&mut ctx, SendState::SendData, Progress::Fresh).await;
        ctx.link.flush();
        self.restore_link(ctx.link);
        match outcome? {
            Progress::Delivered => Ok(()),
            other => Err(FsmError::unexpected("send", SendState::Exit, other).into()),
        }
    }
}

fn send_data(ctx: &mut SendCtx, data: Progress) -> Outcome<'_> {
    Box::pin(async move {
        let first_sent = match data {
            Progress::Fresh => Instant::now(),
            Progress::Retransmit { first_sent } => first_sent,
            other => return Err(FsmError::unexpected("send", SendState::SendData, other).into()),
        };
        let chunk = ctx.chunk();
        let mut bits = 0;
        if ctx.index == 0 {
            bits |= flags::SYN;
        }
        if ctx.index + 1 == ctx.chunks.len() {
            bits |= flags::FIN;
        }
        let seq = ctx.session.seq_at(ctx.session.message_pointer());
        let segment = Packet::segment(u32::from(seq), 0, bits).with_payload(&ctx.message[chunk]);
        ctx.link.send(&segment, ctx.peer).await?;
        Ok(Step::with(
            SendState::WaitAck,
            Progress::InFlight {
                first_sent,
                sent_at: Instant::now(),
            },
        ))
    })
}

fn wait_ack(ctx: &mut SendCtx, data: Progress) -> Outcome<'_> {
    Box::pin(async move {
        match data {
            Progress::InFlight { first_sent, sent_at } => on_chunk_reply(ctx, first_sent, sent_at).await,
            Progress::AwaitFin { since } => on_fin_wait(ctx, since).await,
            other => Err(FsmError::unexpected("send", SendState::WaitAck, other).into()),
        }
    })
}

async fn on_chunk_reply(
    ctx: &mut SendCtx,
    first_sent: Instant,
    sent_at: Instant,
) -> Result<Step<SendState, Progress>, ConnError> {
    let in_flight = Progress::InFlight { first_sent, sent_at };
    let waited = first_sent.elapsed();
    if waited >= ctx.disconnect {
        log::warn!("[send] chunk {} unacknowledged for {waited:?}; giving up", ctx.index);
        return Err(ConnError::DisconnectTimeout(ctx.disconnect));
    }
    let wait = ctx
        .session
        .retransmit_timer
        .current()
        .saturating_sub(sent_at.elapsed())
        .min(ctx.disconnect - waited);

    let (packet, addr) = match ctx.link.recv(Some(wait)).await? {
        Recv::Datagram(packet, addr) => (packet, addr),
        Recv::TimedOut => {
            ctx.session.retransmit_timer.back_off();
            log::debug!(
                "[send] timeout on chunk {}; rto now {:?}",
                ctx.index,
                ctx.session.retransmit_timer.current()
            );
            return Ok(Step::with(SendState::SendData, Progress::Retransmit { first_sent }));
        }
    };
    if addr != ctx.peer {
        log::debug!("[send] ignoring datagram from foreign {addr}");
        return Ok(Step::with(SendState::WaitAck, in_flight));
    }
    if packet.rst() {
        log::warn!("[send] session rejected by {addr}");
        return Err(ConnError::Reset);
    }

    let chunk = ctx.chunk();
    let expected = ctx.session.seq_at(ctx.session.message_pointer() + chunk.len());
    if !packet.ack() || packet.ack_num() != expected {
        log::debug!("[send] stale reply {packet}; expected ack {expected}");
        return Ok(Step::with(SendState::WaitAck, in_flight));
    }

    ctx.session.retransmit_timer.record_rtt_sample(sent_at.elapsed());
    ctx.session.advance(chunk.len());
    ctx.index += 1;

    if !ctx.all_acked() {
        return Ok(Step::to(SendState::SendData));
    }
    if packet.fin() {
        return Ok(Step::with(SendState::SendAck, Progress::PeerFin { seq: packet.seq_num() }));
    }
    Ok(Step::with(SendState::WaitAck, Progress::AwaitFin { since: Instant::now() }))
}

async fn on_fin_wait(ctx: &mut SendCtx, since: Instant) -> Result<Step<SendState, Progress>, ConnError> {
    let waited = since.elapsed();
    if waited >= ctx.disconnect {
        log::warn!("[send] no FIN from {} after delivery; closing anyway", ctx.peer);
        return Ok(Step::with(SendState::Exit, Progress::Delivered));
    }
    let wait = ctx
        .session
        .retransmit_timer
        .current()
        .min(ctx.disconnect - waited);
    let awaiting = Progress::AwaitFin { since };

    let (packet, addr) = match ctx.link.recv(Some(wait)).await? {
        Recv::Datagram(packet, addr) => (packet, addr),
        Recv::TimedOut => return Ok(Step::with(SendState::WaitAck, awaiting)),
    };
    let end = ctx.session.seq_at(ctx.session.message_pointer());
    if addr == ctx.peer && packet.fin() && packet.ack() && packet.ack_num() == end {
        Ok(Step::with(SendState::SendAck, Progress::PeerFin { seq: packet.seq_num() }))
    } else {
        Ok(Step::with(SendState::WaitAck, awaiting))
    }
}

fn send_ack(ctx: &mut SendCtx, data: Progress) -> Outcome<'_> {
    Box::pin(async move {
        let (fin_seq, until) = match data {
            Progress::PeerFin { seq } => (seq, Instant::now() + ctx.linger),
            Progress::Lingering { until, fin_seq } => (fin_seq, until),
            other => return Err(FsmError::unexpected("send", SendState::SendAck, other).into()),
        };
        let seq = ctx.session.seq_at(ctx.session.message_pointer());
        let ack = Packet::segment(u32::from(seq), u32::from(fin_seq.wrapping_add(1)), flags::ACK);
        ctx.link.send(&ack, ctx.peer).await?;
        Ok(Step::with(SendState::TimeWait, Progress::Lingering { until, fin_seq }))
    })
}

fn time_wait(ctx: &mut SendCtx, data: Progress) -> Outcome<'_> {
    Box::pin(async move {
        let Progress::Lingering { until, fin_seq } = data else {
            return Err(FsmError::unexpected("send", SendState::TimeWait, data).into());
        };
        let left = until.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(Step::with(SendState::Exit, Progress::Delivered));
        }
        match ctx.link.recv(Some(left)).await? {
            Recv::TimedOut => Ok(Step::with(SendState::Exit, Progress::Delivered)),
            Recv::Datagram(packet, addr) if addr == ctx.peer && packet.fin() && packet.seq_num() == fin_seq => {
                log::debug!("[send] FIN repeated; re-acknowledging");
                Ok(Step::with(SendState::SendAck, data))
            }
            Recv::Datagram(..) => Ok(Step::with(SendState::TimeWait, data)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_message() {
        assert_eq!(chunk_ranges(5, 2), vec![0..2, 2..4, 4..5]);
        assert_eq!(chunk_ranges(4, 2), vec![0..2, 2..4]);
        assert_eq!(chunk_ranges(3, 1), vec![0..1, 1..2, 2..3]);
        assert_eq!(chunk_ranges(3, 10), vec![0..3]);
    }

    #[test]
    fn empty_message_is_one_empty_chunk() {
        assert_eq!(chunk_ranges(0, 1), vec![0..0]);
    }
}
