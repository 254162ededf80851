//! Active close.
//!
//! ```text
//!  SEND_FIN ──▶ WAIT_ACK ──ack──▶ WAIT_FIN ──FIN──▶ SEND_ACK ──▶ CLEAN_UP
//!     ▲            │  └──FIN+ACK────────────────────▲              ▲
//!     └──timeout───┘                                               │
//!                  └──retries or time exhausted────────────────────┘
//! ```
//!
//! Closing never fails because the peer went quiet: once the retry rounds or
//! the disconnect timeout run out, the socket is released anyway.  The
//! passive side of this exchange lives in [`crate::receiver`].

use std::net::SocketAddr;

use tokio::time::Instant;

use crate::connection::{ConnError, Connection, Link};
use crate::fsm::{BoxFuture, FsmError, Machine, MachineState, Step, Transition};
use crate::packet::{flags, Packet};
use crate::session::{seq_ge, SessionState};
use crate::socket::Recv;
use crate::timer::Budget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Start,
    SendFin,
    WaitAck,
    WaitFin,
    SendAck,
    CleanUp,
    Exit,
}

impl MachineState for CloseState {
    const START: Self = CloseState::Start;
    const EXIT: Self = CloseState::Exit;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Closing {
    #[default]
    Idle,
    FinSent { sent_at: Instant },
    PeerFin { seq: u16 },
    Released,
}

struct CloseCtx {
    link: Link,
    session: SessionState,
    peer: SocketAddr,
    fin_seq: u16,
    peer_seq: u16,
    budget: Budget,
    rounds: u32,
    max_fin_retries: u32,
}

impl CloseCtx {
    fn out_of_rounds(&self) -> bool {
        self.rounds > self.max_fin_retries
    }
}

type Outcome<'a> = BoxFuture<'a, Result<Step<CloseState, Closing>, ConnError>>;

impl Connection {
    /// Tear the connection down and release the socket.
    ///
    /// Only I/O failures are reported; an unresponsive peer just makes the
    /// call take up to the disconnect timeout.
    pub async fn close(mut self) -> Result<(), ConnError> {
        let Some(peer) = self.peer_addr() else {
            log::debug!("[close] no peer; releasing socket");
            return Ok(());
        };
        let machine: Machine<CloseCtx, CloseState, Closing, ConnError> = Machine::new(
            "close",
            vec![
                Transition::new(CloseState::Start, CloseState::SendFin, send_fin),
                Transition::new(CloseState::SendFin, CloseState::WaitAck, wait_ack),
                Transition::new(CloseState::WaitAck, CloseState::SendFin, send_fin),
                Transition::new(CloseState::WaitAck, CloseState::WaitAck, wait_ack),
                Transition::new(CloseState::WaitAck, CloseState::WaitFin, wait_fin),
                Transition::new(CloseState::WaitAck, CloseState::SendAck, send_ack),
                Transition::new(CloseState::WaitAck, CloseState::CleanUp, clean_up),
                Transition::new(CloseState::WaitFin, CloseState::WaitFin, wait_fin),
                Transition::new(CloseState::WaitFin, CloseState::SendAck, send_ack),
                Transition::new(CloseState::WaitFin, CloseState::CleanUp, clean_up),
                Transition::new(CloseState::SendAck, CloseState::CleanUp, clean_up),
            ],
        )?;

        let config = *self.config();
        let mut ctx = CloseCtx {
            link: self.take_link(),
            session: SessionState::new(Some(peer), &config),
            peer,
            fin_seq: self.local_seq(),
            peer_seq: self.peer_seq(),
            budget: Budget::start(config.disconnect_timeout),
            rounds: 0,
            max_fin_retries: config.max_fin_retries,
        };
        log::info!("[close] closing connection to {peer}");

        match machine.run(&mut ctx, CloseState::SendFin, Closing::Idle).await? {
            Closing::Released => Ok(()),
            other => Err(FsmError::unexpected("close", CloseState::Exit, other).into()),
        }
    }
}

fn send_fin(ctx: &mut CloseCtx, _data: Closing) -> Outcome<'_> {
    Box::pin(async move {
        ctx.rounds += 1;
        let fin = Packet::segment(u32::from(ctx.fin_seq), u32::from(ctx.peer_seq), flags::FIN);
        ctx.link.send(&fin, ctx.peer).await?;
        Ok(Step::with(
            CloseState::WaitAck,
            Closing::FinSent {
                sent_at: Instant::now(),
            },
        ))
    })
}

fn wait_ack(ctx: &mut CloseCtx, data: Closing) -> Outcome<'_> {
    Box::pin(async move {
        let Closing::FinSent { sent_at } = data else {
            return Err(FsmError::unexpected("close", CloseState::WaitAck, data).into());
        };
        if ctx.budget.expired() {
            log::warn!("[close] no answer from {} within {:?}; force-closing", ctx.peer, ctx.budget.limit());
            return Ok(Step::to(CloseState::CleanUp));
        }
        let rto = ctx.session.retransmit_timer.current();
        let wait = ctx.budget.clamp(rto.saturating_sub(sent_at.elapsed()));

        let (packet, addr) = match ctx.link.recv(Some(wait)).await? {
            Recv::Datagram(packet, addr) => (packet, addr),
            Recv::TimedOut if ctx.out_of_rounds() => {
                log::warn!("[close] FIN not acknowledged after {} round(s); force-closing", ctx.rounds);
                return Ok(Step::to(CloseState::CleanUp));
            }
            Recv::TimedOut => {
                ctx.session.retransmit_timer.back_off();
                return Ok(Step::to(CloseState::SendFin));
            }
        };
        if addr != ctx.peer {
            return Ok(Step::with(CloseState::WaitAck, data));
        }
        let covers_fin = packet.ack() && seq_ge(packet.ack_num(), ctx.fin_seq.wrapping_add(1));
        match (covers_fin, packet.fin()) {
            (_, true) => {
                Ok(Step::with(CloseState::SendAck, Closing::PeerFin { seq: packet.seq_num() }))
            }
            (true, false) => Ok(Step::to(CloseState::WaitFin)),
            (false, false) => Ok(Step::with(CloseState::WaitAck, data)),
        }
    })
}

fn wait_fin(ctx: &mut CloseCtx, _data: Closing) -> Outcome<'_> {
    Box::pin(async move {
        if ctx.budget.expired() || ctx.out_of_rounds() {
            log::debug!("[close] peer FIN never came");
            return Ok(Step::to(CloseState::CleanUp));
        }
        let wait = ctx.budget.clamp(ctx.session.retransmit_timer.current());
        match ctx.link.recv(Some(wait)).await? {
            Recv::Datagram(packet, addr) if addr == ctx.peer && packet.fin() => {
                Ok(Step::with(CloseState::SendAck, Closing::PeerFin { seq: packet.seq_num() }))
            }
            Recv::Datagram(..) => Ok(Step::to(CloseState::WaitFin)),
            Recv::TimedOut => {
                ctx.rounds += 1;
                ctx.session.retransmit_timer.back_off();
                Ok(Step::to(CloseState::WaitFin))
            }
        }
    })
}

fn send_ack(ctx: &mut CloseCtx, data: Closing) -> Outcome<'_> {
    Box::pin(async move {
        let Closing::PeerFin { seq } = data else {
            return Err(FsmError::unexpected("close", CloseState::SendAck, data).into());
        };
        let ack = Packet::segment(
            u32::from(ctx.fin_seq.wrapping_add(1)),
            u32::from(seq.wrapping_add(1)),
            flags::ACK,
        );
        ctx.link.send(&ack, ctx.peer).await?;
        Ok(Step::to(CloseState::CleanUp))
    })
}

fn clean_up(ctx: &mut CloseCtx, _data: Closing) -> Outcome<'_> {
    Box::pin(async move {
        ctx.link.flush();
        log::debug!("[close] released after {:?}", ctx.budget.elapsed());
        Ok(Step::with(CloseState::Exit, Closing::Released))
    })
}
