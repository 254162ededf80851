//! Reliable receive.
//!
//! ```text
//!  RECEIVE_DATA ──▶ SEND_ACK ──▶ RECEIVE_DATA          (more to come)
//!                      │
//!                      └──final──▶ SEND_FIN ──▶ WAIT_ACK ──▶ EXIT
//!                                     ▲            │
//!                                     └──timeout───┤
//!                      SEND_ACK ◀──peer repeats────┘
//! ```
//!
//! Once a handshake has bound a peer, datagrams from any other address are
//! dropped, and a SYN among them is answered with RST.
//!
//! A segment with `syn` set opens a session and fixes its base; a segment
//! is in order when its offset from the base equals the bytes received so
//! far.  Anything else is answered with the unchanged cumulative ACK, so
//! duplicates are never appended twice.
//!
//! Once the final segment is in, the receiver closes the session with its
//! own FIN and waits, a bounded number of rounds, for it to be acknowledged.
//! The same closing exchange answers a bare FIN from the connected peer, in
//! which case [`Connection::recv`] reports that the peer has gone.

use std::net::SocketAddr;

use tokio::time::Instant;

use crate::connection::{ConnError, Connection, Link};
use crate::fsm::{BoxFuture, FsmError, Machine, MachineState, Step, Transition};
use crate::packet::{flags, Packet};
use crate::session::SessionState;
use crate::socket::Recv;
use crate::state::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Start,
    ReceiveData,
    SendAck,
    SendFin,
    WaitAck,
    Exit,
}

impl MachineState for RecvState {
    const START: Self = RecvState::Start;
    const EXIT: Self = RecvState::Exit;
}

/// Value carried between receive steps.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Inbound {
    /// Bytes of the current session received so far.
    Receiving(Vec<u8>),
    /// The session is over: a complete message, or `None` if the peer closed.
    Finished(Option<Vec<u8>>),
    /// Our FIN is on the wire.
    Closing {
        outcome: Option<Vec<u8>>,
        sent_at: Instant,
    },
}

impl Default for Inbound {
    fn default() -> Self {
        Inbound::Receiving(Vec::new())
    }
}

struct RecvCtx {
    link: Link,
    session: SessionState,
    /// Peer agreed on by the handshake, if any.
    bound_peer: Option<SocketAddr>,
    prev_random_number: Option<u16>,
    /// Value for the next ACK we send.
    ack_value: u16,
    fin_rounds: u32,
    max_fin_retries: u32,
}

impl RecvCtx {
    fn is_bound_peer(&self, addr: SocketAddr) -> bool {
        self.bound_peer.map_or(true, |peer| peer == addr)
    }
}

type Outcome<'a> = BoxFuture<'a, Result<Step<RecvState, Inbound>, ConnError>>;

fn stay(message: Vec<u8>) -> Result<Step<RecvState, Inbound>, ConnError> {
    Ok(Step::with(RecvState::ReceiveData, Inbound::Receiving(message)))
}

/// `syn`, `ack` and payload all absent: a request to end the connection.
fn is_bare_fin(packet: &Packet) -> bool {
    packet.fin() && !packet.syn() && !packet.ack() && packet.payload.is_empty()
}

impl Connection {
    /// Receive one complete message.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        let machine: Machine<RecvCtx, RecvState, Inbound, ConnError> = Machine::new(
            "recv",
            vec![
                Transition::new(RecvState::Start, RecvState::ReceiveData, receive_data),
                Transition::new(RecvState::ReceiveData, RecvState::ReceiveData, receive_data),
                Transition::new(RecvState::ReceiveData, RecvState::SendAck, send_ack),
                Transition::new(RecvState::SendAck, RecvState::ReceiveData, receive_data),
                Transition::new(RecvState::SendAck, RecvState::SendFin, send_fin),
                Transition::new(RecvState::SendFin, RecvState::WaitAck, wait_ack),
                Transition::new(RecvState::WaitAck, RecvState::WaitAck, wait_ack),
                Transition::new(RecvState::WaitAck, RecvState::SendFin, send_fin),
                Transition::new(RecvState::WaitAck, RecvState::SendAck, send_ack),
            ],
        )?;

        let config = *self.config();
        let mut ctx = RecvCtx {
            link: self.take_link(),
            session: SessionState::new(None, &config),
            bound_peer: self.peer_addr(),
            prev_random_number: self.prev_random_number(),
            ack_value: 0,
            fin_rounds: 0,
            max_fin_retries: config.max_fin_retries,
        };

        let outcome = machine
            .run(&mut ctx, RecvState::ReceiveData, Inbound::default())
            .await;
        ctx.link.flush();
        self.restore_link(ctx.link);
        match outcome? {
            Inbound::Finished(Some(message)) => {
                if let Some(base) = ctx.session.peer_base {
                    self.remember_session(base);
                }
                log::debug!("[recv] message of {} byte(s) complete", message.len());
                Ok(Some(message))
            }
            Inbound::Finished(None) => {
                log::info!("[recv] peer closed the connection");
                self.state = ConnectionState::Closed;
                Ok(None)
            }
            other => Err(FsmError::unexpected("recv", RecvState::Exit, other).into()),
        }
    }
}

fn receive_data(ctx: &mut RecvCtx, data: Inbound) -> Outcome<'_> {
    Box::pin(async move {
        let mut message = match data {
            Inbound::Receiving(message) => message,
            other => return Err(FsmError::unexpected("recv", RecvState::ReceiveData, other).into()),
        };
        let (packet, addr) = match ctx.link.recv(None).await? {
            Recv::Datagram(packet, addr) => (packet, addr),
            Recv::TimedOut => return stay(message),
        };

        if packet.rst() || packet.ack() {
            return stay(message);
        }

        if !ctx.is_bound_peer(addr) {
            if packet.syn() {
                log::debug!("[recv] rejecting SYN from {addr}; connected to another peer");
                reset(ctx, packet.seq_num(), addr).await?;
            } else {
                log::debug!("[recv] ignoring {packet} from foreign {addr}");
            }
            return stay(message);
        }

        if packet.syn() {
            let base = packet.seq_num();
            let current = ctx.session.peer_base == Some(base) && ctx.session.is_peer(addr);
            if !current {
                if ctx.prev_random_number == Some(base) {
                    log::debug!("[recv] ignoring SYN of finished session {base} from {addr}");
                    return stay(message);
                }
                if ctx.session.peer_base.is_some() && !ctx.session.is_peer(addr) {
                    log::debug!("[recv] rejecting SYN from {addr}; session in progress");
                    reset(ctx, base, addr).await?;
                    return stay(message);
                }
                log::debug!("[recv] new session {base} from {addr}");
                ctx.session.adopt_peer(addr, base);
                message.clear();
            }
        } else if ctx.session.peer_base.is_none() {
            if is_bare_fin(&packet) {
                ctx.session.peer = Some(addr);
                ctx.ack_value = packet.seq_num().wrapping_add(1);
                return Ok(Step::with(RecvState::SendAck, Inbound::Finished(None)));
            }
            log::debug!("[recv] ignoring {packet} from {addr} outside a session");
            return stay(message);
        } else if !ctx.session.is_peer(addr) {
            log::debug!("[recv] ignoring {packet} from foreign {addr}");
            return stay(message);
        }

        if ctx.session.peer_offset(packet.seq_num()) == Some(ctx.session.wrapped_pointer()) {
            message.extend_from_slice(&packet.payload);
            ctx.session.advance(packet.payload.len());
            ctx.ack_value = ctx.session.peer_ack().unwrap_or_default();
            if packet.fin() {
                return Ok(Step::with(RecvState::SendAck, Inbound::Finished(Some(message))));
            }
        } else {
            log::debug!("[recv] out-of-order {packet}; repeating ack");
            ctx.ack_value = ctx.session.peer_ack().unwrap_or_default();
        }
        Ok(Step::with(RecvState::SendAck, Inbound::Receiving(message)))
    })
}

/// Refuse a SYN from `addr` with a bare RST acknowledging its base.
async fn reset(ctx: &mut RecvCtx, base: u16, addr: SocketAddr) -> Result<(), ConnError> {
    let rst = Packet::segment(u32::from(ctx.session.random_number), u32::from(base), flags::RST);
    ctx.link.send(&rst, addr).await?;
    Ok(())
}

fn send_ack(ctx: &mut RecvCtx, data: Inbound) -> Outcome<'_> {
    Box::pin(async move {
        let Some(peer) = ctx.session.peer else {
            return Err(FsmError::unexpected("recv", RecvState::SendAck, data).into());
        };
        let ack = Packet::segment(
            u32::from(ctx.session.random_number),
            u32::from(ctx.ack_value),
            flags::ACK,
        );
        ctx.link.send(&ack, peer).await?;
        match data {
            Inbound::Receiving(_) => Ok(Step::with(RecvState::ReceiveData, data)),
            Inbound::Finished(_) => Ok(Step::with(RecvState::SendFin, data)),
            other => Err(FsmError::unexpected("recv", RecvState::SendAck, other).into()),
        }
    })
}

fn send_fin(ctx: &mut RecvCtx, data: Inbound) -> Outcome<'_> {
    Box::pin(async move {
        let (Inbound::Finished(outcome), Some(peer)) = (data, ctx.session.peer) else {
            return Err(FsmError::unexpected("recv", RecvState::SendFin, "no finished session").into());
        };
        ctx.fin_rounds += 1;
        let fin = Packet::segment(
            u32::from(ctx.session.random_number),
            u32::from(ctx.ack_value),
            flags::FIN | flags::ACK,
        );
        ctx.link.send(&fin, peer).await?;
        Ok(Step::with(
            RecvState::WaitAck,
            Inbound::Closing {
                outcome,
                sent_at: Instant::now(),
            },
        ))
    })
}

fn wait_ack(ctx: &mut RecvCtx, data: Inbound) -> Outcome<'_> {
    Box::pin(async move {
        let (Inbound::Closing { outcome, sent_at }, Some(peer)) = (data, ctx.session.peer) else {
            return Err(FsmError::unexpected("recv", RecvState::WaitAck, "no FIN in flight").into());
        };
        let wait = ctx
            .session
            .retransmit_timer
            .current()
            .saturating_sub(sent_at.elapsed());

        let (packet, addr) = match ctx.link.recv(Some(wait)).await? {
            Recv::Datagram(packet, addr) => (packet, addr),
            Recv::TimedOut if ctx.fin_rounds > ctx.max_fin_retries => {
                log::warn!("[recv] FIN to {peer} never acknowledged; closing anyway");
                return Ok(Step::with(RecvState::Exit, Inbound::Finished(outcome)));
            }
            Recv::TimedOut => {
                ctx.session.retransmit_timer.back_off();
                return Ok(Step::with(RecvState::SendFin, Inbound::Finished(outcome)));
            }
        };
        if addr != peer {
            return Ok(Step::with(RecvState::WaitAck, Inbound::Closing { outcome, sent_at }));
        }

        let fin_ack = ctx.session.random_number.wrapping_add(1);
        if packet.ack() && packet.ack_num() == fin_ack {
            return Ok(Step::with(RecvState::Exit, Inbound::Finished(outcome)));
        }
        let moved_on = (packet.syn() && ctx.session.peer_base != Some(packet.seq_num()))
            || (is_bare_fin(&packet) && outcome.is_some());
        if moved_on {
            // The peer already started its next session or is closing.
            log::debug!("[recv] {packet} while closing; keeping it for the next receive");
            ctx.link.push_back(packet, addr);
            return Ok(Step::with(RecvState::Exit, Inbound::Finished(outcome)));
        }
        if !packet.ack() && (packet.fin() || packet.syn() || !packet.payload.is_empty()) {
            log::debug!("[recv] peer repeated {packet}; acknowledging again");
            return Ok(Step::with(RecvState::SendAck, Inbound::Finished(outcome)));
        }
        Ok(Step::with(RecvState::WaitAck, Inbound::Closing { outcome, sent_at }))
    })
}
