//! Three-way handshake.
//!
//! ```text
//!  connect:  SEND_SYN ──▶ WAIT_SYN_ACK ──▶ SEND_ACK ──▶ EXIT
//!                ▲              │
//!                └──timeout─────┘
//!
//!  accept:   WAIT_SYN ──▶ SEND_SYN_ACK ──▶ WAIT_ACK ──▶ EXIT
//!                               ▲              │
//!                               └──timeout─────┘
//! ```
//!
//! Both sides pick a random identifier; the SYN consumes one sequence
//! number, so after the handshake each side's next sequence number is its
//! identifier plus one.  Retransmissions are bounded by the disconnect
//! timeout.

use std::net::SocketAddr;

use crate::config::TransportConfig;
use crate::connection::{ConnError, Connection, Link};
use crate::fsm::{BoxFuture, FsmError, Machine, MachineState, Step, Transition};
use crate::packet::{flags, Packet};
use crate::session::{seq_ge, SessionState};
use crate::socket::Recv;
use crate::state::ConnectionState;
use crate::timer::Budget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectState {
    Start,
    SendSyn,
    WaitSynAck,
    SendAck,
    Exit,
}

impl MachineState for ConnectState {
    const START: Self = ConnectState::Start;
    const EXIT: Self = ConnectState::Exit;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptState {
    Start,
    WaitSyn,
    SendSynAck,
    WaitAck,
    Exit,
}

impl MachineState for AcceptState {
    const START: Self = AcceptState::Start;
    const EXIT: Self = AcceptState::Exit;
}

/// Value carried between handshake steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Handshake {
    #[default]
    Idle,
    /// The peer's identifier, learned from its SYN or SYN-ACK.
    PeerSeq(u16),
    /// Both sides agree; next sequence numbers for us and the peer.
    Done { local: u16, peer: u16 },
}

struct ConnectCtx {
    link: Link,
    session: SessionState,
    peer: SocketAddr,
    budget: Budget,
}

struct AcceptCtx {
    link: Link,
    session: SessionState,
    config: TransportConfig,
    budget: Option<Budget>,
}

type ConnectStep<'a> = BoxFuture<'a, Result<Step<ConnectState, Handshake>, ConnError>>;
type AcceptStep<'a> = BoxFuture<'a, Result<Step<AcceptState, Handshake>, ConnError>>;

impl Connection {
    /// Active open: run the initiator side of the handshake with `peer`.
    ///
    /// Fails with [`ConnError::HandshakeFailed`] if no valid SYN-ACK arrives
    /// within the disconnect timeout.
    pub async fn connect(&mut self, peer: SocketAddr) -> Result<(), ConnError> {
        let machine: Machine<ConnectCtx, ConnectState, Handshake, ConnError> = Machine::new(
            "connect",
            vec![
                Transition::new(ConnectState::Start, ConnectState::SendSyn, send_syn),
                Transition::new(ConnectState::SendSyn, ConnectState::WaitSynAck, wait_syn_ack),
                Transition::new(ConnectState::WaitSynAck, ConnectState::SendSyn, send_syn),
                Transition::new(ConnectState::WaitSynAck, ConnectState::WaitSynAck, wait_syn_ack),
                Transition::new(ConnectState::WaitSynAck, ConnectState::SendAck, send_ack),
            ],
        )?;

        self.state = ConnectionState::SynSent;
        let config = *self.config();
        let mut ctx = ConnectCtx {
            link: self.take_link(),
            session: SessionState::new(Some(peer), &config),
            peer,
            budget: Budget::start(config.disconnect_timeout),
        };
        log::info!("[connect] → {peer} (id {})", ctx.session.random_number);

        let outcome = machine.run(&mut ctx, ConnectState::SendSyn, Handshake::Idle).await;
        self.restore_link(ctx.link);
        match outcome {
            Ok(Handshake::Done { local, peer: peer_seq }) => {
                self.established(peer, local, peer_seq);
                log::info!("[connect] established with {peer}");
                Ok(())
            }
            Ok(other) => {
                self.state = ConnectionState::Closed;
                Err(FsmError::unexpected("connect", ConnectState::Exit, other).into())
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    /// Passive open: wait for a SYN and complete the handshake with its sender.
    pub async fn accept(&mut self) -> Result<SocketAddr, ConnError> {
        let machine: Machine<AcceptCtx, AcceptState, Handshake, ConnError> = Machine::new(
            "accept",
            vec![
                Transition::new(AcceptState::Start, AcceptState::WaitSyn, wait_syn),
                Transition::new(AcceptState::WaitSyn, AcceptState::WaitSyn, wait_syn),
                Transition::new(AcceptState::WaitSyn, AcceptState::SendSynAck, send_syn_ack),
                Transition::new(AcceptState::SendSynAck, AcceptState::WaitAck, wait_ack),
                Transition::new(AcceptState::WaitAck, AcceptState::WaitAck, wait_ack),
                Transition::new(AcceptState::WaitAck, AcceptState::SendSynAck, send_syn_ack),
            ],
        )?;

        self.state = ConnectionState::Listen;
        let config = *self.config();
        let mut ctx = AcceptCtx {
            link: self.take_link(),
            session: SessionState::new(None, &config),
            config,
            budget: None,
        };

        let outcome = machine.run(&mut ctx, AcceptState::WaitSyn, Handshake::Idle).await;
        self.restore_link(ctx.link);
        match (outcome, ctx.session.peer) {
            (Ok(Handshake::Done { local, peer: peer_seq }), Some(peer)) => {
                self.established(peer, local, peer_seq);
                log::info!("[accept] established with {peer}");
                Ok(peer)
            }
            (Ok(other), _) => {
                self.state = ConnectionState::Closed;
                Err(FsmError::unexpected("accept", AcceptState::Exit, other).into())
            }
            (Err(e), _) => {
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }
}

fn send_syn(ctx: &mut ConnectCtx, _data: Handshake) -> ConnectStep<'_> {
    Box::pin(async move {
        let syn = Packet::segment(u32::from(ctx.session.random_number), 0, flags::SYN);
        ctx.link.send(&syn, ctx.peer).await?;
        Ok(Step::to(ConnectState::WaitSynAck))
    })
}

fn wait_syn_ack(ctx: &mut ConnectCtx, _data: Handshake) -> ConnectStep<'_> {
    Box::pin(async move {
        if ctx.budget.expired() {
            return Err(ConnError::HandshakeFailed {
                peer: ctx.peer,
                after: ctx.budget.limit(),
            });
        }
        let wait = ctx.budget.clamp(ctx.session.retransmit_timer.current());
        let (packet, addr) = match ctx.link.recv(Some(wait)).await? {
            Recv::Datagram(packet, addr) => (packet, addr),
            Recv::TimedOut => {
                ctx.session.retransmit_timer.back_off();
                log::debug!("[connect] SYN-ACK timeout; resending SYN");
                return Ok(Step::to(ConnectState::SendSyn));
            }
        };
        if addr != ctx.peer {
            return Ok(Step::to(ConnectState::WaitSynAck));
        }
        let expected = ctx.session.seq_at(1);
        if packet.syn() && packet.ack() && seq_ge(packet.ack_num(), expected) {
            Ok(Step::with(ConnectState::SendAck, Handshake::PeerSeq(packet.seq_num())))
        } else {
            log::debug!("[connect] unexpected reply {packet}; resending SYN");
            Ok(Step::to(ConnectState::SendSyn))
        }
    })
}

fn send_ack(ctx: &mut ConnectCtx, data: Handshake) -> ConnectStep<'_> {
    Box::pin(async move {
        let Handshake::PeerSeq(peer_seq) = data else {
            return Err(FsmError::unexpected("connect", ConnectState::SendAck, data).into());
        };
        let local = ctx.session.seq_at(1);
        let peer = peer_seq.wrapping_add(1);
        let ack = Packet::segment(u32::from(local), u32::from(peer), flags::ACK);
        ctx.link.send(&ack, ctx.peer).await?;
        Ok(Step::with(ConnectState::Exit, Handshake::Done { local, peer }))
    })
}

fn wait_syn(ctx: &mut AcceptCtx, _data: Handshake) -> AcceptStep<'_> {
    Box::pin(async move {
        let (packet, addr) = match ctx.link.recv(None).await? {
            Recv::Datagram(packet, addr) => (packet, addr),
            Recv::TimedOut => return Ok(Step::to(AcceptState::WaitSyn)),
        };
        if !packet.syn() || packet.ack() || packet.fin() || !packet.payload.is_empty() {
            log::debug!("[accept] ignoring {packet} from {addr} while listening");
            return Ok(Step::to(AcceptState::WaitSyn));
        }
        ctx.session.adopt_peer(addr, packet.seq_num());
        ctx.budget = Some(Budget::start(ctx.config.disconnect_timeout));
        log::info!("[accept] SYN from {addr} (id {})", packet.seq_num());
        Ok(Step::with(AcceptState::SendSynAck, Handshake::PeerSeq(packet.seq_num())))
    })
}

fn send_syn_ack(ctx: &mut AcceptCtx, data: Handshake) -> AcceptStep<'_> {
    Box::pin(async move {
        let (Handshake::PeerSeq(peer_seq), Some(peer)) = (data, ctx.session.peer) else {
            return Err(FsmError::unexpected("accept", AcceptState::SendSynAck, data).into());
        };
        let syn_ack = Packet::segment(
            u32::from(ctx.session.random_number),
            u32::from(peer_seq.wrapping_add(1)),
            flags::SYN | flags::ACK,
        );
        ctx.link.send(&syn_ack, peer).await?;
        Ok(Step::with(AcceptState::WaitAck, data))
    })
}

fn wait_ack(ctx: &mut AcceptCtx, data: Handshake) -> AcceptStep<'_> {
    Box::pin(async move {
        let (Handshake::PeerSeq(peer_seq), Some(peer), Some(budget)) =
            (data, ctx.session.peer, ctx.budget)
        else {
            return Err(FsmError::unexpected("accept", AcceptState::WaitAck, data).into());
        };
        if budget.expired() {
            return Err(ConnError::HandshakeFailed {
                peer,
                after: budget.limit(),
            });
        }
        let wait = budget.clamp(ctx.session.retransmit_timer.current());
        let (packet, addr) = match ctx.link.recv(Some(wait)).await? {
            Recv::Datagram(packet, addr) => (packet, addr),
            Recv::TimedOut => {
                ctx.session.retransmit_timer.back_off();
                log::debug!("[accept] ACK timeout; resending SYN-ACK");
                return Ok(Step::with(AcceptState::SendSynAck, data));
            }
        };
        if addr != peer {
            return Ok(Step::with(AcceptState::WaitAck, data));
        }

        let local = ctx.session.seq_at(1);
        let done = Handshake::Done {
            local,
            peer: peer_seq.wrapping_add(1),
        };
        if packet.ack() && !packet.syn() && packet.ack_num() == local {
            return Ok(Step::with(AcceptState::Exit, done));
        }
        if packet.syn() && !packet.ack() && packet.seq_num() == peer_seq {
            log::debug!("[accept] duplicate SYN; resending SYN-ACK");
            return Ok(Step::with(AcceptState::SendSynAck, data));
        }
        // The peer has moved on, so our SYN-ACK arrived and only its ACK was
        // lost.  Keep the datagram for the next receive.
        log::debug!("[accept] {packet} implies the handshake completed");
        ctx.link.push_back(packet, addr);
        Ok(Step::with(AcceptState::Exit, done))
    })
}
