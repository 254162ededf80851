//! `rudp`: reliable, ordered message delivery over UDP.
//!
//! # Architecture
//!
//! ```text
//!  connect/accept   send       recv       close
//!  ┌──────────┐ ┌────────┐ ┌──────────┐ ┌──────────┐
//!  │handshake │ │ sender │ │ receiver │ │ teardown │   one state machine each
//!  └────┬─────┘ └───┬────┘ └────┬─────┘ └────┬─────┘
//!       └───────────┴─────┬─────┴────────────┘
//!                  ┌──────▼──────┐
//!                  │ Connection  │  peer, sequence numbers, last session
//!                  └──────┬──────┘
//!        ┌────────────────┼────────────────┐
//!  ┌─────▼─────┐   ┌──────▼──────┐   ┌─────▼─────┐
//!  │    fsm    │   │   session   │   │  socket   │  tokio UdpSocket
//!  └───────────┘   └─────────────┘   └─────┬─────┘
//!                                    ┌─────▼─────┐
//!                                    │  packet   │  40-bit header + payload
//!                                    └───────────┘
//! ```
//!
//! - [`packet`]     - wire format and bit-field access
//! - [`fsm`]        - table-driven async state-machine driver
//! - [`config`]     - timeout, retry and segmentation knobs
//! - [`timer`]      - adaptive retransmit timeout and exchange budgets
//! - [`session`]    - per-operation sequencing state
//! - [`socket`]     - async UDP socket abstraction
//! - [`state`]      - connection lifecycle states
//! - [`connection`] - the connection handle and its errors
//! - [`handshake`]  - `connect` / `accept`
//! - [`sender`]     - `send`
//! - [`receiver`]   - `recv`
//! - [`teardown`]   - `close`
//! - [`simulator`]  - lossy/delaying relay for testing

pub mod config;
pub mod connection;
pub mod fsm;
pub mod handshake;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod teardown;
pub mod timer;

pub use config::TransportConfig;
pub use connection::{ConnError, Connection};
pub use packet::Packet;
