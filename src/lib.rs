//! lwIP-style TCP engine
//!
//! A single-threaded TCP protocol engine: the PCB state machine, the fast
//! and slow timers with retransmission, persist and keepalive policy, PCB
//! allocation with eviction, port allocation, and the segment input and
//! output paths.
//!
//! The caller owns a [`TcpStack`], feeds it inbound segments through
//! [`TcpStack::input`] and calls [`TcpStack::tmr`] every
//! `fast_interval_ms`. Outbound segments go to the [`NetIf`] given at
//! construction; per-connection events go to [`TcpHandler`] objects.

pub mod components;
pub mod config;
pub mod err;
pub mod pool;
pub mod state;
pub mod tcp;
pub mod tcp_api;
pub mod tcp_in;
pub mod tcp_out;
pub mod tcp_proto;
pub mod tcp_tmr;
pub mod tcp_types;

pub use config::{TcpConfig, TCP_MSS, TCP_PRIO_MAX, TCP_PRIO_MIN, TCP_PRIO_NORMAL};
pub use err::{Error, Result};
pub use pool::{PcbId, SegPool};
pub use state::{IpAddrType, ListenPcb, PcbFlags, PcbList, SocketOptions, TcpPcb, TcpState};
pub use tcp::{KeepAlive, PcbCounts, TcpStack};
pub use tcp_api::{NetIf, NullHandler, TcpHandler};
pub use tcp_proto::{TcpFlags, TcpHdr};
pub use tcp_tmr::{TCP_BACKOFF, TCP_PERSIST_BACKOFF};
pub use tcp_types::{seq_between, seq_geq, seq_gt, seq_leq, seq_lt, OutSegment, TcpSegment};
