//! Connection Management Component
//!
//! Owns the state machine position, the connection 4-tuple and the
//! per-connection timers that are not about retransmission.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bitflags::bitflags;

use crate::config::TcpConfig;
use crate::state::TcpState;

bitflags! {
    /// Per-PCB protocol flags (lwIP `tcpflags_t`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PcbFlags: u16 {
        /// Delayed ACK pending
        const ACK_DELAY   = 0x01;
        /// Send ACK on next output
        const ACK_NOW     = 0x02;
        /// In fast recovery
        const INFR        = 0x04;
        /// Application will not read any more
        const RXCLOSED    = 0x10;
        /// FIN has been queued
        const FIN         = 0x20;
        /// Counted in the listener's backlog
        const BACKLOGPEND = 0x200;
    }
}

bitflags! {
    /// Socket options (lwIP `SOF_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SocketOptions: u8 {
        const REUSEADDR = 0x04;
        const KEEPALIVE = 0x08;
    }
}

impl SocketOptions {
    /// Options a connection inherits from its listener (SOF_INHERITED)
    pub const INHERITED: SocketOptions = SocketOptions::REUSEADDR.union(SocketOptions::KEEPALIVE);
}

/// Address family a PCB accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpAddrType {
    #[default]
    V4,
    V6,
    Any,
}

impl IpAddrType {
    /// Wildcard address of this family
    pub fn any_addr(self) -> IpAddr {
        match self {
            IpAddrType::V4 | IpAddrType::Any => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddrType::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Whether `addr` may be used with a PCB of this type.
    pub fn accepts(self, addr: &IpAddr) -> bool {
        match self {
            IpAddrType::Any => true,
            IpAddrType::V4 => addr.is_ipv4(),
            IpAddrType::V6 => addr.is_ipv6(),
        }
    }
}

/// Same family, and either side wildcard or both equal.
pub fn ip_addr_overlaps(a: &IpAddr, b: &IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4() && (a.is_unspecified() || b.is_unspecified() || a == b)
}

/// Connection Management State
#[derive(Debug, Clone)]
pub struct ConnectionManagementState {
    /* Connection Identifier (Tuple) */
    pub ip_type: IpAddrType,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,

    /* Lifecycle State */
    pub state: TcpState,

    /* Timers & Keep-Alive */
    /// Tick of the last activity / state entry
    pub tmr: u32,
    /// Epoch of the last timer pass that visited this PCB
    pub last_timer: u8,
    pub polltmr: u8,
    pub pollinterval: u8,
    pub keep_idle: u32,
    pub keep_intvl: u32,
    pub keep_cnt: u32,
    pub keep_cnt_sent: u8,

    /* Static Connection Parameters & Options */
    pub mss: u16,
    pub so_options: SocketOptions,
    pub tos: u8,
    pub ttl: u8,
    pub prio: u8,
    pub flags: PcbFlags,
}

impl ConnectionManagementState {
    pub fn new(cfg: &TcpConfig, prio: u8, ticks: u32, timer_ctr: u8) -> Self {
        Self {
            ip_type: IpAddrType::V4,
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: 0,
            remote_port: 0,
            state: TcpState::Closed,
            tmr: ticks,
            last_timer: timer_ctr,
            polltmr: 0,
            pollinterval: 0,
            keep_idle: cfg.keep_idle_ms,
            keep_intvl: cfg.keep_intvl_ms,
            keep_cnt: cfg.keep_cnt,
            keep_cnt_sent: 0,
            mss: core::cmp::min(crate::config::TCP_MSS, cfg.mss),
            so_options: SocketOptions::empty(),
            tos: 0,
            ttl: cfg.ttl,
            prio,
            flags: PcbFlags::empty(),
        }
    }

    /// Move to `to`, logging the transition.
    pub fn set_state(&mut self, to: TcpState) {
        if self.state != to {
            log::debug!(
                "tcp {}:{} -> {}:{}: {} -> {}",
                self.local_ip, self.local_port, self.remote_ip, self.remote_port, self.state, to
            );
        }
        self.state = to;
    }

    /// Exact 4-tuple match against an inbound segment's addressing.
    pub fn matches(&self, local_ip: &IpAddr, local_port: u16, remote_ip: &IpAddr, remote_port: u16) -> bool {
        self.remote_port == remote_port
            && self.local_port == local_port
            && self.remote_ip == *remote_ip
            && self.local_ip == *local_ip
    }

    /// Schedule an ACK for the next fast timer unless one is already due.
    pub fn ack_delayed(&mut self) {
        if self.flags.contains(PcbFlags::ACK_DELAY) {
            self.flags.remove(PcbFlags::ACK_DELAY);
            self.flags.insert(PcbFlags::ACK_NOW);
        } else {
            self.flags.insert(PcbFlags::ACK_DELAY);
        }
    }

    pub fn ack_now(&mut self) {
        self.flags.insert(PcbFlags::ACK_NOW);
    }

    /// Ticks since the last recorded activity
    pub fn idle(&self, ticks: u32) -> u32 {
        ticks.wrapping_sub(self.tmr)
    }
}
