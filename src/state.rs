//! TCP Connection State
//!
//! The state machine enum, list membership, and the two PCB shapes stored in
//! the arena: a full connection (`TcpPcb`) and a listener (`ListenPcb`).

use core::fmt;
use std::net::IpAddr;

pub use crate::components::{
    ip_addr_overlaps,
    ConnectionManagementState,
    ReliableOrderedDeliveryState,
    FlowControlState,
    CongestionControlState,
    IpAddrType,
    PcbFlags,
    SocketOptions,
};
use crate::config::TcpConfig;
use crate::pool::PcbId;
use crate::tcp_api::TcpHandler;

/// TCP State Machine States
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TcpState {
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynRcvd = 3,
    Established = 4,
    FinWait1 = 5,
    FinWait2 = 6,
    CloseWait = 7,
    Closing = 8,
    LastAck = 9,
    TimeWait = 10,
}

impl TcpState {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(TcpState::Closed),
            1 => Some(TcpState::Listen),
            2 => Some(TcpState::SynSent),
            3 => Some(TcpState::SynRcvd),
            4 => Some(TcpState::Established),
            5 => Some(TcpState::FinWait1),
            6 => Some(TcpState::FinWait2),
            7 => Some(TcpState::CloseWait),
            8 => Some(TcpState::Closing),
            9 => Some(TcpState::LastAck),
            10 => Some(TcpState::TimeWait),
            _ => None,
        }
    }

    pub fn is_closing(&self) -> bool {
        *self >= TcpState::FinWait1
    }

    /// The list a PCB in this state belongs on. `bound` only matters for
    /// CLOSED, where an unbound PCB is on no list at all.
    pub fn expected_list(&self, bound: bool) -> Option<PcbList> {
        match self {
            TcpState::Closed if bound => Some(PcbList::Bound),
            TcpState::Closed => None,
            TcpState::Listen => Some(PcbList::Listen),
            TcpState::TimeWait => Some(PcbList::TimeWait),
            _ => Some(PcbList::Active),
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(s)
    }
}

/// The four PCB lists
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PcbList {
    Listen,
    Bound,
    Active,
    TimeWait,
}

impl PcbList {
    /// All lists, in the order port and reuse checks scan them
    pub const ALL: [PcbList; 4] = [PcbList::Listen, PcbList::Bound, PcbList::Active, PcbList::TimeWait];

    /// Lists scanned by bind when address reuse is in effect
    pub const NO_TIME_WAIT: [PcbList; 3] = [PcbList::Listen, PcbList::Bound, PcbList::Active];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            PcbList::Listen => 0,
            PcbList::Bound => 1,
            PcbList::Active => 2,
            PcbList::TimeWait => 3,
        }
    }
}

/// Complete TCP connection PCB
pub struct TcpPcb {
    pub conn_mgmt: ConnectionManagementState,
    pub rod: ReliableOrderedDeliveryState,
    pub flow_ctrl: FlowControlState,
    pub cong_ctrl: CongestionControlState,

    /// Listener that spawned this connection, until it is accepted
    pub(crate) listener: Option<PcbId>,
    pub(crate) handler: Option<Box<dyn TcpHandler>>,
}

impl TcpPcb {
    pub(crate) fn new(cfg: &TcpConfig, prio: u8, iss: u32, ticks: u32, timer_ctr: u8) -> Self {
        let mut flow_ctrl = FlowControlState::new(cfg);
        flow_ctrl.snd_wl2 = iss;
        Self {
            conn_mgmt: ConnectionManagementState::new(cfg, prio, ticks, timer_ctr),
            rod: ReliableOrderedDeliveryState::new(cfg, iss),
            flow_ctrl,
            cong_ctrl: CongestionControlState::new(cfg.wnd),
            listener: None,
            handler: None,
        }
    }

    #[inline]
    pub fn state(&self) -> TcpState {
        self.conn_mgmt.state
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }
}

impl fmt::Debug for TcpPcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPcb")
            .field("conn_mgmt", &self.conn_mgmt)
            .field("rod", &self.rod)
            .field("flow_ctrl", &self.flow_ctrl)
            .field("cong_ctrl", &self.cong_ctrl)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

/// Listener-only PCB: what is left of a connection PCB after `listen`
pub struct ListenPcb {
    pub ip_type: IpAddrType,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub prio: u8,
    pub so_options: SocketOptions,
    pub ttl: u8,
    pub tos: u8,
    pub backlog: u8,
    pub accepts_pending: u8,
    pub(crate) handler: Option<Box<dyn TcpHandler>>,
}

impl ListenPcb {
    /// Shrink a closed connection PCB into a listener.
    pub(crate) fn from_pcb(pcb: &mut TcpPcb, backlog: u8) -> Self {
        let cm = &pcb.conn_mgmt;
        Self {
            ip_type: cm.ip_type,
            local_ip: cm.local_ip,
            local_port: cm.local_port,
            prio: cm.prio,
            so_options: cm.so_options,
            ttl: cm.ttl,
            tos: cm.tos,
            backlog: backlog.max(1),
            accepts_pending: 0,
            handler: pcb.handler.take(),
        }
    }
}

impl fmt::Debug for ListenPcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenPcb")
            .field("local_ip", &self.local_ip)
            .field("local_port", &self.local_port)
            .field("prio", &self.prio)
            .field("backlog", &self.backlog)
            .field("accepts_pending", &self.accepts_pending)
            .finish_non_exhaustive()
    }
}

/// Arena slot payload
#[derive(Debug)]
pub(crate) enum Pcb {
    Conn(Box<TcpPcb>),
    Listen(ListenPcb),
}

impl Pcb {
    pub(crate) fn state(&self) -> TcpState {
        match self {
            Pcb::Conn(pcb) => pcb.conn_mgmt.state,
            Pcb::Listen(_) => TcpState::Listen,
        }
    }

    pub(crate) fn local_port(&self) -> u16 {
        match self {
            Pcb::Conn(pcb) => pcb.conn_mgmt.local_port,
            Pcb::Listen(lpcb) => lpcb.local_port,
        }
    }

    pub(crate) fn local_ip(&self) -> IpAddr {
        match self {
            Pcb::Conn(pcb) => pcb.conn_mgmt.local_ip,
            Pcb::Listen(lpcb) => lpcb.local_ip,
        }
    }

    pub(crate) fn so_options(&self) -> SocketOptions {
        match self {
            Pcb::Conn(pcb) => pcb.conn_mgmt.so_options,
            Pcb::Listen(lpcb) => lpcb.so_options,
        }
    }

    pub(crate) fn is_listen(&self) -> bool {
        matches!(self, Pcb::Listen(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(TcpState::FinWait1.to_string(), "FIN_WAIT_1");
        assert_eq!(TcpState::from_u32(9), Some(TcpState::LastAck));
        assert_eq!(TcpState::from_u32(11), None);
    }

    #[test]
    fn list_mapping() {
        assert_eq!(TcpState::Closed.expected_list(false), None);
        assert_eq!(TcpState::Closed.expected_list(true), Some(PcbList::Bound));
        assert_eq!(TcpState::LastAck.expected_list(true), Some(PcbList::Active));
        assert_eq!(TcpState::TimeWait.expected_list(true), Some(PcbList::TimeWait));
        assert!(TcpState::Closing.is_closing());
        assert!(!TcpState::Established.is_closing());
    }
}
