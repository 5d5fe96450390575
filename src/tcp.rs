//! TCP Stack Context
//!
//! `TcpStack` owns everything lwIP keeps in globals: the PCB pool and its
//! four lists, the segment pool, the tick counters, the ephemeral port
//! cursor and the ISS counter. This file holds PCB lifecycle (allocation
//! with eviction, bind, listen, connect, close, shutdown, abort) and the
//! small application-facing setters and queries. Timers live in
//! `tcp_tmr`, the receive path in `tcp_in`, transmission in `tcp_out`.

use std::net::IpAddr;

use crate::config::{TcpConfig, TCP_PRIO_MAX, TCP_PRIO_NORMAL};
use crate::err::{Error, Result};
use crate::pool::{PcbId, PcbPool, SegPool};
use crate::state::{
    ip_addr_overlaps, IpAddrType, ListenPcb, Pcb, PcbFlags, PcbList, SocketOptions, TcpPcb, TcpState,
};
use crate::tcp_api::{NetIf, TcpHandler};
use crate::tcp_proto::TcpFlags;

/// Initial value of the ISS counter
const ISS_SEED: u32 = 6510;

/// Keepalive parameters of one PCB, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub idle_ms: u32,
    pub intvl_ms: u32,
    pub cnt: u32,
}

/// Snapshot of how many PCBs sit on each list and in each closing state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcbCounts {
    pub total: usize,
    pub listen: usize,
    pub bound: usize,
    pub active: usize,
    pub time_wait: usize,
    pub fin_wait1: usize,
    pub fin_wait2: usize,
    pub closing: usize,
    pub last_ack: usize,
}

/// One TCP engine instance
pub struct TcpStack {
    pub(crate) config: TcpConfig,
    pub(crate) netif: Box<dyn NetIf>,
    pub(crate) pcbs: PcbPool,
    pub(crate) segs: SegPool,

    /// Slow-timer ticks since start
    pub(crate) ticks: u32,
    /// Calls to `tmr`, selects the slow-timer half
    pub(crate) timer: u8,
    /// Epoch shared by both timers, for the per-PCB visit guard
    pub(crate) timer_ctr: u8,
    /// Set whenever the ACTIVE list changes; timer walks restart on it
    pub(crate) active_pcbs_changed: bool,
    /// PCB currently inside `input`; output for it is deferred
    pub(crate) input_pcb: Option<PcbId>,
    /// PCBs whose handler is out for a callback, innermost last
    pub(crate) in_callback: Vec<PcbId>,
    /// Errors for PCBs freed while their handler was out
    pub(crate) pending_errs: Vec<(PcbId, Error)>,

    port: u16,
    iss: u32,
}

impl TcpStack {
    pub fn new(config: TcpConfig, netif: Box<dyn NetIf>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pcbs: PcbPool::new(config.max_pcbs, config.max_listen_pcbs),
            segs: SegPool::new(config.max_segs),
            port: *config.local_port_range.start(),
            config,
            netif,
            ticks: 0,
            timer: 0,
            timer_ctr: 0,
            active_pcbs_changed: false,
            input_pcb: None,
            in_callback: Vec::new(),
            pending_errs: Vec::new(),
            iss: ISS_SEED,
        })
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Slow-timer ticks elapsed
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Segment pool units in use
    pub fn segs_in_use(&self) -> usize {
        self.segs.used()
    }

    // ------------------------------------------------------------------------
    // Internal lookups and list helpers
    // ------------------------------------------------------------------------

    pub(crate) fn conn_ref(&self, id: PcbId) -> Result<&TcpPcb> {
        match self.pcbs.get(id) {
            Some(Pcb::Conn(pcb)) => Ok(pcb),
            Some(Pcb::Listen(_)) => Err(Error::Val),
            None => Err(Error::Arg),
        }
    }

    pub(crate) fn conn_mut(&mut self, id: PcbId) -> Result<&mut TcpPcb> {
        match self.pcbs.get_mut(id) {
            Some(Pcb::Conn(pcb)) => Ok(pcb),
            Some(Pcb::Listen(_)) => Err(Error::Val),
            None => Err(Error::Arg),
        }
    }

    /// TCP_REG_ACTIVE
    pub(crate) fn reg_active(&mut self, id: PcbId) {
        self.pcbs.reg(PcbList::Active, id);
        self.active_pcbs_changed = true;
    }

    /// TCP_RMV, flagging the ACTIVE list as changed when that is where the
    /// PCB was.
    pub(crate) fn unlink(&mut self, id: PcbId) {
        if self.pcbs.list_of(id) == Some(PcbList::Active) {
            self.active_pcbs_changed = true;
        }
        self.pcbs.rmv(id);
    }

    /// Release a PCB that is already off every list and hand back its
    /// handler so the caller can report the loss.
    pub(crate) fn release(&mut self, id: PcbId) -> Option<Box<dyn TcpHandler>> {
        match self.pcbs.free(id)? {
            Pcb::Conn(mut pcb) => pcb.handler.take(),
            Pcb::Listen(mut lpcb) => lpcb.handler.take(),
        }
    }

    // ------------------------------------------------------------------------
    // Allocation and eviction
    // ------------------------------------------------------------------------

    /// Allocate a connection PCB, evicting older connections when the pool
    /// is exhausted: TIME_WAIT first, then LAST_ACK, then CLOSING, then the
    /// oldest ACTIVE connection of no higher priority than `prio`.
    pub fn alloc(&mut self, prio: u8) -> Result<PcbId> {
        if self.pcbs.conns_full() {
            log::debug!("tcp_alloc: pool full, killing oldest TIME_WAIT");
            self.kill_timewait();
        }
        if self.pcbs.conns_full() {
            self.kill_state(TcpState::LastAck);
        }
        if self.pcbs.conns_full() {
            self.kill_state(TcpState::Closing);
        }
        if self.pcbs.conns_full() {
            self.kill_prio(prio);
        }
        if self.pcbs.conns_full() {
            log::warn!("tcp_alloc: no free PCB for prio {} ({} in use)", prio, self.pcbs.conn_count());
            return Err(Error::Mem);
        }

        let iss = self.next_iss();
        let pcb = TcpPcb::new(&self.config, prio, iss, self.ticks, self.timer_ctr);
        self.pcbs.alloc_conn(pcb)
    }

    /// `alloc` at normal priority
    pub fn new_pcb(&mut self) -> Result<PcbId> {
        self.alloc(TCP_PRIO_NORMAL)
    }

    /// `new_pcb` for a specific address family
    pub fn new_ip_type(&mut self, ip_type: IpAddrType) -> Result<PcbId> {
        let id = self.new_pcb()?;
        let cm = &mut self.conn_mut(id)?.conn_mgmt;
        cm.ip_type = ip_type;
        cm.local_ip = ip_type.any_addr();
        cm.remote_ip = ip_type.any_addr();
        Ok(id)
    }

    /// PCB with the largest `ticks - tmr` among `candidates`; later
    /// entries win ties.
    fn oldest<'a>(&self, candidates: impl Iterator<Item = (PcbId, &'a TcpPcb)>) -> Option<PcbId> {
        let mut inactivity = 0;
        let mut inactive = None;
        for (id, pcb) in candidates {
            let idle = pcb.conn_mgmt.idle(self.ticks);
            if idle >= inactivity {
                inactivity = idle;
                inactive = Some(id);
            }
        }
        inactive
    }

    pub(crate) fn conns_on(&self, list: PcbList) -> impl Iterator<Item = (PcbId, &TcpPcb)> + '_ {
        self.pcbs.iter(list).filter_map(|(id, pcb)| match pcb {
            Pcb::Conn(pcb) => Some((id, &**pcb)),
            Pcb::Listen(_) => None,
        })
    }

    fn kill_timewait(&mut self) {
        if let Some(id) = self.oldest(self.conns_on(PcbList::TimeWait)) {
            log::debug!("tcp_kill_timewait: killing oldest TIME-WAIT pcb {}", id.index());
            self.abandon_pcb(id, true);
        }
    }

    fn kill_state(&mut self, state: TcpState) {
        let candidates = self.conns_on(PcbList::Active).filter(|(_, pcb)| pcb.state() == state);
        if let Some(id) = self.oldest(candidates) {
            log::debug!("tcp_kill_state: killing oldest {} pcb {}", state, id.index());
            // no data is lost, so no RST
            self.abandon_pcb(id, false);
        }
    }

    fn kill_prio(&mut self, prio: u8) {
        let mut mprio = core::cmp::min(TCP_PRIO_MAX, prio);
        let mut inactivity = 0;
        let mut inactive = None;
        for (id, pcb) in self.conns_on(PcbList::Active) {
            let idle = pcb.conn_mgmt.idle(self.ticks);
            if pcb.conn_mgmt.prio <= mprio && idle >= inactivity {
                inactivity = idle;
                inactive = Some(id);
                mprio = pcb.conn_mgmt.prio;
            }
        }
        if let Some(id) = inactive {
            log::debug!("tcp_kill_prio: killing oldest pcb {} with prio {} ({})", id.index(), mprio, inactivity);
            self.abandon_pcb(id, true);
        }
    }

    // ------------------------------------------------------------------------
    // Ports and sequence numbers
    // ------------------------------------------------------------------------

    fn port_in_use(&self, port: u16) -> bool {
        PcbList::ALL
            .iter()
            .any(|list| self.pcbs.iter(*list).any(|(_, pcb)| pcb.local_port() == port))
    }

    /// Next free ephemeral port, or 0 after a full pass over the range.
    pub(crate) fn new_port(&mut self) -> u16 {
        let start = *self.config.local_port_range.start();
        let end = *self.config.local_port_range.end();
        let mut n = 0u32;
        loop {
            self.port = if self.port == end { start } else { self.port + 1 };
            if !self.port_in_use(self.port) {
                return self.port;
            }
            n += 1;
            if n > self.config.port_span() {
                log::warn!("tcp_new_port: ephemeral range exhausted");
                return 0;
            }
        }
    }

    pub(crate) fn next_iss(&mut self) -> u32 {
        self.iss = self.iss.wrapping_add(self.ticks);
        self.iss
    }

    // ------------------------------------------------------------------------
    // Bind / listen / connect
    // ------------------------------------------------------------------------

    /// Bind to a local address and port. Port 0 picks an ephemeral port.
    /// Returns the bound port.
    pub fn bind(&mut self, id: PcbId, ipaddr: IpAddr, port: u16) -> Result<u16> {
        let pcb = self.conn_ref(id)?;
        let cm = &pcb.conn_mgmt;
        if !cm.ip_type.accepts(&ipaddr) || cm.state != TcpState::Closed {
            return Err(Error::Val);
        }
        if self.pcbs.list_of(id).is_some() {
            return Err(Error::Val);
        }
        let reuse = self.config.so_reuse && cm.so_options.contains(SocketOptions::REUSEADDR);

        let port = if port == 0 {
            match self.new_port() {
                0 => return Err(Error::Buf),
                port => port,
            }
        } else {
            // TIME_WAIT PCBs only count when address reuse is off
            let lists: &[PcbList] = if reuse { &PcbList::NO_TIME_WAIT } else { &PcbList::ALL };
            for list in lists {
                for (_, other) in self.pcbs.iter(*list) {
                    if other.local_port() != port {
                        continue;
                    }
                    if reuse && other.so_options().contains(SocketOptions::REUSEADDR) {
                        continue;
                    }
                    if ip_addr_overlaps(&other.local_ip(), &ipaddr) {
                        return Err(Error::Use);
                    }
                }
            }
            port
        };

        let cm = &mut self.conn_mut(id)?.conn_mgmt;
        if !ipaddr.is_unspecified() {
            cm.local_ip = ipaddr;
        }
        cm.local_port = port;
        self.pcbs.reg(PcbList::Bound, id);
        log::debug!("tcp_bind: bind to port {}", port);
        Ok(port)
    }

    /// `listen_with_backlog` with the configured default backlog
    pub fn listen(&mut self, id: PcbId) -> Result<PcbId> {
        let backlog = self.config.listen_backlog;
        self.listen_with_backlog(id, backlog)
    }

    /// Turn a closed PCB into a listener. The slot keeps its handle; its
    /// payload shrinks to a `ListenPcb`.
    pub fn listen_with_backlog(&mut self, id: PcbId, backlog: u8) -> Result<PcbId> {
        let pcb = match self.pcbs.get(id) {
            Some(Pcb::Listen(_)) => return Ok(id),
            Some(Pcb::Conn(pcb)) => pcb,
            None => return Err(Error::Arg),
        };
        let cm = &pcb.conn_mgmt;
        if cm.state != TcpState::Closed {
            return Err(Error::Val);
        }
        if self.config.so_reuse && cm.so_options.contains(SocketOptions::REUSEADDR) {
            // REUSEADDR let bind through; a port may still only be listened
            // on once per local address
            let taken = self
                .pcbs
                .iter(PcbList::Listen)
                .any(|(_, l)| l.local_port() == cm.local_port && l.local_ip() == cm.local_ip);
            if taken {
                return Err(Error::Use);
            }
        }
        if self.pcbs.listeners_full() {
            log::warn!("tcp_listen: no free listener slot");
            return Err(Error::Mem);
        }

        let pcb = self.conn_mut(id)?;
        let lpcb = ListenPcb::from_pcb(pcb, backlog);
        self.pcbs.rmv(id);
        self.pcbs.replace(id, Pcb::Listen(lpcb));
        self.pcbs.reg(PcbList::Listen, id);
        log::debug!("tcp_listen: pcb {} listening", id.index());
        Ok(id)
    }

    /// Active open: resolve the local address, pick a port if unbound,
    /// queue a SYN and move to SYN_SENT.
    pub fn connect(&mut self, id: PcbId, ipaddr: IpAddr, port: u16) -> Result<()> {
        let pcb = match self.pcbs.get(id) {
            Some(Pcb::Conn(pcb)) => pcb,
            Some(Pcb::Listen(_)) => return Err(Error::Isconn),
            None => return Err(Error::Arg),
        };
        let cm = &pcb.conn_mgmt;
        if !cm.ip_type.accepts(&ipaddr) {
            return Err(Error::Val);
        }
        if cm.state != TcpState::Closed {
            return Err(Error::Isconn);
        }
        let reuse = self.config.so_reuse && cm.so_options.contains(SocketOptions::REUSEADDR);
        let old_local_port = cm.local_port;
        let local_ip = if cm.local_ip.is_unspecified() {
            // no route, no point sending a SYN
            self.netif.route(&ipaddr).ok_or(Error::Rte)?
        } else {
            cm.local_ip
        };

        let local_port = if old_local_port == 0 {
            match self.new_port() {
                0 => return Err(Error::Buf),
                port => port,
            }
        } else {
            if reuse {
                // bind let the port through; the 4-tuple must be unique
                for list in [PcbList::Active, PcbList::TimeWait] {
                    let dup = self.conns_on(list).any(|(_, other)| {
                        let o = &other.conn_mgmt;
                        o.local_port == old_local_port
                            && o.remote_port == port
                            && o.local_ip == local_ip
                            && o.remote_ip == ipaddr
                    });
                    if dup {
                        return Err(Error::Use);
                    }
                }
            }
            old_local_port
        };

        let iss = self.next_iss();
        let wnd = self.config.wnd;
        let pcb = self.conn_mut(id)?;
        pcb.conn_mgmt.remote_ip = ipaddr;
        pcb.conn_mgmt.remote_port = port;
        pcb.conn_mgmt.local_ip = local_ip;
        pcb.conn_mgmt.local_port = local_port;
        pcb.rod.rcv_nxt = 0;
        pcb.rod.iss = iss;
        pcb.rod.snd_nxt = iss;
        pcb.rod.lastack = iss.wrapping_sub(1);
        pcb.rod.snd_lbb = iss.wrapping_sub(1);
        pcb.flow_ctrl.snd_wl2 = iss.wrapping_sub(1);
        pcb.flow_ctrl.rcv_wnd = wnd;
        pcb.flow_ctrl.rcv_ann_wnd = wnd;
        pcb.flow_ctrl.rcv_ann_right_edge = 0;
        pcb.flow_ctrl.snd_wnd = wnd;
        pcb.cong_ctrl.cwnd = 1;
        pcb.cong_ctrl.ssthresh = wnd;

        if let Err(e) = self.enqueue_flags(id, TcpFlags::SYN) {
            if old_local_port == 0 {
                self.conn_mut(id)?.conn_mgmt.local_port = 0;
            }
            return Err(e);
        }

        self.conn_mut(id)?.conn_mgmt.set_state(TcpState::SynSent);
        if old_local_port != 0 {
            self.pcbs.rmv(id);
        }
        self.reg_active(id);
        // the SYN stays queued if it cannot go out now
        let _ = self.output(id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Close / shutdown / abort
    // ------------------------------------------------------------------------

    /// Close a connection or listener. Connections stop receiving; the
    /// handle may go stale immediately (listeners, unconnected PCBs) or
    /// once the closing handshake completes.
    pub fn close(&mut self, id: PcbId) -> Result<()> {
        match self.pcbs.get_mut(id) {
            Some(Pcb::Conn(pcb)) => pcb.conn_mgmt.flags.insert(PcbFlags::RXCLOSED),
            Some(Pcb::Listen(_)) => {}
            None => return Err(Error::Arg),
        }
        self.close_shutdown(id, true)
    }

    /// Shut down the receive side, the transmit side, or both.
    pub fn shutdown(&mut self, id: PcbId, shut_rx: bool, shut_tx: bool) -> Result<()> {
        let pcb = match self.pcbs.get_mut(id) {
            Some(Pcb::Conn(pcb)) => pcb,
            Some(Pcb::Listen(_)) => return Err(Error::Conn),
            None => return Err(Error::Arg),
        };
        if shut_rx {
            pcb.conn_mgmt.flags.insert(PcbFlags::RXCLOSED);
            if shut_tx {
                return self.close_shutdown(id, true);
            }
            pcb.rod.refused_data = None;
        }
        if shut_tx {
            return match pcb.state() {
                TcpState::SynRcvd | TcpState::Established | TcpState::CloseWait => {
                    self.close_shutdown(id, shut_rx)
                }
                // not connected yet: closing TX would free the PCB
                _ => Err(Error::Conn),
            };
        }
        Ok(())
    }

    fn close_shutdown(&mut self, id: PcbId, rst_on_unacked_data: bool) -> Result<()> {
        let wnd = self.config.wnd;
        let pcb = match self.pcbs.get(id) {
            Some(Pcb::Conn(pcb)) => pcb,
            Some(Pcb::Listen(_)) => {
                self.listen_closed(id);
                self.pcbs.rmv(id);
                self.pcbs.free(id);
                return Ok(());
            }
            None => return Err(Error::Arg),
        };
        let state = pcb.state();

        if rst_on_unacked_data
            && matches!(state, TcpState::Established | TcpState::CloseWait)
            && (pcb.rod.refused_data.is_some() || pcb.flow_ctrl.rcv_wnd != wnd)
        {
            // the application did not take everything: tell the peer
            let cm = &pcb.conn_mgmt;
            let (lip, rip, lport, rport) = (cm.local_ip, cm.remote_ip, cm.local_port, cm.remote_port);
            let (seqno, ackno) = (pcb.rod.snd_nxt, pcb.rod.rcv_nxt);
            self.rst(seqno, ackno, lip, rip, lport, rport);
            self.purge(id);
            self.unlink(id);
            if state == TcpState::Established {
                self.conn_mut(id)?.conn_mgmt.set_state(TcpState::TimeWait);
                self.pcbs.reg(PcbList::TimeWait, id);
            } else {
                let handler = self.release(id);
                self.event_err(handler, id, Error::Abrt);
            }
            return Ok(());
        }

        match state {
            TcpState::Closed => {
                // bound or fresh; either way nothing to tell the peer
                self.pcbs.rmv(id);
                self.pcbs.free(id);
                return Ok(());
            }
            TcpState::SynSent => {
                self.pcb_remove(id);
                self.pcbs.free(id);
                return Ok(());
            }
            TcpState::SynRcvd => {
                self.send_fin(id)?;
                self.backlog_accepted(id);
                self.set_fin_wait_1(id);
            }
            TcpState::Established => {
                self.send_fin(id)?;
                self.set_fin_wait_1(id);
            }
            TcpState::CloseWait => {
                self.send_fin(id)?;
                self.conn_mut(id)?.conn_mgmt.set_state(TcpState::LastAck);
            }
            _ => return Ok(()),
        }
        // unsent data also goes out from the timers
        let _ = self.output(id);
        Ok(())
    }

    fn set_fin_wait_1(&mut self, id: PcbId) {
        let ticks = self.ticks;
        if let Ok(pcb) = self.conn_mut(id) {
            pcb.conn_mgmt.set_state(TcpState::FinWait1);
            pcb.conn_mgmt.tmr = ticks;
        }
    }

    /// Abort with RST. The handle is stale afterwards and the handler's
    /// `err` runs with `Abrt`.
    pub fn abort(&mut self, id: PcbId) -> Result<()> {
        self.abandon(id, true)
    }

    /// Drop a connection, optionally telling the peer with a RST.
    pub fn abandon(&mut self, id: PcbId, reset: bool) -> Result<()> {
        match self.pcbs.get(id) {
            Some(Pcb::Conn(_)) => {
                self.abandon_pcb(id, reset);
                Ok(())
            }
            Some(Pcb::Listen(_)) => Err(Error::Val),
            None => Err(Error::Arg),
        }
    }

    pub(crate) fn abandon_pcb(&mut self, id: PcbId, reset: bool) {
        let Some(pcb) = self.pcbs.conn(id) else { return };
        let state = pcb.state();
        if state == TcpState::TimeWait {
            self.pcb_remove(id);
            self.pcbs.free(id);
            return;
        }

        let cm = &pcb.conn_mgmt;
        let (lip, rip, lport, rport) = (cm.local_ip, cm.remote_ip, cm.local_port, cm.remote_port);
        let (seqno, ackno) = (pcb.rod.snd_nxt, pcb.rod.rcv_nxt);
        let send_rst = reset && state != TcpState::Closed;

        self.unlink(id);
        if let Some(pcb) = self.pcbs.conn_mut(id) {
            pcb.rod.purge(&mut self.segs);
        }
        self.backlog_accepted(id);
        if send_rst {
            log::debug!("tcp_abandon: sending RST");
            self.rst(seqno, ackno, lip, rip, lport, rport);
        }
        let handler = self.release(id);
        self.event_err(handler, id, Error::Abrt);
    }

    // ------------------------------------------------------------------------
    // Purge and removal
    // ------------------------------------------------------------------------

    /// Free every queued segment of a connection that can still hold any.
    /// Repeating it finds nothing left to free.
    pub fn purge(&mut self, id: PcbId) {
        let Some(pcb) = self.pcbs.conn(id) else { return };
        if matches!(pcb.state(), TcpState::Closed | TcpState::TimeWait | TcpState::Listen) {
            return;
        }
        self.backlog_accepted(id);
        if let Some(pcb) = self.pcbs.conn_mut(id) {
            pcb.rod.purge(&mut self.segs);
        }
    }

    /// Take a connection off its list, flush a pending delayed ACK and
    /// leave it CLOSED and unbound. The slot itself stays allocated.
    pub(crate) fn pcb_remove(&mut self, id: PcbId) {
        self.unlink(id);
        self.purge(id);
        let Some(pcb) = self.pcbs.conn_mut(id) else { return };
        if pcb.state() != TcpState::TimeWait && pcb.conn_mgmt.flags.contains(PcbFlags::ACK_DELAY) {
            pcb.conn_mgmt.ack_now();
            let _ = self.output(id);
        }
        if let Some(pcb) = self.pcbs.conn_mut(id) {
            debug_assert!(!pcb.rod.has_queued(), "segments leaking");
            pcb.conn_mgmt.set_state(TcpState::Closed);
            pcb.conn_mgmt.local_port = 0;
        }
    }

    fn listen_closed(&mut self, listener: PcbId) {
        for list in [PcbList::Bound, PcbList::Active, PcbList::TimeWait] {
            for id in self.pcbs.ids(list) {
                if let Some(pcb) = self.pcbs.conn_mut(id) {
                    if pcb.listener == Some(listener) {
                        pcb.listener = None;
                    }
                }
            }
        }
    }

    /// Count `id` against its listener's backlog until accepted.
    pub fn backlog_delayed(&mut self, id: PcbId) -> Result<()> {
        let pcb = self.conn_mut(id)?;
        if pcb.conn_mgmt.flags.contains(PcbFlags::BACKLOGPEND) {
            return Ok(());
        }
        if let Some(listener) = pcb.listener {
            pcb.conn_mgmt.flags.insert(PcbFlags::BACKLOGPEND);
            if let Some(lpcb) = self.pcbs.listener_mut(listener) {
                lpcb.accepts_pending = lpcb.accepts_pending.saturating_add(1);
            }
        }
        Ok(())
    }

    /// Release `id`'s slot in its listener's backlog.
    pub fn backlog_accepted(&mut self, id: PcbId) {
        let Some(pcb) = self.pcbs.conn_mut(id) else { return };
        if !pcb.conn_mgmt.flags.contains(PcbFlags::BACKLOGPEND) {
            return;
        }
        if let Some(listener) = pcb.listener {
            pcb.conn_mgmt.flags.remove(PcbFlags::BACKLOGPEND);
            if let Some(lpcb) = self.pcbs.listener_mut(listener) {
                debug_assert!(lpcb.accepts_pending != 0);
                lpcb.accepts_pending = lpcb.accepts_pending.saturating_sub(1);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Application setters
    // ------------------------------------------------------------------------

    /// The application consumed `len` bytes: reopen the receive window and
    /// announce it once it has grown enough.
    pub fn recved(&mut self, id: PcbId, len: u16) -> Result<()> {
        let wnd = self.config.wnd;
        let threshold = u32::from(self.config.wnd_update_threshold());
        let pcb = self.conn_mut(id)?;
        let grown = u32::from(pcb.flow_ctrl.rcv_wnd) + u32::from(len);
        pcb.flow_ctrl.rcv_wnd = u16::try_from(grown.min(u32::from(wnd))).unwrap_or(wnd);

        let inflation = pcb.flow_ctrl.update_rcv_ann_wnd(pcb.rod.rcv_nxt, pcb.conn_mgmt.mss, wnd);
        log::trace!("tcp_recved: received {} bytes, wnd {}", len, pcb.flow_ctrl.rcv_wnd);
        if inflation >= threshold {
            pcb.conn_mgmt.ack_now();
            let _ = self.output(id);
        }
        Ok(())
    }

    pub fn setprio(&mut self, id: PcbId, prio: u8) -> Result<()> {
        match self.pcbs.get_mut(id).ok_or(Error::Arg)? {
            Pcb::Conn(pcb) => pcb.conn_mgmt.prio = prio,
            Pcb::Listen(lpcb) => lpcb.prio = prio,
        }
        Ok(())
    }

    /// Install the event handler of a connection or listener.
    pub fn set_handler(&mut self, id: PcbId, handler: Box<dyn TcpHandler>) -> Result<()> {
        match self.pcbs.get_mut(id).ok_or(Error::Arg)? {
            Pcb::Conn(pcb) => pcb.handler = Some(handler),
            Pcb::Listen(lpcb) => lpcb.handler = Some(handler),
        }
        Ok(())
    }

    /// Poll the handler every `interval` slow ticks.
    pub fn poll(&mut self, id: PcbId, interval: u8) -> Result<()> {
        self.conn_mut(id)?.conn_mgmt.pollinterval = interval;
        Ok(())
    }

    pub fn set_so_options(&mut self, id: PcbId, opts: SocketOptions) -> Result<()> {
        match self.pcbs.get_mut(id).ok_or(Error::Arg)? {
            Pcb::Conn(pcb) => pcb.conn_mgmt.so_options = opts,
            Pcb::Listen(lpcb) => lpcb.so_options = opts,
        }
        Ok(())
    }

    pub fn set_keepalive(&mut self, id: PcbId, ka: KeepAlive) -> Result<()> {
        let cm = &mut self.conn_mut(id)?.conn_mgmt;
        cm.keep_idle = ka.idle_ms;
        cm.keep_intvl = ka.intvl_ms;
        cm.keep_cnt = ka.cnt;
        Ok(())
    }

    pub fn keepalive_params(&self, id: PcbId) -> Result<KeepAlive> {
        let cm = &self.conn_ref(id)?.conn_mgmt;
        Ok(KeepAlive { idle_ms: cm.keep_idle, intvl_ms: cm.keep_intvl, cnt: cm.keep_cnt })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn state(&self, id: PcbId) -> Result<TcpState> {
        self.pcbs.get(id).map(Pcb::state).ok_or(Error::Arg)
    }

    pub fn pcb(&self, id: PcbId) -> Option<&TcpPcb> {
        self.pcbs.conn(id)
    }

    pub fn listener(&self, id: PcbId) -> Option<&ListenPcb> {
        match self.pcbs.get(id)? {
            Pcb::Listen(lpcb) => Some(lpcb),
            Pcb::Conn(_) => None,
        }
    }

    /// The list `id` is on; `None` for a fresh unbound PCB or a stale
    /// handle.
    pub fn list_of(&self, id: PcbId) -> Option<PcbList> {
        self.pcbs.list_of(id)
    }

    /// Handles on `list`, head first
    pub fn list(&self, list: PcbList) -> Vec<PcbId> {
        self.pcbs.ids(list)
    }

    pub fn sndbuf(&self, id: PcbId) -> Result<u16> {
        Ok(self.conn_ref(id)?.rod.snd_buf)
    }

    pub fn counts(&self) -> PcbCounts {
        let mut c = PcbCounts::default();
        for list in PcbList::ALL {
            for (_, pcb) in self.pcbs.iter(list) {
                c.total += 1;
                match list {
                    PcbList::Listen => c.listen += 1,
                    PcbList::Bound => c.bound += 1,
                    PcbList::Active => c.active += 1,
                    PcbList::TimeWait => c.time_wait += 1,
                }
                match pcb.state() {
                    TcpState::FinWait1 => c.fin_wait1 += 1,
                    TcpState::FinWait2 => c.fin_wait2 += 1,
                    TcpState::Closing => c.closing += 1,
                    TcpState::LastAck => c.last_ack += 1,
                    _ => {}
                }
            }
        }
        c
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// A local interface address changed (or went away when `new` is
    /// `None`). Connections on the old address are aborted; listeners bound
    /// to it move to the new one.
    pub fn netif_ip_addr_changed(&mut self, old: IpAddr, new: Option<IpAddr>) {
        if old.is_unspecified() {
            return;
        }
        if new.map_or(true, |n| !n.is_unspecified() && n != old) {
            for list in [PcbList::Active, PcbList::Bound] {
                for id in self.pcbs.ids(list) {
                    let Some(pcb) = self.pcbs.conn(id) else { continue };
                    let local = pcb.conn_mgmt.local_ip;
                    // link-local connections survive (RFC 3927, 1.9)
                    let link_local = matches!(local, IpAddr::V4(v4) if v4.is_link_local());
                    if local == old && !link_local {
                        self.abandon_pcb(id, true);
                    }
                }
            }
        }
        if let Some(new) = new.filter(|n| !n.is_unspecified()) {
            for id in self.pcbs.ids(PcbList::Listen) {
                if let Some(lpcb) = self.pcbs.listener_mut(id) {
                    if !lpcb.local_ip.is_unspecified() && lpcb.local_ip == old {
                        lpcb.local_ip = new;
                    }
                }
            }
        }
    }

    /// Every PCB sits on the list its state calls for, and only live PCBs
    /// are linked.
    pub fn pcbs_sane(&self) -> bool {
        let mut listeners = 0;
        let lists_ok = self.pcbs.all().all(|(_, pcb, list)| {
            let bound = pcb.local_port() != 0;
            if pcb.is_listen() {
                listeners += 1;
            }
            pcb.is_listen() == (list == Some(PcbList::Listen)) && pcb.state().expected_list(bound) == list
        });
        lists_ok && listeners == self.pcbs.listen_count()
    }

    /// Dump all four lists through `log` at debug level.
    pub fn debug_print_pcbs(&self) {
        for list in PcbList::ALL {
            log::debug!("{:?} PCB states:", list);
            for (id, pcb) in self.pcbs.iter(list) {
                match pcb {
                    Pcb::Conn(p) => {
                        let cm = &p.conn_mgmt;
                        log::debug!(
                            "  [{}] local port {}, foreign port {} snd_nxt {} rcv_nxt {} {}",
                            id.index(),
                            cm.local_port,
                            cm.remote_port,
                            p.rod.snd_nxt,
                            p.rod.rcv_nxt,
                            cm.state
                        );
                    }
                    Pcb::Listen(l) => {
                        log::debug!("  [{}] local port {} LISTEN", id.index(), l.local_port);
                    }
                }
            }
        }
    }
}
