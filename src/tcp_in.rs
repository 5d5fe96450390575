//! TCP Packet Reception (RX Path)
//!
//! Demultiplexes an inbound segment to its PCB and runs it through the
//! state machine. Per-segment scratch state lives in `Inbound` rather than
//! in globals; callbacks fire only after the segment has been fully
//! processed, and every callback may free the PCB it was called for.

use bitflags::bitflags;

use crate::config::TCP_MSS;
use crate::err::{Error, Result};
use crate::pool::{PcbId, SegPool};
use crate::state::{CongestionControlState, IpAddrType, Pcb, PcbFlags, PcbList, SocketOptions, TcpState};
use crate::tcp::TcpStack;
use crate::tcp_proto::TcpFlags;
use crate::tcp_types::{seq_between, seq_geq, seq_gt, seq_leq, seq_lt, RefusedData, TcpSeg, TcpSegment};

bitflags! {
    /// Outcome of processing one segment (lwIP `recv_flags`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct RecvFlags: u8 {
        const RESET   = 0x08;
        const CLOSED  = 0x10;
        const GOT_FIN = 0x20;
    }
}

/// One inbound segment while it is being processed
struct Inbound<'a> {
    seg: &'a TcpSegment,
    /// Sequence number, flags and payload, trimmed as processing goes
    inseg: TcpSeg,
    recv_flags: RecvFlags,
    /// In-order data to hand to the application
    recv_data: Option<Vec<u8>>,
}

impl<'a> Inbound<'a> {
    fn new(seg: &'a TcpSegment) -> Self {
        Self {
            seg,
            inseg: TcpSeg::new(seg.seqno, seg.flags, seg.payload.clone()),
            recv_flags: RecvFlags::empty(),
            recv_data: None,
        }
    }

    fn has(&self, flag: TcpFlags) -> bool {
        self.inseg.flags.contains(flag)
    }

    fn seqno(&self) -> u32 {
        self.inseg.seqno
    }

    fn ackno(&self) -> u32 {
        self.seg.ackno
    }

    fn tcplen(&self) -> u32 {
        self.inseg.tcplen()
    }
}

impl TcpStack {
    /// Process one inbound segment addressed to this host.
    pub fn input(&mut self, seg: &TcpSegment) {
        let mut inp = Inbound::new(seg);
        log::trace!(
            "tcp_input: {}:{} -> {}:{} seq {} ack {} {:?} len {}",
            seg.src, seg.src_port, seg.dst, seg.dst_port, seg.seqno, seg.ackno, seg.flags, seg.payload.len()
        );

        let matches = |list| {
            self.conns_on(list)
                .find(|(_, p)| p.conn_mgmt.matches(&seg.dst, seg.dst_port, &seg.src, seg.src_port))
                .map(|(id, _)| id)
        };

        if let Some(id) = matches(PcbList::Active) {
            // move to the front so busy connections are found first
            if self.pcbs.first(PcbList::Active) != Some(id) {
                self.pcbs.rmv(id);
                self.pcbs.reg(PcbList::Active, id);
            }
            self.input_active(id, &mut inp);
            return;
        }
        if let Some(id) = matches(PcbList::TimeWait) {
            self.timewait_input(id, &inp);
            return;
        }

        let mut exact = None;
        let mut any = None;
        for (id, pcb) in self.pcbs.iter(PcbList::Listen) {
            let Pcb::Listen(lpcb) = pcb else { continue };
            if lpcb.local_port != seg.dst_port {
                continue;
            }
            if lpcb.local_ip == seg.dst {
                exact = Some(id);
                break;
            }
            let wildcard_ok = lpcb.ip_type == IpAddrType::Any || lpcb.local_ip.is_ipv4() == seg.dst.is_ipv4();
            if lpcb.local_ip.is_unspecified() && wildcard_ok && any.is_none() {
                any = Some(id);
            }
        }
        if let Some(lid) = exact.or(any) {
            if self.pcbs.first(PcbList::Listen) != Some(lid) {
                self.pcbs.rmv(lid);
                self.pcbs.reg(PcbList::Listen, lid);
            }
            self.listen_input(lid, &inp);
            return;
        }

        // nobody home
        if !seg.flags.contains(TcpFlags::RST) {
            log::debug!("tcp_input: no PCB for port {}, sending RST", seg.dst_port);
            self.rst(seg.ackno, seg.seqno.wrapping_add(seg.tcplen()), seg.dst, seg.src, seg.dst_port, seg.src_port);
        }
    }

    fn input_active(&mut self, id: PcbId, inp: &mut Inbound<'_>) {
        let wnd = self.config.wnd;
        if self.pcbs.conn(id).is_some_and(|p| p.rod.refused_data.is_some()) {
            let res = self.process_refused_data(id);
            let still_refused = self.pcbs.conn(id).is_some_and(|p| p.rod.refused_data.is_some());
            if res == Err(Error::Abrt) || (still_refused && inp.tcplen() > 0) {
                // the application is not taking data; the peer retransmits
                log::debug!("tcp_input: refused data pending, dropping segment");
                return;
            }
        }

        self.input_pcb = Some(id);
        let res = self.process(id, inp);
        self.input_pcb = None;
        if res == Err(Error::Abrt) || !self.pcbs.contains(id) {
            return;
        }

        if inp.recv_flags.contains(RecvFlags::RESET) {
            self.pcb_remove(id);
            let handler = self.release(id);
            self.event_err(handler, id, Error::Rst);
            return;
        }

        self.input_pcb = Some(id);
        let delivered = self.deliver(id, inp);
        self.input_pcb = None;
        if delivered.is_err() || !self.pcbs.contains(id) {
            return;
        }
        let _ = self.output(id);

        if let Some(pcb) = self.pcbs.conn(id) {
            debug_assert!(pcb.flow_ctrl.rcv_wnd <= wnd);
        }
    }

    /// Run the application callbacks a processed segment calls for. `Err`
    /// means the PCB is gone.
    fn deliver(&mut self, id: PcbId, inp: &mut Inbound<'_>) -> Result<()> {
        let wnd = self.config.wnd;
        let acked = self.conn_ref(id)?.rod.acked;
        if acked > 0 {
            self.conn_mut(id)?.rod.acked = 0;
            let res = self.event_sent(id, acked);
            if res == Err(Error::Abrt) || !self.pcbs.contains(id) {
                return Err(Error::Abrt);
            }
        }

        if inp.recv_flags.contains(RecvFlags::CLOSED) {
            // LAST_ACK done: report it unless the application closed first
            let rx_closed = self.conn_ref(id)?.conn_mgmt.flags.contains(PcbFlags::RXCLOSED);
            self.pcb_remove(id);
            let handler = self.release(id);
            if !rx_closed {
                self.event_err(handler, id, Error::Clsd);
            }
            return Err(Error::Clsd);
        }

        if let Some(data) = inp.recv_data.take() {
            if self.conn_ref(id)?.conn_mgmt.flags.contains(PcbFlags::RXCLOSED) {
                // nobody will read this
                log::debug!("tcp_input: data after close, aborting");
                self.abandon_pcb(id, true);
                return Err(Error::Abrt);
            }
            let res = self.event_recv(id, Some(&data));
            if res == Err(Error::Abrt) || !self.pcbs.contains(id) {
                return Err(Error::Abrt);
            }
            if res.is_err() {
                self.conn_mut(id)?.rod.refused_data = Some(RefusedData { data, fin: false });
            }
        }

        if inp.recv_flags.contains(RecvFlags::GOT_FIN) {
            let pcb = self.conn_mut(id)?;
            if let Some(refused) = pcb.rod.refused_data.as_mut() {
                refused.fin = true;
            } else {
                if pcb.flow_ctrl.rcv_wnd != wnd {
                    // the FIN took one sequence number of window
                    pcb.flow_ctrl.rcv_wnd += 1;
                }
                let res = self.event_recv(id, None);
                if res == Err(Error::Abrt) || !self.pcbs.contains(id) {
                    return Err(Error::Abrt);
                }
            }
        }
        Ok(())
    }

    /// Offer previously refused data to the application again.
    pub(crate) fn process_refused_data(&mut self, id: PcbId) -> Result<()> {
        let wnd = self.config.wnd;
        let Some(refused) = self.conn_mut(id)?.rod.refused_data.take() else { return Ok(()) };

        let res = self.event_recv(id, Some(&refused.data));
        if !self.pcbs.contains(id) {
            return Err(Error::Abrt);
        }
        match res {
            Ok(()) => {
                if refused.fin {
                    let pcb = self.conn_mut(id)?;
                    if pcb.flow_ctrl.rcv_wnd != wnd {
                        pcb.flow_ctrl.rcv_wnd += 1;
                    }
                    let res = self.event_recv(id, None);
                    if res == Err(Error::Abrt) || !self.pcbs.contains(id) {
                        return Err(Error::Abrt);
                    }
                }
                Ok(())
            }
            Err(Error::Abrt) => Err(Error::Abrt),
            Err(_) => {
                // still not wanted; keep it for the next fast timer
                self.conn_mut(id)?.rod.refused_data = Some(refused);
                Err(Error::Inprogress)
            }
        }
    }

    // ------------------------------------------------------------------------
    // LISTEN and TIME_WAIT
    // ------------------------------------------------------------------------

    fn listen_input(&mut self, lid: PcbId, inp: &Inbound<'_>) {
        let seg = inp.seg;
        if inp.has(TcpFlags::RST) {
            return;
        }
        if inp.has(TcpFlags::ACK) {
            // an ACK to a listener is always bogus
            self.rst(seg.ackno, seg.seqno.wrapping_add(seg.tcplen()), seg.dst, seg.src, seg.dst_port, seg.src_port);
            return;
        }
        if !inp.has(TcpFlags::SYN) {
            return;
        }

        let Some(lpcb) = self.listener(lid) else { return };
        if lpcb.accepts_pending >= lpcb.backlog {
            log::debug!("tcp_listen_input: listen backlog exceeded for port {}", lpcb.local_port);
            return;
        }
        let (prio, so_options, ttl, tos) = (lpcb.prio, lpcb.so_options, lpcb.ttl, lpcb.tos);

        let npcb = match self.alloc(prio) {
            Ok(npcb) => npcb,
            Err(_) => {
                log::debug!("tcp_listen_input: could not allocate PCB");
                return;
            }
        };
        let Some(pcb) = self.pcbs.conn_mut(npcb) else { return };
        let cm = &mut pcb.conn_mgmt;
        cm.ip_type = if seg.dst.is_ipv4() { IpAddrType::V4 } else { IpAddrType::V6 };
        cm.local_ip = seg.dst;
        cm.local_port = seg.dst_port;
        cm.remote_ip = seg.src;
        cm.remote_port = seg.src_port;
        cm.so_options = so_options & SocketOptions::INHERITED;
        cm.ttl = ttl;
        cm.tos = tos;
        cm.set_state(TcpState::SynRcvd);
        pcb.rod.rcv_nxt = seg.seqno.wrapping_add(1);
        pcb.flow_ctrl.rcv_ann_right_edge = pcb.rod.rcv_nxt;
        // force a window update on the first ACK
        pcb.flow_ctrl.snd_wl1 = seg.seqno.wrapping_sub(1);
        pcb.listener = Some(lid);
        self.reg_active(npcb);
        let _ = self.backlog_delayed(npcb);

        self.parse_mss(npcb, inp);
        if let Some(pcb) = self.pcbs.conn_mut(npcb) {
            pcb.flow_ctrl.snd_wnd = seg.wnd;
            pcb.flow_ctrl.snd_wnd_max = seg.wnd;
            pcb.cong_ctrl.ssthresh = seg.wnd;
        }

        if let Err(e) = self.enqueue_flags(npcb, TcpFlags::SYN | TcpFlags::ACK) {
            log::debug!("tcp_listen_input: could not queue SYN|ACK: {}", e);
            self.abandon_pcb(npcb, false);
            return;
        }
        let _ = self.output(npcb);
    }

    fn timewait_input(&mut self, id: PcbId, inp: &Inbound<'_>) {
        let seg = inp.seg;
        if inp.has(TcpFlags::RST) {
            return;
        }
        let ticks = self.ticks;
        let Some(pcb) = self.pcbs.conn_mut(id) else { return };
        if inp.has(TcpFlags::SYN) {
            // a new connection attempt inside the old window: refuse it
            let right = pcb.rod.rcv_nxt.wrapping_add(u32::from(pcb.flow_ctrl.rcv_wnd));
            if seq_between(seg.seqno, pcb.rod.rcv_nxt, right) {
                self.rst(seg.ackno, seg.seqno.wrapping_add(seg.tcplen()), seg.dst, seg.src, seg.dst_port, seg.src_port);
                return;
            }
        } else if inp.has(TcpFlags::FIN) {
            // restart the 2 MSL wait
            pcb.conn_mgmt.tmr = ticks;
        }
        if inp.tcplen() > 0 {
            pcb.conn_mgmt.ack_now();
            let _ = self.output(id);
        }
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    /// Take the MSS option from a SYN, capped at the configured MSS.
    fn parse_mss(&mut self, id: PcbId, inp: &Inbound<'_>) {
        if !inp.has(TcpFlags::SYN) {
            return;
        }
        let cap = core::cmp::min(TCP_MSS, self.config.mss);
        if let (Some(opt), Some(pcb)) = (inp.seg.mss, self.pcbs.conn_mut(id)) {
            pcb.conn_mgmt.mss = if opt > cap || opt == 0 { cap } else { opt };
        }
    }

    fn process(&mut self, id: PcbId, inp: &mut Inbound<'_>) -> Result<()> {
        let ticks = self.ticks;
        let pcb = self.conn_mut(id)?;
        let state = pcb.state();

        if inp.has(TcpFlags::RST) {
            let acceptable = if state == TcpState::SynSent {
                inp.ackno() == pcb.rod.snd_nxt
            } else {
                let right = pcb.rod.rcv_nxt.wrapping_add(u32::from(pcb.flow_ctrl.rcv_wnd));
                seq_between(inp.seqno(), pcb.rod.rcv_nxt, right)
            };
            if !acceptable {
                log::debug!("tcp_process: unacceptable reset seqno {} rcv_nxt {}", inp.seqno(), pcb.rod.rcv_nxt);
                return Ok(());
            }
            log::debug!("tcp_process: connection RESET");
            inp.recv_flags.insert(RecvFlags::RESET);
            pcb.conn_mgmt.flags.remove(PcbFlags::ACK_DELAY);
            return Err(Error::Rst);
        }

        if inp.has(TcpFlags::SYN) && !matches!(state, TcpState::SynSent | TcpState::SynRcvd) {
            // cope with new connection attempt after remote end crashed
            pcb.conn_mgmt.ack_now();
            return Ok(());
        }

        if !pcb.conn_mgmt.flags.contains(PcbFlags::RXCLOSED) {
            pcb.conn_mgmt.tmr = ticks;
        }
        pcb.conn_mgmt.keep_cnt_sent = 0;
        pcb.rod.acked = 0;
        self.parse_mss(id, inp);

        match state {
            TcpState::SynSent => self.process_synsent(id, inp),
            TcpState::SynRcvd => self.process_synrcvd(id, inp),
            TcpState::Established | TcpState::CloseWait => {
                self.receive(id, inp);
                if inp.recv_flags.contains(RecvFlags::GOT_FIN) {
                    let cm = &mut self.conn_mut(id)?.conn_mgmt;
                    cm.ack_now();
                    cm.set_state(TcpState::CloseWait);
                }
                Ok(())
            }
            TcpState::FinWait1 => self.process_finwait1(id, inp),
            TcpState::FinWait2 => self.process_finwait2(id, inp),
            TcpState::Closing => self.process_closing(id, inp),
            TcpState::LastAck => self.process_lastack(id, inp),
            _ => Ok(()),
        }
    }

    fn process_synsent(&mut self, id: PcbId, inp: &mut Inbound<'_>) -> Result<()> {
        let seg = inp.seg;
        let pcb = self.conn_mut(id)?;
        let syn_seqno = pcb.rod.unacked.front().map(|s| s.seqno);

        if inp.has(TcpFlags::ACK | TcpFlags::SYN) && syn_seqno.map(|s| s.wrapping_add(1)) == Some(inp.ackno()) {
            pcb.rod.snd_buf = pcb.rod.snd_buf.saturating_add(1);
            pcb.rod.rcv_nxt = seg.seqno.wrapping_add(1);
            pcb.flow_ctrl.rcv_ann_right_edge = pcb.rod.rcv_nxt;
            pcb.rod.lastack = inp.ackno();
            pcb.flow_ctrl.snd_wnd = seg.wnd;
            pcb.flow_ctrl.snd_wnd_max = seg.wnd;
            // force a window update on the next segment
            pcb.flow_ctrl.snd_wl1 = seg.seqno.wrapping_sub(1);
            pcb.conn_mgmt.set_state(TcpState::Established);

            pcb.cong_ctrl.ssthresh = seg.wnd;
            pcb.cong_ctrl.on_established(pcb.conn_mgmt.mss);
            log::debug!("tcp_process: SYN_SENT cwnd {} ssthresh {}", pcb.cong_ctrl.cwnd, pcb.cong_ctrl.ssthresh);

            pcb.rod.snd_queuelen = pcb.rod.snd_queuelen.saturating_sub(1);
            if pcb.rod.unacked.pop_front().is_some() {
                self.segs.release(1);
            }
            let pcb = self.conn_mut(id)?;
            if pcb.rod.unacked.is_empty() {
                pcb.rod.rtime = -1;
            } else {
                pcb.rod.rtime = 0;
                pcb.rod.nrtx = 0;
            }

            let res = self.event_connected(id);
            if res == Err(Error::Abrt) || !self.pcbs.contains(id) {
                return Err(Error::Abrt);
            }
            self.conn_mut(id)?.conn_mgmt.ack_now();
        } else if inp.has(TcpFlags::ACK) {
            // not our SYN being acknowledged
            self.rst(seg.ackno, seg.seqno.wrapping_add(seg.tcplen()), seg.dst, seg.src, seg.dst_port, seg.src_port);
            let syn_max_rtx = self.config.syn_max_rtx;
            let pcb = self.conn_mut(id)?;
            if pcb.rod.nrtx < syn_max_rtx {
                // resend our SYN right away
                pcb.rod.rtime = 0;
                self.rexmit_rto(id);
            }
        }
        Ok(())
    }

    fn process_synrcvd(&mut self, id: PcbId, inp: &mut Inbound<'_>) -> Result<()> {
        let seg = inp.seg;
        let pcb = self.conn_ref(id)?;
        let (lastack, snd_nxt, rcv_nxt) = (pcb.rod.lastack, pcb.rod.snd_nxt, pcb.rod.rcv_nxt);

        if inp.has(TcpFlags::ACK) {
            if !seq_between(inp.ackno(), lastack.wrapping_add(1), snd_nxt) {
                // incorrect ACK number
                self.rst(seg.ackno, seg.seqno.wrapping_add(seg.tcplen()), seg.dst, seg.src, seg.dst_port, seg.src_port);
                return Ok(());
            }
            let pcb = self.conn_mut(id)?;
            pcb.conn_mgmt.set_state(TcpState::Established);
            let listener = pcb.listener.filter(|l| self.listener(*l).is_some());

            let res = match listener {
                Some(lid) => {
                    self.backlog_accepted(id);
                    self.event_accept(lid, id)
                }
                None => Err(Error::Val),
            };
            if let Err(e) = res {
                // the application refused the connection, or the listener
                // is gone
                if e != Error::Abrt && self.pcbs.contains(id) {
                    self.abandon_pcb(id, true);
                }
                return Err(Error::Abrt);
            }
            if !self.pcbs.contains(id) {
                return Err(Error::Abrt);
            }

            self.receive(id, inp);
            let pcb = self.conn_mut(id)?;
            pcb.cong_ctrl.ssthresh = pcb.flow_ctrl.snd_wnd;
            // the SYN took one sequence number but is no data
            if pcb.rod.acked != 0 {
                pcb.rod.acked -= 1;
            }
            pcb.cong_ctrl.cwnd = CongestionControlState::initial_cwnd(pcb.conn_mgmt.mss);
            if inp.recv_flags.contains(RecvFlags::GOT_FIN) {
                pcb.conn_mgmt.ack_now();
                pcb.conn_mgmt.set_state(TcpState::CloseWait);
            }
        } else if inp.has(TcpFlags::SYN) && seg.seqno == rcv_nxt.wrapping_sub(1) {
            // looks like another copy of the SYN: resend the SYN|ACK
            let _ = self.rexmit(id);
        }
        Ok(())
    }

    fn process_finwait1(&mut self, id: PcbId, inp: &mut Inbound<'_>) -> Result<()> {
        self.receive(id, inp);
        let fin_acked = self.our_fin_acked(id, inp)?;
        if inp.recv_flags.contains(RecvFlags::GOT_FIN) {
            self.conn_mut(id)?.conn_mgmt.ack_now();
            if fin_acked {
                self.enter_time_wait(id);
            } else {
                self.conn_mut(id)?.conn_mgmt.set_state(TcpState::Closing);
            }
        } else if fin_acked {
            self.conn_mut(id)?.conn_mgmt.set_state(TcpState::FinWait2);
        }
        Ok(())
    }

    fn process_finwait2(&mut self, id: PcbId, inp: &mut Inbound<'_>) -> Result<()> {
        self.receive(id, inp);
        if inp.recv_flags.contains(RecvFlags::GOT_FIN) {
            self.conn_mut(id)?.conn_mgmt.ack_now();
            self.enter_time_wait(id);
        }
        Ok(())
    }

    fn process_closing(&mut self, id: PcbId, inp: &mut Inbound<'_>) -> Result<()> {
        self.receive(id, inp);
        if self.our_fin_acked(id, inp)? {
            self.enter_time_wait(id);
        }
        Ok(())
    }

    fn process_lastack(&mut self, id: PcbId, inp: &mut Inbound<'_>) -> Result<()> {
        self.receive(id, inp);
        if self.our_fin_acked(id, inp)? {
            // freed by input once the callbacks have run
            inp.recv_flags.insert(RecvFlags::CLOSED);
        }
        Ok(())
    }

    fn our_fin_acked(&self, id: PcbId, inp: &Inbound<'_>) -> Result<bool> {
        let pcb = self.conn_ref(id)?;
        Ok(inp.has(TcpFlags::ACK) && inp.ackno() == pcb.rod.snd_nxt && pcb.rod.unsent.is_empty())
    }

    fn enter_time_wait(&mut self, id: PcbId) {
        self.purge(id);
        self.unlink(id);
        if let Some(pcb) = self.pcbs.conn_mut(id) {
            pcb.conn_mgmt.set_state(TcpState::TimeWait);
            self.pcbs.reg(PcbList::TimeWait, id);
        }
    }

    // ------------------------------------------------------------------------
    // ACK and data processing
    // ------------------------------------------------------------------------

    fn receive(&mut self, id: PcbId, inp: &mut Inbound<'_>) {
        if inp.has(TcpFlags::ACK) {
            self.receive_ack(id, inp);
        }
        self.receive_data(id, inp);
    }

    fn receive_ack(&mut self, id: PcbId, inp: &mut Inbound<'_>) {
        let ticks = self.ticks;
        let Some(pcb) = self.pcbs.conn_mut(id) else { return };
        let (seqno, ackno, wnd) = (inp.seqno(), inp.ackno(), inp.seg.wnd);
        let mss = pcb.conn_mgmt.mss;

        let fc = &mut pcb.flow_ctrl;
        let right_wnd_edge = fc.snd_wl2.wrapping_add(u32::from(fc.snd_wnd));
        if seq_lt(fc.snd_wl1, seqno)
            || (fc.snd_wl1 == seqno && seq_lt(fc.snd_wl2, ackno))
            || (fc.snd_wl2 == ackno && wnd > fc.snd_wnd)
        {
            fc.snd_wnd = wnd;
            if fc.snd_wnd_max < wnd {
                fc.snd_wnd_max = wnd;
            }
            fc.snd_wl1 = seqno;
            fc.snd_wl2 = ackno;
            if fc.snd_wnd == 0 {
                fc.start_persist();
            } else if fc.persist_backoff > 0 {
                fc.stop_persist();
            }
            log::trace!("tcp_receive: window update {}", fc.snd_wnd);
        }

        let mut fast_rexmit = false;
        let mut bad_ack = false;
        if seq_leq(ackno, pcb.rod.lastack) {
            pcb.rod.acked = 0;
            // a pure duplicate: no data, same window, something in flight
            let same_wnd = pcb.flow_ctrl.snd_wl2.wrapping_add(u32::from(pcb.flow_ctrl.snd_wnd)) == right_wnd_edge;
            if inp.tcplen() == 0 && same_wnd && pcb.rod.rtime >= 0 && pcb.rod.lastack == ackno {
                pcb.rod.dupacks = pcb.rod.dupacks.saturating_add(1);
                if pcb.rod.dupacks > 3 {
                    pcb.cong_ctrl.on_dupack(mss);
                } else if pcb.rod.dupacks == 3 {
                    fast_rexmit = true;
                }
            } else {
                pcb.rod.dupacks = 0;
            }
        } else if seq_between(ackno, pcb.rod.lastack.wrapping_add(1), pcb.rod.snd_nxt) {
            // new data acknowledged
            if pcb.conn_mgmt.flags.contains(PcbFlags::INFR) {
                pcb.conn_mgmt.flags.remove(PcbFlags::INFR);
                pcb.cong_ctrl.cwnd = pcb.cong_ctrl.ssthresh;
            }
            pcb.rod.nrtx = 0;
            pcb.rod.rto = pcb.rod.rto_base();
            pcb.rod.acked = u16::try_from(ackno.wrapping_sub(pcb.rod.lastack)).unwrap_or(u16::MAX);
            pcb.rod.snd_buf = pcb.rod.snd_buf.saturating_add(pcb.rod.acked);
            pcb.rod.dupacks = 0;
            pcb.rod.lastack = ackno;

            if pcb.state() >= TcpState::Established {
                pcb.cong_ctrl.on_new_ack(mss);
            }

            while let Some(front) = pcb.rod.unacked.front() {
                if !seq_leq(front.end(), ackno) {
                    break;
                }
                let has_fin = front.flags.contains(TcpFlags::FIN);
                pcb.rod.unacked.pop_front();
                if has_fin && pcb.rod.acked != 0 {
                    pcb.rod.acked -= 1;
                }
                pcb.rod.snd_queuelen = pcb.rod.snd_queuelen.saturating_sub(1);
                self.segs.release(1);
            }
            pcb.rod.rtime = if pcb.rod.unacked.is_empty() { -1 } else { 0 };
            pcb.conn_mgmt.polltmr = 0;
        } else {
            // acks something we never sent
            pcb.rod.acked = 0;
            bad_ack = true;
        }

        // segments requeued by a timeout may have been acked meanwhile
        while let Some(front) = pcb.rod.unsent.front() {
            if !seq_between(ackno, front.end(), pcb.rod.snd_nxt) {
                break;
            }
            let has_fin = front.flags.contains(TcpFlags::FIN);
            pcb.rod.unsent.pop_front();
            if has_fin && pcb.rod.acked != 0 {
                pcb.rod.acked -= 1;
            }
            pcb.rod.snd_queuelen = pcb.rod.snd_queuelen.saturating_sub(1);
            self.segs.release(1);
        }

        if pcb.rod.rttest != 0 && seq_lt(pcb.rod.rtseq, ackno) {
            let m = i16::try_from(ticks.wrapping_sub(pcb.rod.rttest)).unwrap_or(i16::MAX);
            pcb.rod.update_rtt(m);
            log::trace!("tcp_receive: RTO {} ({} ms)", pcb.rod.rto, i32::from(pcb.rod.rto) * 500);
            pcb.rod.rttest = 0;
        }

        if fast_rexmit {
            self.rexmit_fast(id);
        }
        if bad_ack {
            let _ = self.send_empty_ack(id);
        }
    }

    fn receive_data(&mut self, id: PcbId, inp: &mut Inbound<'_>) {
        let wnd_max = self.config.wnd;
        let Some(pcb) = self.pcbs.conn_mut(id) else { return };

        if inp.tcplen() == 0 || pcb.state() >= TcpState::CloseWait {
            // zero-length segments outside the window are ACKed
            let last = pcb.rod.rcv_nxt.wrapping_add(u32::from(pcb.flow_ctrl.rcv_wnd)).wrapping_sub(1);
            if !seq_between(inp.seqno(), pcb.rod.rcv_nxt, last) {
                pcb.conn_mgmt.ack_now();
            }
            return;
        }

        let rcv_nxt = pcb.rod.rcv_nxt;
        let seqno = inp.seqno();
        let tcplen = inp.tcplen();
        if seq_between(rcv_nxt, seqno.wrapping_add(1), seqno.wrapping_add(tcplen).wrapping_sub(1)) {
            // starts before rcv_nxt but carries new data: cut the old part
            let off = rcv_nxt.wrapping_sub(seqno) as usize;
            let cut = off.min(inp.inseg.data.len());
            inp.inseg.data.drain(..cut);
            inp.inseg.seqno = rcv_nxt;
        } else if seq_lt(seqno, rcv_nxt) {
            // entirely old: a retransmission, ACK it again
            pcb.conn_mgmt.ack_now();
        }

        let seqno = inp.seqno();
        let rcv_wnd = u32::from(pcb.flow_ctrl.rcv_wnd);
        let last = rcv_nxt.wrapping_add(rcv_wnd).wrapping_sub(1);
        if !seq_between(seqno, rcv_nxt, last) {
            let _ = self.send_empty_ack(id);
            return;
        }

        if seqno != rcv_nxt {
            // out of sequence: ACK what we have, keep the segment for later
            let _ = self.send_empty_ack(id);
            let Some(pcb) = self.pcbs.conn_mut(id) else { return };
            let right = pcb.rod.rcv_nxt.wrapping_add(u32::from(pcb.flow_ctrl.rcv_wnd));
            ooseq_insert(&mut pcb.rod.ooseq, &mut self.segs, inp.inseg.clone(), right);
            return;
        }

        // in sequence
        let inseg = &mut inp.inseg;
        if inseg.tcplen() > rcv_wnd {
            log::trace!("tcp_receive: other end overran receive window (seqno {}, len {})", seqno, inseg.tcplen());
            inseg.flags.remove(TcpFlags::FIN);
            let room = if inseg.flags.contains(TcpFlags::SYN) { rcv_wnd.saturating_sub(1) } else { rcv_wnd };
            inseg.data.truncate(room as usize);
        }

        let ooseq = &mut pcb.rod.ooseq;
        if !ooseq.is_empty() {
            if inseg.flags.contains(TcpFlags::FIN) {
                // nothing can follow a FIN
                self.segs.free_chain(ooseq);
            } else {
                while let Some(next) = ooseq.front() {
                    if !seq_geq(inseg.end(), data_end(next)) {
                        break;
                    }
                    if next.flags.contains(TcpFlags::FIN) && !inseg.flags.contains(TcpFlags::SYN) {
                        inseg.flags.insert(TcpFlags::FIN);
                    }
                    ooseq.pop_front();
                    self.segs.release(1);
                }
                if let Some(next) = ooseq.front() {
                    if seq_gt(inseg.end(), next.seqno) {
                        let mut keep = next.seqno.wrapping_sub(seqno);
                        if inseg.flags.contains(TcpFlags::SYN) {
                            keep = keep.saturating_sub(1);
                        }
                        inseg.data.truncate(keep as usize);
                    }
                }
            }
        }

        let tcplen = inseg.tcplen();
        pcb.rod.rcv_nxt = seqno.wrapping_add(tcplen);
        debug_assert!(u32::from(pcb.flow_ctrl.rcv_wnd) >= tcplen, "tcp_receive: tcplen > rcv_wnd");
        pcb.flow_ctrl.rcv_wnd = pcb.flow_ctrl.rcv_wnd.saturating_sub(tcplen as u16);
        pcb.flow_ctrl.update_rcv_ann_wnd(pcb.rod.rcv_nxt, pcb.conn_mgmt.mss, wnd_max);

        let mut delivered = core::mem::take(&mut inseg.data);
        if inseg.flags.contains(TcpFlags::FIN) {
            log::debug!("tcp_receive: received FIN");
            inp.recv_flags.insert(RecvFlags::GOT_FIN);
        }

        // queued segments that are now in sequence
        while pcb.rod.ooseq.front().is_some_and(|s| s.seqno == pcb.rod.rcv_nxt) {
            let Some(mut seg) = pcb.rod.ooseq.pop_front() else { break };
            self.segs.release(1);
            let len = seg.tcplen();
            pcb.rod.rcv_nxt = pcb.rod.rcv_nxt.wrapping_add(len);
            pcb.flow_ctrl.rcv_wnd = pcb.flow_ctrl.rcv_wnd.saturating_sub(len as u16);
            pcb.flow_ctrl.update_rcv_ann_wnd(pcb.rod.rcv_nxt, pcb.conn_mgmt.mss, wnd_max);
            delivered.append(&mut seg.data);
            if seg.flags.contains(TcpFlags::FIN) {
                log::debug!("tcp_receive: dequeued FIN");
                inp.recv_flags.insert(RecvFlags::GOT_FIN);
                if pcb.state() == TcpState::Established {
                    pcb.conn_mgmt.set_state(TcpState::CloseWait);
                }
            }
        }
        if !delivered.is_empty() {
            inp.recv_data = Some(delivered);
        }
        pcb.conn_mgmt.ack_delayed();
    }
}

fn data_end(seg: &TcpSeg) -> u32 {
    seg.seqno.wrapping_add(seg.data.len() as u32)
}

/// Queue an out-of-sequence segment, trimming overlaps with its
/// neighbours. `right` is the right edge of the receive window. A segment
/// that cannot get a pool unit is dropped.
fn ooseq_insert(ooseq: &mut std::collections::VecDeque<TcpSeg>, segs: &mut SegPool, seg: TcpSeg, right: u32) {
    if ooseq.is_empty() {
        if segs.alloc().is_ok() {
            ooseq.push_back(seg);
        }
        return;
    }

    let seqno = seg.seqno;
    for i in 0..ooseq.len() {
        let next_seqno = ooseq[i].seqno;
        if seqno == next_seqno {
            // same start: keep whichever is longer
            if seg.data.len() > ooseq[i].data.len() && segs.alloc().is_ok() {
                ooseq.insert(i, seg);
                ooseq_settle(ooseq, segs, i);
            }
            return;
        }
        if i == 0 {
            if seq_lt(seqno, next_seqno) {
                if segs.alloc().is_ok() {
                    ooseq.insert(0, seg);
                    ooseq_settle(ooseq, segs, 0);
                }
                return;
            }
        } else {
            let prev_seqno = ooseq[i - 1].seqno;
            if seq_between(seqno, prev_seqno.wrapping_add(1), next_seqno.wrapping_sub(1)) {
                if segs.alloc().is_err() {
                    return;
                }
                let prev = &mut ooseq[i - 1];
                if seq_gt(data_end(prev), seqno) {
                    prev.data.truncate(seqno.wrapping_sub(prev_seqno) as usize);
                }
                ooseq.insert(i, seg);
                ooseq_settle(ooseq, segs, i);
                return;
            }
        }
        if i == ooseq.len() - 1 && seq_gt(seqno, next_seqno) {
            let last = &mut ooseq[i];
            if last.flags.contains(TcpFlags::FIN) {
                // nothing goes after a FIN
                return;
            }
            if segs.alloc().is_err() {
                return;
            }
            if seq_gt(data_end(last), seqno) {
                last.data.truncate(seqno.wrapping_sub(next_seqno) as usize);
            }
            let mut seg = seg;
            if seq_gt(seqno.wrapping_add(seg.tcplen()), right) {
                // keep it inside the window
                seg.flags.remove(TcpFlags::FIN);
                seg.data.truncate(right.wrapping_sub(seqno) as usize);
            }
            ooseq.push_back(seg);
            return;
        }
    }
}

/// The segment at `at` was just queued: drop what it fully covers and
/// trim it against the next one.
fn ooseq_settle(ooseq: &mut std::collections::VecDeque<TcpSeg>, segs: &mut SegPool, at: usize) {
    if ooseq[at].flags.contains(TcpFlags::FIN) {
        let dropped = ooseq.len() - at - 1;
        ooseq.truncate(at + 1);
        segs.release(dropped);
        return;
    }
    let seg_end = data_end(&ooseq[at]);
    while let Some(next) = ooseq.get(at + 1) {
        if !seq_geq(seg_end, data_end(next)) {
            break;
        }
        if next.flags.contains(TcpFlags::FIN) {
            ooseq[at].flags.insert(TcpFlags::FIN);
        }
        ooseq.remove(at + 1);
        segs.release(1);
    }
    if let Some(next_seqno) = ooseq.get(at + 1).map(|n| n.seqno) {
        if seq_gt(seg_end, next_seqno) {
            let keep = next_seqno.wrapping_sub(ooseq[at].seqno);
            ooseq[at].data.truncate(keep as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn seg(seqno: u32, len: usize) -> TcpSeg {
        TcpSeg::new(seqno, TcpFlags::ACK, vec![0xab; len])
    }

    fn starts(q: &VecDeque<TcpSeg>) -> Vec<(u32, usize)> {
        q.iter().map(|s| (s.seqno, s.data.len())).collect()
    }

    #[test]
    fn ooseq_keeps_order() {
        let mut q = VecDeque::new();
        let mut pool = SegPool::new(8);
        ooseq_insert(&mut q, &mut pool, seg(300, 100), 10_000);
        ooseq_insert(&mut q, &mut pool, seg(100, 100), 10_000);
        ooseq_insert(&mut q, &mut pool, seg(500, 100), 10_000);
        assert_eq!(starts(&q), vec![(100, 100), (300, 100), (500, 100)]);
        assert_eq!(pool.used(), 3);
    }

    #[test]
    fn ooseq_longer_duplicate_replaces() {
        let mut q = VecDeque::new();
        let mut pool = SegPool::new(8);
        ooseq_insert(&mut q, &mut pool, seg(100, 50), 10_000);
        ooseq_insert(&mut q, &mut pool, seg(100, 20), 10_000);
        assert_eq!(starts(&q), vec![(100, 50)]);

        ooseq_insert(&mut q, &mut pool, seg(100, 80), 10_000);
        assert_eq!(starts(&q), vec![(100, 80)]);
        assert_eq!(pool.used(), 1);
    }

    #[test]
    fn ooseq_trims_overlaps() {
        let mut q = VecDeque::new();
        let mut pool = SegPool::new(8);
        ooseq_insert(&mut q, &mut pool, seg(100, 100), 10_000);
        ooseq_insert(&mut q, &mut pool, seg(300, 100), 10_000);
        // overlaps both neighbours
        ooseq_insert(&mut q, &mut pool, seg(150, 200), 10_000);
        assert_eq!(starts(&q), vec![(100, 50), (150, 150), (300, 100)]);
    }

    #[test]
    fn ooseq_nothing_after_fin() {
        let mut q = VecDeque::new();
        let mut pool = SegPool::new(8);
        ooseq_insert(&mut q, &mut pool, TcpSeg::new(100, TcpFlags::ACK | TcpFlags::FIN, vec![1; 10]), 10_000);
        ooseq_insert(&mut q, &mut pool, seg(200, 10), 10_000);
        assert_eq!(q.len(), 1);
        assert_eq!(pool.used(), 1);
    }

    #[test]
    fn ooseq_tail_clipped_to_window() {
        let mut q = VecDeque::new();
        let mut pool = SegPool::new(8);
        ooseq_insert(&mut q, &mut pool, seg(100, 10), 1000);
        ooseq_insert(&mut q, &mut pool, TcpSeg::new(900, TcpFlags::ACK | TcpFlags::FIN, vec![1; 200]), 1000);
        assert_eq!(starts(&q), vec![(100, 10), (900, 100)]);
        assert!(!q[1].flags.contains(TcpFlags::FIN));
    }

    #[test]
    fn ooseq_drops_when_pool_empty() {
        let mut q = VecDeque::new();
        let mut pool = SegPool::new(1);
        ooseq_insert(&mut q, &mut pool, seg(100, 10), 10_000);
        ooseq_insert(&mut q, &mut pool, seg(300, 10), 10_000);
        assert_eq!(q.len(), 1);
    }
}
