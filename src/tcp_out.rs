//! TCP Packet Transmission (TX Path)
//!
//! Queues application data and control segments on `unsent`, pushes them
//! out within the send window, and builds the standalone segments that
//! never get queued: empty ACKs, RSTs, keepalives and zero-window probes.

use std::net::IpAddr;

use crate::err::{Error, Result};
use crate::pool::PcbId;
use crate::state::{PcbFlags, TcpState};
use crate::tcp::TcpStack;
use crate::tcp_proto::{build_mss_option, TcpFlags, TcpHdr, TCP_HLEN};
use crate::tcp_types::{seq_lt, OutSegment, TcpSeg};

/// Addressing of a PCB, copied out so the PCB borrow can end before
/// the segment is handed to `NetIf`
#[derive(Clone, Copy)]
struct Route {
    local_ip: IpAddr,
    remote_ip: IpAddr,
    local_port: u16,
    remote_port: u16,
    ttl: u8,
    tos: u8,
}

impl TcpStack {
    fn route_of(&self, id: PcbId) -> Result<Route> {
        let cm = &self.conn_ref(id)?.conn_mgmt;
        Ok(Route {
            local_ip: cm.local_ip,
            remote_ip: cm.remote_ip,
            local_port: cm.local_port,
            remote_port: cm.remote_port,
            ttl: cm.ttl,
            tos: cm.tos,
        })
    }

    /// Source address for a segment to `remote`: `local` unless it is the
    /// wildcard, in which case the routing table decides.
    fn source_addr(&mut self, local: IpAddr, remote: &IpAddr) -> Result<IpAddr> {
        if local.is_unspecified() {
            self.netif.route(remote).ok_or(Error::Rte)
        } else {
            Ok(local)
        }
    }

    fn transmit(&mut self, rt: &Route, mut hdr: TcpHdr, options: &[u8], payload: &[u8]) -> Result<()> {
        if !options.is_empty() {
            hdr.set_hdrlen(((TCP_HLEN + options.len()) / 4) as u16);
        }
        let src = self.source_addr(rt.local_ip, &rt.remote_ip)?;
        let seg = OutSegment { src, dst: rt.remote_ip, ttl: rt.ttl, tos: rt.tos, hdr, options, payload };
        self.netif.output(&seg)
    }

    // ------------------------------------------------------------------------
    // Enqueueing
    // ------------------------------------------------------------------------

    /// Queue application data. Nothing is sent until `output` runs.
    pub fn write(&mut self, id: PcbId, data: &[u8]) -> Result<()> {
        let max_queuelen = self.config.snd_queuelen;
        let pcb = match self.conn_mut(id) {
            Err(Error::Val) => return Err(Error::Conn),
            other => other?,
        };
        match pcb.state() {
            TcpState::Established | TcpState::CloseWait | TcpState::SynSent | TcpState::SynRcvd => {}
            _ => return Err(Error::Conn),
        }
        if data.is_empty() {
            return Ok(());
        }
        let len = u16::try_from(data.len()).map_err(|_| Error::Mem)?;
        if len > pcb.rod.snd_buf {
            log::debug!("tcp_write: too much data (len={} > snd_buf={})", len, pcb.rod.snd_buf);
            return Err(Error::Mem);
        }

        let mss = pcb.conn_mgmt.mss;
        let chunk = match core::cmp::min(mss, pcb.flow_ctrl.snd_wnd_max / 2) {
            0 => mss,
            n => n,
        };
        let nsegs = data.len().div_ceil(usize::from(chunk));
        if usize::from(pcb.rod.snd_queuelen) + nsegs > usize::from(max_queuelen) {
            log::debug!("tcp_write: too long queue {} (max {})", pcb.rod.snd_queuelen, max_queuelen);
            return Err(Error::Mem);
        }
        if self.segs.available() < nsegs {
            log::warn!("tcp_write: no segments for {} bytes", len);
            return Err(Error::Mem);
        }

        let Some(pcb) = self.pcbs.conn_mut(id) else { return Err(Error::Arg) };
        let mut pieces = data.chunks(usize::from(chunk)).peekable();
        while let Some(piece) = pieces.next() {
            self.segs.alloc()?;
            let flags = if pieces.peek().is_none() { TcpFlags::PSH } else { TcpFlags::empty() };
            pcb.rod.unsent.push_back(TcpSeg::new(pcb.rod.snd_lbb, flags, piece.to_vec()));
            pcb.rod.snd_lbb = pcb.rod.snd_lbb.wrapping_add(piece.len() as u32);
            pcb.rod.snd_queuelen += 1;
        }
        pcb.rod.snd_buf -= len;
        log::trace!("tcp_write: queued {} bytes, snd_buf {}", len, pcb.rod.snd_buf);
        Ok(())
    }

    /// Queue a bare SYN and/or FIN segment.
    pub(crate) fn enqueue_flags(&mut self, id: PcbId, flags: TcpFlags) -> Result<()> {
        debug_assert!(flags.intersects(TcpFlags::SYN | TcpFlags::FIN));
        let max_queuelen = self.config.snd_queuelen;
        let Some(pcb) = self.pcbs.conn_mut(id) else { return Err(Error::Arg) };

        // a FIN always gets through
        if pcb.rod.snd_queuelen >= max_queuelen && !flags.contains(TcpFlags::FIN) {
            log::debug!("tcp_enqueue_flags: too long queue {} (max {})", pcb.rod.snd_queuelen, max_queuelen);
            return Err(Error::Mem);
        }
        self.segs.alloc()?;

        let mut seg = TcpSeg::new(pcb.rod.snd_lbb, flags, Vec::new());
        seg.mss_opt = flags.contains(TcpFlags::SYN);
        pcb.rod.unsent.push_back(seg);

        pcb.rod.snd_lbb = pcb.rod.snd_lbb.wrapping_add(1);
        pcb.rod.snd_buf = pcb.rod.snd_buf.saturating_sub(1);
        if flags.contains(TcpFlags::FIN) {
            pcb.conn_mgmt.flags.insert(PcbFlags::FIN);
        }
        pcb.rod.snd_queuelen += 1;
        Ok(())
    }

    /// Queue a FIN, riding on the last unsent segment when it can.
    pub(crate) fn send_fin(&mut self, id: PcbId) -> Result<()> {
        let Some(pcb) = self.pcbs.conn_mut(id) else { return Err(Error::Arg) };
        if let Some(last) = pcb.rod.unsent.back_mut() {
            if !last.flags.intersects(TcpFlags::SYN | TcpFlags::FIN | TcpFlags::RST) {
                last.flags.insert(TcpFlags::FIN);
                pcb.rod.snd_lbb = pcb.rod.snd_lbb.wrapping_add(1);
                pcb.conn_mgmt.flags.insert(PcbFlags::FIN);
                return Ok(());
            }
        }
        self.enqueue_flags(id, TcpFlags::FIN)
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    /// Send whatever `unsent` holds that fits in `min(snd_wnd, cwnd)`, or a
    /// bare ACK if one is due and nothing else goes out.
    pub fn output(&mut self, id: PcbId) -> Result<()> {
        // the input path flushes once it is done with the segment
        if self.input_pcb == Some(id) {
            return Ok(());
        }
        let pcb = self.conn_mut(id)?;
        let wnd = u32::from(pcb.flow_ctrl.eff_wnd(pcb.cong_ctrl.cwnd));
        let lastack = pcb.rod.lastack;
        let fits = |seg: &TcpSeg| seg.seqno.wrapping_sub(lastack).wrapping_add(seg.data.len() as u32) <= wnd;

        let front_fits = pcb.rod.unsent.front().map(fits);
        if pcb.conn_mgmt.flags.contains(PcbFlags::ACK_NOW) && front_fits != Some(true) {
            return self.send_empty_ack(id);
        }
        if front_fits.is_none() {
            return Ok(());
        }

        let remote = pcb.conn_mgmt.remote_ip;
        let local = self.netif.route(&remote).ok_or(Error::Rte)?;
        let pcb = self.conn_mut(id)?;
        if pcb.conn_mgmt.local_ip.is_unspecified() {
            pcb.conn_mgmt.local_ip = local;
        }

        loop {
            let Some(pcb) = self.pcbs.conn_mut(id) else { break };
            if !pcb.rod.unsent.front().is_some_and(fits) {
                break;
            }
            let Some(mut seg) = pcb.rod.unsent.pop_front() else { break };
            if pcb.state() != TcpState::SynSent {
                seg.flags.insert(TcpFlags::ACK);
            }

            if let Err(e) = self.output_segment(id, &seg) {
                log::debug!("tcp_output: segment {} not sent: {}", seg.seqno, e);
                if let Some(pcb) = self.pcbs.conn_mut(id) {
                    pcb.rod.unsent.push_front(seg);
                }
                return Err(e);
            }

            let Some(pcb) = self.pcbs.conn_mut(id) else { break };
            pcb.conn_mgmt.flags.remove(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW);
            let end = seg.end();
            if seq_lt(pcb.rod.snd_nxt, end) {
                pcb.rod.snd_nxt = end;
            }
            if seg.tcplen() > 0 {
                // retransmitted segments may sort before what is in flight
                let at = pcb.rod.unacked.iter().position(|u| seq_lt(seg.seqno, u.seqno));
                match at {
                    Some(i) => pcb.rod.unacked.insert(i, seg),
                    None => pcb.rod.unacked.push_back(seg),
                }
            } else {
                pcb.rod.snd_queuelen = pcb.rod.snd_queuelen.saturating_sub(1);
                self.segs.release(1);
            }
        }

        if let Some(pcb) = self.pcbs.conn_mut(id) {
            if pcb.flow_ctrl.snd_wnd == 0 && !pcb.rod.unsent.is_empty() && pcb.rod.unacked.is_empty() {
                pcb.flow_ctrl.start_persist();
            }
        }
        Ok(())
    }

    fn output_segment(&mut self, id: PcbId, seg: &TcpSeg) -> Result<()> {
        let ticks = self.ticks;
        let rt = self.route_of(id)?;
        let pcb = self.conn_mut(id)?;

        let rcv_nxt = pcb.rod.rcv_nxt;
        let wnd = pcb.flow_ctrl.rcv_ann_wnd;
        pcb.flow_ctrl.rcv_ann_right_edge = rcv_nxt.wrapping_add(u32::from(wnd));

        if pcb.rod.rtime < 0 {
            pcb.rod.rtime = 0;
        }
        if pcb.rod.rttest == 0 {
            pcb.rod.rttest = ticks;
            pcb.rod.rtseq = seg.seqno;
            log::trace!("tcp_output_segment: rtseq {}", seg.seqno);
        }

        let opt = build_mss_option(pcb.conn_mgmt.mss);
        let options: &[u8] = if seg.mss_opt { &opt } else { &[] };
        let hdr = TcpHdr::new(rt.local_port, rt.remote_port, seg.seqno, rcv_nxt, seg.flags, wnd);
        self.transmit(&rt, hdr, options, &seg.data)
    }

    /// Send a bare ACK carrying the current window.
    pub(crate) fn send_empty_ack(&mut self, id: PcbId) -> Result<()> {
        let rt = self.route_of(id)?;
        let pcb = self.conn_mut(id)?;
        let (seqno, ackno, wnd) = (pcb.rod.snd_nxt, pcb.rod.rcv_nxt, pcb.flow_ctrl.rcv_ann_wnd);
        pcb.flow_ctrl.rcv_ann_right_edge = ackno.wrapping_add(u32::from(wnd));

        let hdr = TcpHdr::new(rt.local_port, rt.remote_port, seqno, ackno, TcpFlags::ACK, wnd);
        let res = self.transmit(&rt, hdr, &[], &[]);
        if let Some(pcb) = self.pcbs.conn_mut(id) {
            match res {
                Ok(()) => pcb.conn_mgmt.flags.remove(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW),
                // let the fast timer retry
                Err(_) => pcb.conn_mgmt.flags.insert(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW),
            }
        }
        res
    }

    /// Send a RST|ACK that belongs to no PCB.
    pub(crate) fn rst(
        &mut self,
        seqno: u32,
        ackno: u32,
        local_ip: IpAddr,
        remote_ip: IpAddr,
        local_port: u16,
        remote_port: u16,
    ) {
        let rt = Route { local_ip, remote_ip, local_port, remote_port, ttl: self.config.ttl, tos: 0 };
        let hdr = TcpHdr::new(local_port, remote_port, seqno, ackno, TcpFlags::RST | TcpFlags::ACK, self.config.wnd);
        log::debug!("tcp_rst: seqno {} ackno {}", seqno, ackno);
        if let Err(e) = self.transmit(&rt, hdr, &[], &[]) {
            log::debug!("tcp_rst: not sent: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Retransmission
    // ------------------------------------------------------------------------

    /// Retransmission timeout: requeue everything in flight and send again.
    pub(crate) fn rexmit_rto(&mut self, id: PcbId) {
        let Some(pcb) = self.pcbs.conn_mut(id) else { return };
        if pcb.rod.unacked.is_empty() {
            return;
        }
        let mut requeue = core::mem::take(&mut pcb.rod.unacked);
        requeue.append(&mut pcb.rod.unsent);
        pcb.rod.unsent = requeue;

        pcb.rod.nrtx = pcb.rod.nrtx.saturating_add(1);
        // don't take an RTT sample from a retransmission
        pcb.rod.rttest = 0;
        log::debug!("tcp_rexmit_rto: nrtx {}", pcb.rod.nrtx);
        let _ = self.output(id);
    }

    /// Move the first unacked segment back to `unsent` for retransmission.
    /// Nothing is sent here.
    pub(crate) fn rexmit(&mut self, id: PcbId) -> Result<()> {
        let pcb = self.conn_mut(id)?;
        let seg = pcb.rod.unacked.pop_front().ok_or(Error::Val)?;
        let at = pcb.rod.unsent.iter().position(|u| seq_lt(seg.seqno, u.seqno));
        match at {
            Some(i) => pcb.rod.unsent.insert(i, seg),
            None => pcb.rod.unsent.push_back(seg),
        }
        pcb.rod.nrtx = pcb.rod.nrtx.saturating_add(1);
        pcb.rod.rttest = 0;
        Ok(())
    }

    /// Third duplicate ACK: retransmit the missing segment and enter fast
    /// recovery.
    pub(crate) fn rexmit_fast(&mut self, id: PcbId) {
        let Some(pcb) = self.pcbs.conn(id) else { return };
        if pcb.rod.unacked.is_empty() || pcb.conn_mgmt.flags.contains(PcbFlags::INFR) {
            return;
        }
        log::debug!("tcp_receive: dupacks {} ({}), fast retransmit {}", pcb.rod.dupacks, pcb.rod.lastack,
            pcb.rod.unacked.front().map_or(0, |s| s.seqno));
        if self.rexmit(id).is_err() {
            return;
        }
        if let Some(pcb) = self.pcbs.conn_mut(id) {
            let eff = pcb.flow_ctrl.eff_wnd(pcb.cong_ctrl.cwnd);
            pcb.cong_ctrl.on_fast_retransmit(eff, pcb.conn_mgmt.mss);
            pcb.conn_mgmt.flags.insert(PcbFlags::INFR);
            // reset the retransmission timer to avoid an immediate timeout
            pcb.rod.rtime = 0;
        }
    }

    // ------------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------------

    /// Keepalive: an ACK one below `snd_nxt`, which the peer must answer.
    pub(crate) fn keepalive(&mut self, id: PcbId) -> Result<()> {
        let rt = self.route_of(id)?;
        let pcb = self.conn_ref(id)?;
        let seqno = pcb.rod.snd_nxt.wrapping_sub(1);
        let hdr = TcpHdr::new(rt.local_port, rt.remote_port, seqno, pcb.rod.rcv_nxt, TcpFlags::ACK, pcb.flow_ctrl.rcv_ann_wnd);
        log::debug!("tcp_keepalive: sending keepalive to {}, seqno {}", rt.remote_ip, seqno);
        self.transmit(&rt, hdr, &[], &[])
    }

    /// Persist probe: one byte of the oldest queued data, or the bare FIN.
    pub(crate) fn zero_window_probe(&mut self, id: PcbId) -> Result<()> {
        let rt = self.route_of(id)?;
        let pcb = self.conn_mut(id)?;
        let Some(seg) = pcb.rod.unacked.front().or(pcb.rod.unsent.front()) else {
            return Ok(());
        };
        let is_fin = seg.flags.contains(TcpFlags::FIN) && seg.data.is_empty();
        let (flags, payload) = if is_fin {
            (TcpFlags::FIN | TcpFlags::ACK, Vec::new())
        } else {
            (TcpFlags::ACK, seg.data.iter().take(1).copied().collect())
        };
        let seqno = seg.seqno;

        let probe_end = seqno.wrapping_add(1);
        if seq_lt(pcb.rod.snd_nxt, probe_end) {
            pcb.rod.snd_nxt = probe_end;
        }
        let hdr = TcpHdr::new(rt.local_port, rt.remote_port, seqno, pcb.rod.rcv_nxt, flags, pcb.flow_ctrl.rcv_ann_wnd);
        log::debug!("tcp_zero_window_probe: seqno {} ackno {}", seqno, pcb.rod.rcv_nxt);
        self.transmit(&rt, hdr, &[], &payload)
    }
}
