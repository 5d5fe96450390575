//! TCP Timers
//!
//! `tmr` is the only clock input: call it every `fast_interval_ms`. Every
//! call runs the fast timer (delayed ACKs, refused data); every second
//! call also runs the slow timer (retransmission, persist, keepalive and
//! the per-state timeouts).
//!
//! Both walks stamp each ACTIVE PCB with the current `timer_ctr` so that a
//! PCB is handled at most once per pass even when a callback changes the
//! list and the walk restarts from the head.

use crate::err::Error;
use crate::pool::PcbId;
use crate::state::{PcbFlags, PcbList, SocketOptions, TcpState};
use crate::tcp::TcpStack;

/// RTO multiplier per retransmission count
pub const TCP_BACKOFF: [u8; 13] = [1, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7, 7, 7];

/// Slow ticks between zero-window probes, per persist stage
pub const TCP_PERSIST_BACKOFF: [u8; 7] = [3, 6, 12, 24, 48, 96, 120];

/// What the slow timer decided for one PCB
enum Verdict {
    Keep,
    Remove { reset: bool },
}

impl TcpStack {
    /// Periodic entry point.
    pub fn tmr(&mut self) {
        self.fasttmr();
        self.timer = self.timer.wrapping_add(1);
        if self.timer & 1 != 0 {
            // every other call: 2 * fast interval
            self.slowtmr();
        }
    }

    /// Mark `id` as visited in this pass. False if it already was.
    fn stamp(&mut self, id: PcbId) -> bool {
        let ctr = self.timer_ctr;
        match self.pcbs.conn_mut(id) {
            Some(pcb) if pcb.conn_mgmt.last_timer != ctr => {
                pcb.conn_mgmt.last_timer = ctr;
                true
            }
            _ => false,
        }
    }

    pub fn fasttmr(&mut self) {
        self.timer_ctr = self.timer_ctr.wrapping_add(1);

        'walk: loop {
            let mut cur = self.pcbs.first(PcbList::Active);
            while let Some(id) = cur {
                if !self.stamp(id) {
                    cur = self.pcbs.next(id);
                    continue;
                }

                // send delayed ACKs
                if let Some(pcb) = self.pcbs.conn_mut(id) {
                    if pcb.conn_mgmt.flags.contains(PcbFlags::ACK_DELAY) {
                        log::trace!("tcp_fasttmr: delayed ACK");
                        pcb.conn_mgmt.ack_now();
                        let _ = self.output(id);
                        if let Some(pcb) = self.pcbs.conn_mut(id) {
                            pcb.conn_mgmt.flags.remove(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW);
                        }
                    }
                }

                let next = self.pcbs.next(id);
                if self.pcbs.conn(id).is_some_and(|p| p.rod.refused_data.is_some()) {
                    self.active_pcbs_changed = false;
                    let _ = self.process_refused_data(id);
                    if self.active_pcbs_changed {
                        continue 'walk;
                    }
                }
                cur = next;
            }
            break;
        }
    }

    pub fn slowtmr(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
        self.timer_ctr = self.timer_ctr.wrapping_add(1);

        'walk: loop {
            let mut cur = self.pcbs.first(PcbList::Active);
            while let Some(id) = cur {
                let next = self.pcbs.next(id);
                if self.stamp(id) && self.slowtmr_pcb(id) {
                    // a callback changed the list under us
                    continue 'walk;
                }
                cur = next;
            }
            break;
        }

        let two_msl = self.config.two_msl_ticks();
        for id in self.pcbs.ids(PcbList::TimeWait) {
            let Some(pcb) = self.pcbs.conn(id) else { continue };
            if pcb.conn_mgmt.idle(self.ticks) > two_msl {
                log::debug!("tcp_slowtmr: TIME_WAIT pcb {} expired", id.index());
                self.purge(id);
                self.pcbs.rmv(id);
                self.pcbs.free(id);
            }
        }
    }

    /// Slow-timer work for one ACTIVE PCB. True when the walk must restart.
    fn slowtmr_pcb(&mut self, id: PcbId) -> bool {
        match self.slowtmr_verdict(id) {
            Verdict::Remove { reset } => self.slowtmr_remove(id, reset),
            Verdict::Keep => self.slowtmr_poll(id),
        }
    }

    fn slowtmr_verdict(&mut self, id: PcbId) -> Verdict {
        let cfg = &self.config;
        let ticks = self.ticks;
        let fin_wait = cfg.slow_ticks(cfg.fin_wait_timeout_ms);
        let syn_rcvd = cfg.slow_ticks(cfg.syn_rcvd_timeout_ms);
        let two_msl = cfg.two_msl_ticks();
        let (syn_max_rtx, max_rtx, ooseq_timeout) = (cfg.syn_max_rtx, cfg.max_rtx, cfg.ooseq_timeout);
        let slow = cfg.slow_interval_ms;

        let Some(pcb) = self.pcbs.conn_mut(id) else { return Verdict::Keep };
        let state = pcb.state();
        let mut remove = false;
        let mut reset = false;
        let mut probe = false;
        let mut rexmit = false;

        if state == TcpState::SynSent && pcb.rod.nrtx >= syn_max_rtx {
            log::debug!("tcp_slowtmr: max SYN retries reached");
            remove = true;
        } else if pcb.rod.nrtx >= max_rtx {
            log::debug!("tcp_slowtmr: max DATA retries reached");
            remove = true;
        } else if pcb.flow_ctrl.persist_backoff > 0 {
            let fc = &mut pcb.flow_ctrl;
            let stage = usize::from(fc.persist_backoff.min(TCP_PERSIST_BACKOFF.len() as u8)) - 1;
            let threshold = TCP_PERSIST_BACKOFF[stage];
            if fc.persist_cnt < threshold {
                fc.persist_cnt += 1;
            }
            probe = fc.persist_cnt >= threshold;
        } else {
            let rod = &mut pcb.rod;
            if rod.rtime >= 0 {
                rod.rtime = rod.rtime.saturating_add(1);
            }
            if !rod.unacked.is_empty() && rod.rtime >= rod.rto {
                log::debug!("tcp_slowtmr: rtime {} rto {}", rod.rtime, rod.rto);
                // double the timeout, except for SYNs
                if state != TcpState::SynSent {
                    let backoff = TCP_BACKOFF[usize::from(rod.nrtx).min(TCP_BACKOFF.len() - 1)];
                    rod.rto = rod.rto_base().saturating_mul(i16::from(backoff));
                }
                rod.rtime = 0;
                let eff = pcb.flow_ctrl.eff_wnd(pcb.cong_ctrl.cwnd);
                pcb.cong_ctrl.on_timeout(eff, pcb.conn_mgmt.mss);
                log::debug!("tcp_slowtmr: cwnd {} ssthresh {}", pcb.cong_ctrl.cwnd, pcb.cong_ctrl.ssthresh);
                rexmit = true;
            }
        }

        if probe && self.zero_window_probe(id).is_ok() {
            if let Some(pcb) = self.pcbs.conn_mut(id) {
                let fc = &mut pcb.flow_ctrl;
                fc.persist_cnt = 0;
                if usize::from(fc.persist_backoff) < TCP_PERSIST_BACKOFF.len() {
                    fc.persist_backoff += 1;
                }
            }
        }
        if rexmit {
            self.rexmit_rto(id);
        }

        let Some(pcb) = self.pcbs.conn_mut(id) else { return Verdict::Keep };
        let cm = &pcb.conn_mgmt;
        let idle = cm.idle(ticks);

        if matches!(state, TcpState::FinWait1 | TcpState::FinWait2)
            && cm.flags.contains(PcbFlags::RXCLOSED)
            && idle > fin_wait
        {
            log::debug!("tcp_slowtmr: removing pcb stuck in {}", state);
            remove = true;
        }

        let mut keepalive = false;
        if cm.so_options.contains(SocketOptions::KEEPALIVE)
            && matches!(state, TcpState::Established | TcpState::CloseWait)
        {
            let limit = cm.keep_idle.saturating_add(cm.keep_cnt.saturating_mul(cm.keep_intvl)) / slow;
            let next_probe =
                cm.keep_idle.saturating_add(u32::from(cm.keep_cnt_sent).saturating_mul(cm.keep_intvl)) / slow;
            if idle > limit {
                log::debug!("tcp_slowtmr: KEEPALIVE timeout, aborting connection to {}", cm.remote_ip);
                remove = true;
                reset = true;
            } else if idle > next_probe {
                keepalive = true;
            }
        }

        // the peer should have filled the hole by now
        let rto = u32::try_from(pcb.rod.rto).unwrap_or(0);
        if !pcb.rod.ooseq.is_empty() && idle >= ooseq_timeout.saturating_mul(rto) {
            log::debug!("tcp_slowtmr: dropping OOSEQ queued data");
            self.segs.free_chain(&mut pcb.rod.ooseq);
        }

        if state == TcpState::SynRcvd && idle > syn_rcvd {
            log::debug!("tcp_slowtmr: removing pcb stuck in SYN-RCVD");
            remove = true;
        }
        if state == TcpState::LastAck && idle > two_msl {
            log::debug!("tcp_slowtmr: removing pcb stuck in LAST-ACK");
            remove = true;
        }

        if keepalive && !remove && self.keepalive(id).is_ok() {
            if let Some(pcb) = self.pcbs.conn_mut(id) {
                pcb.conn_mgmt.keep_cnt_sent = pcb.conn_mgmt.keep_cnt_sent.saturating_add(1);
            }
        }

        if remove {
            Verdict::Remove { reset }
        } else {
            Verdict::Keep
        }
    }

    fn slowtmr_remove(&mut self, id: PcbId, reset: bool) -> bool {
        let Some(pcb) = self.pcbs.conn(id) else { return false };
        let cm = &pcb.conn_mgmt;
        let (lip, rip, lport, rport) = (cm.local_ip, cm.remote_ip, cm.local_port, cm.remote_port);
        let (seqno, ackno) = (pcb.rod.snd_nxt, pcb.rod.rcv_nxt);

        self.purge(id);
        self.unlink(id);
        if reset {
            self.rst(seqno, ackno, lip, rip, lport, rport);
        }
        let handler = self.release(id);
        self.active_pcbs_changed = false;
        self.event_err(handler, id, Error::Abrt);
        self.active_pcbs_changed
    }

    fn slowtmr_poll(&mut self, id: PcbId) -> bool {
        let Some(pcb) = self.pcbs.conn_mut(id) else { return false };
        let cm = &mut pcb.conn_mgmt;
        cm.polltmr = cm.polltmr.wrapping_add(1);
        if cm.polltmr < cm.pollinterval {
            return false;
        }
        cm.polltmr = 0;
        self.active_pcbs_changed = false;
        let res = self.event_poll(id);
        if self.active_pcbs_changed {
            return true;
        }
        if res.is_ok() && self.pcbs.contains(id) {
            let _ = self.output(id);
        }
        false
    }

    /// Flush every ACTIVE PCB that has an ACK due.
    pub fn txnow(&mut self) {
        for id in self.pcbs.ids(PcbList::Active) {
            if self.pcbs.conn(id).is_some_and(|p| p.conn_mgmt.flags.contains(PcbFlags::ACK_NOW)) {
                let _ = self.output(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_tables() {
        assert_eq!(TCP_BACKOFF[0], 1);
        assert_eq!(TCP_BACKOFF[6], 7);
        assert!(TCP_BACKOFF[6..].iter().all(|&b| b == 7));
        assert_eq!(TCP_PERSIST_BACKOFF[TCP_PERSIST_BACKOFF.len() - 1], 120);
    }
}
