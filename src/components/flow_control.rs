//! Flow Control Component
//!
//! Manages receive and send windows and the persist (zero-window probe) timer.

use crate::config::TcpConfig;
use crate::tcp_types::{seq_geq, seq_gt};

/// Flow Control State
#[derive(Debug, Clone)]
pub struct FlowControlState {
    /* Peer's Receive Window */
    pub snd_wnd: u16,          // Window the remote peer advertised
    pub snd_wnd_max: u16,      // Maximum window we've seen from peer
    pub snd_wl1: u32,          // Seqno of the last window update
    pub snd_wl2: u32,          // Ackno of the last window update

    /* Our Receive Window */
    pub rcv_wnd: u16,          // Our available receive buffer space
    pub rcv_ann_wnd: u16,      // Window we will advertise
    pub rcv_ann_right_edge: u32, // Right edge of advertised window

    /* Zero Window Probing */
    pub persist_cnt: u8,
    pub persist_backoff: u8,
}

impl FlowControlState {
    pub fn new(cfg: &TcpConfig) -> Self {
        Self {
            snd_wnd: cfg.wnd,
            snd_wnd_max: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            rcv_wnd: cfg.wnd,
            rcv_ann_wnd: cfg.wnd,
            rcv_ann_right_edge: 0,
            persist_cnt: 0,
            persist_backoff: 0,
        }
    }

    /// Recompute the window to advertise. Returns how far the right edge
    /// would move if announced now (`0` while it moves by less than one step).
    pub fn update_rcv_ann_wnd(&mut self, rcv_nxt: u32, mss: u16, wnd_max: u16) -> u32 {
        let new_right_edge = rcv_nxt.wrapping_add(u32::from(self.rcv_wnd));
        let min_step = core::cmp::min(wnd_max / 2, mss);

        let bump = self.rcv_ann_right_edge.wrapping_add(u32::from(min_step));
        if seq_geq(new_right_edge, bump) {
            // we can advertise more window
            self.rcv_ann_wnd = self.rcv_wnd;
            new_right_edge.wrapping_sub(self.rcv_ann_right_edge)
        } else {
            if seq_gt(rcv_nxt, self.rcv_ann_right_edge) {
                // Can happen due to other end sending out of advertised window,
                // but within actual available (but not yet advertised) window
                self.rcv_ann_wnd = 0;
            } else {
                // keep the right edge of window constant
                let new_rcv_ann_wnd = self.rcv_ann_right_edge.wrapping_sub(rcv_nxt);
                self.rcv_ann_wnd = u16::try_from(new_rcv_ann_wnd).unwrap_or(u16::MAX);
            }
            0
        }
    }

    /// Start the persist timer if it is not already running.
    pub fn start_persist(&mut self) {
        if self.persist_backoff == 0 {
            self.persist_cnt = 0;
            self.persist_backoff = 1;
        }
    }

    pub fn stop_persist(&mut self) {
        self.persist_backoff = 0;
    }

    /// Usable send window right now
    #[inline]
    pub fn eff_wnd(&self, cwnd: u16) -> u16 {
        core::cmp::min(self.snd_wnd, cwnd)
    }
}
