//! Congestion Control Component
//!
//! Manages congestion window and slow start threshold.

/// Congestion Control State
#[derive(Debug, Clone)]
pub struct CongestionControlState {
    pub cwnd: u16,       // Congestion Window
    pub ssthresh: u16,   // Slow Start Threshold
}

impl CongestionControlState {
    pub fn new(wnd: u16) -> Self {
        Self {
            cwnd: 1,
            ssthresh: wnd,
        }
    }

    /// RFC 5681: IW = min(4*MSS, max(2*MSS, 4380 bytes))
    pub fn initial_cwnd(mss: u16) -> u16 {
        let mss = u32::from(mss);
        let iw = core::cmp::min(4 * mss, core::cmp::max(2 * mss, 4380));
        u16::try_from(iw).unwrap_or(u16::MAX)
    }

    /// Handshake completed: open the initial window.
    pub fn on_established(&mut self, mss: u16) {
        self.cwnd = Self::initial_cwnd(mss);
    }

    /// New data acknowledged: slow start below ssthresh, congestion
    /// avoidance above. Never wraps.
    pub fn on_new_ack(&mut self, mss: u16) {
        if self.cwnd < self.ssthresh {
            self.cwnd = self.cwnd.saturating_add(mss);
            log::trace!("tcp_receive: slow start cwnd {}", self.cwnd);
        } else {
            let inc = (u32::from(mss) * u32::from(mss)) / u32::from(self.cwnd.max(1));
            self.cwnd = self.cwnd.saturating_add(u16::try_from(inc).unwrap_or(u16::MAX));
            log::trace!("tcp_receive: congestion avoidance cwnd {}", self.cwnd);
        }
    }

    /// Duplicate ACK past the third: inflate by one segment.
    pub fn on_dupack(&mut self, mss: u16) {
        self.cwnd = self.cwnd.saturating_add(mss);
    }

    /// Retransmission timeout: halve the flight into ssthresh, restart from
    /// one segment.
    pub fn on_timeout(&mut self, eff_wnd: u16, mss: u16) {
        self.ssthresh = core::cmp::max(eff_wnd >> 1, mss.saturating_mul(2));
        self.cwnd = mss;
    }

    /// Three duplicate ACKs: enter fast recovery.
    pub fn on_fast_retransmit(&mut self, eff_wnd: u16, mss: u16) {
        self.ssthresh = core::cmp::max(eff_wnd >> 1, mss.saturating_mul(2));
        self.cwnd = self.ssthresh.saturating_add(mss.saturating_mul(3));
    }
}
