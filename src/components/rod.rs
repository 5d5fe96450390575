//! Reliable Ordered Delivery Component
//!
//! Sequence numbers, the three segment queues, retransmission timer and RTT
//! estimation.

use std::collections::VecDeque;

use crate::config::TcpConfig;
use crate::pool::SegPool;
use crate::tcp_types::{RefusedData, TcpSeg};

/// Reliable Ordered Delivery State
#[derive(Debug, Clone)]
pub struct ReliableOrderedDeliveryState {
    /* Local & Remote Sequence Numbers */
    pub snd_nxt: u32,      // Next sequence number we will send
    pub rcv_nxt: u32,      // Next sequence number we expect from peer
    pub lastack: u32,      // Highest cumulative ACK received
    pub iss: u32,          // Our initial send sequence number

    /* Send Buffer Management */
    pub snd_lbb: u32,      // Sequence number of next byte to be buffered
    pub snd_buf: u16,      // Available space in send buffer
    pub snd_queuelen: u16, // Segments on unsent + unacked
    pub acked: u16,        // Bytes acknowledged by the segment being processed

    /* Queues */
    pub unsent: VecDeque<TcpSeg>,
    pub unacked: VecDeque<TcpSeg>,
    pub ooseq: VecDeque<TcpSeg>,
    pub refused_data: Option<RefusedData>,

    /* Retransmission Timer & RTT Estimation */
    pub rtime: i16,        // Ticks since (re)transmission, -1 when disarmed
    pub rttest: u32,       // Tick the RTT sample started, 0 when idle
    pub rtseq: u32,        // Sequence number being timed
    pub sa: i16,           // Smoothed RTT, scaled by 8
    pub sv: i16,           // RTT variance, scaled by 4
    pub rto: i16,          // Retransmission timeout in slow ticks
    pub nrtx: u8,          // Retransmissions of the current segment

    /* Fast Retransmit / Recovery State */
    pub dupacks: u8,
}

impl ReliableOrderedDeliveryState {
    pub fn new(cfg: &TcpConfig, iss: u32) -> Self {
        let rto = cfg.initial_rto();
        Self {
            snd_nxt: iss,
            rcv_nxt: 0,
            lastack: iss,
            iss,
            snd_lbb: iss,
            snd_buf: cfg.snd_buf,
            snd_queuelen: 0,
            acked: 0,
            unsent: VecDeque::new(),
            unacked: VecDeque::new(),
            ooseq: VecDeque::new(),
            refused_data: None,
            rtime: -1,
            rttest: 0,
            rtseq: 0,
            sa: 0,
            sv: rto,
            rto,
            nrtx: 0,
            dupacks: 0,
        }
    }

    /// Base RTO from the current estimator, before backoff
    #[inline]
    pub fn rto_base(&self) -> i16 {
        (self.sa >> 3).saturating_add(self.sv)
    }

    /// Free every queued segment and stop the retransmit timer. A second call
    /// finds empty queues and changes nothing.
    pub fn purge(&mut self, segs: &mut SegPool) {
        self.refused_data = None;
        if !self.ooseq.is_empty() {
            log::trace!("tcp_pcb_purge: data left on ->ooseq");
        }
        segs.free_chain(&mut self.ooseq);
        // Stop the retransmission timer as it will expect data on unacked
        self.rtime = -1;
        segs.free_chain(&mut self.unsent);
        segs.free_chain(&mut self.unacked);
        self.snd_queuelen = 0;
    }

    /// Van Jacobson's estimator; `m` is the measured RTT in ticks.
    pub fn update_rtt(&mut self, m: i16) {
        let mut m = m.wrapping_sub(self.sa >> 3);
        self.sa = self.sa.wrapping_add(m);
        if m < 0 {
            m = m.wrapping_neg();
        }
        m = m.wrapping_sub(self.sv >> 2);
        self.sv = self.sv.wrapping_add(m);
        self.rto = self.rto_base();
    }

    /// Whether any of the three segment queues holds data.
    pub fn has_queued(&self) -> bool {
        !self.unsent.is_empty() || !self.unacked.is_empty() || !self.ooseq.is_empty()
    }
}
