//! Stack configuration
//!
//! Defaults mirror lwIP's `opt.h` / `lwipopts.h` values for a small
//! embedded target. Times are in milliseconds unless noted.

use core::ops::RangeInclusive;

use crate::err::{Error, Result};

/// Lowest connection priority
pub const TCP_PRIO_MIN: u8 = 1;
/// Default connection priority
pub const TCP_PRIO_NORMAL: u8 = 64;
/// Highest connection priority
pub const TCP_PRIO_MAX: u8 = 127;

/// Default MSS before negotiation
pub const TCP_MSS: u16 = 536;

/// Initial retransmission timeout (ms)
pub const TCP_INITIAL_RTO_MS: u32 = 3000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    /* Pools */
    pub max_pcbs: usize,
    pub max_listen_pcbs: usize,
    pub max_segs: usize,

    /* Segment / window sizing */
    pub mss: u16,
    pub wnd: u16,
    pub snd_buf: u16,
    pub snd_queuelen: u16,
    pub ttl: u8,

    /* Retransmission limits */
    pub max_rtx: u8,
    pub syn_max_rtx: u8,

    /* Timeouts */
    pub msl_ms: u32,
    pub fin_wait_timeout_ms: u32,
    pub syn_rcvd_timeout_ms: u32,
    /// Out-of-sequence queue lifetime, in multiples of the RTO
    pub ooseq_timeout: u32,

    /* Keepalive defaults */
    pub keep_idle_ms: u32,
    pub keep_intvl_ms: u32,
    pub keep_cnt: u32,

    /* Timer cadence */
    pub fast_interval_ms: u32,
    pub slow_interval_ms: u32,

    /* Ports / sockets */
    pub local_port_range: RangeInclusive<u16>,
    /// Honour REUSEADDR on bind/listen/connect
    pub so_reuse: bool,
    pub listen_backlog: u8,
}

impl Default for TcpConfig {
    fn default() -> Self {
        let mss = TCP_MSS;
        let snd_buf = 2 * mss;
        Self {
            max_pcbs: 5,
            max_listen_pcbs: 8,
            max_segs: 16,
            mss,
            wnd: 4 * mss,
            snd_buf,
            // TCP_SND_QUEUELEN = 4 * TCP_SND_BUF / TCP_MSS
            snd_queuelen: (4 * snd_buf) / mss,
            ttl: 255,
            max_rtx: 12,
            syn_max_rtx: 6,
            msl_ms: 60_000,
            fin_wait_timeout_ms: 20_000,
            syn_rcvd_timeout_ms: 20_000,
            ooseq_timeout: 6,
            keep_idle_ms: 7_200_000,
            keep_intvl_ms: 75_000,
            keep_cnt: 9,
            fast_interval_ms: 250,
            slow_interval_ms: 500,
            local_port_range: 0xc000..=0xffff,
            so_reuse: true,
            listen_backlog: 0xff,
        }
    }
}

impl TcpConfig {
    /// Reject configurations the timer arithmetic cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.fast_interval_ms == 0 || self.slow_interval_ms < self.fast_interval_ms {
            return Err(Error::Val);
        }
        if self.mss == 0 || self.wnd == 0 || self.snd_buf == 0 || self.snd_queuelen == 0 {
            return Err(Error::Val);
        }
        if self.max_pcbs == 0 || self.max_segs == 0 {
            return Err(Error::Val);
        }
        if self.local_port_range.is_empty() || *self.local_port_range.start() == 0 {
            return Err(Error::Val);
        }
        Ok(())
    }

    /// Convert a millisecond duration into slow-timer ticks.
    #[inline]
    pub fn slow_ticks(&self, ms: u32) -> u32 {
        ms / self.slow_interval_ms
    }

    /// 2 * MSL in slow-timer ticks
    #[inline]
    pub fn two_msl_ticks(&self) -> u32 {
        self.slow_ticks(self.msl_ms.saturating_mul(2))
    }

    /// TCP_WND_UPDATE_THRESHOLD
    #[inline]
    pub fn wnd_update_threshold(&self) -> u16 {
        core::cmp::min(self.wnd / 4, self.mss.saturating_mul(4))
    }

    /// Initial RTO in slow-timer ticks
    #[inline]
    pub fn initial_rto(&self) -> i16 {
        i16::try_from(self.slow_ticks(TCP_INITIAL_RTO_MS)).unwrap_or(i16::MAX)
    }

    /// Number of ephemeral ports available
    pub fn port_span(&self) -> u32 {
        u32::from(*self.local_port_range.end()) - u32::from(*self.local_port_range.start())
    }
}
