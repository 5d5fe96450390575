//! TCP Common Types
//!
//! Segments as they cross the stack boundary, segments queued on a PCB, and
//! modular sequence-number comparisons.

use std::net::IpAddr;

use crate::tcp_proto::{self, TcpFlags, TcpHdr, TCP_HLEN};

// ------------------------------------------------------------------------
// Sequence arithmetic (RFC 793 modulo 2^32)
// ------------------------------------------------------------------------

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_leq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[inline]
pub fn seq_geq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// `b <= a <= c` in sequence space
#[inline]
pub fn seq_between(a: u32, b: u32, c: u32) -> bool {
    seq_geq(a, b) && seq_leq(a, c)
}

/// Inbound segment, already stripped of its IP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seqno: u32,
    pub ackno: u32,
    pub flags: TcpFlags,
    pub wnd: u16,
    /// MSS option, if the segment carried one
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Sequence space the segment occupies (payload plus SYN/FIN).
    pub fn tcplen(&self) -> u32 {
        let ctl = self.flags.intersects(TcpFlags::SYN | TcpFlags::FIN) as u32;
        self.payload.len() as u32 + ctl
    }

    /// Parse a raw TCP segment. Returns `None` for short or malformed input.
    pub fn parse(src: IpAddr, dst: IpAddr, raw: &[u8]) -> Option<Self> {
        let hdr = TcpHdr::from_bytes(raw)?;
        let hdrlen = hdr.hdrlen_bytes() as usize;
        if hdrlen < TCP_HLEN || hdrlen > raw.len() {
            return None;
        }
        Some(TcpSegment {
            src,
            dst,
            src_port: hdr.src_port(),
            dst_port: hdr.dest_port(),
            seqno: hdr.sequence_number(),
            ackno: hdr.ack_number(),
            flags: hdr.flags(),
            wnd: hdr.window(),
            mss: tcp_proto::parse_mss_option(&raw[TCP_HLEN..hdrlen]),
            payload: raw[hdrlen..].to_vec(),
        })
    }
}

/// Outbound segment handed to the IP layer
#[derive(Debug, Clone, Copy)]
pub struct OutSegment<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub ttl: u8,
    pub tos: u8,
    pub hdr: TcpHdr,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl OutSegment<'_> {
    /// Header, options and payload in wire order
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TCP_HLEN + self.options.len() + self.payload.len());
        out.extend_from_slice(&self.hdr.to_bytes());
        out.extend_from_slice(self.options);
        out.extend_from_slice(self.payload);
        out
    }

    /// The segment as the peer's stack would receive it.
    pub fn to_input(&self) -> Option<TcpSegment> {
        TcpSegment::parse(self.src, self.dst, &self.to_bytes())
    }
}

/// Segment queued on a PCB (unsent, unacked or ooseq)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSeg {
    pub seqno: u32,
    pub flags: TcpFlags,
    pub data: Vec<u8>,
    /// Carry the MSS option when transmitted
    pub mss_opt: bool,
}

impl TcpSeg {
    pub fn new(seqno: u32, flags: TcpFlags, data: Vec<u8>) -> Self {
        Self { seqno, flags, data, mss_opt: false }
    }

    /// TCP_TCPLEN
    pub fn tcplen(&self) -> u32 {
        let ctl = self.flags.intersects(TcpFlags::SYN | TcpFlags::FIN) as u32;
        self.data.len() as u32 + ctl
    }

    /// Sequence number just past this segment
    pub fn end(&self) -> u32 {
        self.seqno.wrapping_add(self.tcplen())
    }
}

/// Received data the application declined, held for redelivery
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefusedData {
    pub data: Vec<u8>,
    /// A FIN arrived behind this data
    pub fin: bool,
}
