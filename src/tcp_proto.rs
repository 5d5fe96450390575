//! TCP Protocol Definitions
//!
//! RFC 793 header layout and flag bits.

use bitflags::bitflags;

/// TCP header length (excluding options)
pub const TCP_HLEN: usize = 20;

/// Length of the MSS option (kind, len, value)
pub const TCP_OPT_MSS_LEN: usize = 4;

/// Option kinds
pub const TCP_OPT_EOL: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;

bitflags! {
    /// TCP header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

/// Mask of the flags lwIP interprets
pub const TCP_FLAGS: u8 = 0x3F;

/// TCP Header Structure
///
/// Fields are in network byte order (big-endian).
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Default)]
pub struct TcpHdr {
    /// Source port
    pub src: u16,

    /// Destination port
    pub dest: u16,

    /// Sequence number
    pub seqno: u32,

    /// Acknowledgment number
    pub ackno: u32,

    /// Upper 4 bits: data offset (header length in 32-bit words)
    /// Lower 12 bits: reserved + flags
    pub _hdrlen_rsvd_flags: u16,

    /// Window size
    pub wnd: u16,

    /// Checksum
    pub chksum: u16,

    /// Urgent pointer
    pub urgp: u16,
}

impl TcpHdr {
    /// Build a header from host-order values. The checksum is left zero for
    /// the IP layer to fill in.
    pub fn new(src: u16, dest: u16, seqno: u32, ackno: u32, flags: TcpFlags, wnd: u16) -> Self {
        let mut hdr = TcpHdr {
            src: src.to_be(),
            dest: dest.to_be(),
            seqno: seqno.to_be(),
            ackno: ackno.to_be(),
            _hdrlen_rsvd_flags: 0,
            wnd: wnd.to_be(),
            chksum: 0,
            urgp: 0,
        };
        hdr.set_hdrlen_flags((TCP_HLEN / 4) as u16, flags);
        hdr
    }

    /// Header length in 32-bit words
    #[inline]
    pub fn hdrlen(&self) -> u16 {
        u16::from_be(self._hdrlen_rsvd_flags) >> 12
    }

    /// Header length in bytes
    #[inline]
    pub fn hdrlen_bytes(&self) -> u8 {
        (self.hdrlen() << 2) as u8
    }

    #[inline]
    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_truncate((u16::from_be(self._hdrlen_rsvd_flags) & TCP_FLAGS as u16) as u8)
    }

    #[inline]
    pub fn set_hdrlen(&mut self, len: u16) {
        let current = self.flags();
        self.set_hdrlen_flags(len, current);
    }

    #[inline]
    pub fn set_hdrlen_flags(&mut self, len: u16, flags: TcpFlags) {
        self._hdrlen_rsvd_flags = u16::to_be((len << 12) | flags.bits() as u16);
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be(self.src)
    }

    #[inline]
    pub fn dest_port(&self) -> u16 {
        u16::from_be(self.dest)
    }

    #[inline]
    pub fn sequence_number(&self) -> u32 {
        u32::from_be(self.seqno)
    }

    #[inline]
    pub fn ack_number(&self) -> u32 {
        u32::from_be(self.ackno)
    }

    #[inline]
    pub fn window(&self) -> u16 {
        u16::from_be(self.wnd)
    }

    /// Serialize the fixed header in wire order.
    pub fn to_bytes(&self) -> [u8; TCP_HLEN] {
        let mut out = [0u8; TCP_HLEN];
        out[0..2].copy_from_slice(&self.src_port().to_be_bytes());
        out[2..4].copy_from_slice(&self.dest_port().to_be_bytes());
        out[4..8].copy_from_slice(&self.sequence_number().to_be_bytes());
        out[8..12].copy_from_slice(&self.ack_number().to_be_bytes());
        out[12..14].copy_from_slice(&u16::from_be(self._hdrlen_rsvd_flags).to_be_bytes());
        out[14..16].copy_from_slice(&self.window().to_be_bytes());
        out[16..18].copy_from_slice(&u16::from_be(self.chksum).to_be_bytes());
        out[18..20].copy_from_slice(&u16::from_be(self.urgp).to_be_bytes());
        out
    }

    /// Parse the fixed header from wire bytes.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < TCP_HLEN {
            return None;
        }
        let be16 = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
        let be32 = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some(TcpHdr {
            src: be16(0).to_be(),
            dest: be16(2).to_be(),
            seqno: be32(4).to_be(),
            ackno: be32(8).to_be(),
            _hdrlen_rsvd_flags: be16(12).to_be(),
            wnd: be16(14).to_be(),
            chksum: be16(16).to_be(),
            urgp: be16(18).to_be(),
        })
    }
}

/// Encode the MSS option as carried on SYN segments.
pub fn build_mss_option(mss: u16) -> [u8; TCP_OPT_MSS_LEN] {
    let [hi, lo] = mss.to_be_bytes();
    [TCP_OPT_MSS, TCP_OPT_MSS_LEN as u8, hi, lo]
}

/// Find the MSS option in a raw option block. Malformed options end the scan.
pub fn parse_mss_option(opts: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            TCP_OPT_EOL => return None,
            TCP_OPT_NOP => i += 1,
            TCP_OPT_MSS => {
                if opts.get(i + 1) != Some(&(TCP_OPT_MSS_LEN as u8)) || i + TCP_OPT_MSS_LEN > opts.len() {
                    return None;
                }
                return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
            }
            _ => {
                let len = *opts.get(i + 1)? as usize;
                if len < 2 {
                    return None;
                }
                i += len;
            }
        }
    }
    None
}

// Ensure the struct is exactly 20 bytes
const _: () = assert!(core::mem::size_of::<TcpHdr>() == TCP_HLEN);
