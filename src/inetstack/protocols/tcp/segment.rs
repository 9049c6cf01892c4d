// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        protocols::{
            checksum,
            tcp::{
                sequence_number::SeqNumber,
                PROTOCOL_NUMBER,
            },
        },
        route::Route,
        types::TransportEndpointId,
    },
    runtime::memory::{
        VectorisedView,
        View,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// The minimum size of a valid TCP segment.
pub const TCP_MINIMUM_SIZE: usize = 20;

/// The largest header we are prepared to emit: the fixed header plus the
/// SYN options (MSS, window scale, padding).
pub const TCP_MAX_HEADER_SIZE: usize = 60;

// Flag bits of octet 13.
pub const FLAG_FIN: u8 = 1;
pub const FLAG_SYN: u8 = 2;
pub const FLAG_RST: u8 = 4;
pub const FLAG_PSH: u8 = 8;
pub const FLAG_ACK: u8 = 16;
pub const FLAG_URG: u8 = 32;

// Field offsets within the fixed header.
const SRC_PORT: usize = 0;
const DST_PORT: usize = 2;
const SEQ_NUM: usize = 4;
const ACK_NUM: usize = 8;
const DATA_OFFSET: usize = 12;
const TCP_FLAGS: usize = 13;
const WIN_SIZE: usize = 14;
const TCP_CHECKSUM: usize = 16;
const URGENT_PTR: usize = 18;

// Option kinds recognised by the parser.
const OPTION_EOL: u8 = 0;
const OPTION_NOP: u8 = 1;
const OPTION_MSS: u8 = 2;
const OPTION_WS: u8 = 3;
const OPTION_TS: u8 = 8;

/// Window-scale shifts above this clamp down to it.
const MAX_WND_SCALE: u8 = 14;

/// MSS assumed when the peer does not state one.
pub const DEFAULT_MSS: u16 = 536;

//==============================================================================
// Structures
//==============================================================================

/// The fields of a TCP header, used to describe a segment to be encoded.
#[derive(Clone, Debug, Default)]
pub struct TcpFields {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: SeqNumber,
    pub ack_num: SeqNumber,
    pub data_offset: u8,
    pub flags: u8,
    pub window_size: u16,
}

/// Options carried on a SYN or SYN-ACK segment, after parsing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TcpSynOptions {
    /// Maximum segment size; 536 when the option is absent.
    pub mss: u16,
    /// Window-scale shift count; -1 means the peer offered no scaling.
    pub ws: i8,
    /// Whether a timestamp option was present. Parsed but not acted upon.
    pub ts: bool,
    pub ts_val: u32,
    pub ts_ecr: u32,
}

/// A TCP header as a typed view over a byte buffer covering the fixed
/// header and any options.
pub struct TcpHeader<B>(pub B);

/// A TCP segment: the payload plus the parsed header information.
pub struct Segment {
    pub id: TransportEndpointId,
    pub route: Route,
    pub data: VectorisedView,
    /// Index of the next view handed out by the read endpoint.
    pub view_to_deliver: usize,
    pub seq_num: SeqNumber,
    pub ack_num: SeqNumber,
    pub flags: u8,
    pub window: u16,
    pub parsed_options: TcpSynOptions,
    pub options: Vec<u8>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Default for TcpSynOptions {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            ws: -1,
            ts: false,
            ts_val: 0,
            ts_ecr: 0,
        }
    }
}

impl<B: AsRef<[u8]>> TcpHeader<B> {
    fn buf(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn source_port(&self) -> u16 {
        u16::from_be_bytes([self.buf()[SRC_PORT], self.buf()[SRC_PORT + 1]])
    }

    pub fn destination_port(&self) -> u16 {
        u16::from_be_bytes([self.buf()[DST_PORT], self.buf()[DST_PORT + 1]])
    }

    pub fn sequence_number(&self) -> u32 {
        u32::from_be_bytes([
            self.buf()[SEQ_NUM],
            self.buf()[SEQ_NUM + 1],
            self.buf()[SEQ_NUM + 2],
            self.buf()[SEQ_NUM + 3],
        ])
    }

    pub fn ack_number(&self) -> u32 {
        u32::from_be_bytes([
            self.buf()[ACK_NUM],
            self.buf()[ACK_NUM + 1],
            self.buf()[ACK_NUM + 2],
            self.buf()[ACK_NUM + 3],
        ])
    }

    /// The offset to the payload, in bytes.
    pub fn data_offset(&self) -> usize {
        ((self.buf()[DATA_OFFSET] >> 4) * 4) as usize
    }

    pub fn flags(&self) -> u8 {
        self.buf()[TCP_FLAGS]
    }

    pub fn window_size(&self) -> u16 {
        u16::from_be_bytes([self.buf()[WIN_SIZE], self.buf()[WIN_SIZE + 1]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buf()[TCP_CHECKSUM], self.buf()[TCP_CHECKSUM + 1]])
    }

    /// The one's-complement sum of the whole header buffer on top of
    /// `partial`, which covers the pseudo-header, the segment length, and
    /// the payload.
    pub fn calculate_checksum(&self, partial: u16) -> u16 {
        checksum::checksum(self.buf(), partial)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> TcpHeader<B> {
    fn buf_mut(&mut self) -> &mut [u8] {
        self.0.as_mut()
    }

    /// Encodes the fixed fields of the header. Options, if any, are copied
    /// in by the caller after the fixed header.
    pub fn encode(&mut self, i: &TcpFields) {
        let buf: &mut [u8] = self.buf_mut();
        buf[SRC_PORT..SRC_PORT + 2].copy_from_slice(&i.src_port.to_be_bytes());
        buf[DST_PORT..DST_PORT + 2].copy_from_slice(&i.dst_port.to_be_bytes());
        buf[SEQ_NUM..SEQ_NUM + 4].copy_from_slice(&u32::from(i.seq_num).to_be_bytes());
        buf[ACK_NUM..ACK_NUM + 4].copy_from_slice(&u32::from(i.ack_num).to_be_bytes());
        buf[DATA_OFFSET] = (i.data_offset / 4) << 4;
        buf[TCP_FLAGS] = i.flags;
        buf[WIN_SIZE..WIN_SIZE + 2].copy_from_slice(&i.window_size.to_be_bytes());
        buf[TCP_CHECKSUM..TCP_CHECKSUM + 2].copy_from_slice(&[0, 0]);
        buf[URGENT_PTR..URGENT_PTR + 2].copy_from_slice(&[0, 0]);
    }

    pub fn set_checksum(&mut self, v: u16) {
        self.buf_mut()[TCP_CHECKSUM..TCP_CHECKSUM + 2].copy_from_slice(&v.to_be_bytes());
    }
}

impl Segment {
    /// Wraps an inbound packet, shallow-cloning the payload views.
    pub fn new(route: &Route, id: &TransportEndpointId, vv: &VectorisedView) -> Self {
        Self {
            id: id.clone(),
            route: route.clone(),
            data: vv.clone(),
            view_to_deliver: 0,
            seq_num: SeqNumber::from(0),
            ack_num: SeqNumber::from(0),
            flags: 0,
            window: 0,
            parsed_options: TcpSynOptions::default(),
            options: Vec::new(),
        }
    }

    /// Wraps an outbound payload in an unnumbered segment.
    pub fn from_view(route: &Route, id: &TransportEndpointId, v: View) -> Self {
        Self {
            id: id.clone(),
            route: route.clone(),
            data: VectorisedView::from_view(v),
            view_to_deliver: 0,
            seq_num: SeqNumber::from(0),
            ack_num: SeqNumber::from(0),
            flags: 0,
            window: 0,
            parsed_options: TcpSynOptions::default(),
            options: Vec::new(),
        }
    }

    /// Populates the sequence and ack numbers, flags, and window from the
    /// TCP header stored at the front of the data, verifies the checksum,
    /// and trims the header. Returns false if the segment is malformed.
    ///
    /// The segment has already been validated as holding at least the
    /// minimum TCP header before reaching here.
    pub fn parse(&mut self) -> bool {
        let offset: usize = {
            let first: &View = self.data.first();
            let h: TcpHeader<&[u8]> = TcpHeader(first.as_slice());
            let offset: usize = h.data_offset();
            // The offset must cover the minimum header (otherwise part of
            // the header would be delivered as data) and must lie within
            // the first view (otherwise field reads would walk off it).
            if offset < TCP_MINIMUM_SIZE || offset > first.len() {
                return false;
            }
            offset
        };

        // Verify the checksum over the pseudo-header and the whole segment.
        let mut xsum: u16 =
            checksum::pseudo_header_checksum(PROTOCOL_NUMBER, &self.id.local_address, &self.id.remote_address);
        xsum = checksum::combine(xsum, self.data.size() as u16);
        for v in self.data.views() {
            xsum = checksum::checksum(v.as_slice(), xsum);
        }
        if xsum != 0xFFFF {
            debug!("parse: checksum mismatch, dropping");
            return false;
        }

        let first: &View = self.data.first();
        let h: TcpHeader<&[u8]> = TcpHeader(first.as_slice());
        self.options = first.as_slice()[TCP_MINIMUM_SIZE..offset].to_vec();
        self.parsed_options = parse_syn_options(&self.options);
        self.seq_num = SeqNumber::from(h.sequence_number());
        self.ack_num = SeqNumber::from(h.ack_number());
        self.flags = h.flags();
        self.window = h.window_size();

        self.data.trim_front(offset);
        true
    }

    pub fn flag_is_set(&self, flag: u8) -> bool {
        (self.flags & flag) != 0
    }

    /// The length in sequence space: the payload plus one position each for
    /// SYN and FIN.
    pub fn logical_len(&self) -> u32 {
        let mut len: u32 = self.data.size() as u32;
        if self.flag_is_set(FLAG_SYN) {
            len += 1;
        }
        if self.flag_is_set(FLAG_FIN) {
            len += 1;
        }
        len
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Parses the options of a SYN segment. A malformed length aborts parsing
/// and yields the defaults (MSS 536, no window scaling).
pub fn parse_syn_options(opts: &[u8]) -> TcpSynOptions {
    let mut parsed: TcpSynOptions = TcpSynOptions::default();

    let mut i: usize = 0;
    while i < opts.len() {
        match opts[i] {
            OPTION_EOL => break,
            OPTION_NOP => {
                i += 1;
            },
            kind => {
                if i + 1 >= opts.len() {
                    return TcpSynOptions::default();
                }
                let length: usize = opts[i + 1] as usize;
                if length < 2 || i + length > opts.len() {
                    return TcpSynOptions::default();
                }

                match kind {
                    OPTION_MSS => {
                        if length != 4 {
                            return TcpSynOptions::default();
                        }
                        parsed.mss = u16::from_be_bytes([opts[i + 2], opts[i + 3]]);
                    },
                    OPTION_WS => {
                        if length != 3 {
                            return TcpSynOptions::default();
                        }
                        let mut ws: u8 = opts[i + 2];
                        if ws > MAX_WND_SCALE {
                            ws = MAX_WND_SCALE;
                        }
                        parsed.ws = ws as i8;
                    },
                    OPTION_TS => {
                        if length != 10 {
                            return TcpSynOptions::default();
                        }
                        parsed.ts = true;
                        parsed.ts_val = u32::from_be_bytes([opts[i + 2], opts[i + 3], opts[i + 4], opts[i + 5]]);
                        parsed.ts_ecr = u32::from_be_bytes([opts[i + 6], opts[i + 7], opts[i + 8], opts[i + 9]]);
                    },
                    // Unknown option: the length byte tells us how far to skip.
                    _ => (),
                }
                i += length;
            },
        }
    }

    parsed
}

/// Encodes the MSS and window-scale options offered on a SYN or SYN-ACK.
/// The result is padded with NOPs to a 32-bit boundary.
pub fn encode_syn_options(mss: u16, ws: i8) -> Vec<u8> {
    let mut opts: Vec<u8> = Vec::with_capacity(8);
    opts.extend_from_slice(&[OPTION_MSS, 4]);
    opts.extend_from_slice(&mss.to_be_bytes());
    if ws >= 0 {
        opts.extend_from_slice(&[OPTION_NOP, OPTION_WS, 3, ws as u8]);
    }
    while opts.len() % 4 != 0 {
        opts.push(OPTION_NOP);
    }
    opts
}

//==============================================================================
// Unit Tests
//==============================================================================
