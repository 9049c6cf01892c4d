// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! SYN cookies. The listener encodes the handshake state it would
//! otherwise have to remember inside the initial sequence number it sends,
//! so it stays stateless until the third ACK arrives. The keyed hash is
//! SipHash-2-4.

//==============================================================================
// Imports
//==============================================================================

use crate::inetstack::{
    protocols::tcp::sequence_number::SeqNumber,
    types::TransportEndpointId,
};
use ::rand::Rng;
use ::std::time::{
    SystemTime,
    UNIX_EPOCH,
};

//==============================================================================
// Constants
//==============================================================================

/// The length, in bits, of the timestamp in the cookie.
const TS_LEN: u32 = 8;

/// Mask for timestamp values.
const TS_MASK: u32 = (1 << TS_LEN) - 1;

/// The offset, in bits, of the timestamp in the cookie.
const TS_OFFSET: u32 = 24;

/// Mask for the hashed data below the timestamp.
const HASH_MASK: u32 = (1 << TS_OFFSET) - 1;

/// The maximum allowed difference between a received cookie timestamp and
/// the current timestamp. Cookies older than this are expired.
const MAX_TS_DIFF: u32 = 2;

/// The MSS values that can be encoded in the cookie with two bits.
pub const MSS_TABLE: [u16; 4] = [536, 1300, 1440, 1460];

// SipHash-2-4 initial state, as ASCII text.
const SIP_IV: [&[u8; 8]; 4] = [b"somepseu", b"dorandom", b"lygenera", b"tedbytes"];

//==============================================================================
// Structures
//==============================================================================

/// Cookie state held by a listening endpoint: two random hash keys drawn at
/// listen start.
pub struct CookieContext {
    nonce: [(u64, u64); 2],
}

struct SipState {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl SipState {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        Self {
            v0: u64::from_be_bytes(*SIP_IV[0]) ^ k0,
            v1: u64::from_be_bytes(*SIP_IV[1]) ^ k1,
            v2: u64::from_be_bytes(*SIP_IV[2]) ^ k0,
            v3: u64::from_be_bytes(*SIP_IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

impl CookieContext {
    pub fn new() -> Self {
        let mut rng = ::rand::thread_rng();
        Self {
            nonce: [(rng.gen(), rng.gen()), (rng.gen(), rng.gen())],
        }
    }

    /// The keyed hash over the connection id and a timestamp, under the
    /// given nonce.
    fn cookie_hash(&self, id: &TransportEndpointId, ts: u32, nonce_index: usize) -> u32 {
        let (k0, k1): (u64, u64) = self.nonce[nonce_index];
        let mut state: SipState = SipState::init(k0, k1);

        state.absorb((id.local_port as u64) | (id.remote_port as u64) << 16 | (ts as u64) << 32);
        for addr in [&id.local_address, &id.remote_address] {
            let mut m: u64 = 0;
            for (i, b) in addr.as_slice().iter().enumerate() {
                m |= (*b as u64) << (8 * (i % 8));
                if i % 8 == 7 {
                    state.absorb(m);
                    m = 0;
                }
            }
            state.absorb(m | (addr.len() as u64) << 56);
        }

        state.finalize() as u32
    }

    /// Creates a cookie for the given id and incoming sequence number,
    /// encoding `data` in the low 24 bits.
    pub fn create_cookie(&self, id: &TransportEndpointId, seq: SeqNumber, data: u32) -> SeqNumber {
        self.create_cookie_at(id, seq, data, time_stamp())
    }

    fn create_cookie_at(&self, id: &TransportEndpointId, seq: SeqNumber, data: u32, ts: u32) -> SeqNumber {
        let mut v: u32 = self.cookie_hash(id, 0, 0).wrapping_add(u32::from(seq)).wrapping_add(ts << TS_OFFSET);
        v = v.wrapping_add(self.cookie_hash(id, ts, 1).wrapping_add(data) & HASH_MASK);
        SeqNumber::from(v)
    }

    /// Checks whether the supplied cookie is valid for the given id and
    /// sequence number, and if so returns the data originally encoded into
    /// it.
    pub fn is_cookie_valid(&self, id: &TransportEndpointId, cookie: SeqNumber, seq: SeqNumber) -> (u32, bool) {
        self.is_cookie_valid_at(id, cookie, seq, time_stamp())
    }

    fn is_cookie_valid_at(&self, id: &TransportEndpointId, cookie: SeqNumber, seq: SeqNumber, ts: u32) -> (u32, bool) {
        let v: u32 = u32::from(cookie)
            .wrapping_sub(self.cookie_hash(id, 0, 0))
            .wrapping_sub(u32::from(seq));
        let cookie_ts: u32 = v >> TS_OFFSET;
        if (ts.wrapping_sub(cookie_ts) & TS_MASK) > MAX_TS_DIFF {
            return (0, false);
        }

        (v.wrapping_sub(self.cookie_hash(id, cookie_ts, 1)) & HASH_MASK, true)
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// An 8-bit timestamp with a granularity of 64 seconds.
fn time_stamp() -> u32 {
    let secs: u64 = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    ((secs >> 6) as u32) & TS_MASK
}

/// Quantizes an MSS into a two-bit index into [`MSS_TABLE`].
pub fn encode_mss(mss: u16) -> u32 {
    for i in (1..MSS_TABLE.len()).rev() {
        if mss >= MSS_TABLE[i] {
            return i as u32;
        }
    }
    0
}

//==============================================================================
// Unit Tests
//==============================================================================
