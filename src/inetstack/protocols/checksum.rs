// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The internet checksum: a 16-bit one's-complement sum of 16-bit words.

//==============================================================================
// Imports
//==============================================================================

use crate::inetstack::types::{
    Address,
    TransportProtocolNumber,
};

//==============================================================================
// Standalone Functions
//==============================================================================

/// Folds a 32-bit accumulator down to 16 bits.
///
/// We don't need to subtract out 0xFFFF as we accumulate: with a u32
/// accumulator it takes 2^16 additions to overflow, well beyond the largest
/// packet we handle.
fn fold(mut sum: u32) -> u16 {
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Computes the one's-complement sum of `buf` on top of `initial`. An odd
/// trailing byte is padded with zero. The result is not complemented.
pub fn checksum(buf: &[u8], initial: u16) -> u16 {
    let mut sum: u32 = initial as u32;

    let mut chunks = buf.chunks_exact(2);
    for chunk in chunks.by_ref() {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&b) = chunks.remainder().first() {
        sum += u16::from_be_bytes([b, 0]) as u32;
    }

    fold(sum)
}

/// Combines two partial checksums.
pub fn combine(a: u16, b: u16) -> u16 {
    fold(a as u32 + b as u32)
}

/// Folds the two addresses and the protocol byte into a 16-bit
/// one's-complement accumulator. The transport layer adds the segment
/// length on top of this.
pub fn pseudo_header_checksum(protocol: TransportProtocolNumber, src: &Address, dst: &Address) -> u16 {
    let sum: u16 = checksum(src.as_slice(), 0);
    let sum: u16 = checksum(dst.as_slice(), sum);
    combine(sum, protocol.0 as u16)
}

//==============================================================================
// Unit Tests
//==============================================================================
