// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::inetstack::protocols::checksum;

//==============================================================================
// Constants
//==============================================================================

/// The minimum size of a valid UDP packet.
pub const UDP_MINIMUM_SIZE: usize = 8;

const SRC_PORT: usize = 0;
const DST_PORT: usize = 2;
const LENGTH: usize = 4;
const UDP_CHECKSUM: usize = 6;

//==============================================================================
// Structures
//==============================================================================

/// The fields of a UDP packet, used to describe a packet to be encoded.
#[derive(Clone, Debug, Default)]
pub struct UdpFields {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

/// A UDP header as a typed view over a byte buffer.
pub struct UdpHeader<B>(pub B);

//==============================================================================
// Associated Functions
//==============================================================================

impl<B: AsRef<[u8]>> UdpHeader<B> {
    fn buf(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn source_port(&self) -> u16 {
        u16::from_be_bytes([self.buf()[SRC_PORT], self.buf()[SRC_PORT + 1]])
    }

    pub fn destination_port(&self) -> u16 {
        u16::from_be_bytes([self.buf()[DST_PORT], self.buf()[DST_PORT + 1]])
    }

    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.buf()[LENGTH], self.buf()[LENGTH + 1]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buf()[UDP_CHECKSUM], self.buf()[UDP_CHECKSUM + 1]])
    }

    /// The one's-complement sum of the header on top of `partial`, which
    /// covers the pseudo-header, the length, and the payload.
    pub fn calculate_checksum(&self, partial: u16, length: u16) -> u16 {
        let sum: u16 = checksum::combine(partial, length);
        checksum::checksum(&self.buf()[..UDP_MINIMUM_SIZE], sum)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> UdpHeader<B> {
    fn buf_mut(&mut self) -> &mut [u8] {
        self.0.as_mut()
    }

    /// Encodes all fields of the header.
    pub fn encode(&mut self, i: &UdpFields) {
        let buf: &mut [u8] = self.buf_mut();
        buf[SRC_PORT..SRC_PORT + 2].copy_from_slice(&i.src_port.to_be_bytes());
        buf[DST_PORT..DST_PORT + 2].copy_from_slice(&i.dst_port.to_be_bytes());
        buf[LENGTH..LENGTH + 2].copy_from_slice(&i.length.to_be_bytes());
        buf[UDP_CHECKSUM..UDP_CHECKSUM + 2].copy_from_slice(&i.checksum.to_be_bytes());
    }

    pub fn set_checksum(&mut self, v: u16) {
        self.buf_mut()[UDP_CHECKSUM..UDP_CHECKSUM + 2].copy_from_slice(&v.to_be_bytes());
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
