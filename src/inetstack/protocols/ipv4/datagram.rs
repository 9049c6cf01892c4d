// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::inetstack::{
    protocols::checksum,
    types::{
        Address,
        TransportProtocolNumber,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// The minimum size of a valid IPv4 packet.
pub const IPV4_MINIMUM_SIZE: usize = 20;

/// The size, in bytes, of an IPv4 address.
pub const IPV4_ADDRESS_SIZE: usize = 4;

/// The IP version carried in the version field.
pub const IPV4_VERSION: u8 = 4;

// Field offsets within the fixed header.
const VERS_IHL: usize = 0;
const TOS: usize = 1;
const TOTAL_LEN: usize = 2;
const IDENT: usize = 4;
const FLAGS_FO: usize = 6;
const TTL: usize = 8;
const PROTOCOL: usize = 9;
const IP_CHECKSUM: usize = 10;
const SRC_ADDR: usize = 12;
const DST_ADDR: usize = 16;

//==============================================================================
// Structures
//==============================================================================

/// The fields of an IPv4 packet, used to describe a packet to be encoded.
#[derive(Clone, Debug, Default)]
pub struct Ipv4Fields {
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub id: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_addr: Address,
    pub dst_addr: Address,
}

/// An IPv4 header as a typed view over a byte buffer. Reader methods index
/// the underlying bytes without bounds checks beyond the minimum size:
/// validate with [`Ipv4Header::is_valid`] before using the other methods on
/// untrusted input.
pub struct Ipv4Header<B>(pub B);

//==============================================================================
// Associated Functions
//==============================================================================

impl<B: AsRef<[u8]>> Ipv4Header<B> {
    fn buf(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// The header length in bytes, decoded from the IHL nibble.
    pub fn header_length(&self) -> usize {
        ((self.buf()[VERS_IHL] & 0xf) * 4) as usize
    }

    pub fn version(&self) -> u8 {
        self.buf()[VERS_IHL] >> 4
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.buf()[TOTAL_LEN], self.buf()[TOTAL_LEN + 1]])
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.buf()[IDENT], self.buf()[IDENT + 1]])
    }

    pub fn ttl(&self) -> u8 {
        self.buf()[TTL]
    }

    pub fn protocol(&self) -> u8 {
        self.buf()[PROTOCOL]
    }

    /// The protocol field, as a transport protocol number.
    pub fn transport_protocol(&self) -> TransportProtocolNumber {
        TransportProtocolNumber(self.protocol())
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buf()[IP_CHECKSUM], self.buf()[IP_CHECKSUM + 1]])
    }

    pub fn source_address(&self) -> Address {
        Address::from_slice(&self.buf()[SRC_ADDR..SRC_ADDR + IPV4_ADDRESS_SIZE])
    }

    pub fn destination_address(&self) -> Address {
        Address::from_slice(&self.buf()[DST_ADDR..DST_ADDR + IPV4_ADDRESS_SIZE])
    }

    /// The length of the payload portion of the packet.
    pub fn payload_length(&self) -> u16 {
        self.total_length() - self.header_length() as u16
    }

    /// Performs basic validation: the buffer holds at least the minimum
    /// header, and `IHL*4 <= total length <= pkt_size`.
    pub fn is_valid(&self, pkt_size: usize) -> bool {
        if self.buf().len() < IPV4_MINIMUM_SIZE {
            return false;
        }

        let hlen: usize = self.header_length();
        let tlen: usize = self.total_length() as usize;
        if hlen < IPV4_MINIMUM_SIZE || hlen > tlen || tlen > pkt_size {
            return false;
        }

        true
    }

    /// The one's-complement sum over the header bytes `[0, IHL*4)`.
    pub fn calculate_checksum(&self) -> u16 {
        checksum::checksum(&self.buf()[..self.header_length()], 0)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Ipv4Header<B> {
    fn buf_mut(&mut self) -> &mut [u8] {
        self.0.as_mut()
    }

    /// Encodes all fields of the header.
    pub fn encode(&mut self, i: &Ipv4Fields) {
        let buf: &mut [u8] = self.buf_mut();
        buf[VERS_IHL] = (IPV4_VERSION << 4) | ((i.ihl / 4) & 0xf);
        buf[TOS] = i.tos;
        buf[TOTAL_LEN..TOTAL_LEN + 2].copy_from_slice(&i.total_length.to_be_bytes());
        buf[IDENT..IDENT + 2].copy_from_slice(&i.id.to_be_bytes());
        let flags_fo: u16 = ((i.flags as u16) << 13) | (i.fragment_offset >> 3);
        buf[FLAGS_FO..FLAGS_FO + 2].copy_from_slice(&flags_fo.to_be_bytes());
        buf[TTL] = i.ttl;
        buf[PROTOCOL] = i.protocol;
        buf[IP_CHECKSUM..IP_CHECKSUM + 2].copy_from_slice(&i.checksum.to_be_bytes());
        buf[SRC_ADDR..SRC_ADDR + IPV4_ADDRESS_SIZE].copy_from_slice(i.src_addr.as_slice());
        buf[DST_ADDR..DST_ADDR + IPV4_ADDRESS_SIZE].copy_from_slice(i.dst_addr.as_slice());
    }

    pub fn set_total_length(&mut self, total_length: u16) {
        self.buf_mut()[TOTAL_LEN..TOTAL_LEN + 2].copy_from_slice(&total_length.to_be_bytes());
    }

    pub fn set_checksum(&mut self, v: u16) {
        self.buf_mut()[IP_CHECKSUM..IP_CHECKSUM + 2].copy_from_slice(&v.to_be_bytes());
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::{
        Ipv4Fields,
        Ipv4Header,
        IPV4_MINIMUM_SIZE,
    };
    use crate::inetstack::types::Address;
    use ::anyhow::Result;

    fn sample_fields() -> Ipv4Fields {
        Ipv4Fields {
            ihl: IPV4_MINIMUM_SIZE as u8,
            tos: 0,
            total_length: 39,
            id: 0x1234,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: 6,
            checksum: 0,
            src_addr: Address::v4([10, 0, 0, 1]),
            dst_addr: Address::v4([10, 0, 0, 2]),
        }
    }

    #[test]
    fn encode_round_trips() -> Result<()> {
        let mut buf: Vec<u8> = vec![0u8; IPV4_MINIMUM_SIZE];
        let fields: Ipv4Fields = sample_fields();
        Ipv4Header(&mut buf[..]).encode(&fields);

        let h: Ipv4Header<&[u8]> = Ipv4Header(&buf[..]);
        crate::ensure_eq!(h.is_valid(39), true);
        crate::ensure_eq!(h.version(), 4);
        crate::ensure_eq!(h.header_length(), IPV4_MINIMUM_SIZE);
        crate::ensure_eq!(h.total_length(), 39);
        crate::ensure_eq!(h.id(), 0x1234);
        crate::ensure_eq!(h.ttl(), 64);
        crate::ensure_eq!(h.protocol(), 6);
        crate::ensure_eq!(h.source_address(), Address::v4([10, 0, 0, 1]));
        crate::ensure_eq!(h.destination_address(), Address::v4([10, 0, 0, 2]));
        Ok(())
    }

    #[test]
    fn checksum_verifies_after_encode() -> Result<()> {
        let mut buf: Vec<u8> = vec![0u8; IPV4_MINIMUM_SIZE];
        let fields: Ipv4Fields = sample_fields();
        let mut h: Ipv4Header<&mut [u8]> = Ipv4Header(&mut buf[..]);
        h.encode(&fields);
        let sum: u16 = h.calculate_checksum();
        h.set_checksum(!sum);

        // Checksumming a header that carries its own checksum yields all-ones
        // (or zero, which is the same value in one's complement).
        let verify: u16 = Ipv4Header(&buf[..]).calculate_checksum();
        crate::ensure_eq!(verify == 0xFFFF || verify == 0, true);
        Ok(())
    }

    #[test]
    fn is_valid_rejects_bad_lengths() -> Result<()> {
        let mut buf: Vec<u8> = vec![0u8; IPV4_MINIMUM_SIZE];
        let mut fields: Ipv4Fields = sample_fields();
        fields.total_length = 100;
        Ipv4Header(&mut buf[..]).encode(&fields);

        // Total length larger than the packet.
        crate::ensure_eq!(Ipv4Header(&buf[..]).is_valid(50), false);

        // Truncated header.
        crate::ensure_eq!(Ipv4Header(&buf[..10]).is_valid(10), false);
        Ok(())
    }
}
