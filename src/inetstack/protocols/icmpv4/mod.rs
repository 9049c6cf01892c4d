// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! ICMPv4 echo handling. The receive side enqueues echo requests onto a
//! bounded channel; a dedicated replier task consumes entries and writes
//! echo-reply packets back through the route the request arrived on.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        protocols::checksum,
        route::Route,
        types::TransportProtocolNumber,
    },
    runtime::memory::{
        Prependable,
        View,
    },
};
use ::crossbeam_channel;

//==============================================================================
// Constants
//==============================================================================

/// The minimum size of a valid ICMP packet.
pub const ICMPV4_MINIMUM_SIZE: usize = 4;

/// The ICMP transport protocol number.
pub const PROTOCOL_NUMBER: TransportProtocolNumber = TransportProtocolNumber(1);

/// ICMP message types from RFC 792.
pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV4_ECHO: u8 = 8;

//==============================================================================
// Structures
//==============================================================================

/// An ICMPv4 header as a typed view over a byte buffer.
pub struct Icmpv4Header<B>(pub B);

/// One queued inbound echo request: the route it arrived on and the full
/// ICMP message (header plus payload).
pub struct EchoRequest {
    pub route: Route,
    pub view: View,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl<B: AsRef<[u8]>> Icmpv4Header<B> {
    pub fn typ(&self) -> u8 {
        self.0.as_ref()[0]
    }

    pub fn code(&self) -> u8 {
        self.0.as_ref()[1]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.0.as_ref()[2], self.0.as_ref()[3]])
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Icmpv4Header<B> {
    pub fn set_type(&mut self, t: u8) {
        self.0.as_mut()[0] = t;
    }

    pub fn set_code(&mut self, c: u8) {
        self.0.as_mut()[1] = c;
    }

    pub fn set_checksum(&mut self, v: u16) {
        self.0.as_mut()[2..4].copy_from_slice(&v.to_be_bytes());
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// The echo-replier loop. Exits when the producing side goes away.
pub(crate) fn echo_replier(rx: crossbeam_channel::Receiver<EchoRequest>) {
    while let Ok(req) = rx.recv() {
        send_echo_reply(&req);
    }
}

fn send_echo_reply(req: &EchoRequest) {
    let mut bytes: Vec<u8> = req.view.to_vec();
    if bytes.len() < ICMPV4_MINIMUM_SIZE {
        return;
    }

    let (hdr_bytes, data): (&mut [u8], &mut [u8]) = bytes.split_at_mut(ICMPV4_MINIMUM_SIZE);
    hdr_bytes[0] = ICMPV4_ECHO_REPLY;
    hdr_bytes[2..4].copy_from_slice(&[0, 0]);
    let sum: u16 = checksum::combine(checksum::checksum(hdr_bytes, 0), checksum::checksum(data, 0));
    Icmpv4Header(hdr_bytes).set_checksum(!sum);

    let hdr: Prependable = Prependable::new(req.route.max_header_length());
    if let Err(e) = req.route.write_packet(hdr, Some(View::from(bytes)), PROTOCOL_NUMBER) {
        debug!("send_echo_reply: write failed: {:?}", e);
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::Icmpv4Header;
    use crate::inetstack::{
        protocols::checksum,
        test_helpers::{
            parse_ipv4,
            TestContext,
            DEFAULT_MTU,
        },
    };
    use ::anyhow::Result;

    #[test]
    fn header_fields() -> Result<()> {
        let mut buf: Vec<u8> = vec![0u8; 8];
        {
            let mut h: Icmpv4Header<&mut [u8]> = Icmpv4Header(&mut buf[..]);
            h.set_type(super::ICMPV4_ECHO);
            h.set_code(0);
            h.set_checksum(0xbeef);
        }

        let h: Icmpv4Header<&[u8]> = Icmpv4Header(&buf[..]);
        crate::ensure_eq!(h.typ(), super::ICMPV4_ECHO);
        crate::ensure_eq!(h.code(), 0);
        crate::ensure_eq!(h.checksum(), 0xbeef);
        Ok(())
    }

    // One echo in, exactly one echo-reply out, with the identifier,
    // sequence number, and payload intact.
    #[test]
    fn echo_gets_replied() -> Result<()> {
        let c: TestContext = TestContext::new(DEFAULT_MTU)?;

        // Type, code, checksum, identifier 0x0102, sequence 0x0304, payload.
        let mut echo: Vec<u8> = vec![super::ICMPV4_ECHO, 0, 0, 0, 1, 2, 3, 4, 0xaa, 0xbb, 0xcc];
        let sum: u16 = checksum::checksum(&echo, 0);
        Icmpv4Header(&mut echo[..]).set_checksum(!sum);

        c.inject_ipv4(&echo, super::PROTOCOL_NUMBER.0);

        let reply: Vec<u8> = parse_ipv4(&c.get_packet()?, super::PROTOCOL_NUMBER.0)?;
        crate::ensure_eq!(reply[0], super::ICMPV4_ECHO_REPLY);
        crate::ensure_eq!(reply[1], 0);
        // Identifier, sequence number, and payload come back untouched.
        crate::ensure_eq!(&reply[4..], &echo[4..]);
        // The reply checksums to all-ones.
        crate::ensure_eq!(checksum::checksum(&reply, 0), 0xFFFF);
        Ok(())
    }
}
