// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The UDP transport protocol. Register with [`register`] before
//! `Stack::new` and activate by passing `"udp"` as one of the transport
//! protocol names.

pub mod datagram;
mod endpoint;

#[cfg(test)]
mod tests;

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        registry,
        types::{
            Endpoint,
            NetworkProtocolNumber,
            TransportProtocol,
            TransportProtocolNumber,
        },
        Stack,
    },
    runtime::{
        fail::Fail,
        waiter::WaiterQueue,
    },
};
use self::{
    datagram::{
        UdpHeader,
        UDP_MINIMUM_SIZE,
    },
    endpoint::UdpEndpoint,
};
use ::std::sync::Arc;

//==============================================================================
// Constants
//==============================================================================

/// The string representation of the UDP protocol name.
pub const PROTOCOL_NAME: &str = "udp";

/// The UDP transport protocol number.
pub const PROTOCOL_NUMBER: TransportProtocolNumber = TransportProtocolNumber(17);

//==============================================================================
// Structures
//==============================================================================

pub struct UdpProtocol;

//==============================================================================
// Standalone Functions
//==============================================================================

/// Registers the UDP protocol factory with the process-wide registry.
pub fn register() {
    registry::register_transport_protocol_factory(PROTOCOL_NAME, new_protocol);
}

fn new_protocol() -> Arc<dyn TransportProtocol> {
    Arc::new(UdpProtocol)
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl TransportProtocol for UdpProtocol {
    fn number(&self) -> TransportProtocolNumber {
        PROTOCOL_NUMBER
    }

    fn minimum_packet_size(&self) -> usize {
        UDP_MINIMUM_SIZE
    }

    fn parse_ports(&self, v: &[u8]) -> Result<(u16, u16), Fail> {
        let h: UdpHeader<&[u8]> = UdpHeader(v);
        Ok((h.source_port(), h.destination_port()))
    }

    fn new_endpoint(
        &self,
        stack: &Stack,
        net_proto: NetworkProtocolNumber,
        waiter_queue: WaiterQueue,
    ) -> Result<Arc<dyn Endpoint>, Fail> {
        Ok(UdpEndpoint::new(stack.clone(), net_proto, waiter_queue))
    }
}
