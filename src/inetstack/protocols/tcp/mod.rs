// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The TCP transport protocol. Register with [`register`] before
//! `Stack::new` and activate by passing `"tcp"` as one of the transport
//! protocol names.

pub mod cookie;
mod endpoint;
mod handshake;
mod passive_open;
mod receiver;
pub mod segment;
mod segment_queue;
mod sender;
mod sequence_number;

#[cfg(test)]
mod tests;

pub use self::sequence_number::SeqNumber;

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
    endpoint::TcpEndpoint,
    segment::{
        TcpHeader,
        TCP_MINIMUM_SIZE,
    },
};
use ::std::sync::Arc;

//==============================================================================
// Constants
//==============================================================================

/// The string representation of the TCP protocol name.
pub const PROTOCOL_NAME: &str = "tcp";

/// The TCP transport protocol number.
pub const PROTOCOL_NUMBER: TransportProtocolNumber = TransportProtocolNumber(6);

/// The maximum number of segments the protocol worker processes per
/// wake-up. Yielding after this many lets other events (timeouts, resets)
/// be processed as well.
const MAX_SEGMENTS_PER_WAKE: usize = 100;

// Identifiers used to set up the worker's sleeper.
const WAKER_FOR_NOTIFICATION: usize = 0;
const WAKER_FOR_NEW_SEGMENT: usize = 1;
const WAKER_FOR_SEND: usize = 2;
const WAKER_FOR_SEND_CLOSE: usize = 3;
const WAKER_FOR_ACCEPTED_CLOSE: usize = 4;

//==============================================================================
// Structures
//==============================================================================

pub struct TcpProtocol;

//==============================================================================
// Standalone Functions
//==============================================================================

/// Registers the TCP protocol factory with the process-wide registry.
pub fn register() {
    registry::register_transport_protocol_factory(PROTOCOL_NAME, new_protocol);
}

fn new_protocol() -> Arc<dyn TransportProtocol> {
    Arc::new(TcpProtocol)
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl TransportProtocol for TcpProtocol {
    fn number(&self) -> TransportProtocolNumber {
        PROTOCOL_NUMBER
    }

    fn minimum_packet_size(&self) -> usize {
        TCP_MINIMUM_SIZE
    }

    fn parse_ports(&self, v: &[u8]) -> Result<(u16, u16), Fail> {
        let h: TcpHeader<&[u8]> = TcpHeader(v);
        Ok((h.source_port(), h.destination_port()))
    }

    fn new_endpoint(
        &self,
        stack: &Stack,
        net_proto: NetworkProtocolNumber,
        waiter_queue: WaiterQueue,
    ) -> Result<Arc<dyn Endpoint>, Fail> {
        Ok(TcpEndpoint::new(stack.clone(), net_proto, waiter_queue))
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// The smallest shift `s` such that a 16-bit window field scaled by `s`
/// covers the given buffer size, capped at 14 as RFC 1323 requires.
fn find_wnd_scale(rcv_buf_size: u32) -> u8 {
    let mut scale: u8 = 0;
    while scale < 14 && (0xFFFFu64 << scale) < rcv_buf_size as u64 {
        scale += 1;
    }
    scale
}

//==============================================================================
// Unit Tests
//==============================================================================
