// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        protocols::checksum,
        types::{
            Address,
            LinkAddress,
            NetworkEndpoint,
            NetworkProtocolNumber,
            NicId,
            TransportProtocolNumber,
        },
    },
    runtime::{
        fail::Fail,
        memory::{
            Prependable,
            View,
        },
    },
};
use ::std::{
    fmt,
    sync::Arc,
};

//==============================================================================
// Structures
//==============================================================================

/// The bundle used to emit a packet: local and remote addresses, the
/// next hop, and a refcounted handle to the network endpoint that owns the
/// local address. Clonable; clones share the endpoint handle.
#[derive(Clone)]
pub struct Route {
    pub net_proto: NetworkProtocolNumber,
    pub local_address: Address,
    pub local_link_address: LinkAddress,
    pub remote_address: Address,
    pub remote_link_address: LinkAddress,
    pub next_hop: Address,
    ep: Arc<dyn NetworkEndpoint>,
}

/// A row in the routing table. A row is viable if the masked target address
/// matches the row's destination: for every byte `i`,
/// `(addr[i] & mask[i]) == destination[i]`. First match wins.
#[derive(Clone, Debug)]
pub struct RouteEntry {
    pub destination: Address,
    pub mask: Address,
    pub gateway: Address,
    pub nic: NicId,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Route {
    pub fn new(
        net_proto: NetworkProtocolNumber,
        local_address: Address,
        remote_address: Address,
        ep: Arc<dyn NetworkEndpoint>,
    ) -> Self {
        Self {
            net_proto,
            local_address,
            local_link_address: LinkAddress::empty(),
            remote_address,
            remote_link_address: LinkAddress::empty(),
            next_hop: Address::empty(),
            ep,
        }
    }

    pub fn nic_id(&self) -> NicId {
        self.ep.nic_id()
    }

    /// The MTU available to the transport layer on this route.
    pub fn mtu(&self) -> u32 {
        self.ep.mtu()
    }

    /// The sum of the link-level reserve and the network header size.
    pub fn max_header_length(&self) -> usize {
        self.ep.max_header_length()
    }

    /// Folds the two addresses and the protocol byte into a 16-bit
    /// one's-complement accumulator. Transport protocols add the segment
    /// length and payload on top.
    pub fn pseudo_header_checksum(&self, protocol: TransportProtocolNumber) -> u16 {
        checksum::pseudo_header_checksum(protocol, &self.local_address, &self.remote_address)
    }

    /// Emits a packet on this route through the owning network endpoint.
    pub fn write_packet(
        &self,
        hdr: Prependable,
        payload: Option<View>,
        protocol: TransportProtocolNumber,
    ) -> Result<(), Fail> {
        self.ep.write_packet(self, hdr, payload, protocol)
    }
}

impl RouteEntry {
    /// Whether the given address matches this row.
    pub fn matches(&self, addr: &Address) -> bool {
        if addr.len() != self.destination.len() || addr.len() != self.mask.len() {
            return false;
        }

        for (i, byte) in addr.as_slice().iter().enumerate() {
            if (byte & self.mask.as_slice()[i]) != self.destination.as_slice()[i] {
                return false;
            }
        }

        true
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Route({:?} -> {:?} via {:?})",
            self.local_address, self.remote_address, self.next_hop
        )
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
