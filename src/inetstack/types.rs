// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Core types and capability traits shared by every layer of the stack.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::route::Route,
    runtime::{
        fail::Fail,
        memory::{
            Prependable,
            VectorisedView,
            View,
        },
        waiter::WaiterQueue,
    },
};
use ::arrayvec::ArrayVec;
use ::std::{
    fmt,
    sync::Arc,
};

//==============================================================================
// Constants
//==============================================================================

/// Shutdown the receive half of an endpoint.
pub const SHUTDOWN_READ: ShutdownFlags = 1;
/// Shutdown the send half of an endpoint.
pub const SHUTDOWN_WRITE: ShutdownFlags = 2;

//==============================================================================
// Structures
//==============================================================================

/// Identifier of a NIC within a stack. Zero means "any NIC".
pub type NicId = u32;

/// Identifier of a registered link endpoint.
pub type LinkEndpointId = u64;

/// OR-composable shutdown flags.
pub type ShutdownFlags = u8;

/// The number of a network protocol (e.g. 0x0800 for IPv4).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NetworkProtocolNumber(pub u32);

/// The number of a transport protocol. Matches the IPv4 protocol field.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TransportProtocolNumber(pub u8);

/// An opaque network-layer address. IPv4 addresses are 4 bytes. The empty
/// address is the wildcard. Addresses compare by value.
#[derive(Clone, Default, Eq, Hash, PartialEq)]
pub struct Address(ArrayVec<u8, 16>);

/// A link-layer address. Empty for link endpoints without addressing.
pub type LinkAddress = Address;

/// A full transport address.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FullAddress {
    pub nic: NicId,
    pub addr: Address,
    pub port: u16,
}

/// The identifier of a network endpoint: its local address.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct NetworkEndpointId(pub Address);

/// The identifier of a transport endpoint, used as demultiplexing key.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct TransportEndpointId {
    pub local_port: u16,
    pub local_address: Address,
    pub remote_port: u16,
    pub remote_address: Address,
}

/// Names of the socket options an endpoint understands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SockOptName {
    /// The endpoint's hard error; reading it clears it.
    Error,
    ReceiveBufferSize,
    SendBufferSize,
}

/// Socket option values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SockOpt {
    Error(Option<Fail>),
    ReceiveBufferSize(usize),
    SendBufferSize(usize),
}

//==============================================================================
// Traits
//==============================================================================

/// Implemented by data link layer endpoints (e.g. a TUN device, a loopback
/// channel) and used by network protocols to emit raw frames.
pub trait LinkEndpoint: Send + Sync {
    /// The maximum transmission unit for this endpoint, usually dictated by
    /// the backing physical network. When no physical network exists the
    /// limit is generally 64k.
    fn mtu(&self) -> u32;

    /// The maximum size of the link-level headers. Higher layers reserve
    /// this much headroom in front of the packets they build.
    fn max_header_length(&self) -> u16;

    /// The link address of this endpoint.
    fn link_address(&self) -> LinkAddress;

    /// Saves the network-layer dispatcher that inbound packets are
    /// delivered to.
    fn attach(&self, dispatcher: Arc<dyn NetworkDispatcher>);

    /// Emits one outbound packet.
    fn write_packet(
        &self,
        route: &Route,
        hdr: &Prependable,
        payload: Option<&View>,
        protocol: NetworkProtocolNumber,
    ) -> Result<(), Fail>;
}

/// Receives inbound packets from a link endpoint. Implemented by the NIC.
pub trait NetworkDispatcher: Send + Sync {
    fn deliver_network_packet(
        &self,
        remote_link_addr: LinkAddress,
        protocol: NetworkProtocolNumber,
        vv: VectorisedView,
    );
}

/// Implemented by network protocols (e.g. IPv4) that want to be part of the
/// stack.
pub trait NetworkProtocol: Send + Sync {
    fn number(&self) -> NetworkProtocolNumber;

    /// The minimum valid packet size of this protocol. The stack drops
    /// smaller packets targeted at this protocol.
    fn minimum_packet_size(&self) -> usize;

    /// Extracts the source and destination addresses stored in a packet of
    /// this protocol.
    fn parse_addresses(&self, v: &[u8]) -> (Address, Address);

    /// Creates a new endpoint of this protocol on the given NIC.
    fn new_endpoint(
        &self,
        nic_id: NicId,
        addr: &Address,
        link_ep: Arc<dyn LinkEndpoint>,
        dispatcher: Arc<dyn TransportDispatcher>,
    ) -> Result<Arc<dyn NetworkEndpoint>, Fail>;
}

/// A per-address instance of a network protocol, owned by a NIC.
pub trait NetworkEndpoint: Send + Sync {
    fn nic_id(&self) -> NicId;

    fn id(&self) -> NetworkEndpointId;

    /// The MTU available to transport protocols: the link MTU minus this
    /// protocol's header size.
    fn mtu(&self) -> u32;

    /// The sum of the link-level reserve and this protocol's header size.
    fn max_header_length(&self) -> usize;

    /// Encodes this protocol's header in front of `hdr` and hands the
    /// packet to the link endpoint.
    fn write_packet(
        &self,
        route: &Route,
        hdr: Prependable,
        payload: Option<View>,
        protocol: TransportProtocolNumber,
    ) -> Result<(), Fail>;

    /// Handles one validated inbound packet addressed to this endpoint.
    fn handle_packet(&self, route: &Route, vv: VectorisedView);
}

/// Receives inbound packets from a network endpoint and demultiplexes them
/// to transport endpoints. Implemented by the NIC.
pub trait TransportDispatcher: Send + Sync {
    fn deliver_transport_packet(&self, route: &Route, protocol: TransportProtocolNumber, vv: VectorisedView);
}

/// Implemented by transport protocols (e.g. TCP, UDP) that want to be part
/// of the stack.
pub trait TransportProtocol: Send + Sync {
    fn number(&self) -> TransportProtocolNumber;

    /// The minimum valid packet size of this protocol. The stack drops
    /// smaller packets targeted at this protocol.
    fn minimum_packet_size(&self) -> usize;

    /// Extracts the source and destination ports stored in a packet of this
    /// protocol.
    fn parse_ports(&self, v: &[u8]) -> Result<(u16, u16), Fail>;

    /// Creates a new endpoint of this protocol.
    fn new_endpoint(
        &self,
        stack: &crate::inetstack::Stack,
        net_proto: NetworkProtocolNumber,
        waiter_queue: WaiterQueue,
    ) -> Result<Arc<dyn Endpoint>, Fail>;
}

/// A transport endpoint as seen by the demultiplexer.
pub trait TransportEndpoint: Send + Sync {
    /// Called by the stack when a packet arrives for this endpoint.
    fn handle_packet(&self, route: &Route, id: &TransportEndpointId, vv: VectorisedView);
}

/// The user-facing surface of a transport endpoint.
pub trait Endpoint: Send + Sync {
    /// Binds the endpoint to a specific local address and port. Specifying
    /// a NIC is optional.
    fn bind(&self, addr: FullAddress) -> Result<(), Fail>;

    /// Puts the endpoint in listening mode, accepting up to `backlog`
    /// connections while none is accepted.
    fn listen(&self, backlog: usize) -> Result<(), Fail>;

    /// Returns a connection that has been established to this listening
    /// endpoint, along with its waiter queue.
    fn accept(&self) -> Result<(Arc<dyn Endpoint>, WaiterQueue), Fail>;

    /// Starts connecting the endpoint to the given remote address. Returns
    /// `ConnectStarted` on optimistic start; completion is signalled via
    /// the waiter queue.
    fn connect(&self, addr: FullAddress) -> Result<(), Fail>;

    /// Reads data from the endpoint, optionally returning the sender's
    /// address.
    fn read(&self, from: Option<&mut FullAddress>) -> Result<View, Fail>;

    /// Writes data to the endpoint's peer.
    fn write(&self, v: View, to: Option<&FullAddress>) -> Result<usize, Fail>;

    /// Closes the read and/or write half of the endpoint.
    fn shutdown(&self, flags: ShutdownFlags) -> Result<(), Fail>;

    /// Closes the endpoint, releasing all resources once in-flight work
    /// drains.
    fn close(&self);

    fn set_sock_opt(&self, opt: SockOpt) -> Result<(), Fail>;

    fn get_sock_opt(&self, opt: SockOptName) -> Result<SockOpt, Fail>;
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Address {
    /// The empty (wildcard) address.
    pub fn empty() -> Self {
        Self(ArrayVec::new())
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut inner: ArrayVec<u8, 16> = ArrayVec::new();
        inner.try_extend_from_slice(bytes).expect("address too long");
        Self(inner)
    }

    /// Creates an IPv4 address.
    pub fn v4(octets: [u8; 4]) -> Self {
        Self::from_slice(&octets)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the wildcard address.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 4 {
            write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
        } else if self.0.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{:02x?}", self.0.as_slice())
        }
    }
}
