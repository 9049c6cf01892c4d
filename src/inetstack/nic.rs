// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        demux::TransportDemuxer,
        route::Route,
        types::{
            Address,
            LinkAddress,
            LinkEndpoint,
            NetworkDispatcher,
            NetworkEndpoint,
            NetworkEndpointId,
            NetworkProtocol,
            NetworkProtocolNumber,
            NicId,
            TransportDispatcher,
            TransportEndpointId,
            TransportProtocol,
            TransportProtocolNumber,
        },
        StackInner,
    },
    runtime::{
        fail::Fail,
        memory::VectorisedView,
    },
};
use ::std::{
    collections::HashMap,
    sync::{
        Arc,
        RwLock,
        Weak,
    },
};

//==============================================================================
// Structures
//==============================================================================

/// A "network interface card": ties one link endpoint to the network
/// endpoints configured on it. The NIC owns its network endpoints;
/// destroying the NIC destroys them.
pub struct Nic {
    stack: Weak<StackInner>,
    me: Weak<Nic>,
    id: NicId,
    link_ep: Arc<dyn LinkEndpoint>,
    demux: TransportDemuxer,
    endpoints: RwLock<HashMap<NetworkEndpointId, Arc<dyn NetworkEndpoint>>>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Nic {
    pub(crate) fn new(
        stack: Weak<StackInner>,
        id: NicId,
        link_ep: Arc<dyn LinkEndpoint>,
        demux: TransportDemuxer,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            stack,
            me: me.clone(),
            id,
            link_ep,
            demux,
            endpoints: RwLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> NicId {
        self.id
    }

    pub(crate) fn demux(&self) -> &TransportDemuxer {
        &self.demux
    }

    fn arc(&self) -> Arc<Nic> {
        self.me.upgrade().expect("nic vanished while in use")
    }

    /// Attaches the NIC to its link endpoint, enabling packet delivery.
    pub(crate) fn attach_link_endpoint(&self) {
        self.link_ep.attach(self.arc());
    }

    /// Adds an address to the NIC, so it starts accepting packets targeted
    /// at it under the given network protocol.
    pub(crate) fn add_address(&self, protocol: NetworkProtocolNumber, addr: &Address) -> Result<(), Fail> {
        let stack: Arc<StackInner> = self.stack.upgrade().ok_or(Fail::BadLinkEndpoint)?;
        let net_protocol: &Arc<dyn NetworkProtocol> =
            stack.network_protocols.get(&protocol).ok_or(Fail::UnknownProtocol)?;

        let mut endpoints = self.endpoints.write().unwrap();
        let id: NetworkEndpointId = NetworkEndpointId(addr.clone());
        if endpoints.contains_key(&id) {
            return Err(Fail::DuplicateAddress);
        }

        let ep: Arc<dyn NetworkEndpoint> = net_protocol.new_endpoint(self.id, addr, self.link_ep.clone(), self.arc())?;
        endpoints.insert(id, ep);
        Ok(())
    }

    /// Returns the NIC's primary network endpoint, if any address has been
    /// configured.
    pub(crate) fn primary_endpoint(&self) -> Option<Arc<dyn NetworkEndpoint>> {
        self.endpoints.read().unwrap().values().next().cloned()
    }

    /// Returns the network endpoint configured with the given address.
    pub(crate) fn find_endpoint(&self, addr: &Address) -> Option<Arc<dyn NetworkEndpoint>> {
        self.endpoints.read().unwrap().get(&NetworkEndpointId(addr.clone())).cloned()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl NetworkDispatcher for Nic {
    /// Finds the appropriate network protocol endpoint and hands the packet
    /// over for further processing. Called when the NIC receives a packet
    /// from the link layer.
    fn deliver_network_packet(&self, remote_link_addr: LinkAddress, protocol: NetworkProtocolNumber, vv: VectorisedView) {
        let stack: Arc<StackInner> = match self.stack.upgrade() {
            Some(stack) => stack,
            None => return,
        };

        let net_protocol: &Arc<dyn NetworkProtocol> = match stack.network_protocols.get(&protocol) {
            Some(p) => p,
            None => {
                debug!("deliver_network_packet: unknown network protocol {:?}, dropping", protocol);
                return;
            },
        };

        if vv.is_empty() || vv.first().len() < net_protocol.minimum_packet_size() {
            debug!("deliver_network_packet: packet is not big enough, dropping");
            return;
        }

        let (src, dst): (Address, Address) = net_protocol.parse_addresses(vv.first().as_slice());
        let ep: Arc<dyn NetworkEndpoint> = match self.find_endpoint(&dst) {
            Some(ep) => ep,
            None => {
                debug!("deliver_network_packet: no endpoint for {:?}, dropping", dst);
                return;
            },
        };

        let mut route: Route = Route::new(protocol, dst, src, ep.clone());
        route.local_link_address = self.link_ep.link_address();
        route.remote_link_address = remote_link_addr;

        ep.handle_packet(&route, vv);
    }
}

impl TransportDispatcher for Nic {
    /// Delivers an inbound packet to the appropriate transport endpoint:
    /// the NIC's own demultiplexer first, then the stack-wide one, else the
    /// packet is dropped.
    fn deliver_transport_packet(&self, route: &Route, protocol: TransportProtocolNumber, vv: VectorisedView) {
        let stack: Arc<StackInner> = match self.stack.upgrade() {
            Some(stack) => stack,
            None => return,
        };

        let trans_protocol: &Arc<dyn TransportProtocol> = match stack.transport_protocols.get(&protocol) {
            Some(p) => p,
            None => {
                debug!("deliver_transport_packet: unknown transport protocol {:?}, dropping", protocol);
                return;
            },
        };

        if vv.is_empty() || vv.first().len() < trans_protocol.minimum_packet_size() {
            debug!("deliver_transport_packet: packet is not big enough, dropping");
            return;
        }

        let (src_port, dst_port): (u16, u16) = match trans_protocol.parse_ports(vv.first().as_slice()) {
            Ok(ports) => ports,
            Err(_) => {
                debug!("deliver_transport_packet: failed to parse ports, dropping");
                return;
            },
        };

        let id: TransportEndpointId = TransportEndpointId {
            local_port: dst_port,
            local_address: route.local_address.clone(),
            remote_port: src_port,
            remote_address: route.remote_address.clone(),
        };

        if self.demux.deliver_packet(route, protocol, vv.clone(), &id) {
            return;
        }
        if stack.demux.deliver_packet(route, protocol, vv, &id) {
            return;
        }

        debug!("deliver_transport_packet: no endpoint for {:?}, dropping", id);
    }
}
