// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The stack fabric: protocol registries, NICs, routes, the transport
//! demultiplexer, and the port manager, glued together by [`Stack`].

pub mod demux;
pub mod link;
pub mod nic;
pub mod ports;
pub mod protocols;
pub mod registry;
pub mod route;
#[cfg(test)]
pub mod test_helpers;
pub mod types;

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        demux::TransportDemuxer,
        nic::Nic,
        ports::PortManager,
        route::{
            Route,
            RouteEntry,
        },
        types::{
            Address,
            Endpoint,
            LinkEndpoint,
            LinkEndpointId,
            NetworkEndpoint,
            NetworkProtocol,
            NetworkProtocolNumber,
            NicId,
            TransportEndpoint,
            TransportEndpointId,
            TransportProtocol,
            TransportProtocolNumber,
        },
    },
    runtime::{
        fail::Fail,
        waiter::WaiterQueue,
    },
};
use ::std::{
    collections::HashMap,
    sync::{
        Arc,
        RwLock,
    },
};

//==============================================================================
// Structures
//==============================================================================

pub(crate) struct StackState {
    nics: HashMap<NicId, Arc<Nic>>,
    route_table: Vec<RouteEntry>,
}

pub(crate) struct StackInner {
    pub(crate) network_protocols: HashMap<NetworkProtocolNumber, Arc<dyn NetworkProtocol>>,
    pub(crate) transport_protocols: HashMap<TransportProtocolNumber, Arc<dyn TransportProtocol>>,
    pub(crate) demux: TransportDemuxer,
    pub(crate) port_manager: PortManager,
    state: RwLock<StackState>,
}

/// A networking stack, with its configured protocols, NICs, and route
/// table. Cheap to clone; clones share the same stack.
#[derive(Clone)]
pub struct Stack {
    inner: Arc<StackInner>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Stack {
    /// Allocates a new networking stack with the requested network and
    /// transport protocols, instantiated from the process-wide registries.
    /// Unknown names are skipped.
    pub fn new(network: &[&str], transport: &[&str]) -> Self {
        crate::runtime::logging::initialize();

        let mut network_protocols: HashMap<NetworkProtocolNumber, Arc<dyn NetworkProtocol>> = HashMap::new();
        for name in network {
            match registry::network_protocol_factory(name) {
                Some(factory) => {
                    let p: Arc<dyn NetworkProtocol> = factory();
                    network_protocols.insert(p.number(), p);
                },
                None => warn!("new: network protocol {} is not registered", name),
            }
        }

        let mut transport_protocols: HashMap<TransportProtocolNumber, Arc<dyn TransportProtocol>> = HashMap::new();
        for name in transport {
            match registry::transport_protocol_factory(name) {
                Some(factory) => {
                    let p: Arc<dyn TransportProtocol> = factory();
                    transport_protocols.insert(p.number(), p);
                },
                None => warn!("new: transport protocol {} is not registered", name),
            }
        }

        let net_numbers: Vec<NetworkProtocolNumber> = network_protocols.keys().copied().collect();
        let trans_numbers: Vec<TransportProtocolNumber> = transport_protocols.keys().copied().collect();

        Self {
            inner: Arc::new(StackInner {
                network_protocols,
                transport_protocols,
                demux: TransportDemuxer::new(&net_numbers, &trans_numbers),
                port_manager: PortManager::new(),
                state: RwLock::new(StackState {
                    nics: HashMap::new(),
                    route_table: Vec::new(),
                }),
            }),
        }
    }

    /// Creates a NIC with the given id, backed by the registered link
    /// endpoint.
    pub fn create_nic(&self, id: NicId, link_ep_id: LinkEndpointId) -> Result<(), Fail> {
        let link_ep: Arc<dyn LinkEndpoint> = registry::find_link_endpoint(link_ep_id).ok_or(Fail::BadLinkEndpoint)?;

        let net_numbers: Vec<NetworkProtocolNumber> = self.inner.network_protocols.keys().copied().collect();
        let trans_numbers: Vec<TransportProtocolNumber> = self.inner.transport_protocols.keys().copied().collect();

        let mut state = self.inner.state.write().unwrap();
        if state.nics.contains_key(&id) {
            return Err(Fail::DuplicateNicId);
        }

        let nic: Arc<Nic> = Nic::new(
            Arc::downgrade(&self.inner),
            id,
            link_ep,
            TransportDemuxer::new(&net_numbers, &trans_numbers),
        );
        nic.attach_link_endpoint();
        state.nics.insert(id, nic);
        Ok(())
    }

    /// Adds an address to the given NIC under the given network protocol.
    pub fn add_address(&self, nic_id: NicId, protocol: NetworkProtocolNumber, addr: &Address) -> Result<(), Fail> {
        let nic: Arc<Nic> = self.nic(nic_id)?;
        nic.add_address(protocol, addr)
    }

    /// Replaces the routing table.
    pub fn set_route_table(&self, table: Vec<RouteEntry>) {
        self.inner.state.write().unwrap().route_table = table;
    }

    /// Creates a new transport endpoint of the given protocol pair.
    pub fn new_endpoint(
        &self,
        trans_proto: TransportProtocolNumber,
        net_proto: NetworkProtocolNumber,
        waiter_queue: WaiterQueue,
    ) -> Result<Arc<dyn Endpoint>, Fail> {
        let protocol: Arc<dyn TransportProtocol> = self
            .inner
            .transport_protocols
            .get(&trans_proto)
            .cloned()
            .ok_or(Fail::UnknownProtocol)?;
        protocol.new_endpoint(self, net_proto, waiter_queue)
    }

    /// Finds a route to the given destination: the first routing table
    /// entry whose NIC matches (or whose NIC is unconstrained) and whose
    /// masked destination matches `remote`. The route's local address is
    /// drawn from the chosen NIC's endpoint; the next hop is the entry's
    /// gateway.
    pub fn find_route(
        &self,
        nic_id: NicId,
        local: &Address,
        remote: &Address,
        net_proto: NetworkProtocolNumber,
    ) -> Result<Route, Fail> {
        let state = self.inner.state.read().unwrap();
        for entry in &state.route_table {
            if (nic_id != 0 && entry.nic != 0 && entry.nic != nic_id) || !entry.matches(remote) {
                continue;
            }

            let chosen: NicId = if entry.nic != 0 { entry.nic } else { nic_id };
            let nic: &Arc<Nic> = match state.nics.get(&chosen) {
                Some(nic) => nic,
                None => continue,
            };

            let ep: Option<Arc<dyn NetworkEndpoint>> = if local.is_empty() {
                nic.primary_endpoint()
            } else {
                nic.find_endpoint(local)
            };
            let ep: Arc<dyn NetworkEndpoint> = match ep {
                Some(ep) => ep,
                None => continue,
            };

            let mut route: Route = Route::new(net_proto, ep.id().0, remote.clone(), ep);
            route.next_hop = entry.gateway.clone();
            return Ok(route);
        }

        Err(Fail::NoRoute)
    }

    /// Registers a transport endpoint: in the per-NIC demultiplexer when a
    /// NIC is named, in the stack-wide one otherwise.
    pub fn register_transport_endpoint(
        &self,
        nic_id: NicId,
        net_protos: &[NetworkProtocolNumber],
        trans_proto: TransportProtocolNumber,
        id: &TransportEndpointId,
        ep: Arc<dyn TransportEndpoint>,
    ) -> Result<(), Fail> {
        if nic_id == 0 {
            return self.inner.demux.register_endpoint(net_protos, trans_proto, id, ep);
        }
        let nic: Arc<Nic> = self.nic(nic_id)?;
        nic.demux().register_endpoint(net_protos, trans_proto, id, ep)
    }

    /// Removes a transport endpoint from the demultiplexer it was
    /// registered in.
    pub fn unregister_transport_endpoint(
        &self,
        nic_id: NicId,
        net_protos: &[NetworkProtocolNumber],
        trans_proto: TransportProtocolNumber,
        id: &TransportEndpointId,
    ) {
        if nic_id == 0 {
            self.inner.demux.unregister_endpoint(net_protos, trans_proto, id);
            return;
        }
        if let Ok(nic) = self.nic(nic_id) {
            nic.demux().unregister_endpoint(net_protos, trans_proto, id);
        }
    }

    pub(crate) fn port_manager(&self) -> &PortManager {
        &self.inner.port_manager
    }

    fn nic(&self, id: NicId) -> Result<Arc<Nic>, Fail> {
        self.inner.state.read().unwrap().nics.get(&id).cloned().ok_or(Fail::UnknownNicId)
    }
}
