// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        route::Route,
        types::{
            Address,
            NetworkProtocolNumber,
            TransportEndpoint,
            TransportEndpointId,
            TransportProtocolNumber,
        },
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
    },
};

//==============================================================================
// Structures
//==============================================================================

#[derive(Clone, Eq, Hash, PartialEq)]
struct ProtocolIds {
    network: NetworkProtocolNumber,
    transport: TransportProtocolNumber,
}

/// The endpoints of one `(network, transport)` protocol pair. Each pair has
/// its own lock so protocols do not interfere with each other.
struct TransportEndpoints {
    endpoints: RwLock<HashMap<TransportEndpointId, Arc<dyn TransportEndpoint>>>,
}

/// Demultiplexes packets targeted at transport endpoints, after the network
/// layer has parsed them. Two levels: first the `(network, transport)`
/// protocol pair, then the endpoint id.
pub struct TransportDemuxer {
    protocol: HashMap<ProtocolIds, TransportEndpoints>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl TransportDemuxer {
    /// Creates a demultiplexer with one endpoint table per protocol pair.
    pub fn new(net_protos: &[NetworkProtocolNumber], trans_protos: &[TransportProtocolNumber]) -> Self {
        let mut protocol: HashMap<ProtocolIds, TransportEndpoints> = HashMap::new();
        for network in net_protos {
            for transport in trans_protos {
                protocol.insert(
                    ProtocolIds {
                        network: *network,
                        transport: *transport,
                    },
                    TransportEndpoints {
                        endpoints: RwLock::new(HashMap::new()),
                    },
                );
            }
        }
        Self { protocol }
    }

    /// Registers the endpoint under every requested network protocol so
    /// that packets matching `id` are delivered to it. Rolls back the
    /// partial registrations if any single one collides.
    pub fn register_endpoint(
        &self,
        net_protos: &[NetworkProtocolNumber],
        protocol: TransportProtocolNumber,
        id: &TransportEndpointId,
        ep: Arc<dyn TransportEndpoint>,
    ) -> Result<(), Fail> {
        for (i, network) in net_protos.iter().enumerate() {
            if let Err(e) = self.single_register_endpoint(*network, protocol, id, ep.clone()) {
                self.unregister_endpoint(&net_protos[..i], protocol, id);
                return Err(e);
            }
        }
        Ok(())
    }

    fn single_register_endpoint(
        &self,
        network: NetworkProtocolNumber,
        protocol: TransportProtocolNumber,
        id: &TransportEndpointId,
        ep: Arc<dyn TransportEndpoint>,
    ) -> Result<(), Fail> {
        let eps: &TransportEndpoints = match self.protocol.get(&ProtocolIds {
            network,
            transport: protocol,
        }) {
            Some(eps) => eps,
            None => {
                debug!("single_register_endpoint: no table for protocol pair");
                return Ok(());
            },
        };

        let mut endpoints = eps.endpoints.write().unwrap();
        if endpoints.contains_key(id) {
            return Err(Fail::PortInUse);
        }
        endpoints.insert(id.clone(), ep);
        Ok(())
    }

    /// Removes the endpoint with the given id so it receives no more
    /// packets.
    pub fn unregister_endpoint(
        &self,
        net_protos: &[NetworkProtocolNumber],
        protocol: TransportProtocolNumber,
        id: &TransportEndpointId,
    ) {
        for network in net_protos {
            if let Some(eps) = self.protocol.get(&ProtocolIds {
                network: *network,
                transport: protocol,
            }) {
                eps.endpoints.write().unwrap().remove(id);
            }
        }
    }

    /// Attempts to deliver the packet. Returns true if an endpoint was
    /// found.
    pub fn deliver_packet(
        &self,
        route: &Route,
        protocol: TransportProtocolNumber,
        vv: VectorisedView,
        id: &TransportEndpointId,
    ) -> bool {
        let eps: &TransportEndpoints = match self.protocol.get(&ProtocolIds {
            network: route.net_proto,
            transport: protocol,
        }) {
            Some(eps) => eps,
            None => return false,
        };

        let ep: Arc<dyn TransportEndpoint> = {
            let endpoints = eps.endpoints.read().unwrap();
            match Self::find_endpoint_locked(&endpoints, id) {
                Some(ep) => ep,
                None => return false,
            }
        };

        ep.handle_packet(route, id, vv);
        true
    }

    /// Looks up the endpoint for an id: the full four-tuple first, then the
    /// local-address listener binding, then the wildcard binding.
    fn find_endpoint_locked(
        endpoints: &HashMap<TransportEndpointId, Arc<dyn TransportEndpoint>>,
        id: &TransportEndpointId,
    ) -> Option<Arc<dyn TransportEndpoint>> {
        if let Some(ep) = endpoints.get(id) {
            return Some(ep.clone());
        }

        let mut bound: TransportEndpointId = TransportEndpointId {
            local_port: id.local_port,
            local_address: id.local_address.clone(),
            remote_port: 0,
            remote_address: Address::empty(),
        };
        if let Some(ep) = endpoints.get(&bound) {
            return Some(ep.clone());
        }

        bound.local_address = Address::empty();
        endpoints.get(&bound).cloned()
    }
}
