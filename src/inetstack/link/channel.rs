// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A link endpoint that stores outbound packets in a channel and allows
//! injection of inbound packets. This is the loopback used by tests and by
//! embedders that pump frames themselves.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        registry,
        route::Route,
        types::{
            LinkAddress,
            LinkEndpoint,
            LinkEndpointId,
            NetworkDispatcher,
            NetworkProtocolNumber,
        },
    },
    runtime::{
        fail::Fail,
        memory::{
            Prependable,
            VectorisedView,
            View,
        },
    },
};
use ::crossbeam_channel;
use ::std::sync::{
    Arc,
    RwLock,
};

//==============================================================================
// Structures
//==============================================================================

/// All the information about one outbound packet.
pub struct PacketInfo {
    pub header: View,
    pub payload: Option<View>,
    pub protocol: NetworkProtocolNumber,
}

/// The channel-backed link endpoint.
pub struct ChannelEndpoint {
    mtu: u32,
    dispatcher: RwLock<Option<Arc<dyn NetworkDispatcher>>>,
    tx: crossbeam_channel::Sender<PacketInfo>,
}

//==============================================================================
// Associated Functions
//==============================================================================

/// Creates a new channel endpoint, registers it, and returns its id, the
/// endpoint itself, and the consuming half of the outbound queue.
pub fn new(
    size: usize,
    mtu: u32,
) -> (LinkEndpointId, Arc<ChannelEndpoint>, crossbeam_channel::Receiver<PacketInfo>) {
    let (tx, rx) = crossbeam_channel::bounded::<PacketInfo>(size);
    let ep: Arc<ChannelEndpoint> = Arc::new(ChannelEndpoint {
        mtu,
        dispatcher: RwLock::new(None),
        tx,
    });
    let id: LinkEndpointId = registry::register_link_endpoint(ep.clone());
    (id, ep, rx)
}

impl ChannelEndpoint {
    /// Injects an inbound packet.
    pub fn inject(&self, protocol: NetworkProtocolNumber, vv: VectorisedView) {
        let dispatcher: Option<Arc<dyn NetworkDispatcher>> = self.dispatcher.read().unwrap().clone();
        if let Some(dispatcher) = dispatcher {
            dispatcher.deliver_network_packet(LinkAddress::empty(), protocol, vv);
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl LinkEndpoint for ChannelEndpoint {
    fn mtu(&self) -> u32 {
        self.mtu
    }

    /// The channel has no link-level header.
    fn max_header_length(&self) -> u16 {
        0
    }

    fn link_address(&self) -> LinkAddress {
        LinkAddress::empty()
    }

    fn attach(&self, dispatcher: Arc<dyn NetworkDispatcher>) {
        *self.dispatcher.write().unwrap() = Some(dispatcher);
    }

    fn write_packet(
        &self,
        _route: &Route,
        hdr: &Prependable,
        payload: Option<&View>,
        protocol: NetworkProtocolNumber,
    ) -> Result<(), Fail> {
        let p: PacketInfo = PacketInfo {
            header: View::from(hdr.used_bytes().to_vec()),
            payload: payload.cloned(),
            protocol,
        };
        let _ = self.tx.send(p);
        Ok(())
    }
}
