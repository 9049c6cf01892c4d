// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The IPv4 network protocol. To take part in a stack this module must be
//! registered by calling [`register`] before `Stack::new`, and activated by
//! passing `"ipv4"` as one of the network protocol names.

pub mod datagram;

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        protocols::icmpv4::{
            self,
            EchoRequest,
            Icmpv4Header,
        },
        registry,
        route::Route,
        types::{
            Address,
            LinkEndpoint,
            NetworkEndpoint,
            NetworkEndpointId,
            NetworkProtocol,
            NetworkProtocolNumber,
            NicId,
            TransportDispatcher,
            TransportProtocolNumber,
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
use self::datagram::{
    Ipv4Fields,
    Ipv4Header,
    IPV4_ADDRESS_SIZE,
    IPV4_MINIMUM_SIZE,
};
use ::crossbeam_channel;
use ::rand::Rng;
use ::std::{
    sync::Arc,
    thread,
};

//==============================================================================
// Constants
//==============================================================================

/// The string representation of the IPv4 protocol name.
pub const PROTOCOL_NAME: &str = "ipv4";

/// The IPv4 network protocol number.
pub const PROTOCOL_NUMBER: NetworkProtocolNumber = NetworkProtocolNumber(0x0800);

/// Time-to-live written on every emitted packet.
const DEFAULT_TTL: u8 = 64;

/// Capacity of the inbound echo-request queue.
const ECHO_QUEUE_SIZE: usize = 10;

//==============================================================================
// Structures
//==============================================================================

pub struct Ipv4Protocol;

/// A per-address IPv4 endpoint, owned by its NIC and identified by its
/// local address.
pub struct Ipv4Endpoint {
    nic_id: NicId,
    address: Address,
    link_ep: Arc<dyn LinkEndpoint>,
    dispatcher: Arc<dyn TransportDispatcher>,
    echo_tx: crossbeam_channel::Sender<EchoRequest>,
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Registers the IPv4 protocol factory with the process-wide registry.
pub fn register() {
    registry::register_network_protocol_factory(PROTOCOL_NAME, new_protocol);
}

fn new_protocol() -> Arc<dyn NetworkProtocol> {
    Arc::new(Ipv4Protocol)
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Ipv4Endpoint {
    fn handle_icmp(&self, route: &Route, vv: VectorisedView) {
        if vv.size() < icmpv4::ICMPV4_MINIMUM_SIZE {
            debug!("handle_icmp: message too short, dropping");
            return;
        }

        let typ: u8 = Icmpv4Header(vv.first().as_slice()).typ();
        match typ {
            icmpv4::ICMPV4_ECHO => {
                let req: EchoRequest = EchoRequest {
                    route: route.clone(),
                    view: vv.to_view(),
                };
                // Drop the request if the replier is backed up.
                let _ = self.echo_tx.try_send(req);
            },
            icmpv4::ICMPV4_ECHO_REPLY => {
                debug!("handle_icmp: echo reply with no one waiting, dropping");
            },
            typ => {
                debug!("handle_icmp: unsupported type {}, dropping", typ);
            },
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl NetworkProtocol for Ipv4Protocol {
    fn number(&self) -> NetworkProtocolNumber {
        PROTOCOL_NUMBER
    }

    fn minimum_packet_size(&self) -> usize {
        IPV4_MINIMUM_SIZE
    }

    fn parse_addresses(&self, v: &[u8]) -> (Address, Address) {
        let h: Ipv4Header<&[u8]> = Ipv4Header(v);
        (h.source_address(), h.destination_address())
    }

    fn new_endpoint(
        &self,
        nic_id: NicId,
        addr: &Address,
        link_ep: Arc<dyn LinkEndpoint>,
        dispatcher: Arc<dyn TransportDispatcher>,
    ) -> Result<Arc<dyn NetworkEndpoint>, Fail> {
        if addr.len() != IPV4_ADDRESS_SIZE {
            return Err(Fail::BadLocalAddress);
        }

        let (echo_tx, echo_rx) = crossbeam_channel::bounded::<EchoRequest>(ECHO_QUEUE_SIZE);
        thread::spawn(move || icmpv4::echo_replier(echo_rx));

        Ok(Arc::new(Ipv4Endpoint {
            nic_id,
            address: addr.clone(),
            link_ep,
            dispatcher,
            echo_tx,
        }))
    }
}

impl NetworkEndpoint for Ipv4Endpoint {
    fn nic_id(&self) -> NicId {
        self.nic_id
    }

    fn id(&self) -> NetworkEndpointId {
        NetworkEndpointId(self.address.clone())
    }

    fn mtu(&self) -> u32 {
        self.link_ep.mtu() - IPV4_MINIMUM_SIZE as u32
    }

    fn max_header_length(&self) -> usize {
        self.link_ep.max_header_length() as usize + IPV4_MINIMUM_SIZE
    }

    fn write_packet(
        &self,
        route: &Route,
        mut hdr: Prependable,
        payload: Option<View>,
        protocol: TransportProtocolNumber,
    ) -> Result<(), Fail> {
        let payload_len: usize = payload.as_ref().map(|p| p.len()).unwrap_or(0);
        let total_length: u16 = (IPV4_MINIMUM_SIZE + hdr.used_length() + payload_len) as u16;

        let buf: &mut [u8] = hdr
            .prepend(IPV4_MINIMUM_SIZE)
            .expect("reserved headroom does not fit the ipv4 header");
        let mut h: Ipv4Header<&mut [u8]> = Ipv4Header(buf);
        h.encode(&Ipv4Fields {
            ihl: IPV4_MINIMUM_SIZE as u8,
            tos: 0,
            total_length,
            id: ::rand::thread_rng().gen(),
            flags: 0,
            fragment_offset: 0,
            ttl: DEFAULT_TTL,
            protocol: protocol.0,
            checksum: 0,
            src_addr: route.local_address.clone(),
            dst_addr: route.remote_address.clone(),
        });
        let sum: u16 = h.calculate_checksum();
        h.set_checksum(!sum);

        self.link_ep.write_packet(route, &hdr, payload.as_ref(), PROTOCOL_NUMBER)
    }

    fn handle_packet(&self, route: &Route, mut vv: VectorisedView) {
        let (hlen, tlen, protocol): (usize, usize, u8) = {
            let first: &View = vv.first();
            let h: Ipv4Header<&[u8]> = Ipv4Header(first.as_slice());
            if !h.is_valid(vv.size()) {
                debug!("handle_packet: invalid header, dropping");
                return;
            }
            (h.header_length(), h.total_length() as usize, h.protocol())
        };

        vv.cap_length(tlen);
        vv.trim_front(hlen);

        if TransportProtocolNumber(protocol) == icmpv4::PROTOCOL_NUMBER {
            self.handle_icmp(route, vv);
        } else {
            self.dispatcher
                .deliver_transport_packet(route, TransportProtocolNumber(protocol), vv);
        }
    }
}
