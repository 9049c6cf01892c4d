// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        protocols::{
            checksum,
            udp::datagram::{
                UdpFields,
                UdpHeader,
                UDP_MINIMUM_SIZE,
            },
            udp::PROTOCOL_NUMBER,
        },
        route::Route,
        types::{
            Address,
            Endpoint,
            FullAddress,
            NetworkProtocolNumber,
            NicId,
            ShutdownFlags,
            SockOpt,
            SockOptName,
            TransportEndpoint,
            TransportEndpointId,
            SHUTDOWN_READ,
        },
        Stack,
    },
    runtime::{
        fail::Fail,
        memory::{
            Prependable,
            VectorisedView,
            View,
        },
        waiter::{
            WaiterQueue,
            EVENT_IN,
        },
    },
};
use ::std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        Weak,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Default cap on buffered inbound datagrams, in payload bytes.
const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

//==============================================================================
// Structures
//==============================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum UdpState {
    Initial,
    Bound,
    Closed,
}

/// One buffered inbound datagram.
struct UdpPacket {
    sender_address: FullAddress,
    data: VectorisedView,
}

struct Core {
    state: UdpState,
    id: TransportEndpointId,
    bind_nic: NicId,
    bind_addr: Address,
    effective_net_protos: Vec<NetworkProtocolNumber>,
}

struct Rcv {
    ready: bool,
    closed: bool,
    list: VecDeque<UdpPacket>,
    buf_size: usize,
    buf_size_max: usize,
}

/// A UDP endpoint. User threads and the stack's receive path call in
/// concurrently; the two halves are synchronized independently.
pub struct UdpEndpoint {
    stack: Stack,
    net_proto: NetworkProtocolNumber,
    waiter_queue: WaiterQueue,
    me: Weak<UdpEndpoint>,
    core: Mutex<Core>,
    rcv: Mutex<Rcv>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl UdpEndpoint {
    pub fn new(stack: Stack, net_proto: NetworkProtocolNumber, waiter_queue: WaiterQueue) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            stack,
            net_proto,
            waiter_queue,
            me: me.clone(),
            core: Mutex::new(Core {
                state: UdpState::Initial,
                id: TransportEndpointId::default(),
                bind_nic: 0,
                bind_addr: Address::empty(),
                effective_net_protos: Vec::new(),
            }),
            rcv: Mutex::new(Rcv {
                ready: false,
                closed: false,
                list: VecDeque::new(),
                buf_size: 0,
                buf_size_max: DEFAULT_RECEIVE_BUFFER_SIZE,
            }),
        })
    }

    fn bind_locked(&self, core: &mut Core, addr: FullAddress) -> Result<(), Fail> {
        // Binding is only allowed from the initial state.
        if core.state != UdpState::Initial {
            return Err(Fail::InvalidEndpointState);
        }

        let net_protos: Vec<NetworkProtocolNumber> = vec![self.net_proto];
        let port: u16 = self
            .stack
            .port_manager()
            .reserve_port(&net_protos, PROTOCOL_NUMBER, &addr.addr, addr.port)?;

        let id: TransportEndpointId = TransportEndpointId {
            local_port: port,
            local_address: addr.addr.clone(),
            remote_port: 0,
            remote_address: Address::empty(),
        };

        let ep: Arc<UdpEndpoint> = self.me.upgrade().expect("endpoint vanished while binding");
        if let Err(e) = self
            .stack
            .register_transport_endpoint(addr.nic, &net_protos, PROTOCOL_NUMBER, &id, ep)
        {
            self.stack.port_manager().release_port(&net_protos, PROTOCOL_NUMBER, &addr.addr, port);
            return Err(e);
        }

        core.id = id;
        core.bind_nic = addr.nic;
        core.bind_addr = addr.addr;
        core.effective_net_protos = net_protos;
        core.state = UdpState::Bound;

        self.rcv.lock().unwrap().ready = true;
        Ok(())
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Sends one UDP datagram via the provided route under the provided
/// identity.
fn send_udp(route: &Route, data: View, local_port: u16, remote_port: u16) -> Result<(), Fail> {
    let mut hdr: Prependable = Prependable::new(UDP_MINIMUM_SIZE + route.max_header_length());

    let length: u16 = (UDP_MINIMUM_SIZE + data.len()) as u16;
    let mut xsum: u16 = route.pseudo_header_checksum(PROTOCOL_NUMBER);
    xsum = checksum::checksum(data.as_slice(), xsum);

    let buf: &mut [u8] = hdr
        .prepend(UDP_MINIMUM_SIZE)
        .expect("reserved headroom does not fit the udp header");
    let mut udp: UdpHeader<&mut [u8]> = UdpHeader(buf);
    udp.encode(&UdpFields {
        src_port: local_port,
        dst_port: remote_port,
        length,
        checksum: 0,
    });
    let sum: u16 = udp.calculate_checksum(xsum, length);
    udp.set_checksum(!sum);

    route.write_packet(hdr, Some(data), PROTOCOL_NUMBER)
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Endpoint for UdpEndpoint {
    /// Binds the endpoint to a local address and port, reserving the port
    /// and registering for delivery.
    fn bind(&self, addr: FullAddress) -> Result<(), Fail> {
        let mut core = self.core.lock().unwrap();
        self.bind_locked(&mut core, addr)
    }

    fn listen(&self, _backlog: usize) -> Result<(), Fail> {
        Err(Fail::NotSupported)
    }

    fn accept(&self) -> Result<(Arc<dyn Endpoint>, WaiterQueue), Fail> {
        Err(Fail::NotSupported)
    }

    fn connect(&self, _addr: FullAddress) -> Result<(), Fail> {
        Err(Fail::NotSupported)
    }

    /// Returns the next buffered datagram as one contiguous view, never
    /// split or joined.
    fn read(&self, from: Option<&mut FullAddress>) -> Result<View, Fail> {
        let mut rcv = self.rcv.lock().unwrap();

        let pkt: UdpPacket = match rcv.list.pop_front() {
            Some(pkt) => pkt,
            None => {
                if rcv.closed {
                    return Err(Fail::ClosedForReceive);
                }
                return Err(Fail::WouldBlock);
            },
        };
        rcv.buf_size -= pkt.data.size();
        drop(rcv);

        if let Some(from) = from {
            *from = pkt.sender_address;
        }
        Ok(pkt.data.to_view())
    }

    /// Sends one datagram to `to`. The endpoint is bound to an ephemeral
    /// port on first use if the user never bound it.
    fn write(&self, v: View, to: Option<&FullAddress>) -> Result<usize, Fail> {
        let to: &FullAddress = to.ok_or(Fail::DestinationRequired)?;

        let mut core = self.core.lock().unwrap();
        match core.state {
            UdpState::Initial => self.bind_locked(&mut core, FullAddress::default())?,
            UdpState::Bound => (),
            UdpState::Closed => return Err(Fail::InvalidEndpointState),
        }

        let route: Route = self
            .stack
            .find_route(to.nic, &core.bind_addr, &to.addr, self.net_proto)?;

        let len: usize = v.len();
        send_udp(&route, v, core.id.local_port, to.port)?;
        Ok(len)
    }

    fn shutdown(&self, flags: ShutdownFlags) -> Result<(), Fail> {
        let core = self.core.lock().unwrap();
        if core.state != UdpState::Bound {
            return Err(Fail::NotConnected);
        }
        drop(core);

        if flags & SHUTDOWN_READ != 0 {
            let mut rcv = self.rcv.lock().unwrap();
            rcv.closed = true;
            drop(rcv);
            self.waiter_queue.notify(EVENT_IN);
        }
        Ok(())
    }

    fn close(&self) {
        let mut core = self.core.lock().unwrap();
        if core.state == UdpState::Bound {
            self.stack.unregister_transport_endpoint(
                core.bind_nic,
                &core.effective_net_protos,
                PROTOCOL_NUMBER,
                &core.id,
            );
            self.stack.port_manager().release_port(
                &core.effective_net_protos,
                PROTOCOL_NUMBER,
                &core.bind_addr,
                core.id.local_port,
            );
        }
        core.state = UdpState::Closed;
        drop(core);

        let mut rcv = self.rcv.lock().unwrap();
        rcv.closed = true;
        rcv.list.clear();
        rcv.buf_size = 0;
        drop(rcv);

        self.waiter_queue.notify(EVENT_IN);
    }

    fn set_sock_opt(&self, opt: SockOpt) -> Result<(), Fail> {
        match opt {
            SockOpt::ReceiveBufferSize(n) => {
                self.rcv.lock().unwrap().buf_size_max = n;
                Ok(())
            },
            _ => Err(Fail::UnknownProtocolOption),
        }
    }

    fn get_sock_opt(&self, opt: SockOptName) -> Result<SockOpt, Fail> {
        match opt {
            SockOptName::Error => Ok(SockOpt::Error(None)),
            SockOptName::ReceiveBufferSize => Ok(SockOpt::ReceiveBufferSize(self.rcv.lock().unwrap().buf_size_max)),
            _ => Err(Fail::UnknownProtocolOption),
        }
    }
}

impl TransportEndpoint for UdpEndpoint {
    /// Validates the length field, trims the header, and queues the
    /// datagram unless the receive buffer is full.
    fn handle_packet(&self, route: &Route, id: &TransportEndpointId, mut vv: VectorisedView) {
        let (src_port, length): (u16, u16) = {
            let hdr: UdpHeader<&[u8]> = UdpHeader(vv.first().as_slice());
            (hdr.source_port(), hdr.length())
        };
        if length as usize > vv.size() {
            debug!("handle_packet: malformed datagram, dropping");
            return;
        }

        vv.trim_front(UDP_MINIMUM_SIZE);

        let mut rcv = self.rcv.lock().unwrap();
        if !rcv.ready || rcv.closed || rcv.buf_size >= rcv.buf_size_max {
            debug!("handle_packet: receive buffer full, dropping");
            return;
        }

        let was_empty: bool = rcv.buf_size == 0;
        rcv.buf_size += vv.size();
        rcv.list.push_back(UdpPacket {
            sender_address: FullAddress {
                nic: route.nic_id(),
                addr: id.remote_address.clone(),
                port: src_port,
            },
            data: vv,
        });
        drop(rcv);

        if was_empty {
            self.waiter_queue.notify(EVENT_IN);
        }
    }
}
