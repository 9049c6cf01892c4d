// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Shared helpers for stack-level tests: a channel-link test context that
//! can drive handshakes, and parsers for asserting on emitted packets.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        link::channel::{
            self,
            ChannelEndpoint,
            PacketInfo,
        },
        protocols::{
            checksum,
            ipv4::{
                self,
                datagram::{
                    Ipv4Fields,
                    Ipv4Header,
                    IPV4_MINIMUM_SIZE,
                },
            },
            tcp::{
                self,
                segment::{
                    parse_syn_options,
                    TcpFields,
                    TcpHeader,
                    TcpSynOptions,
                    FLAG_ACK,
                    FLAG_SYN,
                    TCP_MINIMUM_SIZE,
                },
                SeqNumber,
            },
            udp::{
                self,
                datagram::{
                    UdpFields,
                    UdpHeader,
                    UDP_MINIMUM_SIZE,
                },
            },
        },
        route::RouteEntry,
        types::{
            Address,
            Endpoint,
            FullAddress,
            SockOpt,
            SockOptName,
        },
        Stack,
    },
    runtime::{
        fail::Fail,
        memory::{
            VectorisedView,
            View,
        },
        waiter::{
            self,
            WaiterQueue,
            EVENT_OUT,
        },
    },
};
use ::anyhow::{
    bail,
    Result,
};
use ::crossbeam_channel;
use ::std::{
    sync::Arc,
    time::Duration,
};

//==============================================================================
// Constants
//==============================================================================

/// The MTU used throughout the tests, matching loopback interfaces.
pub const DEFAULT_MTU: u32 = 65535;

pub const STACK_ADDR: [u8; 4] = [10, 0, 0, 1];
pub const TEST_ADDR: [u8; 4] = [10, 0, 0, 2];
pub const TEST_PORT: u16 = 4096;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

//==============================================================================
// Structures
//==============================================================================

/// The TCP header fields of an injected packet.
pub struct Headers {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
    pub seq_num: u32,
    pub ack_num: u32,
    pub rcv_wnd: u16,
}

/// A parsed outbound TCP packet.
#[derive(Debug)]
pub struct TcpPacket {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    pub flags: u8,
    pub window: u16,
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

/// A parsed outbound UDP packet.
#[derive(Debug)]
pub struct UdpPacket {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// A stack wired to a channel link endpoint, so tests can inject inbound
/// packets and observe everything the stack emits.
pub struct TestContext {
    pub stack: Stack,
    pub link: Arc<ChannelEndpoint>,
    pub link_rx: crossbeam_channel::Receiver<PacketInfo>,
    pub wq: WaiterQueue,
    pub ep: Option<Arc<dyn Endpoint>>,
    /// The stack endpoint's local port, learned from its SYN.
    pub port: u16,
    /// The stack endpoint's initial sequence number, learned from its SYN.
    pub iss: u32,
    /// The options carried on the stack's SYN.
    pub syn_options: TcpSynOptions,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl TestContext {
    pub fn new(mtu: u32) -> Result<Self> {
        ipv4::register();
        tcp::register();
        udp::register();

        let stack: Stack = Stack::new(&["ipv4"], &["tcp", "udp"]);
        let (link_id, link, link_rx) = channel::new(256, mtu);

        if let Err(e) = stack.create_nic(1, link_id) {
            bail!("create_nic failed: {:?}", e);
        }
        if let Err(e) = stack.add_address(1, ipv4::PROTOCOL_NUMBER, &Address::v4(STACK_ADDR)) {
            bail!("add_address failed: {:?}", e);
        }
        stack.set_route_table(vec![RouteEntry {
            destination: Address::v4([0, 0, 0, 0]),
            mask: Address::v4([0, 0, 0, 0]),
            gateway: Address::empty(),
            nic: 1,
        }]);

        Ok(Self {
            stack,
            link,
            link_rx,
            wq: WaiterQueue::new(),
            ep: None,
            port: 0,
            iss: 0,
            syn_options: TcpSynOptions::default(),
        })
    }

    pub fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.ep.as_ref().expect("no endpoint created").clone()
    }

    /// Creates a TCP endpoint and its waiter queue.
    pub fn create_endpoint(&mut self) -> Result<()> {
        let wq: WaiterQueue = WaiterQueue::new();
        let ep: Arc<dyn Endpoint> = match self
            .stack
            .new_endpoint(tcp::PROTOCOL_NUMBER, ipv4::PROTOCOL_NUMBER, wq.clone())
        {
            Ok(ep) => ep,
            Err(e) => bail!("new_endpoint failed: {:?}", e),
        };
        self.wq = wq;
        self.ep = Some(ep);
        Ok(())
    }

    /// Reads the next packet the stack emitted, as one contiguous buffer.
    pub fn get_packet(&self) -> Result<Vec<u8>> {
        self.get_packet_within(RECV_TIMEOUT)
    }

    pub fn get_packet_within(&self, timeout: Duration) -> Result<Vec<u8>> {
        match self.link_rx.recv_timeout(timeout) {
            Ok(p) => {
                let mut bytes: Vec<u8> = p.header.to_vec();
                if let Some(payload) = p.payload {
                    bytes.extend_from_slice(payload.as_slice());
                }
                Ok(bytes)
            },
            Err(_) => bail!("timed out waiting for a packet"),
        }
    }

    pub fn no_packet_within(&self, timeout: Duration) -> bool {
        self.link_rx.recv_timeout(timeout).is_err()
    }

    /// Injects a TCP packet from the test peer.
    pub fn send_packet(&self, payload: &[u8], h: &Headers) {
        let tcp_len: usize = TCP_MINIMUM_SIZE + payload.len();

        let mut tcp: Vec<u8> = vec![0u8; TCP_MINIMUM_SIZE];
        TcpHeader(&mut tcp[..]).encode(&TcpFields {
            src_port: h.src_port,
            dst_port: h.dst_port,
            seq_num: SeqNumber::from(h.seq_num),
            ack_num: SeqNumber::from(h.ack_num),
            data_offset: TCP_MINIMUM_SIZE as u8,
            flags: h.flags,
            window_size: h.rcv_wnd,
        });
        let mut xsum: u16 = checksum::pseudo_header_checksum(
            tcp::PROTOCOL_NUMBER,
            &Address::v4(TEST_ADDR),
            &Address::v4(STACK_ADDR),
        );
        xsum = checksum::combine(xsum, tcp_len as u16);
        xsum = checksum::checksum(payload, xsum);
        let sum: u16 = TcpHeader(&tcp[..]).calculate_checksum(xsum);
        TcpHeader(&mut tcp[..]).set_checksum(!sum);

        tcp.extend_from_slice(payload);
        self.inject_ipv4(&tcp, tcp::PROTOCOL_NUMBER.0);
    }

    /// Injects a UDP datagram from the test peer.
    pub fn send_udp_packet(&self, payload: &[u8], src_port: u16, dst_port: u16) {
        let length: u16 = (UDP_MINIMUM_SIZE + payload.len()) as u16;

        let mut udp_bytes: Vec<u8> = vec![0u8; UDP_MINIMUM_SIZE];
        UdpHeader(&mut udp_bytes[..]).encode(&UdpFields {
            src_port,
            dst_port,
            length,
            checksum: 0,
        });
        let mut xsum: u16 = checksum::pseudo_header_checksum(
            udp::PROTOCOL_NUMBER,
            &Address::v4(TEST_ADDR),
            &Address::v4(STACK_ADDR),
        );
        xsum = checksum::checksum(payload, xsum);
        let sum: u16 = UdpHeader(&udp_bytes[..]).calculate_checksum(xsum, length);
        UdpHeader(&mut udp_bytes[..]).set_checksum(!sum);

        udp_bytes.extend_from_slice(payload);
        self.inject_ipv4(&udp_bytes, udp::PROTOCOL_NUMBER.0);
    }

    /// Injects a raw IPv4 payload (e.g. an ICMP message) from the test
    /// peer.
    pub fn inject_ipv4(&self, payload: &[u8], protocol: u8) {
        let total_length: u16 = (IPV4_MINIMUM_SIZE + payload.len()) as u16;
        let mut ip: Vec<u8> = vec![0u8; IPV4_MINIMUM_SIZE];
        let mut h: Ipv4Header<&mut [u8]> = Ipv4Header(&mut ip[..]);
        h.encode(&Ipv4Fields {
            ihl: IPV4_MINIMUM_SIZE as u8,
            tos: 0,
            total_length,
            id: 1,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol,
            checksum: 0,
            src_addr: Address::v4(TEST_ADDR),
            dst_addr: Address::v4(STACK_ADDR),
        });
        let sum: u16 = h.calculate_checksum();
        h.set_checksum(!sum);

        ip.extend_from_slice(payload);
        self.link
            .inject(ipv4::PROTOCOL_NUMBER, VectorisedView::from_view(View::from(ip)));
    }

    /// Creates an endpoint and drives the three-way handshake against the
    /// test peer, whose SYN-ACK carries `irs` and `wnd`.
    pub fn create_connected(&mut self, irs: u32, wnd: u16) -> Result<()> {
        self.create_endpoint()?;
        self.connect(irs, wnd)
    }

    /// Drives the handshake for the already-created endpoint.
    pub fn connect(&mut self, irs: u32, wnd: u16) -> Result<()> {
        let ep: Arc<dyn Endpoint> = self.endpoint();

        let (entry, notify_rx) = waiter::new_channel_entry();
        self.wq.event_register(&entry, EVENT_OUT);

        match ep.connect(FullAddress {
            nic: 0,
            addr: Address::v4(TEST_ADDR),
            port: TEST_PORT,
        }) {
            Err(Fail::ConnectStarted) => (),
            other => bail!("unexpected return value from connect: {:?}", other),
        }

        // The stack opens with a SYN.
        let syn: TcpPacket = parse_ipv4_tcp(&self.get_packet()?)?;
        if syn.flags != FLAG_SYN {
            bail!("expected SYN, got flags {:#x}", syn.flags);
        }
        if syn.dst_port != TEST_PORT {
            bail!("SYN has wrong destination port {}", syn.dst_port);
        }
        self.iss = syn.seq_num;
        self.port = syn.src_port;
        self.syn_options = parse_syn_options(&syn.options);

        // Answer with a SYN-ACK.
        self.send_packet(
            &[],
            &Headers {
                src_port: TEST_PORT,
                dst_port: self.port,
                flags: FLAG_SYN | FLAG_ACK,
                seq_num: irs,
                ack_num: self.iss.wrapping_add(1),
                rcv_wnd: wnd,
            },
        );

        // The stack completes with a pure ACK.
        let ack: TcpPacket = parse_ipv4_tcp(&self.get_packet()?)?;
        if ack.flags != FLAG_ACK {
            bail!("expected ACK, got flags {:#x}", ack.flags);
        }
        if ack.seq_num != self.iss.wrapping_add(1) || ack.ack_num != irs.wrapping_add(1) {
            bail!("bad ACK numbers: seq {} ack {}", ack.seq_num, ack.ack_num);
        }

        // The connection is reported writable once the worker is up.
        if notify_rx.recv_timeout(RECV_TIMEOUT).is_err() {
            bail!("timed out waiting for the connection to establish");
        }
        match ep.get_sock_opt(SockOptName::Error) {
            Ok(SockOpt::Error(None)) => (),
            other => bail!("connection failed: {:?}", other),
        }

        self.wq.event_unregister(&entry);
        Ok(())
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Validates the IPv4 envelope of an emitted packet and returns its
/// payload.
pub fn parse_ipv4(packet: &[u8], protocol: u8) -> Result<Vec<u8>> {
    let h: Ipv4Header<&[u8]> = Ipv4Header(packet);
    if !h.is_valid(packet.len()) {
        bail!("emitted packet has an invalid ipv4 header");
    }
    let verify: u16 = h.calculate_checksum();
    if verify != 0xFFFF && verify != 0 {
        bail!("emitted packet has a bad ipv4 checksum");
    }
    if h.protocol() != protocol {
        bail!("emitted packet has protocol {}, expected {}", h.protocol(), protocol);
    }
    if h.source_address() != Address::v4(STACK_ADDR) || h.destination_address() != Address::v4(TEST_ADDR) {
        bail!("emitted packet has wrong addresses");
    }

    let hlen: usize = h.header_length();
    let tlen: usize = h.total_length() as usize;
    Ok(packet[hlen..tlen].to_vec())
}

/// Parses an emitted TCP packet, verifying the IPv4 envelope and the TCP
/// checksum.
pub fn parse_ipv4_tcp(packet: &[u8]) -> Result<TcpPacket> {
    let seg: Vec<u8> = parse_ipv4(packet, tcp::PROTOCOL_NUMBER.0)?;
    if seg.len() < TCP_MINIMUM_SIZE {
        bail!("emitted segment is too short");
    }

    let mut xsum: u16 = checksum::pseudo_header_checksum(
        tcp::PROTOCOL_NUMBER,
        &Address::v4(STACK_ADDR),
        &Address::v4(TEST_ADDR),
    );
    xsum = checksum::combine(xsum, seg.len() as u16);
    xsum = checksum::checksum(&seg, xsum);
    if xsum != 0xFFFF {
        bail!("emitted segment has a bad tcp checksum");
    }

    let h: TcpHeader<&[u8]> = TcpHeader(&seg[..]);
    let offset: usize = h.data_offset();
    if offset < TCP_MINIMUM_SIZE || offset > seg.len() {
        bail!("emitted segment has a bad data offset");
    }

    Ok(TcpPacket {
        src_port: h.source_port(),
        dst_port: h.destination_port(),
        seq_num: h.sequence_number(),
        ack_num: h.ack_number(),
        flags: h.flags(),
        window: h.window_size(),
        options: seg[TCP_MINIMUM_SIZE..offset].to_vec(),
        payload: seg[offset..].to_vec(),
    })
}

/// Parses an emitted UDP packet, verifying the IPv4 envelope.
pub fn parse_ipv4_udp(packet: &[u8]) -> Result<UdpPacket> {
    let datagram: Vec<u8> = parse_ipv4(packet, udp::PROTOCOL_NUMBER.0)?;
    if datagram.len() < UDP_MINIMUM_SIZE {
        bail!("emitted datagram is too short");
    }

    let h: UdpHeader<&[u8]> = UdpHeader(&datagram[..]);
    if h.length() as usize != datagram.len() {
        bail!("emitted datagram has a bad length field");
    }

    Ok(UdpPacket {
        src_port: h.source_port(),
        dst_port: h.destination_port(),
        payload: datagram[UDP_MINIMUM_SIZE..].to_vec(),
    })
}
