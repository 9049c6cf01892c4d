// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        protocols::{
            ipv4,
            tcp::{
                self,
                segment::{
                    FLAG_ACK,
                    FLAG_FIN,
                    FLAG_RST,
                    FLAG_SYN,
                },
            },
        },
        test_helpers::{
            parse_ipv4_tcp,
            Headers,
            TcpPacket,
            TestContext,
            DEFAULT_MTU,
            STACK_ADDR,
            TEST_PORT,
        },
        types::{
            Address,
            Endpoint,
            FullAddress,
            SockOpt,
            SockOptName,
        },
    },
    runtime::{
        fail::Fail,
        memory::View,
        waiter::{
            self,
            WaiterQueue,
            EVENT_IN,
            EVENT_OUT,
        },
    },
};
use ::anyhow::{
    bail,
    Result,
};
use ::std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// The MSS our SYN advertises at the default MTU: the link MTU minus the
/// IPv4 and TCP headers.
const DEFAULT_IPV4_MSS: u16 = (DEFAULT_MTU - 20 - 20) as u16;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

//==============================================================================
// Unit Tests
//==============================================================================

#[test]
fn active_handshake() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_connected(789, 30000)?;

    // The SYN carried the MSS derived from the link MTU.
    crate::ensure_eq!(c.syn_options.mss, DEFAULT_IPV4_MSS);
    Ok(())
}

#[test]
fn give_up_connect() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_endpoint()?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    // Register for notification, then start the connection attempt.
    let (entry, notify_rx) = waiter::new_channel_entry();
    c.wq.event_register(&entry, EVENT_OUT);

    match ep.connect(FullAddress {
        nic: 0,
        addr: Address::v4(crate::inetstack::test_helpers::TEST_ADDR),
        port: TEST_PORT,
    }) {
        Err(Fail::ConnectStarted) => (),
        other => bail!("unexpected return value from connect: {:?}", other),
    }

    // Close the endpoint without ever answering; the handshake aborts.
    ep.close();

    if notify_rx.recv_timeout(NOTIFY_TIMEOUT).is_err() {
        bail!("timed out waiting for the aborted connect to report");
    }
    match ep.get_sock_opt(SockOptName::Error) {
        Ok(SockOpt::Error(Some(Fail::Aborted))) => (),
        other => bail!("expected Aborted, got {:?}", other),
    }

    c.wq.event_unregister(&entry);
    Ok(())
}

#[test]
fn simple_receive() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_connected(789, 30000)?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    let (entry, notify_rx) = waiter::new_channel_entry();
    c.wq.event_register(&entry, EVENT_IN);

    crate::ensure_eq!(ep.read(None), Err(Fail::WouldBlock));

    let data: &[u8] = &[1, 2, 3];
    c.send_packet(
        data,
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK,
            seq_num: 790,
            ack_num: c.iss.wrapping_add(1),
            rcv_wnd: 30000,
        },
    );

    // Wait for receive to be notified.
    if notify_rx.recv_timeout(NOTIFY_TIMEOUT).is_err() {
        bail!("timed out waiting for data to arrive");
    }

    let v: View = match ep.read(None) {
        Ok(v) => v,
        Err(e) => bail!("unexpected error from read: {:?}", e),
    };
    crate::ensure_eq!(v.as_slice(), data);

    // The data is acknowledged.
    let ack: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(ack.dst_port, TEST_PORT);
    crate::ensure_eq!(ack.flags, FLAG_ACK);
    crate::ensure_eq!(ack.seq_num, c.iss.wrapping_add(1));
    crate::ensure_eq!(ack.ack_num, 790 + data.len() as u32);

    c.wq.event_unregister(&entry);
    Ok(())
}

#[test]
fn out_of_order_receive() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_connected(789, 30000)?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    let (entry, notify_rx) = waiter::new_channel_entry();
    c.wq.event_register(&entry, EVENT_IN);

    // The second half of the stream arrives first.
    c.send_packet(
        &[4, 5, 6],
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK,
            seq_num: 793,
            ack_num: c.iss.wrapping_add(1),
            rcv_wnd: 30000,
        },
    );

    // The stack tells the peer where it still is.
    let dup: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(dup.flags, FLAG_ACK);
    crate::ensure_eq!(dup.ack_num, 790);

    // No data is delivered to the user yet.
    crate::ensure_eq!(ep.read(None), Err(Fail::WouldBlock));

    // The hole is filled.
    c.send_packet(
        &[1, 2, 3],
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK,
            seq_num: 790,
            ack_num: c.iss.wrapping_add(1),
            rcv_wnd: 30000,
        },
    );

    if notify_rx.recv_timeout(NOTIFY_TIMEOUT).is_err() {
        bail!("timed out waiting for data to arrive");
    }

    // The user sees the stream in sender order.
    crate::ensure_eq!(ep.read(None)?.as_slice(), &[1, 2, 3]);
    let second: View = loop {
        match ep.read(None) {
            Ok(v) => break v,
            Err(Fail::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => bail!("unexpected error from read: {:?}", e),
        }
    };
    crate::ensure_eq!(second.as_slice(), &[4, 5, 6]);

    // Everything is acknowledged at once.
    let ack: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(ack.flags, FLAG_ACK);
    crate::ensure_eq!(ack.ack_num, 796);

    c.wq.event_unregister(&entry);
    Ok(())
}

#[test]
fn flow_control_zero_window() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_endpoint()?;
    c.endpoint().set_sock_opt(SockOpt::ReceiveBufferSize(10))?;
    c.connect(789, 30000)?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    let (entry, notify_rx) = waiter::new_channel_entry();
    c.wq.event_register(&entry, EVENT_IN);

    // Fill the receive buffer exactly.
    let data: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
    c.send_packet(
        data,
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK,
            seq_num: 790,
            ack_num: c.iss.wrapping_add(1),
            rcv_wnd: 30000,
        },
    );

    // The ACK closes the window.
    let ack: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(ack.ack_num, 800);
    crate::ensure_eq!(ack.window, 0);

    if notify_rx.recv_timeout(NOTIFY_TIMEOUT).is_err() {
        bail!("timed out waiting for data to arrive");
    }
    crate::ensure_eq!(ep.read(None)?.as_slice(), data);

    // Draining the buffer reopens the window.
    let update: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(update.ack_num, 800);
    crate::ensure_eq!(update.window, 10);

    c.wq.event_unregister(&entry);
    Ok(())
}

#[test]
fn no_window_shrink() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_endpoint()?;
    c.endpoint().set_sock_opt(SockOpt::ReceiveBufferSize(10))?;
    c.connect(789, 30000)?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    // Shrink the buffer after the window was announced.
    ep.set_sock_opt(SockOpt::ReceiveBufferSize(5))?;

    c.send_packet(
        &[1, 2, 3],
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK,
            seq_num: 790,
            ack_num: c.iss.wrapping_add(1),
            rcv_wnd: 30000,
        },
    );

    // The window shrinks only as data arrives, never by retraction: 10-3,
    // not 5-3.
    let ack: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(ack.ack_num, 793);
    crate::ensure_eq!(ack.window, 7);

    // Filling the rest of the originally announced window is fine.
    c.send_packet(
        &[4, 5, 6, 7, 8, 9, 10],
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK,
            seq_num: 793,
            ack_num: c.iss.wrapping_add(1),
            rcv_wnd: 30000,
        },
    );

    let ack: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(ack.ack_num, 800);
    crate::ensure_eq!(ack.window, 0);

    // Consume everything; the window settles at the new buffer size.
    crate::ensure_eq!(ep.read(None)?.as_slice(), &[1, 2, 3]);
    crate::ensure_eq!(ep.read(None)?.as_slice(), &[4, 5, 6, 7, 8, 9, 10]);

    let update: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(update.ack_num, 800);
    crate::ensure_eq!(update.window, 5);
    Ok(())
}

#[test]
fn simple_send() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_connected(789, 30000)?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    let data: &[u8] = &[1, 2, 3];
    crate::ensure_eq!(ep.write(View::from(data.to_vec()), None)?, 3);

    let seg: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(seg.dst_port, TEST_PORT);
    crate::ensure_eq!(seg.flags, FLAG_ACK);
    crate::ensure_eq!(seg.seq_num, c.iss.wrapping_add(1));
    crate::ensure_eq!(seg.ack_num, 790);
    crate::ensure_eq!(seg.payload.as_slice(), data);

    // Acknowledge it so the sender retires the segment.
    c.send_packet(
        &[],
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK,
            seq_num: 790,
            ack_num: c.iss.wrapping_add(4),
            rcv_wnd: 30000,
        },
    );

    // No retransmission follows.
    crate::ensure_eq!(c.no_packet_within(Duration::from_millis(1500)), true);
    Ok(())
}

#[test]
fn data_retransmits_until_acked() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_connected(789, 30000)?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    ep.write(View::from(vec![9, 9, 9]), None)?;

    let first: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(first.payload.as_slice(), &[9, 9, 9]);

    // Withholding the ACK forces a retransmission of the same bytes.
    let retrans: TcpPacket = parse_ipv4_tcp(&c.get_packet_within(Duration::from_secs(3))?)?;
    crate::ensure_eq!(retrans.seq_num, first.seq_num);
    crate::ensure_eq!(retrans.payload.as_slice(), &[9, 9, 9]);

    c.send_packet(
        &[],
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK,
            seq_num: 790,
            ack_num: c.iss.wrapping_add(4),
            rcv_wnd: 30000,
        },
    );
    Ok(())
}

#[test]
fn syn_retransmits_with_backoff() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_endpoint()?;

    match c.endpoint().connect(FullAddress {
        nic: 0,
        addr: Address::v4(crate::inetstack::test_helpers::TEST_ADDR),
        port: TEST_PORT,
    }) {
        Err(Fail::ConnectStarted) => (),
        other => bail!("unexpected return value from connect: {:?}", other),
    }

    let syn: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(syn.flags, FLAG_SYN);

    // Unanswered, the SYN comes again.
    let again: TcpPacket = parse_ipv4_tcp(&c.get_packet_within(Duration::from_secs(3))?)?;
    crate::ensure_eq!(again.flags, FLAG_SYN);
    crate::ensure_eq!(again.seq_num, syn.seq_num);

    c.endpoint().close();
    Ok(())
}

#[test]
fn nonblocking_close_sends_fin() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_connected(789, 30000)?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    let t0: Instant = Instant::now();
    ep.close();
    if t0.elapsed() > Duration::from_secs(3) {
        bail!("close took too long");
    }

    let fin: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(fin.flags, FLAG_ACK | FLAG_FIN);
    crate::ensure_eq!(fin.seq_num, c.iss.wrapping_add(1));
    crate::ensure_eq!(fin.ack_num, 790);

    // Complete the shutdown from the peer side.
    c.send_packet(
        &[],
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK | FLAG_FIN,
            seq_num: 790,
            ack_num: c.iss.wrapping_add(2),
            rcv_wnd: 30000,
        },
    );

    // Our FIN was acked and theirs is acknowledged in turn.
    let ack: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(ack.flags, FLAG_ACK);
    crate::ensure_eq!(ack.ack_num, 791);
    Ok(())
}

#[test]
fn close_resets_after_grace_period() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_connected(789, 30000)?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    ep.close();

    let fin: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(fin.flags, FLAG_ACK | FLAG_FIN);

    // Acknowledge the FIN but never send our own; the stack gives up after
    // its grace period and resets.
    c.send_packet(
        &[],
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK,
            seq_num: 790,
            ack_num: c.iss.wrapping_add(2),
            rcv_wnd: 30000,
        },
    );

    let rst: TcpPacket = parse_ipv4_tcp(&c.get_packet_within(Duration::from_secs(5))?)?;
    crate::ensure_eq!(rst.flags, FLAG_ACK | FLAG_RST);
    crate::ensure_eq!(rst.ack_num, 790);
    Ok(())
}

#[test]
fn reset_from_peer_sets_hard_error() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_connected(789, 30000)?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    let (entry, notify_rx) = waiter::new_channel_entry();
    c.wq.event_register(&entry, EVENT_IN);

    c.send_packet(
        &[],
        &Headers {
            src_port: TEST_PORT,
            dst_port: c.port,
            flags: FLAG_ACK | FLAG_RST,
            seq_num: 790,
            ack_num: c.iss.wrapping_add(1),
            rcv_wnd: 30000,
        },
    );

    if notify_rx.recv_timeout(NOTIFY_TIMEOUT).is_err() {
        bail!("timed out waiting for the reset to surface");
    }
    match ep.get_sock_opt(SockOptName::Error) {
        Ok(SockOpt::Error(Some(Fail::ConnectionReset))) => (),
        other => bail!("expected ConnectionReset, got {:?}", other),
    }

    c.wq.event_unregister(&entry);
    Ok(())
}

#[test]
fn passive_open_with_syn_cookies() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;

    let wq: WaiterQueue = WaiterQueue::new();
    let ep: Arc<dyn Endpoint> = match c.stack.new_endpoint(tcp::PROTOCOL_NUMBER, ipv4::PROTOCOL_NUMBER, wq.clone()) {
        Ok(ep) => ep,
        Err(e) => bail!("new_endpoint failed: {:?}", e),
    };

    ep.bind(FullAddress {
        nic: 0,
        addr: Address::v4(STACK_ADDR),
        port: 80,
    })?;
    ep.listen(10)?;

    let (entry, notify_rx) = waiter::new_channel_entry();
    wq.event_register(&entry, EVENT_IN);

    // A client knocks.
    c.send_packet(
        &[],
        &Headers {
            src_port: TEST_PORT,
            dst_port: 80,
            flags: FLAG_SYN,
            seq_num: 789,
            ack_num: 0,
            rcv_wnd: 30000,
        },
    );

    let synack: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(synack.flags, FLAG_SYN | FLAG_ACK);
    crate::ensure_eq!(synack.src_port, 80);
    crate::ensure_eq!(synack.ack_num, 790);

    // Complete the handshake.
    c.send_packet(
        &[],
        &Headers {
            src_port: TEST_PORT,
            dst_port: 80,
            flags: FLAG_ACK,
            seq_num: 790,
            ack_num: synack.seq_num.wrapping_add(1),
            rcv_wnd: 30000,
        },
    );

    if notify_rx.recv_timeout(NOTIFY_TIMEOUT).is_err() {
        bail!("timed out waiting for the connection to be queued");
    }

    let (accepted, accepted_wq): (Arc<dyn Endpoint>, WaiterQueue) = match ep.accept() {
        Ok(pair) => pair,
        Err(e) => bail!("accept failed: {:?}", e),
    };

    // Data flows to the accepted endpoint.
    let (data_entry, data_rx) = waiter::new_channel_entry();
    accepted_wq.event_register(&data_entry, EVENT_IN);

    c.send_packet(
        &[7, 7, 7],
        &Headers {
            src_port: TEST_PORT,
            dst_port: 80,
            flags: FLAG_ACK,
            seq_num: 790,
            ack_num: synack.seq_num.wrapping_add(1),
            rcv_wnd: 30000,
        },
    );

    if data_rx.recv_timeout(NOTIFY_TIMEOUT).is_err() {
        bail!("timed out waiting for data on the accepted endpoint");
    }
    crate::ensure_eq!(accepted.read(None)?.as_slice(), &[7, 7, 7]);

    let ack: TcpPacket = parse_ipv4_tcp(&c.get_packet()?)?;
    crate::ensure_eq!(ack.flags, FLAG_ACK);
    crate::ensure_eq!(ack.ack_num, 793);

    accepted_wq.event_unregister(&data_entry);
    wq.event_unregister(&entry);
    Ok(())
}

#[test]
fn accept_with_nothing_queued_would_block() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;

    let wq: WaiterQueue = WaiterQueue::new();
    let ep: Arc<dyn Endpoint> = match c.stack.new_endpoint(tcp::PROTOCOL_NUMBER, ipv4::PROTOCOL_NUMBER, wq) {
        Ok(ep) => ep,
        Err(e) => bail!("new_endpoint failed: {:?}", e),
    };

    ep.bind(FullAddress {
        nic: 0,
        addr: Address::v4(STACK_ADDR),
        port: 81,
    })?;
    ep.listen(4)?;

    match ep.accept() {
        Err(Fail::WouldBlock) => (),
        other => bail!("expected WouldBlock, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[test]
fn write_blocks_when_send_buffer_full() -> Result<()> {
    let mut c: TestContext = TestContext::new(DEFAULT_MTU)?;
    c.create_endpoint()?;
    c.endpoint().set_sock_opt(SockOpt::SendBufferSize(4))?;
    c.connect(789, 30000)?;
    let ep: Arc<dyn Endpoint> = c.endpoint();

    crate::ensure_eq!(ep.write(View::from(vec![1, 2, 3, 4]), None)?, 4);
    crate::ensure_eq!(ep.write(View::from(vec![5]), None), Err(Fail::WouldBlock));
    Ok(())
}

#[test]
fn bind_conflicts_surface_port_in_use() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;

    let ep1: Arc<dyn Endpoint> =
        match c.stack.new_endpoint(tcp::PROTOCOL_NUMBER, ipv4::PROTOCOL_NUMBER, WaiterQueue::new()) {
            Ok(ep) => ep,
            Err(e) => bail!("new_endpoint failed: {:?}", e),
        };
    let ep2: Arc<dyn Endpoint> =
        match c.stack.new_endpoint(tcp::PROTOCOL_NUMBER, ipv4::PROTOCOL_NUMBER, WaiterQueue::new()) {
            Ok(ep) => ep,
            Err(e) => bail!("new_endpoint failed: {:?}", e),
        };

    let addr: FullAddress = FullAddress {
        nic: 0,
        addr: Address::v4(STACK_ADDR),
        port: 82,
    };
    ep1.bind(addr.clone())?;
    crate::ensure_eq!(ep2.bind(addr), Err(Fail::PortInUse));
    crate::ensure_eq!(
        ep1.bind(FullAddress {
            nic: 0,
            addr: Address::v4(STACK_ADDR),
            port: 83,
        }),
        Err(Fail::AlreadyBound)
    );
    Ok(())
}
