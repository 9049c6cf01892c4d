// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        protocols::{
            ipv4,
            udp,
        },
        test_helpers::{
            parse_ipv4_udp,
            TestContext,
            UdpPacket,
            DEFAULT_MTU,
            STACK_ADDR,
            TEST_ADDR,
            TEST_PORT,
        },
        types::{
            Address,
            Endpoint,
            FullAddress,
            SockOpt,
        },
    },
    runtime::{
        fail::Fail,
        memory::View,
        waiter::{
            self,
            WaiterQueue,
            EVENT_IN,
        },
    },
};
use ::anyhow::{
    bail,
    Result,
};
use ::std::{
    sync::Arc,
    time::Duration,
};

//==============================================================================
// Constants
//==============================================================================

const STACK_PORT: u16 = 1234;

//==============================================================================
// Standalone Functions
//==============================================================================

fn new_udp_endpoint(c: &TestContext) -> Result<(Arc<dyn Endpoint>, WaiterQueue)> {
    let wq: WaiterQueue = WaiterQueue::new();
    match c.stack.new_endpoint(udp::PROTOCOL_NUMBER, ipv4::PROTOCOL_NUMBER, wq.clone()) {
        Ok(ep) => Ok((ep, wq)),
        Err(e) => bail!("new_endpoint failed: {:?}", e),
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[test]
fn bind_and_receive() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;
    let (ep, wq): (Arc<dyn Endpoint>, WaiterQueue) = new_udp_endpoint(&c)?;

    ep.bind(FullAddress {
        nic: 0,
        addr: Address::v4(STACK_ADDR),
        port: STACK_PORT,
    })?;

    let (entry, notify_rx) = waiter::new_channel_entry();
    wq.event_register(&entry, EVENT_IN);

    crate::ensure_eq!(ep.read(None), Err(Fail::WouldBlock));

    c.send_udp_packet(&[1, 2, 3, 4, 5], TEST_PORT, STACK_PORT);

    if notify_rx.recv_timeout(Duration::from_secs(2)).is_err() {
        bail!("timed out waiting for the datagram");
    }

    let mut from: FullAddress = FullAddress::default();
    let v: View = ep.read(Some(&mut from))?;
    crate::ensure_eq!(v.as_slice(), &[1, 2, 3, 4, 5]);
    crate::ensure_eq!(from.addr, Address::v4(TEST_ADDR));
    crate::ensure_eq!(from.port, TEST_PORT);

    wq.event_unregister(&entry);
    Ok(())
}

#[test]
fn write_emits_datagram() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;
    let (ep, _wq): (Arc<dyn Endpoint>, WaiterQueue) = new_udp_endpoint(&c)?;

    ep.bind(FullAddress {
        nic: 0,
        addr: Address::v4(STACK_ADDR),
        port: STACK_PORT,
    })?;

    let to: FullAddress = FullAddress {
        nic: 0,
        addr: Address::v4(TEST_ADDR),
        port: TEST_PORT,
    };
    crate::ensure_eq!(ep.write(View::from(vec![9, 8, 7]), Some(&to))?, 3);

    let p: UdpPacket = parse_ipv4_udp(&c.get_packet()?)?;
    crate::ensure_eq!(p.src_port, STACK_PORT);
    crate::ensure_eq!(p.dst_port, TEST_PORT);
    crate::ensure_eq!(p.payload.as_slice(), &[9, 8, 7]);
    Ok(())
}

#[test]
fn write_requires_destination() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;
    let (ep, _wq): (Arc<dyn Endpoint>, WaiterQueue) = new_udp_endpoint(&c)?;

    crate::ensure_eq!(ep.write(View::from(vec![1]), None), Err(Fail::DestinationRequired));
    Ok(())
}

#[test]
fn unbound_write_picks_ephemeral_port() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;
    let (ep, _wq): (Arc<dyn Endpoint>, WaiterQueue) = new_udp_endpoint(&c)?;

    let to: FullAddress = FullAddress {
        nic: 0,
        addr: Address::v4(TEST_ADDR),
        port: TEST_PORT,
    };
    ep.write(View::from(vec![1]), Some(&to))?;

    let p: UdpPacket = parse_ipv4_udp(&c.get_packet()?)?;
    crate::ensure_eq!(p.src_port >= 16000, true);
    Ok(())
}

#[test]
fn full_receive_buffer_drops_datagrams() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;
    let (ep, wq): (Arc<dyn Endpoint>, WaiterQueue) = new_udp_endpoint(&c)?;

    ep.set_sock_opt(SockOpt::ReceiveBufferSize(4))?;
    ep.bind(FullAddress {
        nic: 0,
        addr: Address::v4(STACK_ADDR),
        port: STACK_PORT,
    })?;

    let (entry, notify_rx) = waiter::new_channel_entry();
    wq.event_register(&entry, EVENT_IN);

    // The first datagram fills the buffer; the second is dropped.
    c.send_udp_packet(&[1, 2, 3, 4], TEST_PORT, STACK_PORT);
    c.send_udp_packet(&[5, 6, 7, 8], TEST_PORT, STACK_PORT);

    if notify_rx.recv_timeout(Duration::from_secs(2)).is_err() {
        bail!("timed out waiting for the datagram");
    }

    crate::ensure_eq!(ep.read(None)?.as_slice(), &[1, 2, 3, 4]);
    crate::ensure_eq!(ep.read(None), Err(Fail::WouldBlock));

    wq.event_unregister(&entry);
    Ok(())
}

#[test]
fn datagrams_are_never_joined() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;
    let (ep, wq): (Arc<dyn Endpoint>, WaiterQueue) = new_udp_endpoint(&c)?;

    ep.bind(FullAddress {
        nic: 0,
        addr: Address::v4(STACK_ADDR),
        port: STACK_PORT,
    })?;

    let (entry, notify_rx) = waiter::new_channel_entry();
    wq.event_register(&entry, EVENT_IN);

    c.send_udp_packet(&[1, 2], TEST_PORT, STACK_PORT);
    c.send_udp_packet(&[3], TEST_PORT, STACK_PORT);

    if notify_rx.recv_timeout(Duration::from_secs(2)).is_err() {
        bail!("timed out waiting for the datagrams");
    }

    // One read per datagram, in arrival order.
    loop {
        match ep.read(None) {
            Ok(v) => {
                crate::ensure_eq!(v.as_slice(), &[1, 2]);
                break;
            },
            Err(Fail::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => bail!("unexpected error from read: {:?}", e),
        }
    }
    loop {
        match ep.read(None) {
            Ok(v) => {
                crate::ensure_eq!(v.as_slice(), &[3]);
                break;
            },
            Err(Fail::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => bail!("unexpected error from read: {:?}", e),
        }
    }

    wq.event_unregister(&entry);
    Ok(())
}

#[test]
fn stream_operations_are_not_supported() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;
    let (ep, _wq): (Arc<dyn Endpoint>, WaiterQueue) = new_udp_endpoint(&c)?;

    crate::ensure_eq!(ep.listen(1), Err(Fail::NotSupported));
    crate::ensure_eq!(
        ep.connect(FullAddress {
            nic: 0,
            addr: Address::v4(TEST_ADDR),
            port: TEST_PORT,
        }),
        Err(Fail::NotSupported)
    );
    crate::ensure_eq!(ep.accept().err(), Some(Fail::NotSupported));
    Ok(())
}

#[test]
fn closed_endpoint_reports_closed_for_receive() -> Result<()> {
    let c: TestContext = TestContext::new(DEFAULT_MTU)?;
    let (ep, _wq): (Arc<dyn Endpoint>, WaiterQueue) = new_udp_endpoint(&c)?;

    ep.bind(FullAddress {
        nic: 0,
        addr: Address::v4(STACK_ADDR),
        port: STACK_PORT,
    })?;
    ep.close();

    crate::ensure_eq!(ep.read(None), Err(Fail::ClosedForReceive));
    Ok(())
}
