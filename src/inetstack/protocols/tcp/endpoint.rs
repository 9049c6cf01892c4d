// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The TCP endpoint. This type is the interface between users and the
//! protocol implementation: it is legal for concurrent threads to call in,
//! they are properly synchronized. The protocol state machine itself
//! (`Sender`, `Receiver`, retransmission bookkeeping) runs in a single
//! worker thread per connection; user-facing operations hand off to it
//! through queues and wakers.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        protocols::tcp::{
            handshake::Handshake,
            receiver::Receiver,
            segment::{
                Segment,
                TcpFields,
                TcpHeader,
                FLAG_ACK,
                FLAG_RST,
                FLAG_SYN,
                TCP_MINIMUM_SIZE,
            },
            segment_queue::SegmentQueue,
            sender::Sender,
            sequence_number::SeqNumber,
            MAX_SEGMENTS_PER_WAKE,
            PROTOCOL_NUMBER,
            WAKER_FOR_NEW_SEGMENT,
            WAKER_FOR_NOTIFICATION,
            WAKER_FOR_SEND,
            WAKER_FOR_SEND_CLOSE,
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
            SHUTDOWN_WRITE,
        },
        protocols::checksum,
        Stack,
    },
    runtime::{
        fail::Fail,
        memory::{
            Prependable,
            VectorisedView,
            View,
        },
        sleep::{
            Sleeper,
            Waker,
        },
        waiter::{
            WaiterQueue,
            EVENT_ERR,
            EVENT_HUP,
            EVENT_IN,
            EVENT_OUT,
        },
    },
};
use ::crossbeam_channel;
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
        Mutex,
        Weak,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Default size of the receive and send buffers.
pub(super) const DEFAULT_BUFFER_SIZE: usize = 208 * 1024;

/// How long a closing connection may linger before it is reset.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(3);

// Notification bits handed to the protocol worker.
pub(super) const NOTIFY_CLOSE: u32 = 1 << 0;
pub(super) const NOTIFY_RECEIVE_WINDOW: u32 = 1 << 1;

//==============================================================================
// Structures
//==============================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum TcpState {
    Initial,
    Bound,
    Listen,
    Connecting,
    Connected,
    Closed,
    Error,
}

pub(super) struct AcceptedChan {
    pub tx: crossbeam_channel::Sender<Arc<TcpEndpoint>>,
    pub rx: crossbeam_channel::Receiver<Arc<TcpEndpoint>>,
}

pub(super) struct Core {
    pub state: TcpState,
    pub id: TransportEndpointId,
    pub bound_nic: NicId,
    pub bound_addr: Address,
    pub route: Option<Route>,
    pub effective_net_protos: Vec<NetworkProtocolNumber>,
    pub is_registered: bool,
    pub is_port_reserved: bool,
    pub hard_error: Option<Fail>,
    pub accepted: Option<AcceptedChan>,
    pub worker_running: bool,
}

struct RcvList {
    list: VecDeque<Segment>,
    closed: bool,
    buf_size: usize,
    buf_used: usize,
}

struct SndQueue {
    list: VecDeque<View>,
    closed: bool,
    buf_size: usize,
    buf_used: usize,
}

/// A TCP endpoint.
pub struct TcpEndpoint {
    pub(super) stack: Stack,
    pub(super) net_proto: NetworkProtocolNumber,
    pub(super) waiter_queue: WaiterQueue,
    pub(super) me: Weak<TcpEndpoint>,

    pub(super) core: Mutex<Core>,
    rcv_list: Mutex<RcvList>,
    snd_queue: Mutex<SndQueue>,

    /// Inbound segments, fed by the receive path and drained by the worker.
    segment_queue: SegmentQueue,
    notify_flags: AtomicU32,

    pub(super) new_segment_waker: Waker,
    pub(super) notification_waker: Waker,
    pub(super) send_waker: Waker,
    pub(super) send_close_waker: Waker,
    pub(super) accepted_close_waker: Waker,

    /// Sender/receiver built by a passive handshake, waiting for the
    /// worker to be started on first accept.
    pub(super) worker_seed: Mutex<Option<(Sender, Receiver)>>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl TcpEndpoint {
    pub fn new(stack: Stack, net_proto: NetworkProtocolNumber, waiter_queue: WaiterQueue) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            stack,
            net_proto,
            waiter_queue,
            me: me.clone(),
            core: Mutex::new(Core {
                state: TcpState::Initial,
                id: TransportEndpointId::default(),
                bound_nic: 0,
                bound_addr: Address::empty(),
                route: None,
                effective_net_protos: Vec::new(),
                is_registered: false,
                is_port_reserved: false,
                hard_error: None,
                accepted: None,
                worker_running: false,
            }),
            rcv_list: Mutex::new(RcvList {
                list: VecDeque::new(),
                closed: false,
                buf_size: DEFAULT_BUFFER_SIZE,
                buf_used: 0,
            }),
            snd_queue: Mutex::new(SndQueue {
                list: VecDeque::new(),
                closed: false,
                buf_size: DEFAULT_BUFFER_SIZE,
                buf_used: 0,
            }),
            segment_queue: SegmentQueue::new(2 * DEFAULT_BUFFER_SIZE),
            notify_flags: AtomicU32::new(0),
            new_segment_waker: Waker::new(),
            notification_waker: Waker::new(),
            send_waker: Waker::new(),
            send_close_waker: Waker::new(),
            accepted_close_waker: Waker::new(),
            worker_seed: Mutex::new(None),
        })
    }

    //==========================================================================
    // Helpers shared with the worker, the handshake, and the listener.
    //==========================================================================

    pub(super) fn arc(&self) -> Arc<TcpEndpoint> {
        self.me.upgrade().expect("endpoint vanished while in use")
    }

    /// Hands a notification to the protocol worker.
    pub(super) fn notify_protocol_worker(&self, flags: u32) {
        self.notify_flags.fetch_or(flags, Ordering::SeqCst);
        self.notification_waker.assert();
    }

    /// Takes and clears the pending notification bits.
    pub(super) fn fetch_notifications(&self) -> u32 {
        self.notify_flags.swap(0, Ordering::SeqCst)
    }

    pub(super) fn dequeue_segment(&self) -> Option<Segment> {
        self.segment_queue.dequeue()
    }

    pub(super) fn segment_queue_is_empty(&self) -> bool {
        self.segment_queue.is_empty()
    }

    /// Puts a segment back for the connection's receiver (used when the
    /// handshake-completing ACK carries data).
    pub(super) fn requeue_segment(&self, seg: Segment) {
        if self.segment_queue.enqueue(seg) {
            self.new_segment_waker.assert();
        }
    }

    pub(super) fn add_worker_wakers_for_handshake(&self, sleeper: &Sleeper, segment_id: usize, notification_id: usize) {
        sleeper.add_waker(&self.new_segment_waker, segment_id);
        sleeper.add_waker(&self.notification_waker, notification_id);
    }

    pub(super) fn route_mtu(&self) -> u32 {
        let core = self.core.lock().unwrap();
        core.route.as_ref().map(|r| r.mtu()).unwrap_or(0)
    }

    /// How much receive buffer space remains for new in-order data.
    pub(super) fn receive_buffer_available(&self) -> usize {
        let rcv_list = self.rcv_list.lock().unwrap();
        rcv_list.buf_size.saturating_sub(rcv_list.buf_used)
    }

    /// Called by the receiver when in-order data (or the peer's FIN, as
    /// `None`) becomes available to the user.
    pub(super) fn ready_to_read(&self, seg: Option<Segment>) {
        {
            let mut rcv_list = self.rcv_list.lock().unwrap();
            match seg {
                Some(seg) => {
                    rcv_list.buf_used += seg.data.size();
                    rcv_list.list.push_back(seg);
                },
                None => rcv_list.closed = true,
            }
        }
        self.waiter_queue.notify(EVENT_IN);
    }

    /// Credits back send-buffer space for acknowledged bytes and wakes
    /// blocked writers when the buffer transitions away from full.
    pub(super) fn on_send_buffer_freed(&self, bytes: usize) {
        let notify: bool = {
            let mut snd_queue = self.snd_queue.lock().unwrap();
            let was_full: bool = snd_queue.buf_used >= snd_queue.buf_size;
            snd_queue.buf_used = snd_queue.buf_used.saturating_sub(bytes);
            was_full && !snd_queue.closed && snd_queue.buf_used < snd_queue.buf_size
        };
        if notify {
            self.waiter_queue.notify(EVENT_OUT);
        }
    }

    /// Sends one segment on the connection's route.
    pub(super) fn send_raw(
        &self,
        data: Option<&View>,
        flags: u8,
        seq: SeqNumber,
        ack: SeqNumber,
        wnd: u16,
    ) -> Result<(), Fail> {
        self.send_raw_with_options(data, &[], flags, seq, ack, wnd)
    }

    pub(super) fn send_raw_with_options(
        &self,
        data: Option<&View>,
        options: &[u8],
        flags: u8,
        seq: SeqNumber,
        ack: SeqNumber,
        wnd: u16,
    ) -> Result<(), Fail> {
        let (route, id): (Route, TransportEndpointId) = {
            let core = self.core.lock().unwrap();
            (core.route.clone().ok_or(Fail::NoRoute)?, core.id.clone())
        };
        send_tcp(&route, &id, data, options, flags, seq, ack, wnd)
    }

    //==========================================================================
    // The protocol worker.
    //==========================================================================

    pub(super) fn start_worker_if_needed(&self) {
        let mut core = self.core.lock().unwrap();
        if core.worker_running || core.state != TcpState::Connected {
            return;
        }
        core.worker_running = true;
        drop(core);

        let ep: Arc<TcpEndpoint> = self.arc();
        thread::spawn(move || ep.protocol_main_loop(false));
    }

    /// The main loop of a connection. Runs in its own thread and owns the
    /// sender and receiver outright.
    pub(super) fn protocol_main_loop(self: Arc<Self>, do_handshake: bool) {
        let (mut snd, mut rcv): (Sender, Receiver) = if do_handshake {
            let rcv_wnd: u32 = self.rcv_list.lock().unwrap().buf_size as u32;
            let mut handshake: Handshake = Handshake::new_active(self.clone(), rcv_wnd);
            match handshake.execute() {
                Ok(()) => handshake.into_sender_receiver(),
                Err(e) => {
                    self.cleanup(Some(e));
                    return;
                },
            }
        } else {
            match self.worker_seed.lock().unwrap().take() {
                Some(seed) => seed,
                None => {
                    self.cleanup(Some(Fail::InvalidEndpointState));
                    return;
                },
            }
        };

        {
            let mut core = self.core.lock().unwrap();
            core.state = TcpState::Connected;
        }
        self.waiter_queue.notify(EVENT_OUT);

        let sleeper: Sleeper = Sleeper::new();
        sleeper.add_waker(&self.notification_waker, WAKER_FOR_NOTIFICATION);
        sleeper.add_waker(&self.new_segment_waker, WAKER_FOR_NEW_SEGMENT);
        sleeper.add_waker(&self.send_waker, WAKER_FOR_SEND);
        sleeper.add_waker(&self.send_close_waker, WAKER_FOR_SEND_CLOSE);

        let mut close_deadline: Option<Instant> = None;
        let mut failure: Option<Fail> = None;

        // Catch up on anything that arrived while the handshake had the
        // wakers.
        if let Err(e) = self.handle_segments(&mut snd, &mut rcv) {
            self.cleanup(Some(e));
            return;
        }
        self.handle_write(&mut snd, &mut rcv);

        loop {
            // The connection is done once both halves are shut and all of
            // our bytes are acknowledged.
            if rcv.closed && snd.closed && snd.snd_una == snd.snd_nxt_list {
                break;
            }

            let deadline: Option<Instant> = match (close_deadline, snd.resend_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let fired: Option<usize> = match deadline {
                Some(d) => sleeper.fetch_before(d),
                None => sleeper.fetch(true),
            };

            match fired {
                None => {
                    let now: Instant = Instant::now();
                    if close_deadline.map_or(false, |d| now >= d) {
                        // The grace period ran out before the connection
                        // wound down. Reset the peer and give up.
                        let (ack, wnd): (SeqNumber, u16) = rcv.get_send_params(&self);
                        let _ = self.send_raw(None, FLAG_ACK | FLAG_RST, snd.snd_nxt, ack, wnd);
                        failure = Some(Fail::ConnectionAborted);
                        break;
                    }
                    if snd.resend_deadline.map_or(false, |d| now >= d) {
                        if let Err(e) = snd.retransmit_timer_expired(&self, &mut rcv) {
                            let (ack, wnd): (SeqNumber, u16) = rcv.get_send_params(&self);
                            let _ = self.send_raw(None, FLAG_ACK | FLAG_RST, snd.snd_nxt, ack, wnd);
                            failure = Some(e);
                            break;
                        }
                    }
                },
                Some(WAKER_FOR_NEW_SEGMENT) => {
                    if let Err(e) = self.handle_segments(&mut snd, &mut rcv) {
                        failure = Some(e);
                        break;
                    }
                },
                Some(WAKER_FOR_SEND) => self.handle_write(&mut snd, &mut rcv),
                Some(WAKER_FOR_SEND_CLOSE) => self.handle_close(&mut snd, &mut rcv),
                Some(WAKER_FOR_NOTIFICATION) => {
                    let flags: u32 = self.fetch_notifications();
                    if flags & NOTIFY_CLOSE != 0 && close_deadline.is_none() {
                        close_deadline = Some(Instant::now() + CLOSE_GRACE_PERIOD);
                    }
                    if flags & NOTIFY_RECEIVE_WINDOW != 0 {
                        // Readers freed buffer space; let the peer know.
                        snd.send_ack(&self, &mut rcv);
                    }
                },
                Some(_) => (),
            }
        }

        self.cleanup(failure);
    }

    /// Processes up to a batch of inbound segments, then generates an ACK
    /// if the receiver consumed anything new.
    fn handle_segments(&self, snd: &mut Sender, rcv: &mut Receiver) -> Result<(), Fail> {
        for _ in 0..MAX_SEGMENTS_PER_WAKE {
            let seg: Segment = match self.segment_queue.dequeue() {
                Some(seg) => seg,
                None => break,
            };

            if seg.flag_is_set(FLAG_RST) {
                return Err(Fail::ConnectionReset);
            }
            if seg.flag_is_set(FLAG_SYN) {
                debug!("handle_segments: in-window SYN on established connection, dropping");
                continue;
            }
            if !seg.flag_is_set(FLAG_ACK) {
                // Everything on an established connection carries an ACK.
                continue;
            }

            snd.handle_rcvd_segment(self, &seg);
            if rcv.handle_rcvd_segment(self, seg) {
                snd.send_ack(self, rcv);
            }
        }

        // Keep draining on the next pass if the queue is still non-empty.
        if !self.segment_queue.is_empty() {
            self.new_segment_waker.assert();
        }

        // Ack whatever the receiver consumed this round.
        if snd.max_sent_ack != rcv.rcv_nxt {
            snd.send_ack(self, rcv);
        }

        Ok(())
    }

    /// Moves queued user writes onto the sender's write list and sends what
    /// the window allows.
    fn handle_write(&self, snd: &mut Sender, rcv: &mut Receiver) {
        let views: Vec<View> = {
            let mut snd_queue = self.snd_queue.lock().unwrap();
            snd_queue.list.drain(..).collect()
        };

        if !views.is_empty() {
            let (route, id): (Option<Route>, TransportEndpointId) = {
                let core = self.core.lock().unwrap();
                (core.route.clone(), core.id.clone())
            };
            let route: Route = match route {
                Some(route) => route,
                None => return,
            };

            for v in views {
                snd.append_segment(Segment::from_view(&route, &id, v));
            }
        }

        snd.send_data(self, rcv);
    }

    fn handle_close(&self, snd: &mut Sender, rcv: &mut Receiver) {
        snd.closed = true;
        self.handle_write(snd, rcv);
    }

    /// Releases everything the endpoint holds once its worker (or a failed
    /// setup path) is done with it.
    pub(super) fn cleanup(&self, error: Option<Fail>) {
        let accepted: Option<AcceptedChan> = {
            let mut core = self.core.lock().unwrap();
            match error {
                Some(e) => {
                    core.hard_error = Some(e);
                    core.state = TcpState::Error;
                },
                None => core.state = TcpState::Closed,
            }

            if core.is_registered {
                self.stack.unregister_transport_endpoint(
                    core.bound_nic,
                    &core.effective_net_protos,
                    PROTOCOL_NUMBER,
                    &core.id,
                );
                core.is_registered = false;
            }
            if core.is_port_reserved {
                self.stack.port_manager().release_port(
                    &core.effective_net_protos,
                    PROTOCOL_NUMBER,
                    &core.bound_addr,
                    core.id.local_port,
                );
                core.is_port_reserved = false;
            }
            core.worker_running = false;
            core.accepted.take()
        };

        // Connections that were queued but never accepted get reset.
        if let Some(chan) = accepted {
            while let Ok(ep) = chan.rx.try_recv() {
                ep.abort();
            }
        }

        {
            let mut rcv_list = self.rcv_list.lock().unwrap();
            rcv_list.closed = true;
        }
        self.waiter_queue.notify(EVENT_IN | EVENT_OUT | EVENT_ERR | EVENT_HUP);
    }

    /// Resets a connection that never reached its owner: fire a RST at the
    /// peer and tear the endpoint down.
    pub(super) fn abort(&self) {
        if let Some((snd, rcv)) = self.worker_seed.lock().unwrap().take() {
            let _ = self.send_raw(None, FLAG_ACK | FLAG_RST, snd.snd_nxt, rcv.rcv_nxt, 0);
        }
        self.cleanup(Some(Fail::ConnectionAborted));
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Encodes and emits one TCP segment on the given route.
fn send_tcp(
    route: &Route,
    id: &TransportEndpointId,
    data: Option<&View>,
    options: &[u8],
    flags: u8,
    seq: SeqNumber,
    ack: SeqNumber,
    wnd: u16,
) -> Result<(), Fail> {
    let hdr_len: usize = TCP_MINIMUM_SIZE + options.len();
    debug_assert_eq!(hdr_len % 4, 0);

    let mut hdr: Prependable = Prependable::new(hdr_len + route.max_header_length());
    {
        let buf: &mut [u8] = hdr.prepend(hdr_len).expect("reserved headroom does not fit the tcp header");
        TcpHeader(&mut buf[..]).encode(&TcpFields {
            src_port: id.local_port,
            dst_port: id.remote_port,
            seq_num: seq,
            ack_num: ack,
            data_offset: hdr_len as u8,
            flags,
            window_size: wnd,
        });
        buf[TCP_MINIMUM_SIZE..].copy_from_slice(options);

        let mut xsum: u16 = route.pseudo_header_checksum(PROTOCOL_NUMBER);
        let length: u16 = (hdr_len + data.map(|d| d.len()).unwrap_or(0)) as u16;
        xsum = checksum::combine(xsum, length);
        if let Some(d) = data {
            xsum = checksum::checksum(d.as_slice(), xsum);
        }
        let sum: u16 = TcpHeader(&buf[..]).calculate_checksum(xsum);
        TcpHeader(&mut buf[..]).set_checksum(!sum);
    }

    route.write_packet(hdr, data.cloned(), PROTOCOL_NUMBER)
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Endpoint for TcpEndpoint {
    /// Reserves the port and records the local half of the id.
    fn bind(&self, addr: FullAddress) -> Result<(), Fail> {
        let mut core = self.core.lock().unwrap();
        if core.state != TcpState::Initial {
            return Err(Fail::AlreadyBound);
        }

        let net_protos: Vec<NetworkProtocolNumber> = vec![self.net_proto];
        let port: u16 = self
            .stack
            .port_manager()
            .reserve_port(&net_protos, PROTOCOL_NUMBER, &addr.addr, addr.port)?;

        core.id.local_port = port;
        core.id.local_address = addr.addr.clone();
        core.bound_addr = addr.addr;
        core.bound_nic = addr.nic;
        core.effective_net_protos = net_protos;
        core.is_port_reserved = true;
        core.state = TcpState::Bound;
        Ok(())
    }

    /// Registers the endpoint for SYN delivery and launches the listener
    /// worker.
    fn listen(&self, backlog: usize) -> Result<(), Fail> {
        let mut core = self.core.lock().unwrap();
        match core.state {
            TcpState::Bound => (),
            // Adjusting the backlog of an already-listening endpoint only
            // replaces the accept queue.
            TcpState::Listen => {
                let (tx, rx) = crossbeam_channel::bounded(backlog);
                core.accepted = Some(AcceptedChan { tx, rx });
                return Ok(());
            },
            _ => return Err(Fail::InvalidEndpointState),
        }

        let net_protos: Vec<NetworkProtocolNumber> = core.effective_net_protos.clone();
        let id: TransportEndpointId = core.id.clone();
        self.stack
            .register_transport_endpoint(core.bound_nic, &net_protos, PROTOCOL_NUMBER, &id, self.arc())?;
        core.is_registered = true;

        let (tx, rx) = crossbeam_channel::bounded(backlog);
        core.accepted = Some(AcceptedChan { tx, rx });
        core.state = TcpState::Listen;
        core.worker_running = true;
        drop(core);

        let rcv_wnd: u32 = self.rcv_list.lock().unwrap().buf_size as u32;
        let ep: Arc<TcpEndpoint> = self.arc();
        thread::spawn(move || ep.protocol_listen_loop(rcv_wnd));
        Ok(())
    }

    /// Returns an established connection from the accept queue, starting
    /// its worker on the way out.
    fn accept(&self) -> Result<(Arc<dyn Endpoint>, WaiterQueue), Fail> {
        let rx: crossbeam_channel::Receiver<Arc<TcpEndpoint>> = {
            let core = self.core.lock().unwrap();
            if core.state != TcpState::Listen {
                return Err(Fail::InvalidEndpointState);
            }
            match &core.accepted {
                Some(chan) => chan.rx.clone(),
                None => return Err(Fail::InvalidEndpointState),
            }
        };

        match rx.try_recv() {
            Ok(ep) => {
                ep.start_worker_if_needed();
                let wq: WaiterQueue = ep.waiter_queue.clone();
                Ok((ep as Arc<dyn Endpoint>, wq))
            },
            Err(_) => Err(Fail::WouldBlock),
        }
    }

    /// Starts connecting to the given peer. The reply is `ConnectStarted`;
    /// actual completion is delivered through the waiter queue once the
    /// worker finishes the handshake.
    fn connect(&self, addr: FullAddress) -> Result<(), Fail> {
        let mut core = self.core.lock().unwrap();
        match core.state {
            TcpState::Initial | TcpState::Bound => (),
            TcpState::Connecting => return Err(Fail::AlreadyConnecting),
            TcpState::Connected => return Err(Fail::AlreadyConnected),
            _ => return Err(Fail::InvalidEndpointState),
        }

        let nic: NicId = if addr.nic != 0 { addr.nic } else { core.bound_nic };
        let route: Route = self
            .stack
            .find_route(nic, &core.id.local_address, &addr.addr, self.net_proto)?;

        core.id.local_address = route.local_address.clone();
        core.id.remote_address = addr.addr.clone();
        core.id.remote_port = addr.port;

        let net_protos: Vec<NetworkProtocolNumber> = vec![self.net_proto];
        let ep: Arc<TcpEndpoint> = self.arc();
        if core.id.local_port != 0 {
            self.stack
                .register_transport_endpoint(nic, &net_protos, PROTOCOL_NUMBER, &core.id, ep)?;
        } else {
            // No local port yet: pick an ephemeral one by retrying the
            // registration until it takes.
            let id: TransportEndpointId = core.id.clone();
            let stack: Stack = self.stack.clone();
            let chosen: u16 = self.stack.port_manager().pick_ephemeral_port(|p| {
                let mut candidate: TransportEndpointId = id.clone();
                candidate.local_port = p;
                match stack.register_transport_endpoint(nic, &net_protos, PROTOCOL_NUMBER, &candidate, ep.clone()) {
                    Ok(()) => Ok(true),
                    Err(Fail::PortInUse) => Ok(false),
                    Err(e) => Err(e),
                }
            })?;
            core.id.local_port = chosen;
        }

        core.is_registered = true;
        core.bound_nic = nic;
        core.effective_net_protos = net_protos;
        core.route = Some(route);
        core.state = TcpState::Connecting;
        core.worker_running = true;
        drop(core);

        let ep: Arc<TcpEndpoint> = self.arc();
        thread::spawn(move || ep.protocol_main_loop(true));

        Err(Fail::ConnectStarted)
    }

    /// Returns the next view of in-order data. Does not block: with no
    /// data buffered the result is `WouldBlock`, or `ClosedForReceive`
    /// once the receive half is done.
    fn read(&self, _from: Option<&mut FullAddress>) -> Result<View, Fail> {
        let (v, window_opened): (View, bool) = {
            let mut rcv_list = self.rcv_list.lock().unwrap();

            if rcv_list.list.is_empty() {
                if rcv_list.closed {
                    return Err(Fail::ClosedForReceive);
                }
                return Err(Fail::WouldBlock);
            }

            let was_exhausted: bool = rcv_list.buf_used >= rcv_list.buf_size;

            let (v, segment_done): (View, bool) = {
                let front: &mut Segment = rcv_list.list.front_mut().expect("list is non-empty");
                let v: View = front.data.views()[front.view_to_deliver].clone();
                front.view_to_deliver += 1;
                (v, front.view_to_deliver >= front.data.views().len())
            };
            if segment_done {
                rcv_list.list.pop_front();
            }
            rcv_list.buf_used = rcv_list.buf_used.saturating_sub(v.len());

            (v, was_exhausted && rcv_list.buf_used < rcv_list.buf_size)
        };

        if window_opened {
            // The advertised window was pinched shut; have the worker
            // announce the newly freed space.
            self.notify_protocol_worker(NOTIFY_RECEIVE_WINDOW);
        }

        Ok(v)
    }

    /// Queues bytes for transmission and wakes the worker. Returns
    /// `WouldBlock` when the send buffer is out of space.
    fn write(&self, v: View, _to: Option<&FullAddress>) -> Result<usize, Fail> {
        {
            let core = self.core.lock().unwrap();
            match core.state {
                TcpState::Connected => (),
                TcpState::Error => return Err(core.hard_error.unwrap_or(Fail::ConnectionAborted)),
                _ => return Err(Fail::NotConnected),
            }
        }

        let len: usize = v.len();
        if len == 0 {
            return Ok(0);
        }

        {
            let mut snd_queue = self.snd_queue.lock().unwrap();
            if snd_queue.closed {
                return Err(Fail::ClosedForSend);
            }
            if snd_queue.buf_used >= snd_queue.buf_size {
                return Err(Fail::WouldBlock);
            }
            snd_queue.buf_used += len;
            snd_queue.list.push_back(v);
        }

        self.send_waker.assert();
        Ok(len)
    }

    fn shutdown(&self, flags: ShutdownFlags) -> Result<(), Fail> {
        {
            let core = self.core.lock().unwrap();
            match core.state {
                TcpState::Connected | TcpState::Connecting | TcpState::Listen => (),
                _ => return Err(Fail::NotConnected),
            }
        }

        if flags & SHUTDOWN_READ != 0 {
            {
                let mut rcv_list = self.rcv_list.lock().unwrap();
                rcv_list.closed = true;
            }
            self.waiter_queue.notify(EVENT_IN);
        }

        if flags & SHUTDOWN_WRITE != 0 {
            {
                let mut snd_queue = self.snd_queue.lock().unwrap();
                if snd_queue.closed {
                    return Err(Fail::ClosedForSend);
                }
                snd_queue.closed = true;
                // A zero-payload entry marks where the FIN goes.
                snd_queue.list.push_back(View::new(0));
            }
            self.send_close_waker.assert();
        }

        Ok(())
    }

    /// Initiates a graceful close. If the connection has not wound down
    /// within the grace period, the worker resets it.
    fn close(&self) {
        let _ = self.shutdown(SHUTDOWN_READ | SHUTDOWN_WRITE);

        let state: TcpState = {
            let core = self.core.lock().unwrap();
            core.state
        };
        match state {
            TcpState::Initial | TcpState::Bound => self.cleanup(None),
            TcpState::Listen => {
                self.notify_flags.fetch_or(NOTIFY_CLOSE, Ordering::SeqCst);
                self.accepted_close_waker.assert();
                self.notification_waker.assert();
            },
            TcpState::Connecting | TcpState::Connected => self.notify_protocol_worker(NOTIFY_CLOSE),
            TcpState::Closed | TcpState::Error => (),
        }
    }

    fn set_sock_opt(&self, opt: SockOpt) -> Result<(), Fail> {
        match opt {
            SockOpt::ReceiveBufferSize(n) => {
                {
                    let mut rcv_list = self.rcv_list.lock().unwrap();
                    rcv_list.buf_size = n;
                }
                self.segment_queue.set_limit(2 * n);
                Ok(())
            },
            SockOpt::SendBufferSize(n) => {
                let mut snd_queue = self.snd_queue.lock().unwrap();
                snd_queue.buf_size = n;
                Ok(())
            },
            SockOpt::Error(_) => Err(Fail::InvalidOptionValue),
        }
    }

    fn get_sock_opt(&self, opt: SockOptName) -> Result<SockOpt, Fail> {
        match opt {
            SockOptName::Error => {
                let mut core = self.core.lock().unwrap();
                Ok(SockOpt::Error(core.hard_error.take()))
            },
            SockOptName::ReceiveBufferSize => Ok(SockOpt::ReceiveBufferSize(self.rcv_list.lock().unwrap().buf_size)),
            SockOptName::SendBufferSize => Ok(SockOpt::SendBufferSize(self.snd_queue.lock().unwrap().buf_size)),
        }
    }
}

impl TransportEndpoint for TcpEndpoint {
    /// The stack's receive path: parse, enqueue, wake the worker. Producers
    /// drop silently when the segment queue is over its byte limit.
    fn handle_packet(&self, route: &Route, id: &TransportEndpointId, vv: VectorisedView) {
        let mut seg: Segment = Segment::new(route, id, &vv);
        if !seg.parse() {
            debug!("handle_packet: malformed segment, dropping");
            return;
        }

        if !self.segment_queue.enqueue(seg) {
            debug!("handle_packet: segment queue full, dropping");
            return;
        }
        self.new_segment_waker.assert();
    }
}
