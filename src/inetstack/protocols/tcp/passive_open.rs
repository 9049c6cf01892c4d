// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The listener side of TCP. A listening endpoint keeps no per-connection
//! state before a handshake completes: the state it would need is encoded
//! into the SYN cookie it sends as its initial sequence number. Each
//! inbound SYN is handled by a short-lived thread that completes the
//! handshake and queues the new endpoint for `accept`.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::{
        protocols::tcp::{
            cookie::{
                encode_mss,
                CookieContext,
                MSS_TABLE,
            },
            endpoint::{
                TcpEndpoint,
                TcpState,
                NOTIFY_CLOSE,
            },
            handshake::Handshake,
            receiver::Receiver,
            segment::{
                Segment,
                TcpSynOptions,
                FLAG_ACK,
                FLAG_SYN,
            },
            sender::Sender,
            sequence_number::SeqNumber,
            MAX_SEGMENTS_PER_WAKE,
            PROTOCOL_NUMBER,
            WAKER_FOR_ACCEPTED_CLOSE,
            WAKER_FOR_NEW_SEGMENT,
            WAKER_FOR_NOTIFICATION,
        },
        types::NetworkProtocolNumber,
        Stack,
    },
    runtime::{
        fail::Fail,
        sleep::Sleeper,
        waiter::{
            WaiterQueue,
            EVENT_IN,
        },
    },
};
use ::crossbeam_channel;
use ::std::{
    sync::Arc,
    thread,
};

//==============================================================================
// Structures
//==============================================================================

/// State a listening endpoint shares with its per-SYN handshake threads.
pub(super) struct ListenContext {
    stack: Stack,
    net_proto: NetworkProtocolNumber,
    rcv_wnd: u32,
    cookie: CookieContext,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl ListenContext {
    fn new(stack: Stack, net_proto: NetworkProtocolNumber, rcv_wnd: u32) -> Self {
        Self {
            stack,
            net_proto,
            rcv_wnd,
            cookie: CookieContext::new(),
        }
    }

    /// Creates a new endpoint in connected state, registered under the
    /// segment's four-tuple.
    fn create_connected_endpoint(&self, s: &Segment) -> Result<Arc<TcpEndpoint>, Fail> {
        let n: Arc<TcpEndpoint> = TcpEndpoint::new(self.stack.clone(), self.net_proto, WaiterQueue::new());

        {
            let mut core = n.core.lock().unwrap();
            core.id = s.id.clone();
            core.bound_nic = s.route.nic_id();
            core.route = Some(s.route.clone());
            core.effective_net_protos = vec![self.net_proto];

            // Register the new endpoint so packets are routed to it.
            self.stack.register_transport_endpoint(
                core.bound_nic,
                &core.effective_net_protos,
                PROTOCOL_NUMBER,
                &core.id,
                n.clone(),
            )?;
            core.is_registered = true;
            core.state = TcpState::Connected;
        }

        Ok(n)
    }
}

impl TcpEndpoint {
    /// The main loop of a listening endpoint. Runs in its own thread and
    /// is responsible for handling connection requests.
    pub(super) fn protocol_listen_loop(self: Arc<Self>, rcv_wnd: u32) {
        let ctx: Arc<ListenContext> = Arc::new(ListenContext::new(self.stack.clone(), self.net_proto, rcv_wnd));

        let sleeper: Sleeper = Sleeper::new();
        sleeper.add_waker(&self.notification_waker, WAKER_FOR_NOTIFICATION);
        sleeper.add_waker(&self.new_segment_waker, WAKER_FOR_NEW_SEGMENT);
        sleeper.add_waker(&self.accepted_close_waker, WAKER_FOR_ACCEPTED_CLOSE);

        loop {
            match sleeper.fetch(true) {
                Some(WAKER_FOR_NOTIFICATION) => {
                    if self.fetch_notifications() & NOTIFY_CLOSE != 0 {
                        break;
                    }
                },
                Some(WAKER_FOR_ACCEPTED_CLOSE) => break,
                Some(WAKER_FOR_NEW_SEGMENT) => {
                    // Process at most a batch of segments per wake-up.
                    let mut may_requeue: bool = true;
                    for _ in 0..MAX_SEGMENTS_PER_WAKE {
                        match self.dequeue_segment() {
                            Some(s) => self.handle_listen_segment(&ctx, s),
                            None => {
                                may_requeue = false;
                                break;
                            },
                        }
                    }

                    // If segments remain, make sure the next iteration
                    // wakes up.
                    if may_requeue && !self.segment_queue_is_empty() {
                        self.new_segment_waker.assert();
                    }
                },
                _ => (),
            }
        }

        self.cleanup(None);
    }

    fn handle_listen_segment(&self, ctx: &Arc<ListenContext>, s: Segment) {
        if s.flag_is_set(FLAG_SYN) && !s.flag_is_set(FLAG_ACK) {
            let ctx: Arc<ListenContext> = ctx.clone();
            let listener: Arc<TcpEndpoint> = self.arc();
            thread::spawn(move || listener.handle_syn_segment(ctx, s));
            return;
        }

        if s.flag_is_set(FLAG_ACK) {
            // A bare ACK with no connection behind it: this is only
            // legitimate if it acknowledges a cookie we handed out, in
            // which case it carries everything needed to reconstitute the
            // connection.
            let iss: SeqNumber = SeqNumber::from(u32::from(s.ack_num).wrapping_sub(1));
            let irs: SeqNumber = SeqNumber::from(u32::from(s.seq_num).wrapping_sub(1));

            let (data, ok): (u32, bool) = ctx.cookie.is_cookie_valid(&s.id, iss, irs);
            if !ok {
                debug!("handle_listen_segment: invalid cookie on ACK, dropping");
                return;
            }

            let mss: u16 = MSS_TABLE[(data & 0x3) as usize];
            let n: Arc<TcpEndpoint> = match ctx.create_connected_endpoint(&s) {
                Ok(n) => n,
                Err(e) => {
                    debug!("handle_listen_segment: endpoint creation failed: {:?}", e);
                    return;
                },
            };

            // The cookie path never saw the peer's window-scale offer, so
            // neither side scales.
            let snd: Sender = Sender::new(iss, irs, s.window as u32, mss, -1);
            let rcv: Receiver = Receiver::new(irs, ctx.rcv_wnd, 0);
            *n.worker_seed.lock().unwrap() = Some((snd, rcv));

            // Any payload on the ACK waits in the queue for the worker.
            if s.data.size() > 0 {
                n.requeue_segment(s);
            }

            self.deliver_accepted(n);
        }
    }

    /// Runs in its own thread once the listener receives a SYN: completes
    /// the handshake and queues the new endpoint for acceptance.
    fn handle_syn_segment(self: Arc<Self>, ctx: Arc<ListenContext>, s: Segment) {
        let opts: TcpSynOptions = s.parsed_options;
        let irs: SeqNumber = s.seq_num;
        let cookie: SeqNumber = ctx.cookie.create_cookie(&s.id, irs, encode_mss(opts.mss));

        let n: Arc<TcpEndpoint> = match ctx.create_connected_endpoint(&s) {
            Ok(n) => n,
            Err(e) => {
                debug!("handle_syn_segment: endpoint creation failed: {:?}", e);
                return;
            },
        };

        let mut handshake: Handshake = Handshake::new_passive(n.clone(), cookie, irs, &opts, ctx.rcv_wnd);
        if let Err(e) = handshake.execute() {
            debug!("handle_syn_segment: handshake failed: {:?}", e);
            n.cleanup(Some(e));
            return;
        }

        *n.worker_seed.lock().unwrap() = Some(handshake.into_sender_receiver());
        self.deliver_accepted(n);
    }

    /// Delivers a newly-established endpoint to the listener's accept
    /// queue. If the listener is no longer listening, the connection is
    /// reset instead.
    fn deliver_accepted(&self, n: Arc<TcpEndpoint>) {
        let tx: Option<crossbeam_channel::Sender<Arc<TcpEndpoint>>> = {
            let core = self.core.lock().unwrap();
            if core.state == TcpState::Listen {
                core.accepted.as_ref().map(|chan| chan.tx.clone())
            } else {
                None
            }
        };

        match tx {
            Some(tx) => {
                // Blocks while the backlog is full; that is the throttle.
                if tx.send(n).is_ok() {
                    self.waiter_queue.notify(EVENT_IN);
                }
            },
            None => n.abort(),
        }
    }
}
