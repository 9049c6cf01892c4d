// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::protocols::tcp::{
        endpoint::{
            TcpEndpoint,
            NOTIFY_CLOSE,
        },
        find_wnd_scale,
        receiver::Receiver,
        segment::{
            encode_syn_options,
            Segment,
            TcpSynOptions,
            FLAG_ACK,
            FLAG_RST,
            FLAG_SYN,
            TCP_MINIMUM_SIZE,
        },
        sender::Sender,
        sequence_number::SeqNumber,
        MAX_SEGMENTS_PER_WAKE,
        WAKER_FOR_NEW_SEGMENT,
        WAKER_FOR_NOTIFICATION,
    },
    runtime::{
        fail::Fail,
        sleep::Sleeper,
    },
};
use ::rand::Rng;
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

/// Initial SYN retransmission timeout.
const INITIAL_RTO: Duration = Duration::from_secs(1);

/// Total time we are willing to spend on a handshake.
const MAX_HANDSHAKE_TIME: Duration = Duration::from_secs(60);

//==============================================================================
// Structures
//==============================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum HandshakeState {
    SynSent,
    SynRcvd,
    Completed,
}

/// The three-way handshake state machine. Runs on the thread that will
/// become (or hand off to) the connection's worker.
pub struct Handshake {
    ep: Arc<TcpEndpoint>,
    state: HandshakeState,
    active: bool,
    /// The flags our next (re)transmitted SYN carries.
    flags: u8,
    /// Our initial sequence number.
    iss: SeqNumber,
    /// The peer's sequence number plus one, once known.
    ack_num: SeqNumber,
    /// The receive window we announce.
    rcv_wnd: u32,
    /// The window-scale shift we offer.
    rcv_wnd_scale: u8,
    /// The peer's advertised window, unscaled (windows on SYNs never are).
    snd_wnd: u32,
    /// The peer's MSS.
    mss: u16,
    /// The window-scale shift the peer offered; -1 for none.
    snd_wnd_scale: i8,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Handshake {
    /// Prepares an active (client) handshake with a random initial
    /// sequence number.
    pub fn new_active(ep: Arc<TcpEndpoint>, rcv_wnd: u32) -> Self {
        let iss: SeqNumber = SeqNumber::from(::rand::thread_rng().gen::<u32>());
        Self {
            ep,
            state: HandshakeState::SynSent,
            active: true,
            flags: FLAG_SYN,
            iss,
            ack_num: SeqNumber::from(0),
            rcv_wnd,
            rcv_wnd_scale: find_wnd_scale(rcv_wnd),
            snd_wnd: 0,
            mss: 0,
            snd_wnd_scale: -1,
        }
    }

    /// Prepares a passive (server) handshake already in SYN-RCVD state,
    /// with the cookie as our initial sequence number.
    pub fn new_passive(
        ep: Arc<TcpEndpoint>,
        cookie: SeqNumber,
        irs: SeqNumber,
        opts: &TcpSynOptions,
        rcv_wnd: u32,
    ) -> Self {
        Self {
            ep,
            state: HandshakeState::SynRcvd,
            active: false,
            flags: FLAG_SYN | FLAG_ACK,
            iss: cookie,
            ack_num: irs + 1,
            rcv_wnd,
            rcv_wnd_scale: find_wnd_scale(rcv_wnd),
            snd_wnd: 0,
            mss: opts.mss,
            snd_wnd_scale: opts.ws,
        }
    }

    /// The scale our announced windows are shifted by once the connection
    /// is established: zero unless both sides negotiated scaling.
    fn effective_rcv_wnd_scale(&self) -> u8 {
        if self.snd_wnd_scale < 0 {
            return 0;
        }
        self.rcv_wnd_scale
    }

    /// Builds the connection's sender and receiver from the completed
    /// handshake.
    pub fn into_sender_receiver(self) -> (Sender, Receiver) {
        debug_assert_eq!(self.state, HandshakeState::Completed);
        let scale: u8 = self.effective_rcv_wnd_scale();
        let irs: SeqNumber = SeqNumber::from(u32::from(self.ack_num).wrapping_sub(1));
        let snd: Sender = Sender::new(self.iss, irs, self.snd_wnd, self.mss, self.snd_wnd_scale);
        let rcv: Receiver = Receiver::new(irs, self.rcv_wnd, scale);
        (snd, rcv)
    }

    /// (Re)transmits our SYN or SYN-ACK, with the MSS and window-scale
    /// options.
    fn send_syn(&self) {
        // Offer scaling on a SYN-ACK only if the peer did.
        let ws: i8 = if self.active || self.snd_wnd_scale >= 0 {
            self.rcv_wnd_scale as i8
        } else {
            -1
        };
        let mss: u16 = (self.ep.route_mtu() as usize - TCP_MINIMUM_SIZE) as u16;
        let opts: Vec<u8> = encode_syn_options(mss, ws);

        // Windows on SYN segments are never scaled.
        let wnd: u16 = self.rcv_wnd.min(0xFFFF) as u16;
        if let Err(e) = self
            .ep
            .send_raw_with_options(None, &opts, self.flags, self.iss, self.ack_num, wnd)
        {
            debug!("send_syn: write failed: {:?}", e);
        }
    }

    fn handle_segment(&mut self, seg: Segment) -> Result<(), Fail> {
        if seg.flag_is_set(FLAG_RST) {
            return Err(Fail::ConnectionRefused);
        }

        match self.state {
            HandshakeState::SynSent => {
                if !seg.flag_is_set(FLAG_SYN) {
                    return Ok(());
                }

                self.ack_num = seg.seq_num + 1;
                self.mss = seg.parsed_options.mss;
                self.snd_wnd_scale = seg.parsed_options.ws;

                if seg.flag_is_set(FLAG_ACK) {
                    if seg.ack_num != self.iss + 1 {
                        // Acknowledges something we never sent.
                        debug!("handle_segment: bad ack on SYN-ACK, ignoring");
                        return Ok(());
                    }
                    self.snd_wnd = seg.window as u32;
                    self.state = HandshakeState::Completed;
                    self.flags |= FLAG_ACK;

                    // Complete with a pure ACK carrying our scaled window.
                    let wnd: u32 = self.rcv_wnd >> self.effective_rcv_wnd_scale();
                    let _ = self
                        .ep
                        .send_raw(None, FLAG_ACK, self.iss + 1, self.ack_num, wnd.min(0xFFFF) as u16);
                } else {
                    // Simultaneous open: answer the peer's SYN with a
                    // SYN-ACK and wait for ours to be acknowledged.
                    self.state = HandshakeState::SynRcvd;
                    self.flags |= FLAG_ACK;
                    self.send_syn();
                }
            },

            HandshakeState::SynRcvd => {
                if seg.flag_is_set(FLAG_SYN) {
                    if seg.seq_num + 1 != self.ack_num {
                        debug!("handle_segment: unexpected SYN in SYN-RCVD, ignoring");
                        return Ok(());
                    }
                    // A retransmitted SYN; remind the peer where we are.
                    self.send_syn();
                    return Ok(());
                }

                if seg.flag_is_set(FLAG_ACK) && seg.ack_num == self.iss + 1 {
                    self.snd_wnd = seg.window as u32;
                    self.state = HandshakeState::Completed;

                    // The completing ACK may already carry data; leave it
                    // for the connection's receiver.
                    if seg.data.size() > 0 {
                        self.ep.requeue_segment(seg);
                    }
                }
            },

            HandshakeState::Completed => (),
        }

        Ok(())
    }

    fn process_segments(&mut self) -> Result<(), Fail> {
        for _ in 0..MAX_SEGMENTS_PER_WAKE {
            let seg: Segment = match self.ep.dequeue_segment() {
                Some(seg) => seg,
                None => break,
            };
            self.handle_segment(seg)?;
            if self.state == HandshakeState::Completed {
                break;
            }
        }
        Ok(())
    }

    /// Runs the handshake to completion: sends our SYN, retransmits with
    /// exponential backoff, and processes the peer's answers. Fails with
    /// `Timeout` after sixty seconds and `Aborted` if the endpoint is
    /// closed underneath us.
    pub fn execute(&mut self) -> Result<(), Fail> {
        let sleeper: Sleeper = Sleeper::new();
        self.ep.add_worker_wakers_for_handshake(&sleeper, WAKER_FOR_NEW_SEGMENT, WAKER_FOR_NOTIFICATION);

        let start: Instant = Instant::now();
        let mut rto: Duration = INITIAL_RTO;
        self.send_syn();
        let mut deadline: Instant = Instant::now() + rto;

        while self.state != HandshakeState::Completed {
            match sleeper.fetch_before(deadline) {
                None => {
                    if start.elapsed() >= MAX_HANDSHAKE_TIME {
                        return Err(Fail::Timeout);
                    }
                    rto *= 2;
                    deadline = Instant::now() + rto;
                    self.send_syn();
                },
                Some(WAKER_FOR_NEW_SEGMENT) => self.process_segments()?,
                Some(WAKER_FOR_NOTIFICATION) => {
                    if self.ep.fetch_notifications() & NOTIFY_CLOSE != 0 {
                        return Err(Fail::Aborted);
                    }
                },
                Some(_) => (),
            }
        }

        Ok(())
    }
}
