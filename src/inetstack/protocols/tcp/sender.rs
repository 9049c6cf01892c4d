// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::protocols::tcp::{
        endpoint::TcpEndpoint,
        receiver::Receiver,
        segment::{
            Segment,
            FLAG_ACK,
            FLAG_FIN,
        },
        sequence_number::SeqNumber,
    },
    runtime::{
        fail::Fail,
        memory::View,
    },
};
use ::std::{
    collections::VecDeque,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Floor for the retransmission timeout.
const MIN_RTO: Duration = Duration::from_millis(200);

/// Once the backed-off RTO exceeds this, the connection is given up on.
const MAX_RTO: Duration = Duration::from_secs(60);

//==============================================================================
// Structures
//==============================================================================

/// The state necessary to send segments. Owned exclusively by the
/// endpoint's worker thread.
///
/// Invariant: `snd_una <= snd_nxt <= snd_nxt_list`.
pub struct Sender {
    /// The send window size, in bytes, already scaled.
    pub snd_wnd: u32,

    /// The oldest unacknowledged sequence number. SND.UNA in RFC 793 terms.
    pub snd_una: SeqNumber,

    /// The sequence number of the next segment to be sent. SND.NXT.
    pub snd_nxt: SeqNumber,

    /// The sequence number of the next segment to be added to the write
    /// list.
    pub snd_nxt_list: SeqNumber,

    /// The sequence number being used for the latest RTT measurement, and
    /// the time its segment was sent.
    rtt_measure_seq_num: SeqNumber,
    rtt_measure_time: Instant,

    /// Set once the user has shut down the send half and the FIN marker has
    /// been taken onto the write list.
    pub closed: bool,

    /// Segments assigned sequence numbers but not yet fully acknowledged,
    /// plus segments still waiting for a number. Entries ahead of
    /// `write_next` are retransmissions.
    write_list: VecDeque<Segment>,
    write_next: usize,

    // Smoothed round-trip time, variation, and retransmission timeout, as
    // defined in RFC 6298.
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
    srtt_inited: bool,

    /// The maximum payload of a single segment.
    pub max_payload_size: usize,

    /// Shift applied to window advertisements from the peer.
    snd_wnd_scale: u8,

    /// The "largest" acknowledgement actually put on the wire.
    pub max_sent_ack: SeqNumber,

    /// When set, the retransmission timer is armed for this instant.
    pub resend_deadline: Option<Instant>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Sender {
    /// `snd_wnd` is the raw window from the peer's SYN, which is never
    /// scaled. A negative `snd_wnd_scale` means the peer offered no
    /// scaling.
    pub fn new(iss: SeqNumber, irs: SeqNumber, snd_wnd: u32, mss: u16, snd_wnd_scale: i8) -> Self {
        Self {
            snd_wnd,
            snd_una: iss + 1,
            snd_nxt: iss + 1,
            snd_nxt_list: iss + 1,
            rtt_measure_seq_num: iss + 1,
            rtt_measure_time: Instant::now(),
            closed: false,
            write_list: VecDeque::new(),
            write_next: 0,
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            rto: Duration::from_secs(1),
            srtt_inited: false,
            max_payload_size: mss as usize,
            snd_wnd_scale: if snd_wnd_scale > 0 { snd_wnd_scale as u8 } else { 0 },
            max_sent_ack: irs + 1,
            resend_deadline: None,
        }
    }

    /// Appends an unnumbered segment to the write list. A zero-length
    /// segment is the end-of-send marker and consumes one sequence
    /// position for its FIN.
    pub fn append_segment(&mut self, seg: Segment) {
        let size: usize = seg.data.size();
        self.snd_nxt_list = self.snd_nxt_list + if size == 0 { 1 } else { size as u32 };
        self.write_list.push_back(seg);
    }

    /// Sends an ACK segment reflecting the receiver's current state.
    pub fn send_ack(&mut self, ep: &TcpEndpoint, rcv: &mut Receiver) {
        let seq: SeqNumber = self.snd_nxt;
        self.send_segment(ep, rcv, None, FLAG_ACK, seq);
    }

    /// Sends new data segments, and retransmissions when `write_next` has
    /// been rewound. Called when data becomes available or the send window
    /// opens up.
    pub fn send_data(&mut self, ep: &TcpEndpoint, rcv: &mut Receiver) {
        let end: SeqNumber = self.snd_una + self.snd_wnd;

        while self.write_next < self.write_list.len() {
            let i: usize = self.write_next;

            // The flags field doubles as the "sequence number assigned"
            // marker.
            if self.write_list[i].flags == 0 {
                self.write_list[i].seq_num = self.snd_nxt;
                self.write_list[i].flags = FLAG_ACK;
            }

            let seq: SeqNumber = self.write_list[i].seq_num;
            let size: u32 = self.write_list[i].data.size() as u32;
            let seg_end: SeqNumber;
            if size == 0 {
                // The zero-length marker carries our FIN. RFC 793 permits
                // sending it even at a closed window.
                self.write_list[i].flags = FLAG_ACK | FLAG_FIN;
                seg_end = seq + 1;
            } else {
                if !(seq < end) {
                    break;
                }
                if size > seq.size_to(end) {
                    break;
                }
                seg_end = seq + size;
            }

            let flags: u8 = self.write_list[i].flags;
            let payload: Option<View> = if size > 0 {
                Some(self.write_list[i].data.first().clone())
            } else {
                None
            };

            let now: Instant = Instant::now();
            let new_data: bool = self.snd_nxt < seg_end;
            if new_data && self.rtt_measure_seq_num.in_range(seq, seg_end) {
                self.rtt_measure_time = now;
            }

            self.send_segment(ep, rcv, payload.as_ref(), flags, seq);

            // snd_nxt only advances for new data, not for retransmissions.
            if new_data {
                self.snd_nxt = seg_end;
            }
            self.write_next += 1;
        }

        if self.resend_deadline.is_none() && self.snd_una != self.snd_nxt {
            self.resend_deadline = Some(Instant::now() + self.rto);
        }
    }

    /// Updates send-side state from a received segment: the peer's window
    /// advertisement and any newly acknowledged data.
    pub fn handle_rcvd_segment(&mut self, ep: &TcpEndpoint, seg: &Segment) {
        // Stash away the advertised window, scaled if the peer negotiated a
        // scale factor on the handshake.
        self.snd_wnd = (seg.window as u32) << self.snd_wnd_scale;

        let ack: SeqNumber = seg.ack_num;
        let ack_m1: SeqNumber = SeqNumber::from(u32::from(ack).wrapping_sub(1));
        if !ack_m1.in_range(self.snd_una, self.snd_nxt) {
            // Acknowledges nothing new.
            return;
        }

        // Take an RTT sample when the measured byte is covered.
        if self.rtt_measure_seq_num < ack {
            self.update_rto(self.rtt_measure_time.elapsed());
            self.rtt_measure_seq_num = self.snd_nxt;
        }

        let acked: u32 = self.snd_una.size_to(ack);
        self.snd_una = ack;

        // Remove acknowledged data from the write list. FIN markers carry
        // no data but consume one position, hence logical lengths.
        let mut ack_left: u32 = acked;
        let mut freed: usize = 0;
        while ack_left > 0 {
            match self.write_list.front_mut() {
                Some(front) => {
                    let data_len: u32 = front.logical_len();
                    if data_len > ack_left {
                        front.data.trim_front(ack_left as usize);
                        // Keep the number aligned for retransmission.
                        front.seq_num = front.seq_num + ack_left;
                        freed += ack_left as usize;
                        break;
                    }
                    freed += front.data.size();
                    self.write_list.pop_front();
                    if self.write_next > 0 {
                        self.write_next -= 1;
                    }
                    ack_left -= data_len;
                },
                None => {
                    debug_assert!(false, "acknowledged bytes beyond the write list");
                    break;
                },
            }
        }

        // Acknowledged bytes free up send-buffer space for blocked writers.
        if freed > 0 {
            ep.on_send_buffer_freed(freed);
        }

        if self.snd_una == self.snd_nxt {
            // Nothing outstanding: no need for a retransmission timer.
            self.resend_deadline = None;
        } else {
            self.resend_deadline = Some(Instant::now() + self.rto);
        }
    }

    /// The retransmission deadline fired: back the timer off and rewind to
    /// the front of the write list so `send_data` resends outstanding
    /// segments. Fails with `Timeout` once the backoff exceeds the bound.
    pub fn retransmit_timer_expired(&mut self, ep: &TcpEndpoint, rcv: &mut Receiver) -> Result<(), Fail> {
        self.resend_deadline = None;
        if self.snd_una == self.snd_nxt {
            // Everything was acknowledged in the meantime.
            return Ok(());
        }

        self.rto = self.rto * 2;
        if self.rto > MAX_RTO {
            return Err(Fail::Timeout);
        }

        // No RTT samples from retransmitted data.
        self.rtt_measure_seq_num = self.snd_nxt;

        self.write_next = 0;
        self.send_data(ep, rcv);
        Ok(())
    }

    fn send_segment(&mut self, ep: &TcpEndpoint, rcv: &mut Receiver, data: Option<&View>, flags: u8, seq: SeqNumber) {
        let (ack, wnd): (SeqNumber, u16) = rcv.get_send_params(ep);
        if let Err(e) = ep.send_raw(data, flags, seq, ack, wnd) {
            debug!("send_segment: write failed: {:?}", e);
        }
        self.max_sent_ack = ack;
    }

    fn update_rto(&mut self, rtt: Duration) {
        if !self.srtt_inited {
            self.srtt = rtt;
            self.rttvar = rtt / 2;
            self.srtt_inited = true;
        } else {
            let diff: Duration = if self.srtt > rtt { self.srtt - rtt } else { rtt - self.srtt };
            self.rttvar = (self.rttvar * 3 + diff) / 4;
            self.srtt = (self.srtt * 7 + rtt) / 8;
        }

        self.rto = self.srtt + (self.rttvar * 4).max(MIN_RTO);
        if self.rto < MIN_RTO {
            self.rto = MIN_RTO;
        }
    }
}
