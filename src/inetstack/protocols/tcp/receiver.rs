// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::inetstack::protocols::tcp::{
    endpoint::TcpEndpoint,
    segment::{
        Segment,
        FLAG_FIN,
    },
    sequence_number::SeqNumber,
};

//==============================================================================
// Structures
//==============================================================================

/// The state necessary to receive segments and turn them into a stream of
/// bytes. Owned exclusively by the endpoint's worker thread.
pub struct Receiver {
    /// The next sequence number expected from the peer. RCV.NXT in RFC 793
    /// terms.
    pub rcv_nxt: SeqNumber,

    /// One beyond the "largest" sequence number the peer has been told we
    /// are willing to accept. This can lag `rcv_nxt + window` when the
    /// user shrinks the receive buffer: the window is reduced as data
    /// arrives instead of being yanked back.
    pub rcv_acc: SeqNumber,

    pub rcv_wnd_scale: u8,

    /// Set once the peer's FIN has been consumed.
    pub closed: bool,

    /// Segments received ahead of `rcv_nxt`, ordered by sequence number.
    pending: Vec<Segment>,
    pending_buf_used: usize,
    pending_buf_size: usize,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Receiver {
    pub fn new(irs: SeqNumber, rcv_wnd: u32, rcv_wnd_scale: u8) -> Self {
        Self {
            rcv_nxt: irs + 1,
            rcv_acc: irs + rcv_wnd + 1,
            rcv_wnd_scale,
            closed: false,
            pending: Vec::new(),
            pending_buf_used: 0,
            pending_buf_size: rcv_wnd as usize,
        }
    }

    /// The RFC 793 acceptability test for an incoming segment.
    pub fn acceptable(&self, seg_seq: SeqNumber, seg_len: u32) -> bool {
        acceptable(self.rcv_nxt, self.rcv_acc, seg_seq, seg_len)
    }

    /// The `(ack, window)` pair to put on outgoing segments. Recomputes
    /// `rcv_acc` from the buffer space currently available, never letting
    /// it move backwards.
    pub fn get_send_params(&mut self, ep: &TcpEndpoint) -> (SeqNumber, u16) {
        let avail: u32 = ep.receive_buffer_available() as u32;
        let acc: SeqNumber = self.rcv_nxt + avail;
        if self.rcv_acc < acc {
            self.rcv_acc = acc;
        }

        let wnd: u32 = (self.rcv_acc - self.rcv_nxt) >> self.rcv_wnd_scale;
        (self.rcv_nxt, wnd.min(0xFFFF) as u16)
    }

    /// Handles one inbound segment. Returns true when the caller owes the
    /// peer an immediate ACK (out-of-window or out-of-order segment).
    pub fn handle_rcvd_segment(&mut self, ep: &TcpEndpoint, seg: Segment) -> bool {
        if self.closed {
            return false;
        }

        let seg_len: u32 = seg.logical_len();
        let seg_seq: SeqNumber = seg.seq_num;

        if !self.acceptable(seg_seq, seg_len) {
            // Out of window. The peer gets an ACK telling it where we are.
            return true;
        }

        let seg: Segment = match self.consume_segment(ep, seg) {
            None => {
                self.drain_pending(ep);
                return false;
            },
            Some(seg) => seg,
        };

        // The segment is ahead of rcv_nxt. Park it for later if it carries
        // anything and the pending buffer permits, and ack immediately so
        // the peer knows it may have to retransmit.
        if seg.logical_len() > 0 {
            if self.pending_buf_used < self.pending_buf_size {
                self.pending_buf_used += seg.logical_len() as usize;
                let pos: usize = self
                    .pending
                    .iter()
                    .position(|p| seg.seq_num < p.seq_num)
                    .unwrap_or(self.pending.len());
                self.pending.insert(pos, seg);
            }
            return true;
        }

        false
    }

    /// Attempts to consume a segment: trims any head duplication, hands the
    /// payload to the endpoint's delivery list, and advances `rcv_nxt`.
    /// Gives the segment back if it starts beyond `rcv_nxt`.
    fn consume_segment(&mut self, ep: &TcpEndpoint, mut seg: Segment) -> Option<Segment> {
        let seg_len: u32 = seg.logical_len();
        let seg_seq: SeqNumber = seg.seq_num;

        if seg_len > 0 {
            if !self.rcv_nxt.in_range(seg_seq, seg_seq + seg_len) {
                return Some(seg);
            }

            // Cut off data we already have.
            let duplicate: usize = (self.rcv_nxt - seg_seq).min(seg.data.size() as u32) as usize;
            seg.data.trim_front(duplicate);
            seg.seq_num = self.rcv_nxt;

            let fin: bool = seg.flag_is_set(FLAG_FIN);
            let data_len: u32 = seg.data.size() as u32;
            self.rcv_nxt = self.rcv_nxt + data_len;
            if data_len > 0 {
                ep.ready_to_read(Some(seg));
            }

            if fin {
                self.rcv_nxt = self.rcv_nxt + 1;
                self.closed = true;
                // Nothing out of order can matter anymore.
                self.pending.clear();
                self.pending_buf_used = 0;
                ep.ready_to_read(None);
            }
        } else if seg_seq != self.rcv_nxt {
            return Some(seg);
        }

        None
    }

    /// Moves any now-contiguous pending segments into the delivery list.
    fn drain_pending(&mut self, ep: &TcpEndpoint) {
        while !self.pending.is_empty() {
            let (f_seq, f_len): (SeqNumber, u32) = {
                let f: &Segment = &self.pending[0];
                (f.seq_num, f.logical_len())
            };

            // Segments entirely below rcv_nxt carry nothing new; drop them.
            let entirely_old: bool = f_len > 0 && (f_seq + f_len) <= self.rcv_nxt;
            let consumable: bool =
                entirely_old || (f_len > 0 && self.rcv_nxt.in_range(f_seq, f_seq + f_len)) || (f_len == 0 && f_seq == self.rcv_nxt);
            if !consumable {
                break;
            }

            let seg: Segment = self.pending.remove(0);
            self.pending_buf_used = self.pending_buf_used.saturating_sub(f_len as usize);
            if !entirely_old {
                let leftover: Option<Segment> = self.consume_segment(ep, seg);
                debug_assert!(leftover.is_none());
                if self.closed {
                    // consume_segment flushed the store on FIN.
                    break;
                }
            }
        }
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// The RFC 793 window test, on explicit state for testability:
///
/// ```text
/// Segment  Receive  Test
/// Length   Window
/// -------  -------  -------------------------------------------
///    0        0     SEG.SEQ = RCV.NXT
///    0       >0     RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
///   >0        0     not acceptable
///   >0       >0     RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
///                or RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
/// ```
pub fn acceptable(rcv_nxt: SeqNumber, rcv_acc: SeqNumber, seg_seq: SeqNumber, seg_len: u32) -> bool {
    let rcv_wnd: u32 = rcv_acc - rcv_nxt;

    if seg_len == 0 {
        if rcv_wnd == 0 {
            return seg_seq == rcv_nxt;
        }
        return seg_seq.in_range(rcv_nxt, rcv_acc);
    }

    if rcv_wnd == 0 {
        return false;
    }

    seg_seq.in_range(rcv_nxt, rcv_acc) || (seg_seq + (seg_len - 1)).in_range(rcv_nxt, rcv_acc)
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::acceptable;
    use crate::inetstack::protocols::tcp::SeqNumber;
    use ::anyhow::Result;

    fn s(v: u32) -> SeqNumber {
        SeqNumber::from(v)
    }

    #[test]
    fn zero_length_zero_window() -> Result<()> {
        crate::ensure_eq!(acceptable(s(790), s(790), s(790), 0), true);
        crate::ensure_eq!(acceptable(s(790), s(790), s(791), 0), false);
        Ok(())
    }

    #[test]
    fn zero_length_open_window() -> Result<()> {
        crate::ensure_eq!(acceptable(s(790), s(800), s(790), 0), true);
        crate::ensure_eq!(acceptable(s(790), s(800), s(799), 0), true);
        crate::ensure_eq!(acceptable(s(790), s(800), s(800), 0), false);
        crate::ensure_eq!(acceptable(s(790), s(800), s(789), 0), false);
        Ok(())
    }

    #[test]
    fn data_zero_window_never_acceptable() -> Result<()> {
        crate::ensure_eq!(acceptable(s(790), s(790), s(790), 1), false);
        Ok(())
    }

    #[test]
    fn data_overlapping_window() -> Result<()> {
        // Fully inside.
        crate::ensure_eq!(acceptable(s(790), s(800), s(793), 3), true);
        // Starts before the window but overlaps it.
        crate::ensure_eq!(acceptable(s(790), s(800), s(788), 5), true);
        // Entirely old.
        crate::ensure_eq!(acceptable(s(790), s(800), s(780), 5), false);
        // Starts at the right edge.
        crate::ensure_eq!(acceptable(s(790), s(800), s(800), 3), false);
        // Tail pokes past the right edge, head inside.
        crate::ensure_eq!(acceptable(s(790), s(800), s(798), 5), true);
        Ok(())
    }

    #[test]
    fn wrap_around_window() -> Result<()> {
        let nxt: SeqNumber = s(0xfffffffa);
        let acc: SeqNumber = s(10);
        crate::ensure_eq!(acceptable(nxt, acc, s(0xfffffffa), 4), true);
        crate::ensure_eq!(acceptable(nxt, acc, s(2), 4), true);
        crate::ensure_eq!(acceptable(nxt, acc, s(10), 4), false);
        Ok(())
    }
}
