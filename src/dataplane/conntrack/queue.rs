//! Send and receive byte queues of a tracked TCP flow
//!
//! Sequence numbers are 32-bit and wrap; all comparisons go through the
//! `seq_*` helpers.

use super::entry::{MAX_REMOTE_WINDOW_MSS, RMEM_MAX, SND_DEFAULT_MSS, WMEM_MAX};
use std::collections::{BTreeMap, VecDeque};
use tracing::trace;

/// `a` precedes `b` in sequence space
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// Broken bookkeeping inside a queue; the flow cannot continue
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueViolation {
    #[error("send queue starts at {front}, past the acknowledged sequence {ack}")]
    Uncovered { front: u32, ack: u32 },

    #[error("write after FIN was queued")]
    WriteAfterFin,

    #[error("data received after FIN")]
    DataAfterFin,
}

/// Contiguous byte range `[begin, end)` of a flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    begin: u32,
    data: Vec<u8>,
}

impl Segment {
    pub fn new(begin: u32, data: Vec<u8>) -> Self {
        Self { begin, data }
    }

    /// First sequence number (inclusive)
    pub fn begin(&self) -> u32 {
        self.begin
    }

    /// One past the last sequence number
    pub fn end(&self) -> u32 {
        self.begin.wrapping_add(self.data.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

// ========================================
// Send side
// ========================================

/// Bytes written by the application and not yet acknowledged by the peer
#[derive(Debug)]
pub struct SendQueue {
    queue: VecDeque<Segment>,
    size: usize,
    /// Next sequence number to be written
    latest_seq: u32,
    /// Lowest unacknowledged sequence number
    ack_seq: u32,
    /// One past the last byte handed out by `fetch`
    fetch_seq: u32,
    /// Peer's advertised window in bytes
    window: u32,
    mss: u32,
    /// Multiplier applied to window fields in ACKs
    window_scale: u32,
    fin_pending: bool,
    fin_acked: bool,
}

impl SendQueue {
    pub fn new(initial_seq: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            size: 0,
            latest_seq: initial_seq,
            ack_seq: initial_seq,
            fetch_seq: initial_seq,
            window: 0,
            mss: SND_DEFAULT_MSS,
            window_scale: 1,
            fin_pending: false,
            fin_acked: false,
        }
    }

    /// Configure from the peer's SYN: window, MSS and window-scale shift
    pub fn init(&mut self, window: u32, mss: u32, window_scale: u8) {
        self.mss = mss.max(1);
        self.window = window.min(MAX_REMOTE_WINDOW_MSS * self.mss);
        self.window_scale = 1 << window_scale.min(14);
    }

    /// Account for the SYN or FIN consuming one sequence number
    pub(crate) fn inc_all_seq(&mut self) {
        self.latest_seq = self.latest_seq.wrapping_add(1);
        self.ack_seq = self.ack_seq.wrapping_add(1);
        self.fetch_seq = self.fetch_seq.wrapping_add(1);
    }

    pub(crate) fn dec_all_seq(&mut self) {
        self.latest_seq = self.latest_seq.wrapping_sub(1);
        self.ack_seq = self.ack_seq.wrapping_sub(1);
        self.fetch_seq = self.fetch_seq.wrapping_sub(1);
    }

    /// Enqueue application bytes, returning how many were accepted
    pub fn write(&mut self, mut data: &[u8]) -> Result<usize, QueueViolation> {
        if self.fin_pending {
            return Err(QueueViolation::WriteAfterFin);
        }
        let mut total = 0;
        while !data.is_empty() {
            let len = data.len().min(self.mss as usize).min(WMEM_MAX - self.size);
            if len == 0 {
                break;
            }
            let (chunk, rest) = data.split_at(len);
            self.queue.push_back(Segment::new(self.latest_seq, chunk.to_vec()));
            self.latest_seq = self.latest_seq.wrapping_add(len as u32);
            self.size += len;
            total += len;
            data = rest;
        }
        Ok(total)
    }

    /// Unacknowledged bytes sliced into MSS-sized segments, at most one
    /// window in total, starting from the lowest unacknowledged byte
    pub fn fetch(&mut self) -> Result<Vec<Segment>, QueueViolation> {
        let unacked = self.latest_seq.wrapping_sub(self.ack_seq) as usize;
        let limit = unacked.min(self.window as usize);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(front) = self.queue.front() else {
            return Ok(Vec::new());
        };
        if seq_gt(front.begin(), self.ack_seq) {
            return Err(QueueViolation::Uncovered {
                front: front.begin(),
                ack: self.ack_seq,
            });
        }

        let mut bytes = Vec::with_capacity(limit);
        for segment in &self.queue {
            if bytes.len() >= limit {
                break;
            }
            if seq_le(segment.end(), self.ack_seq) {
                continue;
            }
            let skip = if seq_lt(segment.begin(), self.ack_seq) {
                self.ack_seq.wrapping_sub(segment.begin()) as usize
            } else {
                0
            };
            let take = (segment.len() - skip).min(limit - bytes.len());
            bytes.extend_from_slice(&segment.data()[skip..skip + take]);
        }

        let mut seq = self.ack_seq;
        let segments: Vec<Segment> = bytes
            .chunks(self.mss as usize)
            .map(|chunk| {
                let s = Segment::new(seq, chunk.to_vec());
                seq = s.end();
                s
            })
            .collect();
        self.fetch_seq = seq;
        Ok(segments)
    }

    /// Cumulative acknowledgement; repeating an ACK has no further effect
    /// and an older one does not touch the window either
    pub fn ack(&mut self, seq: u32, window: u16) {
        if self.fin_acked || seq_lt(seq, self.ack_seq) {
            return;
        }
        self.window = (window as u32)
            .saturating_mul(self.window_scale)
            .min(MAX_REMOTE_WINDOW_MSS * self.mss);

        let fin_seq = self.latest_seq.wrapping_add(1);
        if self.fin_pending && seq == fin_seq {
            trace!("FIN acknowledged");
            self.ack_seq = fin_seq;
            self.fetch_seq = fin_seq;
            self.fin_acked = true;
            self.queue.clear();
            self.size = 0;
            return;
        }

        let mut seq = seq;
        if seq_gt(seq, self.latest_seq) {
            // acknowledges bytes never sent, clamp to what was written
            match self.queue.back() {
                Some(last) => seq = last.end(),
                None => return,
            }
        }
        if seq_gt(seq, self.ack_seq) {
            self.ack_seq = seq;
        }
        while let Some(front) = self.queue.front() {
            if seq_gt(front.end(), self.ack_seq) {
                break;
            }
            self.size -= front.len();
            self.queue.pop_front();
        }
    }

    /// Mark the output side closed; a FIN follows the queued bytes
    pub fn close(&mut self) {
        self.fin_pending = true;
    }

    pub fn need_fin(&self) -> bool {
        self.fin_pending && !self.fin_acked
    }

    pub fn fin_acked(&self) -> bool {
        self.fin_acked
    }

    pub fn has_data(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn has_space(&self) -> bool {
        self.size < WMEM_MAX
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn latest_seq(&self) -> u32 {
        self.latest_seq
    }

    pub fn ack_seq(&self) -> u32 {
        self.ack_seq
    }

    pub fn fetch_seq(&self) -> u32 {
        self.fetch_seq
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn mss(&self) -> u32 {
        self.mss
    }
}

// ========================================
// Receive side
// ========================================

/// Bytes received from the peer, reassembled in sequence order
#[derive(Debug)]
pub struct ReceiveQueue {
    readable: VecDeque<u8>,
    /// Segments beyond a gap, keyed by their first sequence number
    reorder: BTreeMap<u32, Vec<u8>>,
    reorder_size: usize,
    expecting_seq: u32,
    /// Sequence number of the next byte the application reads
    read_seq: u32,
    closed: bool,
}

impl ReceiveQueue {
    pub fn new(expecting_seq: u32) -> Self {
        Self {
            readable: VecDeque::new(),
            reorder: BTreeMap::new(),
            reorder_size: 0,
            expecting_seq,
            read_seq: expecting_seq,
            closed: false,
        }
    }

    /// Insert a received segment; returns true if readable bytes grew
    pub fn store(&mut self, segment: Segment) -> Result<bool, QueueViolation> {
        if self.closed {
            return Err(QueueViolation::DataAfterFin);
        }
        if segment.is_empty() || seq_le(segment.end(), self.expecting_seq) {
            return Ok(false);
        }
        if self.readable.len() + self.reorder_size + segment.len() > RMEM_MAX {
            trace!("receive buffer full, segment dropped");
            return Ok(false);
        }
        if seq_gt(segment.begin(), self.expecting_seq) {
            let begin = segment.begin();
            let data = segment.into_data();
            let longer = self.reorder.get(&begin).is_none_or(|d| d.len() < data.len());
            if longer {
                self.reorder_size += data.len();
                if let Some(old) = self.reorder.insert(begin, data) {
                    self.reorder_size -= old.len();
                }
            }
            return Ok(false);
        }
        self.append(segment);
        self.drain_reorder();
        Ok(true)
    }

    fn append(&mut self, segment: Segment) {
        let skip = self.expecting_seq.wrapping_sub(segment.begin()) as usize;
        let end = segment.end();
        self.readable.extend(&segment.data()[skip..]);
        self.expecting_seq = end;
    }

    /// Move buffered segments that became contiguous into the readable region
    fn drain_reorder(&mut self) {
        loop {
            let next = self
                .reorder
                .iter()
                .find(|(begin, _)| seq_le(**begin, self.expecting_seq))
                .map(|(begin, _)| *begin);
            let Some(begin) = next else {
                break;
            };
            let Some(data) = self.reorder.remove(&begin) else {
                break;
            };
            self.reorder_size -= data.len();
            let segment = Segment::new(begin, data);
            if seq_gt(segment.end(), self.expecting_seq) {
                self.append(segment);
            }
        }
    }

    /// Drain up to `max_len` contiguous bytes
    pub fn read(&mut self, max_len: usize) -> Vec<u8> {
        let n = max_len.min(self.readable.len());
        let bytes: Vec<u8> = self.readable.drain(..n).collect();
        self.read_seq = self.read_seq.wrapping_add(n as u32);
        bytes
    }

    /// Account for the peer's FIN
    pub(crate) fn inc_expecting_seq(&mut self) {
        self.expecting_seq = self.expecting_seq.wrapping_add(1);
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_data(&self) -> bool {
        !self.readable.is_empty()
    }

    pub fn readable_len(&self) -> usize {
        self.readable.len()
    }

    pub fn expecting_seq(&self) -> u32 {
        self.expecting_seq
    }

    pub fn read_seq(&self) -> u32 {
        self.read_seq
    }

    /// Free buffer space advertised to the peer
    pub fn window(&self) -> u32 {
        RMEM_MAX.saturating_sub(self.readable.len() + self.reorder_size) as u32
    }
}
