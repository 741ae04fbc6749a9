// invtrace: Passive Measurement of Inventory Propagation and Peer Latency from Captured P2P Traffic
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Module to group captured TCP segments into per-flow byte streams.
//!
//! Every direction of a TCP connection is its own [`FlowId`]. Segments of a flow are drained in
//! ascending sequence number order, and each sequence number is delivered at most once. No TCP
//! semantics beyond that (acknowledgements, windows, retransmission timers, or sequence number
//! wrap-around) are modeled.
use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashSet},
    fmt,
    net::SocketAddr,
};

use bytes::Bytes;
use priority_queue::PriorityQueue;

use invtrace_utils::pcap_utils::TcpSegment;

/// Identifies one direction of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowId {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowId {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }

    /// The peer that sent the bytes of this flow.
    pub fn peer(&self) -> SocketAddr {
        self.src
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Segment {
    seq: u32,
    /// Capture timestamp in ms.
    timestamp: i64,
    payload: Bytes,
    /// Insertion index, breaks ties between equal sequence numbers.
    arrival: usize,
}

/// The segments captured on a single flow.
///
/// A `Stream` is an [`Iterator`] over its payloads in sequence order. Iterating consumes the
/// segments, so the stream cannot be restarted. After each call to `next`, [`Stream::timestamp`]
/// returns the capture timestamp of the segment just taken from the queue.
#[derive(Debug)]
pub struct Stream {
    flow: FlowId,
    queue: PriorityQueue<Segment, Reverse<(u32, usize)>>,
    delivered: HashSet<u32>,
    timestamp: i64,
    inserted: usize,
}

impl Stream {
    pub fn new(flow: FlowId) -> Self {
        Self {
            flow,
            queue: PriorityQueue::new(),
            delivered: HashSet::new(),
            timestamp: 0,
            inserted: 0,
        }
    }

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    /// Capture timestamp (in ms) of the segment most recently taken from the queue, or 0 if
    /// nothing was taken yet.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Number of queued segments, duplicates included.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a segment. Empty payloads carry nothing to reassemble and are ignored.
    pub fn push(&mut self, seq: u32, timestamp: i64, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        let arrival = self.inserted;
        self.inserted += 1;
        self.queue.push(
            Segment {
                seq,
                timestamp,
                payload,
                arrival,
            },
            Reverse((seq, arrival)),
        );
    }
}

impl Iterator for Stream {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        while let Some((segment, _)) = self.queue.pop() {
            self.timestamp = segment.timestamp;
            if !self.delivered.insert(segment.seq) {
                log::trace!("{}: dropping duplicate seq {}", self.flow, segment.seq);
                continue;
            }
            return Some(segment.payload);
        }
        None
    }
}

/// Build one [`Stream`] per flow that carries at least one non-empty segment. The map is ordered
/// by flow so that processing a capture twice yields the same sequence of decisions.
pub fn extract_streams(segments: impl IntoIterator<Item = TcpSegment>) -> BTreeMap<FlowId, Stream> {
    let mut streams: BTreeMap<FlowId, Stream> = BTreeMap::new();
    for segment in segments {
        if segment.payload.is_empty() {
            continue;
        }
        let timestamp = segment.timestamp_ms();
        let flow = FlowId::new(segment.src, segment.dst);
        streams
            .entry(flow)
            .or_insert_with(|| Stream::new(flow))
            .push(segment.seq, timestamp, segment.payload);
    }
    log::info!("Streams: {}", streams.len());
    streams
}
