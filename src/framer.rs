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
//! Module to cut the byte stream of a flow into protocol messages.
use bytes::{Bytes, BytesMut};

use crate::{
    protocol::{Decoder, Message},
    stream::{FlowId, Stream},
};

/// A decoded message together with the flow it was observed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    pub flow: FlowId,
    /// Capture timestamp (ms) of the chunk that last extended the buffer.
    pub timestamp: i64,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub messages: usize,
    pub incomplete: usize,
    pub malformed: usize,
    /// Bytes dropped on malformed frames or left undecoded at the end of the stream.
    pub dropped_bytes: usize,
}

impl std::ops::AddAssign for FrameStats {
    fn add_assign(&mut self, rhs: Self) {
        self.messages += rhs.messages;
        self.incomplete += rhs.incomplete;
        self.malformed += rhs.malformed;
        self.dropped_bytes += rhs.dropped_bytes;
    }
}

/// An iterator over all messages of a single [`Stream`].
///
/// The iterator keeps one growing buffer:
/// - After a message is decoded, decoding continues on the remaining bytes without pulling a new
///   chunk.
/// - If the buffer holds an incomplete frame, the next chunk is appended.
/// - If the buffer does not start with a valid frame, the whole buffer is dropped and replaced by
///   the next chunk. Valid frames that follow the malformed one within the same buffer are lost.
///
/// The iterator ends when more bytes are needed but the stream is exhausted. Undecoded bytes are
/// dropped silently.
pub struct Frames<'a, D> {
    stream: Stream,
    decoder: &'a D,
    buffer: Option<Bytes>,
    stats: FrameStats,
}

impl<'a, D: Decoder> Frames<'a, D> {
    pub fn new(stream: Stream, decoder: &'a D) -> Self {
        Self {
            stream,
            decoder,
            buffer: None,
            stats: FrameStats::default(),
        }
    }

    pub fn flow(&self) -> FlowId {
        self.stream.flow()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }
}

impl<D: Decoder> Iterator for Frames<'_, D> {
    type Item = Framed;

    fn next(&mut self) -> Option<Framed> {
        let flow = self.stream.flow();
        loop {
            let mut data = match self.buffer.take() {
                Some(data) => data,
                // only the case before the first chunk, or after the stream is exhausted
                None => self.stream.next()?,
            };

            match self.decoder.decode(&mut data) {
                Ok(message) => {
                    self.stats.messages += 1;
                    if !data.is_empty() {
                        self.buffer = Some(data);
                    }
                    return Some(Framed {
                        flow,
                        timestamp: self.stream.timestamp(),
                        message,
                    });
                }
                Err(e) if e.is_incomplete() => {
                    log::debug!("{flow}: {e}");
                    self.stats.incomplete += 1;
                    let Some(chunk) = self.stream.next() else {
                        self.stats.dropped_bytes += data.len();
                        return None;
                    };
                    let mut bytes = BytesMut::from(data);
                    bytes.extend_from_slice(&chunk);
                    self.buffer = Some(bytes.freeze());
                }
                Err(e) => {
                    log::debug!("{flow}: {e}, dropping {} bytes", data.len());
                    self.stats.malformed += 1;
                    self.stats.dropped_bytes += data.len();
                    self.buffer = Some(self.stream.next()?);
                }
            }
        }
    }
}
