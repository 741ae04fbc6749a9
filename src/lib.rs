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
//! Library for passive measurement of inventory propagation and peer latency from captured
//! Bitcoin P2P traffic.
pub mod cache;
pub mod config;
pub mod driver;
pub mod framer;
pub mod ingest;
pub mod protocol;
pub mod redis_store;
pub mod rtt;
pub mod store;
pub mod stream;
pub mod util;

pub mod prelude {
    pub use super::{
        cache::{ObservationCache, PairingKey},
        config::Config,
        driver::{IngestDriver, TickOutcome},
        framer::{Framed, Frames},
        ingest::{process_capture, CaptureSummary, IngestError},
        protocol::{BitcoinDecoder, Decoder, Message, Network},
        redis_store::RedisStore,
        rtt::RttCalculator,
        store::{MemoryStore, Pipeline, Store},
        stream::{extract_streams, FlowId, Stream},
    };
}
