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
//! Module to compute round trip times from paired ping and pong timestamps.
use std::{collections::BTreeSet, net::SocketAddr};

use crate::{
    cache::PairingKey,
    store::{Pipeline, Store, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    pub peer: SocketAddr,
    /// Pong minus ping timestamp in ms. May be zero or negative.
    pub rtt: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RttPass {
    pub pipeline: Pipeline,
    pub samples: Vec<RttSample>,
}

/// Computes RTT samples and maintains the sliding window `rtt:{ip}-{port}` of each peer, newest
/// sample first.
#[derive(Debug, Clone, Copy)]
pub struct RttCalculator {
    /// TTL of the sample lists in seconds.
    ttl: u64,
    /// Maximum number of samples kept per peer.
    rtt_count: usize,
}

impl RttCalculator {
    pub fn new(ttl: u64, rtt_count: usize) -> Self {
        Self { ttl, rtt_count }
    }

    /// Stage one sample for each pairing key that holds at least two timestamps.
    pub fn calculate<S: Store>(
        &self,
        store: &S,
        keys: &BTreeSet<PairingKey>,
    ) -> Result<RttPass, StoreError> {
        let mut pass = RttPass::default();
        for key in keys {
            let name = key.to_string();
            let timestamps = store.lrange(&name, 0, 1)?;
            let [ping, pong] = timestamps.as_slice() else {
                log::debug!("{name} holds {} timestamps, skipping", timestamps.len());
                continue;
            };
            let rtt = parse(&name, pong)? - parse(&name, ping)?;

            let rtt_key = key.rtt_key();
            pass.pipeline
                .lpush(rtt_key.as_str(), rtt)
                .ltrim(rtt_key.as_str(), 0, self.rtt_count as isize - 1)
                .expire(rtt_key, self.ttl);
            pass.samples.push(RttSample { peer: key.peer, rtt });
        }
        log::debug!("RTT samples: {}", pass.samples.len());
        Ok(pass)
    }
}

fn parse(key: &str, value: &str) -> Result<i64, StoreError> {
    value.parse().map_err(|_| StoreError::NotAnInteger {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::store::{Clock, MemoryStore};

    fn peer() -> SocketAddr {
        "10.0.0.1:8333".parse().unwrap()
    }

    fn store_with(entries: &[(PairingKey, &[i64])]) -> MemoryStore {
        let mut store = MemoryStore::with_clock(Clock::Fixed(0));
        let mut pipe = Pipeline::new();
        for (key, timestamps) in entries {
            for ts in timestamps.iter() {
                pipe.rpush(key.to_string(), ts);
            }
        }
        store.execute(pipe).unwrap();
        store
    }

    #[test]
    fn rtt_from_ping_and_pong() {
        let key = PairingKey::new(peer(), 7);
        let mut store = store_with(&[(key, &[2000, 2500][..])]);
        let pass = RttCalculator::new(10800, 36)
            .calculate(&store, &BTreeSet::from([key]))
            .unwrap();
        assert_eq!(pass.samples, vec![RttSample { peer: peer(), rtt: 500 }]);

        store.execute(pass.pipeline).unwrap();
        assert_eq!(store.lrange("rtt:10.0.0.1-8333", 0, -1).unwrap(), vec!["500"]);
        assert_eq!(store.ttl_ms("rtt:10.0.0.1-8333"), Some(10_800_000));
    }

    #[test]
    fn window_keeps_newest() {
        let first = PairingKey::new(peer(), 1);
        let second = PairingKey::new(peer(), 2);
        let mut store = store_with(&[(first, &[0, 10][..]), (second, &[100, 120][..])]);
        let mut old = Pipeline::new();
        old.rpush("rtt:10.0.0.1-8333", 1).rpush("rtt:10.0.0.1-8333", 2);
        store.execute(old).unwrap();

        let pass = RttCalculator::new(10800, 2)
            .calculate(&store, &BTreeSet::from([first, second]))
            .unwrap();
        store.execute(pass.pipeline).unwrap();
        assert_eq!(
            store.lrange("rtt:10.0.0.1-8333", 0, -1).unwrap(),
            vec!["20", "10"]
        );
    }

    #[test]
    fn single_timestamp_is_skipped() {
        let key = PairingKey::new(peer(), 7);
        let store = store_with(&[(key, &[2000][..])]);
        let pass = RttCalculator::new(10800, 36)
            .calculate(&store, &BTreeSet::from([key, PairingKey::new(peer(), 8)]))
            .unwrap();
        assert!(pass.samples.is_empty());
        assert!(pass.pipeline.is_empty());
    }

    #[test]
    fn negative_rtt_is_stored() {
        let key = PairingKey::new(peer(), 7);
        let mut store = store_with(&[(key, &[2500, 2000, 9000][..])]);
        let pass = RttCalculator::new(10800, 36)
            .calculate(&store, &BTreeSet::from([key]))
            .unwrap();
        store.execute(pass.pipeline).unwrap();
        assert_eq!(store.lrange("rtt:10.0.0.1-8333", 0, -1).unwrap(), vec!["-500"]);
    }
}
