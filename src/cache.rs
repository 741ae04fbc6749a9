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
//! Module to turn decoded messages into staged store mutations.
//!
//! Keys written by this module:
//! - `inv:{type}:{hash}`: sorted set of the peers that announced the item, scored by the time
//!   (ms) of their latest announcement. Expires `ttl` seconds after the last update.
//! - `rinv:{type}:{hash}`: time (ms) a block was announced first. Written once, never expires.
//! - `lastblockhash`: hash of the block that was most recently announced for the first time.
//! - `ping:{ip}-{port}:{nonce}`: timestamps of a ping and its pong. Created by the pinger; pongs
//!   are only appended to existing lists.
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    net::SocketAddr,
};

use crate::{
    framer::Framed,
    protocol::{InvEntry, Message},
    store::{Pipeline, Store, StoreError},
};

pub const LAST_BLOCK_HASH: &str = "lastblockhash";

pub fn inv_key(entry: &InvEntry) -> String {
    format!("inv:{}:{}", entry.inv_type, entry.hash)
}

pub fn first_seen_key(entry: &InvEntry) -> String {
    format!("rinv:{}:{}", entry.inv_type, entry.hash)
}

/// Name of a peer as used in keys and set members.
pub fn peer_name(peer: SocketAddr) -> String {
    format!("{}-{}", peer.ip(), peer.port())
}

pub fn rtt_key(peer: SocketAddr) -> String {
    format!("rtt:{}", peer_name(peer))
}

/// Key of the list that pairs a ping with its pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairingKey {
    pub peer: SocketAddr,
    pub nonce: u64,
}

impl PairingKey {
    pub fn new(peer: SocketAddr, nonce: u64) -> Self {
        Self { peer, nonce }
    }

    pub fn rtt_key(&self) -> String {
        rtt_key(self.peer)
    }
}

impl fmt::Display for PairingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ping:{}:{}", peer_name(self.peer), self.nonce)
    }
}

/// Everything the cache collected for one capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observations {
    pub pipeline: Pipeline,
    /// Pairing keys a pong was appended to.
    pub pairing_keys: BTreeSet<PairingKey>,
    /// Inventory entries plus pongs processed.
    pub count: u64,
}

/// Applies the rules for `inv` and `pong` messages. Reads go to the store right away, writes are
/// staged until [`ObservationCache::finish`].
pub struct ObservationCache<'s, S> {
    store: &'s S,
    /// TTL in seconds.
    ttl: u64,
    pipeline: Pipeline,
    /// First-seen times staged in this batch, which the store does not know yet.
    first_seen: HashMap<String, i64>,
    pairing_keys: BTreeSet<PairingKey>,
    count: u64,
}

impl<'s, S: Store> ObservationCache<'s, S> {
    pub fn new(store: &'s S, ttl: u64) -> Self {
        Self {
            store,
            ttl,
            pipeline: Pipeline::new(),
            first_seen: HashMap::new(),
            pairing_keys: BTreeSet::new(),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn observe(&mut self, framed: &Framed) -> Result<(), StoreError> {
        let peer = framed.flow.peer();
        match &framed.message {
            Message::Inv { entries, count } => {
                for entry in entries {
                    self.observe_inv(peer, framed.timestamp, entry)?;
                }
                self.count += count;
            }
            Message::Pong { nonce } => {
                self.observe_pong(PairingKey::new(peer, *nonce), framed.timestamp)?;
                self.count += 1;
            }
            m => log::trace!("{}: ignoring {}", framed.flow, m.command()),
        }
        Ok(())
    }

    fn first_seen(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.first_seen.get(key) {
            Some(ts) => Ok(Some(*ts)),
            None => self.store.get_i64(key),
        }
    }

    fn observe_inv(
        &mut self,
        peer: SocketAddr,
        timestamp: i64,
        entry: &InvEntry,
    ) -> Result<(), StoreError> {
        if entry.is_block() {
            let key = first_seen_key(entry);
            match self.first_seen(&key)? {
                None => {
                    log::debug!("First seen block {} from {peer} at {timestamp}", entry.hash);
                    self.pipeline
                        .set(key.as_str(), timestamp)
                        .set(LAST_BLOCK_HASH, &entry.hash);
                    self.first_seen.insert(key, timestamp);
                }
                Some(first) if timestamp - first > self.ttl as i64 * 1000 => {
                    log::debug!(
                        "Skipping block {} from {peer}, first seen {} ms earlier",
                        entry.hash,
                        timestamp - first
                    );
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let key = inv_key(entry);
        self.pipeline
            .zadd(key.as_str(), timestamp, peer_name(peer))
            .expire(key, self.ttl);
        Ok(())
    }

    fn observe_pong(&mut self, key: PairingKey, timestamp: i64) -> Result<(), StoreError> {
        let name = key.to_string();
        if !self.store.exists(&name)? {
            log::debug!("No ping recorded for {name}, ignoring pong");
            return Ok(());
        }
        self.pipeline.rpushx(name, timestamp);
        self.pairing_keys.insert(key);
        Ok(())
    }

    pub fn finish(self) -> Observations {
        Observations {
            pipeline: self.pipeline,
            pairing_keys: self.pairing_keys,
            count: self.count,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        protocol::{MSG_BLOCK, MSG_TX},
        store::{Clock, MemoryStore},
        stream::FlowId,
    };

    const TTL: u64 = 10800;
    const HASH: &str = "00000000000000000001aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn peer(i: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, i], 8333))
    }

    fn inv(from: SocketAddr, timestamp: i64, inv_type: u32, hash: &str) -> Framed {
        Framed {
            flow: FlowId::new(from, "10.0.0.100:40000".parse().unwrap()),
            timestamp,
            message: Message::Inv {
                entries: vec![InvEntry {
                    inv_type,
                    hash: hash.to_string(),
                }],
                count: 1,
            },
        }
    }

    fn pong(from: SocketAddr, timestamp: i64, nonce: u64) -> Framed {
        Framed {
            flow: FlowId::new(from, "10.0.0.100:40000".parse().unwrap()),
            timestamp,
            message: Message::Pong { nonce },
        }
    }

    /// Observe each message in its own batch and flush it.
    fn observe_all(store: &mut MemoryStore, messages: &[Framed]) {
        for framed in messages {
            let mut cache = ObservationCache::new(&*store, TTL);
            cache.observe(framed).unwrap();
            let obs = cache.finish();
            store.execute(obs.pipeline).unwrap();
        }
    }

    fn block() -> InvEntry {
        InvEntry {
            inv_type: MSG_BLOCK,
            hash: HASH.to_string(),
        }
    }

    #[test]
    fn block_dedup_within_ttl() {
        let mut store = MemoryStore::with_clock(Clock::Fixed(0));
        observe_all(
            &mut store,
            &[
                inv(peer(1), 1_000_000, MSG_BLOCK, HASH),
                inv(peer(2), 5_000_000, MSG_BLOCK, HASH),
            ],
        );

        assert_eq!(store.get_i64(&first_seen_key(&block())).unwrap(), Some(1_000_000));
        assert_eq!(store.get(LAST_BLOCK_HASH).unwrap().as_deref(), Some(HASH));
        assert_eq!(
            store.zrange_with_scores(&inv_key(&block())),
            vec![
                ("10.0.0.1-8333".to_string(), 1_000_000),
                ("10.0.0.2-8333".to_string(), 5_000_000)
            ]
        );
        assert_eq!(store.ttl_ms(&inv_key(&block())), Some(TTL as i64 * 1000));
        assert_eq!(store.ttl_ms(&first_seen_key(&block())), None);
    }

    #[test]
    fn block_dedup_in_one_batch() {
        let store = MemoryStore::with_clock(Clock::Fixed(0));
        let mut cache = ObservationCache::new(&store, TTL);
        cache.observe(&inv(peer(1), 1_000, MSG_BLOCK, HASH)).unwrap();
        cache.observe(&inv(peer(2), 2_000, MSG_BLOCK, HASH)).unwrap();
        let obs = cache.finish();

        let sets = obs
            .pipeline
            .commands()
            .iter()
            .filter(|c| matches!(c, crate::store::StoreCommand::Set { .. }))
            .count();
        // first-seen and lastblockhash, once
        assert_eq!(sets, 2);
        assert_eq!(obs.count, 2);
    }

    #[test]
    fn block_after_ttl_is_skipped() {
        let mut store = MemoryStore::with_clock(Clock::Fixed(0));
        observe_all(
            &mut store,
            &[
                inv(peer(1), 1_000_000, MSG_BLOCK, HASH),
                inv(peer(3), 1_000_000 + 10_800_001, MSG_BLOCK, HASH),
            ],
        );

        assert_eq!(store.get_i64(&first_seen_key(&block())).unwrap(), Some(1_000_000));
        assert_eq!(store.zscore(&inv_key(&block()), "10.0.0.3-8333"), None);
        assert_eq!(store.zrange_with_scores(&inv_key(&block())).len(), 1);
    }

    #[test]
    fn block_exactly_at_ttl_is_kept() {
        let mut store = MemoryStore::with_clock(Clock::Fixed(0));
        observe_all(
            &mut store,
            &[
                inv(peer(1), 1_000_000, MSG_BLOCK, HASH),
                inv(peer(3), 1_000_000 + 10_800_000, MSG_BLOCK, HASH),
            ],
        );
        assert_eq!(
            store.zscore(&inv_key(&block()), "10.0.0.3-8333"),
            Some(11_800_000)
        );
    }

    #[test]
    fn transactions_have_no_first_seen() {
        let mut store = MemoryStore::with_clock(Clock::Fixed(0));
        observe_all(&mut store, &[inv(peer(1), 42, MSG_TX, HASH)]);
        assert_eq!(store.keys(), vec![format!("inv:1:{HASH}")]);
    }

    #[test]
    fn pong_requires_prior_ping() {
        let store = MemoryStore::with_clock(Clock::Fixed(0));
        let mut cache = ObservationCache::new(&store, TTL);
        cache.observe(&pong(peer(1), 2_500, 7)).unwrap();
        let obs = cache.finish();

        assert!(obs.pipeline.is_empty());
        assert!(obs.pairing_keys.is_empty());
        assert_eq!(obs.count, 1);
    }

    #[test]
    fn pong_appends_to_ping() {
        let mut store = MemoryStore::with_clock(Clock::Fixed(0));
        let key = PairingKey::new(peer(1), 7);
        let mut ping = Pipeline::new();
        ping.rpush(key.to_string(), 2_000);
        store.execute(ping).unwrap();

        let mut cache = ObservationCache::new(&store, TTL);
        cache.observe(&pong(peer(1), 2_500, 7)).unwrap();
        cache.observe(&pong(peer(1), 2_600, 8)).unwrap();
        let obs = cache.finish();
        assert_eq!(obs.pairing_keys.iter().collect::<Vec<_>>(), vec![&key]);

        store.execute(obs.pipeline).unwrap();
        assert_eq!(
            store.lrange("ping:10.0.0.1-8333:7", 0, -1).unwrap(),
            vec!["2000", "2500"]
        );
        assert!(!store.exists("ping:10.0.0.1-8333:8").unwrap());
    }

    #[test]
    fn other_messages_are_ignored() {
        let store = MemoryStore::with_clock(Clock::Fixed(0));
        let mut cache = ObservationCache::new(&store, TTL);
        let mut framed = pong(peer(1), 1, 1);
        framed.message = Message::Ping { nonce: Some(1) };
        cache.observe(&framed).unwrap();
        framed.message = Message::Other {
            command: "version".to_string(),
        };
        cache.observe(&framed).unwrap();
        let obs = cache.finish();
        assert!(obs.pipeline.is_empty());
        assert_eq!(obs.count, 0);
    }

    #[test]
    fn key_names() {
        let key = PairingKey::new("[2001:db8::1]:8333".parse().unwrap(), 9);
        assert_eq!(key.to_string(), "ping:2001:db8::1-8333:9");
        assert_eq!(key.rtt_key(), "rtt:2001:db8::1-8333");
        assert_eq!(first_seen_key(&block()), format!("rinv:2:{HASH}"));
    }
}
