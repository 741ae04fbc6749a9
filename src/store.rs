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
//! Key-value store holding the results, and the batches of mutations staged against it.
//!
//! Reads go to the store immediately. Writes are staged in a [`Pipeline`] and applied with
//! [`Store::execute`]. Executing a pipeline is not a transaction: if a command fails, the commands
//! before it stay applied and the ones after it are skipped.
use std::{
    collections::{BTreeMap, VecDeque},
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Redis Error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Operation against key {0} holding the wrong kind of value")]
    WrongType(String),
    #[error("Value {value:?} of key {key} is not an integer")]
    NotAnInteger { key: String, value: String },
}

/// A single staged mutation. Names and semantics follow the Redis commands of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreCommand {
    /// Overwrite `key` with a scalar and clear its expiry.
    Set { key: String, value: String },
    /// Add `member` to the sorted set at `key`, or update its score.
    ZAdd {
        key: String,
        score: i64,
        member: String,
    },
    /// Let `key` expire `ttl` seconds from now. No effect on missing keys.
    Expire { key: String, ttl: u64 },
    /// Append to the list at `key`, creating it if needed.
    RPush { key: String, value: String },
    /// Append to the list at `key` only if it already exists.
    RPushX { key: String, value: String },
    /// Prepend to the list at `key`, creating it if needed.
    LPush { key: String, value: String },
    /// Keep only the elements `start..=stop` of the list at `key`. Negative indices count from
    /// the end.
    LTrim {
        key: String,
        start: isize,
        stop: isize,
    },
}

/// Mutations staged for a single [`Store::execute`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    commands: Vec<StoreCommand>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[StoreCommand] {
        &self.commands
    }

    pub fn push(&mut self, command: StoreCommand) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.push(StoreCommand::Set {
            key: key.into(),
            value: value.to_string(),
        })
    }

    pub fn zadd(
        &mut self,
        key: impl Into<String>,
        score: i64,
        member: impl Into<String>,
    ) -> &mut Self {
        self.push(StoreCommand::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        })
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: u64) -> &mut Self {
        self.push(StoreCommand::Expire {
            key: key.into(),
            ttl,
        })
    }

    pub fn rpush(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.push(StoreCommand::RPush {
            key: key.into(),
            value: value.to_string(),
        })
    }

    pub fn rpushx(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.push(StoreCommand::RPushX {
            key: key.into(),
            value: value.to_string(),
        })
    }

    pub fn lpush(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.push(StoreCommand::LPush {
            key: key.into(),
            value: value.to_string(),
        })
    }

    pub fn ltrim(&mut self, key: impl Into<String>, start: isize, stop: isize) -> &mut Self {
        self.push(StoreCommand::LTrim {
            key: key.into(),
            start,
            stop,
        })
    }
}

pub trait Store {
    /// Value of the scalar at `key`.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Elements `start..=stop` of the list at `key`. Negative indices count from the end.
    fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;

    fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Apply all commands of `pipeline` in order and return how many were applied.
    fn execute(&mut self, pipeline: Pipeline) -> Result<usize, StoreError>;

    /// Read the scalar at `key` as an integer.
    fn get_i64(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.get(key)?
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| StoreError::NotAnInteger {
                        key: key.to_string(),
                        value,
                    })
            })
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Scalar(String),
    /// Member to score.
    SortedSet(BTreeMap<String, i64>),
    List(VecDeque<String>),
}

/// Source of the current time used to evaluate expiry deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    System,
    Fixed(i64),
}

impl Clock {
    pub fn now_ms(&self) -> i64 {
        match self {
            Self::System => chrono::Utc::now().timestamp_millis(),
            Self::Fixed(now) => *now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Snapshot {
    values: BTreeMap<String, Value>,
    /// Expiry deadlines in ms since the epoch.
    expiry: BTreeMap<String, i64>,
}

/// An in-process store with Redis semantics, optionally persisted as a JSON snapshot after every
/// executed pipeline.
#[derive(Debug)]
pub struct MemoryStore {
    data: Snapshot,
    clock: Clock,
    snapshot: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Clock::System)
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            data: Snapshot::default(),
            clock,
            snapshot: None,
        }
    }

    /// Create a store persisted at `path`, loading the previous snapshot if there is one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let data = if path.exists() {
            log::info!("Loading store snapshot from {path:?}");
            serde_json::from_reader(BufReader::new(File::open(path)?))?
        } else {
            Snapshot::default()
        };
        Ok(Self {
            data,
            clock: Clock::System,
            snapshot: Some(path.to_path_buf()),
        })
    }

    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    fn is_expired(&self, key: &str) -> bool {
        self.data
            .expiry
            .get(key)
            .is_some_and(|deadline| *deadline <= self.clock.now_ms())
    }

    fn live(&self, key: &str) -> Option<&Value> {
        if self.is_expired(key) {
            None
        } else {
            self.data.values.get(key)
        }
    }

    fn evict_if_expired(&mut self, key: &str) {
        if self.is_expired(key) {
            self.data.values.remove(key);
            self.data.expiry.remove(key);
        }
    }

    /// Drop all keys whose deadline has passed.
    fn sweep_expired(&mut self) {
        let now = self.clock.now_ms();
        let expired = self
            .data
            .expiry
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect_vec();
        if !expired.is_empty() {
            log::trace!("Dropping {} expired keys", expired.len());
        }
        for key in expired {
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) {
        self.data.values.remove(key);
        self.data.expiry.remove(key);
    }

    fn list_mut(
        &mut self,
        key: &str,
        create: bool,
    ) -> Result<Option<&mut VecDeque<String>>, StoreError> {
        if create && !self.data.values.contains_key(key) {
            self.data
                .values
                .insert(key.to_string(), Value::List(VecDeque::new()));
        }
        match self.data.values.get_mut(key) {
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    fn apply(&mut self, command: StoreCommand) -> Result<(), StoreError> {
        match command {
            StoreCommand::Set { key, value } => {
                self.data.expiry.remove(&key);
                self.data.values.insert(key, Value::Scalar(value));
            }
            StoreCommand::ZAdd { key, score, member } => {
                self.evict_if_expired(&key);
                match self
                    .data
                    .values
                    .entry(key.clone())
                    .or_insert_with(|| Value::SortedSet(BTreeMap::new()))
                {
                    Value::SortedSet(set) => {
                        set.insert(member, score);
                    }
                    _ => return Err(StoreError::WrongType(key)),
                }
            }
            StoreCommand::Expire { key, ttl } => {
                self.evict_if_expired(&key);
                if self.data.values.contains_key(&key) {
                    let deadline = self.clock.now_ms() + (ttl as i64) * 1000;
                    self.data.expiry.insert(key, deadline);
                }
            }
            StoreCommand::RPush { key, value } => {
                self.evict_if_expired(&key);
                if let Some(list) = self.list_mut(&key, true)? {
                    list.push_back(value);
                }
            }
            StoreCommand::RPushX { key, value } => {
                self.evict_if_expired(&key);
                if let Some(list) = self.list_mut(&key, false)? {
                    list.push_back(value);
                }
            }
            StoreCommand::LPush { key, value } => {
                self.evict_if_expired(&key);
                if let Some(list) = self.list_mut(&key, true)? {
                    list.push_front(value);
                }
            }
            StoreCommand::LTrim { key, start, stop } => {
                self.evict_if_expired(&key);
                let emptied = match self.list_mut(&key, false)? {
                    Some(list) => {
                        match list_bounds(list.len(), start, stop) {
                            Some((first, last)) => {
                                list.truncate(last + 1);
                                list.drain(..first);
                            }
                            None => list.clear(),
                        }
                        list.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn write_snapshot(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        serde_json::to_writer(BufWriter::new(File::create(&tmp)?), &self.data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// All keys that are not expired, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.data
            .values
            .keys()
            .filter(|key| !self.is_expired(key))
            .cloned()
            .collect()
    }

    /// Score of `member` in the sorted set at `key`.
    pub fn zscore(&self, key: &str, member: &str) -> Option<i64> {
        match self.live(key)? {
            Value::SortedSet(set) => set.get(member).copied(),
            _ => None,
        }
    }

    /// Members of the sorted set at `key` with their scores, ordered by score.
    pub fn zrange_with_scores(&self, key: &str) -> Vec<(String, i64)> {
        match self.live(key) {
            Some(Value::SortedSet(set)) => set
                .iter()
                .map(|(member, score)| (member.clone(), *score))
                .sorted_by(|(m1, s1), (m2, s2)| s1.cmp(s2).then_with(|| m1.cmp(m2)))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Remaining time to live of `key` in ms, if it has an expiry.
    pub fn ttl_ms(&self, key: &str) -> Option<i64> {
        self.live(key)?;
        self.data
            .expiry
            .get(key)
            .map(|deadline| deadline - self.clock.now_ms())
    }
}

/// Resolve the inclusive range `start..=stop` on a list of length `len` the way Redis does.
/// Returns `None` if the range is empty.
fn list_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live(key) {
            Some(Value::Scalar(value)) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        match self.live(key) {
            Some(Value::List(list)) => Ok(list_bounds(list.len(), start, stop)
                .map(|(first, last)| list.range(first..=last).cloned().collect())
                .unwrap_or_default()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live(key).is_some())
    }

    fn execute(&mut self, pipeline: Pipeline) -> Result<usize, StoreError> {
        let mut applied = 0;
        let mut result = Ok(());
        for command in pipeline.commands {
            if let Err(e) = self.apply(command) {
                result = Err(e);
                break;
            }
            applied += 1;
        }
        self.sweep_expired();
        // persist whatever was applied, even if a command failed
        self.write_snapshot()?;
        result.map(|_| applied)
    }
}
