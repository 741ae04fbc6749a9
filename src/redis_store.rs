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
//! [`Store`] backed by a Redis server, shared with the pinger that records the ping timestamps.
use std::cell::RefCell;

use crate::store::{Pipeline, Store, StoreCommand, StoreError};

pub struct RedisStore {
    conn: RefCell<redis::Connection>,
}

impl RedisStore {
    /// Connect to the server at `url`, e.g. `redis://127.0.0.1:6379/` or
    /// `redis+unix:///tmp/redis.sock?pass=secret`.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        log::info!("Connected to redis at {url}");
        Ok(Self {
            conn: RefCell::new(conn),
        })
    }

    fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        Ok(cmd.query(&mut *self.conn.borrow_mut())?)
    }
}

/// Translate the staged commands into a single, non-transactional redis pipeline.
fn redis_pipeline(pipeline: &Pipeline) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    for command in pipeline.commands() {
        let cmd = match command {
            StoreCommand::Set { key, value } => pipe.cmd("SET").arg(key).arg(value),
            StoreCommand::ZAdd { key, score, member } => {
                pipe.cmd("ZADD").arg(key).arg(score).arg(member)
            }
            StoreCommand::Expire { key, ttl } => pipe.cmd("EXPIRE").arg(key).arg(ttl),
            StoreCommand::RPush { key, value } => pipe.cmd("RPUSH").arg(key).arg(value),
            StoreCommand::RPushX { key, value } => pipe.cmd("RPUSHX").arg(key).arg(value),
            StoreCommand::LPush { key, value } => pipe.cmd("LPUSH").arg(key).arg(value),
            StoreCommand::LTrim { key, start, stop } => {
                pipe.cmd("LTRIM").arg(key).arg(start).arg(stop)
            }
        };
        cmd.ignore();
    }
    pipe
}

impl Store for RedisStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.query(redis::cmd("GET").arg(key))
    }

    fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.query(redis::cmd("EXISTS").arg(key))
    }

    fn execute(&mut self, pipeline: Pipeline) -> Result<usize, StoreError> {
        if pipeline.is_empty() {
            return Ok(0);
        }
        redis_pipeline(&pipeline).query::<()>(self.conn.get_mut())?;
        Ok(pipeline.len())
    }
}
