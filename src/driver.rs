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
//! Module that claims captures from the input directory and feeds them to the pipeline.
use std::{fs, path::PathBuf, time::Duration};

use invtrace_utils::pcap_utils::{claim_oldest, Claim};

use crate::{
    config::Config,
    ingest::{process_capture, CaptureSummary, IngestError},
    protocol::Decoder,
    store::Store,
};

/// Time between two looks into the input directory.
pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to claim, or another process won the claim.
    Idle,
    Processed(PathBuf, CaptureSummary),
    /// The claimed capture could not be read. It was deleted.
    Discarded(PathBuf),
}

/// Processes the captures of one directory, one file at a time, oldest first.
pub struct IngestDriver<D, S> {
    config: Config,
    decoder: D,
    store: S,
}

impl<D: Decoder, S: Store> IngestDriver<D, S> {
    pub fn new(config: Config, decoder: D, store: S) -> Self {
        Self {
            config,
            decoder,
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claim and process at most one capture.
    ///
    /// A capture that cannot be read is logged and deleted. A store failure is returned, and the
    /// claimed file is left in place for inspection.
    pub fn tick(&mut self) -> Result<TickOutcome, IngestError> {
        let path = match claim_oldest(&self.config.pcap_dir, &self.config.extension) {
            Ok(Claim::Claimed(path)) => path,
            Ok(Claim::OnlyNewest(path)) => {
                log::debug!("Only {path:?} exists, waiting for the next capture");
                return Ok(TickOutcome::Idle);
            }
            Ok(Claim::Empty) => {
                log::debug!("No captures in {:?}", self.config.pcap_dir);
                return Ok(TickOutcome::Idle);
            }
            Err(e) => {
                log::warn!("Cannot claim a capture: {e}");
                return Ok(TickOutcome::Idle);
            }
        };

        log::info!("Processing {path:?}");
        let outcome = match process_capture(&path, &self.config, &self.decoder, &mut self.store) {
            Ok(summary) => TickOutcome::Processed(path.clone(), summary),
            Err(IngestError::Capture(e)) => {
                log::error!("Cannot read {path:?}: {e}");
                TickOutcome::Discarded(path.clone())
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = fs::remove_file(&path) {
            log::error!("Cannot delete {path:?}: {e}");
        }
        Ok(outcome)
    }

    /// Tick every [`TICK`] until CTRL+C is received or the store fails.
    pub async fn run(&mut self) -> Result<(), IngestError> {
        let mut interval = tokio::time::interval(TICK);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    log::info!("Received CTRL+C, stopping");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.tick()?;
                }
            }
        }
    }
}
