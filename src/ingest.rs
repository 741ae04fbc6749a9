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
//! Module to run one capture file through the whole pipeline.
//!
//! The store is written twice per capture: once after all messages were observed, and once after
//! the RTT samples were computed. A crash in between leaves the first batch applied and the second
//! one lost.
use std::{
    path::Path,
    time::{Duration, Instant},
};

use invtrace_utils::pcap_utils::{read_tcp_segments, CaptureError, TcpSegment};

use crate::{
    cache::ObservationCache,
    config::Config,
    framer::{FrameStats, Frames},
    protocol::Decoder,
    rtt::RttCalculator,
    store::{Store, StoreError},
    stream::extract_streams,
};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Capture Error: {0}")]
    Capture(#[from] CaptureError),
    #[error("Store Error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub segments: usize,
    pub streams: usize,
    pub frames: FrameStats,
    /// Inventory entries plus pongs.
    pub count: u64,
    pub rtt_samples: usize,
    /// Store commands applied by both flushes.
    pub applied: usize,
    pub elapsed: Duration,
}

/// Read the capture at `path` and process all of its TCP segments.
pub fn process_capture<D: Decoder, S: Store>(
    path: &Path,
    config: &Config,
    decoder: &D,
    store: &mut S,
) -> Result<CaptureSummary, IngestError> {
    let start = Instant::now();
    let segments = read_tcp_segments(path)?;
    let mut summary = process_segments(segments, config, decoder, store)?;
    summary.elapsed = start.elapsed();
    log::info!(
        "Processed {path:?}: {} segments, {} streams, {} messages, count {}, {} RTT samples \
         in {:?}",
        summary.segments,
        summary.streams,
        summary.frames.messages,
        summary.count,
        summary.rtt_samples,
        summary.elapsed,
    );
    Ok(summary)
}

/// Process the segments of one capture. Streams are handled one after the other, in the order of
/// their flow.
pub fn process_segments<D: Decoder, S: Store>(
    segments: Vec<TcpSegment>,
    config: &Config,
    decoder: &D,
    store: &mut S,
) -> Result<CaptureSummary, StoreError> {
    let mut summary = CaptureSummary {
        segments: segments.len(),
        ..Default::default()
    };
    let streams = extract_streams(segments);
    summary.streams = streams.len();

    let mut cache = ObservationCache::new(&*store, config.ttl);
    for stream in streams.into_values() {
        let mut frames = Frames::new(stream, decoder);
        for framed in frames.by_ref() {
            cache.observe(&framed)?;
        }
        let stats = frames.stats();
        if stats.malformed > 0 || stats.dropped_bytes > 0 {
            log::debug!(
                "{}: {} malformed frames, {} bytes dropped",
                frames.flow(),
                stats.malformed,
                stats.dropped_bytes
            );
        }
        summary.frames += stats;
    }
    let observations = cache.finish();
    summary.count = observations.count;
    summary.applied += store.execute(observations.pipeline)?;

    let rtt = RttCalculator::new(config.ttl, config.rtt_count)
        .calculate(&*store, &observations.pairing_keys)?;
    summary.rtt_samples = rtt.samples.len();
    summary.applied += store.execute(rtt.pipeline)?;

    Ok(summary)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::{fs, net::SocketAddr, path::PathBuf};

    use bytes::Bytes;
    use invtrace_utils::pcap_utils::write_tcp_segments;

    use crate::{
        protocol::{
            encode_frame, encode_inv, encode_nonce, BitcoinDecoder, InvEntry, Network, MSG_BLOCK,
            MSG_TX,
        },
        store::{Clock, MemoryStore, Pipeline},
    };

    const BLOCK: &str = "000000000000000000024bead8df69990852c202db0e0097c1a12ea637d7e96d";
    const TX: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    fn tmp_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("invtrace-ingest-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config(dir: &Path) -> Config {
        Config::from_json(
            &serde_json::json!({"logfile": dir.join("a.log"), "pcap_dir": dir}).to_string(),
        )
        .unwrap()
    }

    fn inv(inv_type: u32, hash: &str) -> Bytes {
        let payload = encode_inv(&[InvEntry {
            inv_type,
            hash: hash.to_string(),
        }])
        .unwrap();
        encode_frame(Network::Mainnet, "inv", &payload)
    }

    fn segment(src: SocketAddr, dst: SocketAddr, ms: u64, seq: u32, payload: Bytes) -> TcpSegment {
        TcpSegment {
            timestamp: Duration::from_millis(ms),
            src,
            dst,
            seq,
            payload,
        }
    }

    #[test]
    fn end_to_end() {
        let dir = tmp_dir("e2e");
        let config = config(&dir);
        let a: SocketAddr = "10.0.0.1:8333".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:8333".parse().unwrap();
        let local: SocketAddr = "10.0.0.100:40000".parse().unwrap();

        let block = inv(MSG_BLOCK, BLOCK);
        let tx = inv(MSG_TX, TX);
        let pong = encode_frame(Network::Mainnet, "pong", &encode_nonce(7));
        let segments = vec![
            segment(a, local, 1_000, 1, block.clone()),
            segment(b, local, 1_500, 1, tx),
            segment(a, local, 2_500, 1 + block.len() as u32, pong),
            // pure acknowledgement from the local node
            segment(local, a, 2_600, 1, Bytes::new()),
        ];
        let path = dir.join("capture.pcap");
        write_tcp_segments(&path, &segments).unwrap();

        // the pinger recorded the ping before the capture is processed
        let mut store = MemoryStore::with_clock(Clock::Fixed(3_000));
        let mut ping = Pipeline::new();
        ping.rpush("ping:10.0.0.1-8333:7", 2_000);
        store.execute(ping).unwrap();

        let summary =
            process_capture(&path, &config, &BitcoinDecoder::default(), &mut store).unwrap();
        assert_eq!(summary.segments, 3);
        assert_eq!(summary.streams, 2);
        assert_eq!(summary.frames.messages, 3);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.rtt_samples, 1);

        assert_eq!(
            store.keys(),
            vec![
                format!("inv:1:{TX}"),
                format!("inv:2:{BLOCK}"),
                "lastblockhash".to_string(),
                "ping:10.0.0.1-8333:7".to_string(),
                format!("rinv:2:{BLOCK}"),
                "rtt:10.0.0.1-8333".to_string(),
            ]
        );
        assert_eq!(store.get_i64(&format!("rinv:2:{BLOCK}")).unwrap(), Some(1_000));
        assert_eq!(store.get("lastblockhash").unwrap().as_deref(), Some(BLOCK));
        assert_eq!(store.zscore(&format!("inv:2:{BLOCK}"), "10.0.0.1-8333"), Some(1_000));
        assert_eq!(store.zscore(&format!("inv:1:{TX}"), "10.0.0.2-8333"), Some(1_500));
        assert_eq!(store.lrange("rtt:10.0.0.1-8333", 0, -1).unwrap(), vec!["500"]);
    }

    #[test]
    fn resync_loses_trailing_frame() {
        let dir = tmp_dir("resync");
        let config = config(&dir);
        let a: SocketAddr = "10.0.0.1:8333".parse().unwrap();
        let local: SocketAddr = "10.0.0.100:40000".parse().unwrap();

        let first = inv(MSG_TX, TX);
        let chunk: Bytes = [&[0u8; 8][..], &first[..]].concat().into();
        let second = inv(MSG_BLOCK, BLOCK);
        let segments = vec![
            segment(a, local, 1_000, 1, chunk.clone()),
            segment(a, local, 2_000, 1 + chunk.len() as u32, second),
        ];

        let mut store = MemoryStore::with_clock(Clock::Fixed(0));
        let summary =
            process_segments(segments, &config, &BitcoinDecoder::default(), &mut store).unwrap();
        assert_eq!(summary.frames.malformed, 1);
        assert_eq!(summary.frames.messages, 1);
        assert!(!store.exists(&format!("inv:1:{TX}")).unwrap());
        assert_eq!(store.zscore(&format!("inv:2:{BLOCK}"), "10.0.0.1-8333"), Some(2_000));
    }

    #[test]
    fn unreadable_capture() {
        let dir = tmp_dir("unreadable");
        let config = config(&dir);
        let path = dir.join("broken.pcap");
        fs::write(&path, b"not a capture").unwrap();
        let mut store = MemoryStore::new();
        assert!(matches!(
            process_capture(&path, &config, &BitcoinDecoder::default(), &mut store),
            Err(IngestError::Capture(_))
        ));
        assert!(store.keys().is_empty());
    }
}
