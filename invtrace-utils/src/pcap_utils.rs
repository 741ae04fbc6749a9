//! Module to read TCP payloads from captured P2P traffic and to manage the capture directory.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Write},
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use etherparse::{NetSlice, PacketBuilder, SlicedPacket, TransportSlice};
use flate2::{bufread::GzDecoder, write::GzEncoder, Compression};
use itertools::Itertools;
use pcap_file::{
    pcap::{PcapPacket, PcapReader, PcapWriter},
    DataLink, PcapError,
};

/// Suffix appended to a capture's extension while it is being read.
pub const CLAIM_SUFFIX: &str = "_";

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Pcap error: {0}")]
    Pcap(#[from] PcapError),
    #[error("Unsupported link type: {0:?}")]
    UnsupportedLinkType(DataLink),
    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("Cannot read directory entry: {0}")]
    Glob(#[from] glob::GlobError),
    #[error("Cannot claim {path:?}: {source}")]
    Claim {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Segment {src} -> {dst} mixes address families")]
    MixedAddressFamilies { src: SocketAddr, dst: SocketAddr },
    #[error("Cannot build frame: {0}")]
    Build(String),
}

/// One captured TCP segment with a non-empty payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    /// Capture timestamp, relative to the unix epoch.
    pub timestamp: Duration,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub payload: Bytes,
}

impl TcpSegment {
    /// Capture timestamp in milliseconds since the epoch.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.as_millis() as i64
    }
}

/// Counters of a single pass over a capture file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub records: usize,
    pub unparseable: usize,
    pub not_tcp: usize,
    pub empty_payload: usize,
}

/// Whether the capture at `path` is gzip compressed, also while it is claimed.
pub fn is_gzip(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.strip_suffix(CLAIM_SUFFIX).unwrap_or(&name).ends_with(".gz")
}

fn open_capture(path: &Path) -> Result<PcapReader<Box<dyn Read>>, CaptureError> {
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = if is_gzip(path) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(PcapReader::new(reader)?)
}

fn slice_frame(datalink: DataLink, data: &[u8]) -> Option<SlicedPacket<'_>> {
    match datalink {
        DataLink::ETHERNET => SlicedPacket::from_ethernet(data).ok(),
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => SlicedPacket::from_ip(data).ok(),
        DataLink::LINUX_SLL => SlicedPacket::from_linux_sll(data).ok(),
        _ => None,
    }
}

/// Read all TCP segments carrying payload from the capture at `path`. Paths ending in `.gz` are
/// decompressed on the fly.
///
/// Frames that cannot be sliced, that are not TCP over IPv4 or IPv6, or that carry no payload are
/// skipped. A truncated last record ends the capture early, which happens when the capture
/// process was killed while writing.
pub fn read_tcp_segments(path: impl AsRef<Path>) -> Result<Vec<TcpSegment>, CaptureError> {
    read_tcp_segments_with_stats(path).map(|(segments, _)| segments)
}

/// Same as [`read_tcp_segments`], but also returns the counters of skipped records.
pub fn read_tcp_segments_with_stats(
    path: impl AsRef<Path>,
) -> Result<(Vec<TcpSegment>, ReadStats), CaptureError> {
    let path = path.as_ref();
    let mut cap = open_capture(path)?;
    let datalink = cap.header().datalink;
    if !matches!(
        datalink,
        DataLink::ETHERNET | DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 | DataLink::LINUX_SLL
    ) {
        return Err(CaptureError::UnsupportedLinkType(datalink));
    }

    let mut stats = ReadStats::default();
    let mut segments = Vec::new();

    while let Some(next_packet) = cap.next_packet() {
        let packet = match next_packet {
            Ok(packet) => packet,
            Err(PcapError::IncompleteBuffer) => {
                log::warn!("{path:?} ends with a truncated record");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        stats.records += 1;

        let Some(pkt) = slice_frame(datalink, &packet.data) else {
            stats.unparseable += 1;
            continue;
        };
        let (src_ip, dst_ip): (IpAddr, IpAddr) = match &pkt.net {
            Some(NetSlice::Ipv4(ip)) => (
                ip.header().source_addr().into(),
                ip.header().destination_addr().into(),
            ),
            Some(NetSlice::Ipv6(ip)) => (
                ip.header().source_addr().into(),
                ip.header().destination_addr().into(),
            ),
            #[allow(unreachable_patterns)]
            _ => {
                stats.not_tcp += 1;
                continue;
            }
        };
        let Some(TransportSlice::Tcp(tcp)) = &pkt.transport else {
            stats.not_tcp += 1;
            continue;
        };
        if tcp.payload().is_empty() {
            stats.empty_payload += 1;
            continue;
        }

        segments.push(TcpSegment {
            timestamp: packet.timestamp,
            src: SocketAddr::new(src_ip, tcp.source_port()),
            dst: SocketAddr::new(dst_ip, tcp.destination_port()),
            seq: tcp.sequence_number(),
            payload: Bytes::copy_from_slice(tcp.payload()),
        });
    }

    log::trace!(
        "{path:?}: {} records, {} segments, {} unparseable, {} not tcp, {} empty",
        stats.records,
        segments.len(),
        stats.unparseable,
        stats.not_tcp,
        stats.empty_payload,
    );

    Ok((segments, stats))
}

/// Write `segments` into a new Ethernet capture at `path`, gzip compressed if the path ends in
/// `.gz`. MAC addresses are zeroed.
pub fn write_tcp_segments<'a>(
    path: impl AsRef<Path>,
    segments: impl IntoIterator<Item = &'a TcpSegment>,
) -> Result<usize, CaptureError> {
    let path = path.as_ref();
    let mut writer = PcapWriter::new(Vec::new())?;
    let mut written = 0;

    for seg in segments {
        let eth = PacketBuilder::ethernet2([0; 6], [0; 6]);
        let ip = match (seg.src.ip(), seg.dst.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => eth.ipv4(src.octets(), dst.octets(), 64),
            (IpAddr::V6(src), IpAddr::V6(dst)) => eth.ipv6(src.octets(), dst.octets(), 64),
            _ => {
                return Err(CaptureError::MixedAddressFamilies {
                    src: seg.src,
                    dst: seg.dst,
                })
            }
        };
        let builder = ip.tcp(seg.src.port(), seg.dst.port(), seg.seq, u16::MAX);
        let mut frame = Vec::with_capacity(builder.size(seg.payload.len()));
        builder
            .write(&mut frame, &seg.payload)
            .map_err(|e| CaptureError::Build(e.to_string()))?;
        writer.write_packet(&PcapPacket::new(
            seg.timestamp,
            frame.len() as u32,
            &frame,
        ))?;
        written += 1;
    }

    let data = writer.into_writer();
    let file = BufWriter::new(File::create(path)?);
    if is_gzip(path) {
        let mut gz = GzEncoder::new(file, Compression::default());
        gz.write_all(&data)?;
        gz.finish()?.flush()?;
    } else {
        let mut file = file;
        file.write_all(&data)?;
        file.flush()?;
    }

    Ok(written)
}

/// List all captures with the given extension in `dir`, sorted by name.
pub fn list_captures(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, CaptureError> {
    let pattern = dir.join(format!("*.{extension}"));
    let mut paths = Vec::new();
    for entry in glob::glob(&pattern.to_string_lossy())? {
        paths.push(entry?);
    }
    Ok(paths.into_iter().sorted().collect())
}

/// Result of trying to claim a capture from the input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The oldest capture was renamed to the returned path and is now owned by the caller.
    Claimed(PathBuf),
    /// Only one capture exists. It is the newest and may still be written to.
    OnlyNewest(PathBuf),
    /// No capture exists.
    Empty,
}

/// Path a capture is renamed to while it is being read.
pub fn claimed_path(path: &Path) -> PathBuf {
    let mut claimed = path.as_os_str().to_owned();
    claimed.push(CLAIM_SUFFIX);
    PathBuf::from(claimed)
}

/// Claim the oldest capture (by name) that is not also the newest one, by renaming it with the
/// [`CLAIM_SUFFIX`]. Another process racing for the same file makes the rename fail, which is
/// reported as [`CaptureError::Claim`].
pub fn claim_oldest(dir: &Path, extension: &str) -> Result<Claim, CaptureError> {
    let captures = list_captures(dir, extension)?;
    let (oldest, newest) = match (captures.first(), captures.last()) {
        (Some(oldest), Some(newest)) => (oldest, newest),
        _ => return Ok(Claim::Empty),
    };
    if oldest == newest {
        return Ok(Claim::OnlyNewest(newest.clone()));
    }

    let claimed = claimed_path(oldest);
    fs::rename(oldest, &claimed).map_err(|source| CaptureError::Claim {
        path: oldest.clone(),
        source,
    })?;
    Ok(Claim::Claimed(claimed))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::Ipv4Addr;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("invtrace-utils-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn segment(ms: u64, seq: u32, payload: &'static [u8]) -> TcpSegment {
        TcpSegment {
            timestamp: Duration::from_millis(ms),
            src: SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 8333),
            dst: SocketAddr::new(Ipv4Addr::new(10, 0, 0, 2).into(), 40000),
            seq,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn write_then_read() {
        let dir = tmp_dir("rw");
        let path = dir.join("a.pcap");
        let mut v6 = segment(1_500, 7, b"world");
        v6.src = "[2001:db8::1]:8333".parse().unwrap();
        v6.dst = "[2001:db8::2]:50000".parse().unwrap();
        let segments = vec![segment(1_000, 100, b"hello"), v6];

        assert_eq!(write_tcp_segments(&path, &segments).unwrap(), 2);
        let (read, stats) = read_tcp_segments_with_stats(&path).unwrap();
        assert_eq!(read, segments);
        assert_eq!(stats.records, 2);
        assert_eq!(read[0].timestamp_ms(), 1_000);
    }

    #[test]
    fn empty_payloads_are_skipped() {
        let dir = tmp_dir("empty");
        let path = dir.join("a.pcap");
        let segments = vec![segment(1, 1, b""), segment(2, 2, b"x")];
        write_tcp_segments(&path, &segments).unwrap();

        let (read, stats) = read_tcp_segments_with_stats(&path).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].seq, 2);
        assert_eq!(stats.empty_payload, 1);
    }

    #[test]
    fn mixed_families_are_rejected() {
        let dir = tmp_dir("mixed");
        let mut seg = segment(1, 1, b"x");
        seg.dst = "[2001:db8::2]:50000".parse().unwrap();
        assert!(matches!(
            write_tcp_segments(dir.join("a.pcap"), [&seg]),
            Err(CaptureError::MixedAddressFamilies { .. })
        ));
    }

    #[test]
    fn claim_skips_newest() {
        let dir = tmp_dir("claim");
        assert_eq!(claim_oldest(&dir, "pcap").unwrap(), Claim::Empty);

        fs::write(dir.join("1000.pcap"), b"").unwrap();
        assert_eq!(
            claim_oldest(&dir, "pcap").unwrap(),
            Claim::OnlyNewest(dir.join("1000.pcap"))
        );

        fs::write(dir.join("1001.pcap"), b"").unwrap();
        fs::write(dir.join("notes.txt"), b"").unwrap();
        assert_eq!(
            claim_oldest(&dir, "pcap").unwrap(),
            Claim::Claimed(dir.join("1000.pcap_"))
        );
        assert!(dir.join("1000.pcap_").exists());
        assert!(!dir.join("1000.pcap").exists());

        // the claimed file no longer matches the extension
        assert_eq!(
            list_captures(&dir, "pcap").unwrap(),
            vec![dir.join("1001.pcap")]
        );
    }

    #[test]
    fn gzip_survives_claim() {
        let dir = tmp_dir("gzip");
        let segments = vec![segment(1_000, 1, b"hello")];
        write_tcp_segments(dir.join("1000.pcap.gz"), &segments).unwrap();
        write_tcp_segments(dir.join("1001.pcap.gz"), &segments).unwrap();

        let Claim::Claimed(claimed) = claim_oldest(&dir, "pcap.gz").unwrap() else {
            panic!("1000.pcap.gz should be claimed");
        };
        assert_eq!(claimed, dir.join("1000.pcap.gz_"));
        assert!(is_gzip(&claimed));
        assert!(!is_gzip(&dir.join("1000.pcap_")));
        assert_eq!(read_tcp_segments(&claimed).unwrap(), segments);
    }
}
