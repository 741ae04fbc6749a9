use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};

use invtrace_utils::pcap_utils::{
    read_tcp_segments, read_tcp_segments_with_stats, write_tcp_segments,
};

#[derive(Parser, Debug)]
#[command(author, version, about)] // get author/version information from Cargo.toml
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the number of segments and payload bytes per TCP flow of a capture.
    Summary { capture: PathBuf },
    /// Copy all TCP segments from or to `port` into a new capture.
    Extract {
        capture: PathBuf,
        output: PathBuf,
        #[arg(short, long, default_value_t = 8333)]
        port: u16,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    match Args::parse().command {
        Cmd::Summary { capture } => {
            let (segments, stats) = read_tcp_segments_with_stats(&capture)?;
            log::info!("{capture:?}: {stats:?}");

            let mut flows: BTreeMap<(SocketAddr, SocketAddr), (usize, usize)> = BTreeMap::new();
            for seg in &segments {
                let flow = flows.entry((seg.src, seg.dst)).or_default();
                flow.0 += 1;
                flow.1 += seg.payload.len();
            }
            for ((src, dst), (num_segments, num_bytes)) in flows {
                println!("{src} -> {dst}: {num_segments} segments, {num_bytes} bytes");
            }
        }
        Cmd::Extract {
            capture,
            output,
            port,
        } => {
            let segments = read_tcp_segments(&capture)?;
            let written = write_tcp_segments(
                &output,
                segments
                    .iter()
                    .filter(|seg| seg.src.port() == port || seg.dst.port() == port),
            )?;
            println!("wrote {written} of {} segments to {output:?}", segments.len());
        }
    }

    Ok(())
}
