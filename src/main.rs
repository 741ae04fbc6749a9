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
use std::{path::PathBuf, process::exit};

use clap::{error::ErrorKind, Parser};

use invtrace::{prelude::*, util};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON).
    config: PathBuf,
}

fn usage() -> ! {
    eprintln!("Usage: main [config]");
    exit(1)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(_) => usage(),
    };
    if !args.config.is_file() {
        usage();
    }
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            usage();
        }
    };

    util::init_logging(&config)?;
    println!(
        "Writing output to {}, press CTRL+C to terminate..",
        config.logfile.display()
    );
    log::info!("Watching {:?} for *.{} captures", config.pcap_dir, config.extension);

    let decoder = BitcoinDecoder::new(config.network);
    match config.redis_url.clone() {
        Some(url) => run(config, decoder, RedisStore::connect(&url)?).await,
        None => {
            let store = match &config.store_snapshot {
                Some(path) => MemoryStore::open(path)?,
                None => MemoryStore::new(),
            };
            run(config, decoder, store).await
        }
    }
}

async fn run<S: Store>(config: Config, decoder: BitcoinDecoder, store: S) -> anyhow::Result<()> {
    let mut driver = IngestDriver::new(config, decoder, store);
    driver.run().await?;
    Ok(())
}
